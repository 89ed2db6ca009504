//! # Tween 模块
//!
//! 单属性补间：在给定时长内按缓动曲线从起始值插值到目标值。
//!
//! ## 状态转换
//!
//! ```text
//! Idle -> Running -> (Paused <-> Running) -> Completed
//! ```

use super::easing::EasingFunction;
use crate::geometry::{Color, Vec2};

/// 补间状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TweenState {
    /// 尚未开始（首次 update 自动开始）
    Idle,
    /// 播放中
    Running,
    /// 暂停
    Paused,
    /// 已完成
    Completed,
}

/// 可补间的值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TweenValue {
    Float(f32),
    Position(Vec2),
    Color(Color),
}

impl TweenValue {
    /// 插值；类型不一致时直接返回目标值
    pub fn lerp(&self, to: &TweenValue, t: f32) -> TweenValue {
        match (self, to) {
            (Self::Float(a), Self::Float(b)) => Self::Float(a + (b - a) * t),
            (Self::Position(a), Self::Position(b)) => Self::Position(a.lerp(*b, t)),
            (Self::Color(a), Self::Color(b)) => Self::Color(a.lerp(*b, t)),
            _ => *to,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_position(&self) -> Option<Vec2> {
        match self {
            Self::Position(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<Color> {
        match self {
            Self::Color(v) => Some(*v),
            _ => None,
        }
    }
}

enum TweenTarget {
    Value {
        from: TweenValue,
        to: TweenValue,
        current: TweenValue,
    },
    /// 每帧以缓动后的进度调用
    Callback(Box<dyn FnMut(f32)>),
}

/// 补间动画
pub struct Tween {
    target: TweenTarget,
    duration: f32,
    easing: EasingFunction,
    state: TweenState,
    elapsed: f32,
    /// 循环次数，0 表示无限
    loops: u32,
    completed_loops: u32,
    yoyo: bool,
    reversed: bool,
    on_complete: Option<Box<dyn FnMut()>>,
}

impl std::fmt::Debug for Tween {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tween")
            .field("value", &self.value())
            .field("duration", &self.duration)
            .field("easing", &self.easing)
            .field("state", &self.state)
            .field("elapsed", &self.elapsed)
            .field("loops", &self.loops)
            .field("yoyo", &self.yoyo)
            .finish()
    }
}

impl Tween {
    fn with_target(target: TweenTarget, duration: f32, easing: EasingFunction) -> Self {
        Self {
            target,
            duration: duration.max(0.0),
            easing,
            state: TweenState::Idle,
            elapsed: 0.0,
            loops: 1,
            completed_loops: 0,
            yoyo: false,
            reversed: false,
            on_complete: None,
        }
    }

    /// 创建值补间
    pub fn new(from: TweenValue, to: TweenValue, duration: f32, easing: EasingFunction) -> Self {
        Self::with_target(
            TweenTarget::Value {
                from,
                to,
                current: from,
            },
            duration,
            easing,
        )
    }

    /// 浮点补间
    pub fn float(from: f32, to: f32, duration: f32, easing: EasingFunction) -> Self {
        Self::new(TweenValue::Float(from), TweenValue::Float(to), duration, easing)
    }

    /// 位置补间
    pub fn position(from: Vec2, to: Vec2, duration: f32, easing: EasingFunction) -> Self {
        Self::new(
            TweenValue::Position(from),
            TweenValue::Position(to),
            duration,
            easing,
        )
    }

    /// 颜色补间
    pub fn color(from: Color, to: Color, duration: f32, easing: EasingFunction) -> Self {
        Self::new(TweenValue::Color(from), TweenValue::Color(to), duration, easing)
    }

    /// 回调补间
    pub fn callback<F>(duration: f32, easing: EasingFunction, f: F) -> Self
    where
        F: FnMut(f32) + 'static,
    {
        Self::with_target(TweenTarget::Callback(Box::new(f)), duration, easing)
    }

    /// 设置循环次数（0 = 无限）
    pub fn with_loops(mut self, loops: u32) -> Self {
        self.loops = loops;
        self
    }

    /// 每轮结束后反向
    pub fn with_yoyo(mut self, yoyo: bool) -> Self {
        self.yoyo = yoyo;
        self
    }

    /// 完成回调
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn start(&mut self) {
        if self.state == TweenState::Idle {
            self.state = TweenState::Running;
        }
    }

    pub fn pause(&mut self) {
        if self.state == TweenState::Running {
            self.state = TweenState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == TweenState::Paused {
            self.state = TweenState::Running;
        }
    }

    /// 回到起点并重置为 Idle
    pub fn reset(&mut self) {
        self.state = TweenState::Idle;
        self.elapsed = 0.0;
        self.completed_loops = 0;
        self.reversed = false;
        self.apply(0.0);
    }

    /// 立即跳到终点
    pub fn finish(&mut self) {
        if self.state == TweenState::Completed {
            return;
        }
        self.apply(1.0);
        self.complete();
    }

    /// 推进时间
    pub fn update(&mut self, dt: f32) {
        match self.state {
            TweenState::Completed | TweenState::Paused => return,
            TweenState::Idle => self.state = TweenState::Running,
            TweenState::Running => {}
        }

        if self.duration <= 0.0 {
            self.finish();
            return;
        }

        self.elapsed += dt.max(0.0);
        loop {
            if self.elapsed < self.duration {
                self.apply(self.elapsed / self.duration);
                return;
            }

            self.completed_loops += 1;
            if self.loops != 0 && self.completed_loops >= self.loops {
                self.elapsed = self.duration;
                self.apply(1.0);
                self.complete();
                return;
            }

            self.elapsed -= self.duration;
            if self.yoyo {
                self.reversed = !self.reversed;
            }
        }
    }

    fn complete(&mut self) {
        self.state = TweenState::Completed;
        if let Some(f) = self.on_complete.as_mut() {
            f();
        }
    }

    fn apply(&mut self, progress: f32) {
        let eased = self.easing.apply(progress);
        let eased = if self.reversed { 1.0 - eased } else { eased };
        match &mut self.target {
            TweenTarget::Value { from, to, current } => *current = from.lerp(to, eased),
            TweenTarget::Callback(f) => f(eased),
        }
    }

    /// 当前值（回调补间返回 `None`）
    pub fn value(&self) -> Option<TweenValue> {
        match &self.target {
            TweenTarget::Value { current, .. } => Some(*current),
            TweenTarget::Callback(_) => None,
        }
    }

    /// 当前浮点值
    pub fn float_value(&self) -> Option<f32> {
        self.value().and_then(|v| v.as_float())
    }

    pub fn state(&self) -> TweenState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == TweenState::Completed
    }

    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// 总时长（无限循环返回 `None`）
    pub fn total_duration(&self) -> Option<f32> {
        if self.loops == 0 {
            None
        } else {
            Some(self.duration * self.loops as f32)
        }
    }

    /// 当前轮的线性进度
    pub fn progress(&self) -> f32 {
        if self.duration <= 0.0 {
            return if self.is_complete() { 1.0 } else { 0.0 };
        }
        (self.elapsed / self.duration).clamp(0.0, 1.0)
    }
}
