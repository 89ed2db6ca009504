//! # Transition 模块
//!
//! 场景切换效果。过渡以覆盖层的方式绘制在新内容之上：
//! 可选的 `outgoing` 纹理代表旧画面，没有时以纯色遮罩代替。
//!
//! ## 支持的过渡效果
//!
//! - `none`: 立即完成
//! - `fade`: 遮罩从不透明淡出
//! - `fadethrough`: 遮罩淡入至全黑，在中点切换内容，再淡出
//! - `slideleft` / `slideright` / `slideup` / `slidedown`: 旧画面滑出
//! - `dissolve`: 旧画面交叉溶解
//! - `wipe`: 从左向右擦除旧画面
//! - `zoom`: 旧画面放大并淡出

use crate::animation::EasingFunction;
use crate::geometry::{Color, Rect};
use crate::render::Renderer;

/// 过渡类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    None,
    Fade,
    FadeThrough,
    SlideLeft,
    SlideRight,
    SlideUp,
    SlideDown,
    Dissolve,
    Wipe,
    Zoom,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 10] = [
        Self::None,
        Self::Fade,
        Self::FadeThrough,
        Self::SlideLeft,
        Self::SlideRight,
        Self::SlideUp,
        Self::SlideDown,
        Self::Dissolve,
        Self::Wipe,
        Self::Zoom,
    ];

    /// 从脚本中的名称解析，大小写与 `_`/`-` 不敏感
    pub fn from_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let kind = match key.as_str() {
            "none" | "" => Self::None,
            "fade" => Self::Fade,
            "fadethrough" | "fadeblack" => Self::FadeThrough,
            "slideleft" => Self::SlideLeft,
            "slideright" => Self::SlideRight,
            "slideup" => Self::SlideUp,
            "slidedown" => Self::SlideDown,
            "dissolve" => Self::Dissolve,
            "wipe" => Self::Wipe,
            "zoom" => Self::Zoom,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fade => "fade",
            Self::FadeThrough => "fadethrough",
            Self::SlideLeft => "slideleft",
            Self::SlideRight => "slideright",
            Self::SlideUp => "slideup",
            Self::SlideDown => "slidedown",
            Self::Dissolve => "dissolve",
            Self::Wipe => "wipe",
            Self::Zoom => "zoom",
        }
    }
}

/// 过渡阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    Idle,
    Running,
    Completed,
}

/// 单次 `update` 中发生的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionEvents {
    /// 本帧越过中点（仅 FadeThrough）
    pub reached_midpoint: bool,
    /// 本帧完成
    pub completed: bool,
}

/// 场景过渡
pub struct SceneTransition {
    kind: TransitionKind,
    duration: f32,
    elapsed: f32,
    phase: TransitionPhase,
    easing: EasingFunction,
    color: Color,
    outgoing: Option<String>,
    midpoint_fired: bool,
    on_complete: Option<Box<dyn FnMut()>>,
    on_midpoint: Option<Box<dyn FnMut()>>,
}

impl std::fmt::Debug for SceneTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneTransition")
            .field("kind", &self.kind)
            .field("duration", &self.duration)
            .field("elapsed", &self.elapsed)
            .field("phase", &self.phase)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}

impl SceneTransition {
    /// 创建过渡（尚未开始）
    pub fn new(kind: TransitionKind) -> Self {
        Self {
            kind,
            duration: 0.0,
            elapsed: 0.0,
            phase: TransitionPhase::Idle,
            easing: EasingFunction::EaseInOutQuad,
            color: Color::BLACK,
            outgoing: None,
            midpoint_fired: false,
            on_complete: None,
            on_midpoint: None,
        }
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn with_easing(mut self, easing: EasingFunction) -> Self {
        self.easing = easing;
        self
    }

    /// 旧画面纹理
    pub fn with_outgoing(mut self, texture_id: impl Into<String>) -> Self {
        self.outgoing = Some(texture_id.into());
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// 中点回调；只有 FadeThrough 会触发
    pub fn on_midpoint<F>(mut self, f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        self.on_midpoint = Some(Box::new(f));
        self
    }

    /// 开始过渡；时长为 0 或类型为 None 时立即完成
    pub fn start(&mut self, duration: f32) -> TransitionEvents {
        self.duration = duration.max(0.0);
        self.elapsed = 0.0;
        self.midpoint_fired = false;
        self.phase = TransitionPhase::Running;
        if self.kind == TransitionKind::None || self.duration <= 0.0 {
            return self.finish();
        }
        TransitionEvents::default()
    }

    /// 推进时间
    pub fn update(&mut self, dt: f32) -> TransitionEvents {
        if self.phase != TransitionPhase::Running {
            return TransitionEvents::default();
        }
        self.elapsed = (self.elapsed + dt.max(0.0)).min(self.duration);
        let mut events = TransitionEvents::default();
        if self.progress() >= 0.5 {
            events.reached_midpoint = self.fire_midpoint();
        }
        if self.elapsed >= self.duration {
            events.completed = self.complete();
        }
        events
    }

    /// 跳到结束
    pub fn finish(&mut self) -> TransitionEvents {
        if self.phase == TransitionPhase::Completed {
            return TransitionEvents::default();
        }
        self.elapsed = self.duration;
        self.phase = TransitionPhase::Running;
        TransitionEvents {
            reached_midpoint: self.fire_midpoint(),
            completed: self.complete(),
        }
    }

    fn fire_midpoint(&mut self) -> bool {
        if self.kind != TransitionKind::FadeThrough || self.midpoint_fired {
            return false;
        }
        self.midpoint_fired = true;
        if let Some(f) = self.on_midpoint.as_mut() {
            f();
        }
        true
    }

    fn complete(&mut self) -> bool {
        if self.phase == TransitionPhase::Completed {
            return false;
        }
        self.phase = TransitionPhase::Completed;
        if let Some(f) = self.on_complete.as_mut() {
            f();
        }
        true
    }

    /// 线性进度（0.0 - 1.0）
    pub fn progress(&self) -> f32 {
        match self.phase {
            TransitionPhase::Idle => 0.0,
            TransitionPhase::Completed => 1.0,
            TransitionPhase::Running if self.duration <= 0.0 => 1.0,
            TransitionPhase::Running => (self.elapsed / self.duration).clamp(0.0, 1.0),
        }
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn phase(&self) -> TransitionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == TransitionPhase::Running
    }

    pub fn is_complete(&self) -> bool {
        self.phase == TransitionPhase::Completed
    }

    /// 遮罩透明度（Fade / FadeThrough / 无旧画面时的其他类型）
    pub fn mask_alpha(&self) -> f32 {
        let p = self.easing.apply(self.progress());
        match self.kind {
            TransitionKind::None => 0.0,
            TransitionKind::FadeThrough => 1.0 - (2.0 * self.progress() - 1.0).abs(),
            _ => 1.0 - p,
        }
    }

    /// 绘制覆盖层
    pub fn render(&self, renderer: &mut dyn Renderer) {
        if self.phase != TransitionPhase::Running {
            return;
        }
        let size = renderer.viewport();
        let full = Rect::new(0.0, 0.0, size.x, size.y);
        let p = self.easing.apply(self.progress());

        let rect = match self.kind {
            TransitionKind::None => return,
            TransitionKind::Fade | TransitionKind::FadeThrough => {
                renderer.fill_rect(full, self.color.with_alpha(self.mask_alpha()));
                return;
            }
            TransitionKind::Dissolve => full,
            TransitionKind::SlideLeft => Rect::new(-p * size.x, 0.0, size.x, size.y),
            TransitionKind::SlideRight => Rect::new(p * size.x, 0.0, size.x, size.y),
            TransitionKind::SlideUp => Rect::new(0.0, -p * size.y, size.x, size.y),
            TransitionKind::SlideDown => Rect::new(0.0, p * size.y, size.x, size.y),
            TransitionKind::Wipe => Rect::new(p * size.x, 0.0, (1.0 - p) * size.x, size.y),
            TransitionKind::Zoom => {
                let scale = 1.0 + p;
                let (w, h) = (size.x * scale, size.y * scale);
                Rect::new((size.x - w) / 2.0, (size.y - h) / 2.0, w, h)
            }
        };

        let alpha = match self.kind {
            TransitionKind::Dissolve | TransitionKind::Zoom => 1.0 - p,
            _ => 1.0,
        };
        match &self.outgoing {
            Some(texture) => {
                renderer.draw_texture(texture, rect, 0.0, Color::WHITE.with_alpha(alpha))
            }
            None => renderer.fill_rect(rect, self.color.with_alpha(alpha)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{DrawCommand, RecordingRenderer};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_from_name() {
        assert_eq!(TransitionKind::from_name("Fade"), Some(TransitionKind::Fade));
        assert_eq!(
            TransitionKind::from_name("fade_through"),
            Some(TransitionKind::FadeThrough)
        );
        assert_eq!(
            TransitionKind::from_name("slide-left"),
            Some(TransitionKind::SlideLeft)
        );
        assert_eq!(TransitionKind::from_name("spin"), None);
        for kind in TransitionKind::ALL {
            assert_eq!(TransitionKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn test_progress_and_completion_callback() {
        let done = Rc::new(Cell::new(0));
        let d = done.clone();
        let mut t =
            SceneTransition::new(TransitionKind::Fade).on_complete(move || d.set(d.get() + 1));
        assert_eq!(t.progress(), 0.0);
        t.start(1.0);
        t.update(0.25);
        assert_eq!(t.progress(), 0.25);
        let events = t.update(2.0);
        assert!(events.completed);
        assert!(!events.reached_midpoint);
        assert_eq!(t.progress(), 1.0);
        t.update(1.0);
        assert_eq!(done.get(), 1);
    }

    #[test]
    fn test_fade_through_midpoint_once() {
        let mid = Rc::new(Cell::new(0));
        let m = mid.clone();
        let mut t = SceneTransition::new(TransitionKind::FadeThrough);
        t = t.on_midpoint(move || m.set(m.get() + 1));
        t.start(1.0);
        assert!(!t.update(0.4).reached_midpoint);
        assert!(t.update(0.2).reached_midpoint);
        assert!(!t.update(0.2).reached_midpoint);
        t.update(1.0);
        assert_eq!(mid.get(), 1);
        assert!(t.is_complete());
    }

    #[test]
    fn test_midpoint_only_for_fade_through() {
        let mid = Rc::new(Cell::new(false));
        let m = mid.clone();
        let mut t = SceneTransition::new(TransitionKind::Dissolve).on_midpoint(move || m.set(true));
        t.start(1.0);
        t.update(1.0);
        assert!(!mid.get());
    }

    #[test]
    fn test_none_and_zero_duration_complete_immediately() {
        let mut t = SceneTransition::new(TransitionKind::None);
        assert!(t.start(1.0).completed);
        assert!(t.is_complete());

        let mut t = SceneTransition::new(TransitionKind::FadeThrough);
        let events = t.start(0.0);
        assert!(events.reached_midpoint && events.completed);
    }

    #[test]
    fn test_render_fade_through_peaks_at_midpoint() {
        let mut t = SceneTransition::new(TransitionKind::FadeThrough);
        t.start(2.0);
        t.update(1.0);
        let mut renderer = RecordingRenderer::new(800.0, 600.0);
        t.render(&mut renderer);
        match &renderer.commands[0] {
            DrawCommand::FillRect { rect, color } => {
                assert_eq!(rect.width, 800.0);
                assert_eq!(color.a, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_render_slide_moves_outgoing() {
        let mut t = SceneTransition::new(TransitionKind::SlideLeft)
            .with_easing(EasingFunction::Linear)
            .with_outgoing("bg/old.png");
        t.start(1.0);
        t.update(0.5);
        let mut renderer = RecordingRenderer::new(800.0, 600.0);
        t.render(&mut renderer);
        match &renderer.commands[0] {
            DrawCommand::Texture { texture_id, rect, .. } => {
                assert_eq!(texture_id, "bg/old.png");
                assert_eq!(rect.x, -400.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        t.finish();
        let mut renderer = RecordingRenderer::new(800.0, 600.0);
        t.render(&mut renderer);
        assert!(renderer.commands.is_empty());
    }
}
