//! # Timeline 模块
//!
//! 按顺序编排补间：`append` 开启新的顺序步骤，`join` 与上一步并行，
//! `delay` 插入空白等待。上一步全部完成后，剩余时间会带入下一步。

use super::tween::{Tween, TweenState};

#[derive(Debug)]
enum Step {
    Group { tweens: Vec<Tween>, elapsed: f32 },
    Delay { duration: f32, elapsed: f32 },
}

impl Step {
    /// 推进本步骤，返回未用完的时间；步骤未完成时返回 `None`
    fn advance(&mut self, dt: f32) -> Option<f32> {
        match self {
            Step::Delay { duration, elapsed } => {
                let need = (*duration - *elapsed).max(0.0);
                if dt >= need {
                    *elapsed = *duration;
                    Some(dt - need)
                } else {
                    *elapsed += dt;
                    None
                }
            }
            Step::Group { tweens, elapsed } => {
                let before = *elapsed;
                *elapsed += dt;
                for tween in tweens.iter_mut() {
                    tween.update(dt);
                }
                if !tweens.iter().all(Tween::is_complete) {
                    return None;
                }
                let length = tweens
                    .iter()
                    .filter_map(Tween::total_duration)
                    .fold(0.0_f32, f32::max);
                Some((before + dt - length).clamp(0.0, dt))
            }
        }
    }
}

/// 补间时间线
#[derive(Debug, Default)]
pub struct Timeline {
    steps: Vec<Step>,
    current: usize,
    paused: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加顺序步骤
    pub fn append(mut self, tween: Tween) -> Self {
        self.steps.push(Step::Group {
            tweens: vec![tween],
            elapsed: 0.0,
        });
        self
    }

    /// 与上一步并行
    pub fn join(mut self, tween: Tween) -> Self {
        match self.steps.last_mut() {
            Some(Step::Group { tweens, .. }) => tweens.push(tween),
            _ => {
                self.steps.push(Step::Group {
                    tweens: vec![tween],
                    elapsed: 0.0,
                });
            }
        }
        self
    }

    /// 插入等待
    pub fn delay(mut self, seconds: f32) -> Self {
        self.steps.push(Step::Delay {
            duration: seconds.max(0.0),
            elapsed: 0.0,
        });
        self
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// 推进时间
    pub fn update(&mut self, dt: f32) {
        if self.paused {
            return;
        }
        let mut remaining = dt.max(0.0);
        while let Some(step) = self.steps.get_mut(self.current) {
            match step.advance(remaining) {
                Some(left) => {
                    remaining = left;
                    self.current += 1;
                }
                None => break,
            }
        }
    }

    /// 跳到终点：所有补间立即完成
    pub fn finish(&mut self) {
        for step in &mut self.steps[self.current..] {
            if let Step::Group { tweens, .. } = step {
                for tween in tweens.iter_mut() {
                    tween.finish();
                }
            }
        }
        self.current = self.steps.len();
    }

    pub fn state(&self) -> TweenState {
        if self.is_complete() {
            TweenState::Completed
        } else if self.paused {
            TweenState::Paused
        } else if self.current == 0 && self.steps.first().is_some_and(Step::is_untouched) {
            TweenState::Idle
        } else {
            TweenState::Running
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.steps.len()
    }

    /// 步骤数
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 查看某一步中的补间
    pub fn tween(&self, step: usize, index: usize) -> Option<&Tween> {
        match self.steps.get(step)? {
            Step::Group { tweens, .. } => tweens.get(index),
            Step::Delay { .. } => None,
        }
    }
}

impl Step {
    fn is_untouched(&self) -> bool {
        match self {
            Step::Group { elapsed, .. } | Step::Delay { elapsed, .. } => *elapsed == 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::EasingFunction;

    fn linear(from: f32, to: f32, d: f32) -> Tween {
        Tween::float(from, to, d, EasingFunction::Linear)
    }

    #[test]
    fn test_sequential_steps_carry_leftover_time() {
        let mut tl = Timeline::new().append(linear(0.0, 1.0, 1.0)).append(linear(0.0, 10.0, 1.0));
        tl.update(1.5);
        assert!(tl.tween(0, 0).unwrap().is_complete());
        assert_eq!(tl.tween(1, 0).unwrap().float_value(), Some(5.0));
        tl.update(0.5);
        assert!(tl.is_complete());
    }

    #[test]
    fn test_join_runs_in_parallel() {
        let mut tl = Timeline::new()
            .append(linear(0.0, 1.0, 1.0))
            .join(linear(0.0, 4.0, 2.0));
        assert_eq!(tl.len(), 1);
        tl.update(1.0);
        assert!(tl.tween(0, 0).unwrap().is_complete());
        assert!(!tl.is_complete());
        tl.update(1.0);
        assert!(tl.is_complete());
        assert_eq!(tl.tween(0, 1).unwrap().float_value(), Some(4.0));
    }

    #[test]
    fn test_delay_postpones_next_step() {
        let mut tl = Timeline::new().delay(0.5).append(linear(0.0, 1.0, 1.0));
        assert_eq!(tl.state(), TweenState::Idle);
        tl.update(0.25);
        assert_eq!(tl.tween(1, 0).unwrap().state(), TweenState::Idle);
        tl.update(0.75);
        assert_eq!(tl.tween(1, 0).unwrap().float_value(), Some(0.5));
    }

    #[test]
    fn test_finish_completes_everything() {
        let mut tl = Timeline::new().append(linear(0.0, 1.0, 1.0)).delay(3.0);
        tl.finish();
        assert!(tl.is_complete());
        assert_eq!(tl.tween(0, 0).unwrap().float_value(), Some(1.0));
    }
}
