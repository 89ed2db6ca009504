//! # Animation 模块
//!
//! 补间、时间线与命名动画管理。
//!
//! ## 设计原则
//!
//! - 缓动输入统一截断到 `[0, 1]`，端点严格为 0 和 1
//! - 补间自行持有当前值，调用方每帧读取
//! - `update(dt)` 同步完成，不会挂起

mod easing;
mod manager;
mod timeline;
mod tween;

pub use easing::EasingFunction;
pub use manager::{AnimationManager, ManagedAnimation};
pub use timeline::Timeline;
pub use tween::{Tween, TweenState, TweenValue};
