//! # Manager 模块
//!
//! 按名称追踪动画，`update` 时移除已完成的条目。

use std::collections::HashMap;

use super::timeline::Timeline;
use super::tween::Tween;

/// 受管理的动画
#[derive(Debug)]
pub enum ManagedAnimation {
    Tween(Tween),
    Timeline(Timeline),
}

impl ManagedAnimation {
    fn update(&mut self, dt: f32) {
        match self {
            Self::Tween(t) => t.update(dt),
            Self::Timeline(t) => t.update(dt),
        }
    }

    fn finish(&mut self) {
        match self {
            Self::Tween(t) => t.finish(),
            Self::Timeline(t) => t.finish(),
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            Self::Tween(t) => t.is_complete(),
            Self::Timeline(t) => t.is_complete(),
        }
    }
}

impl From<Tween> for ManagedAnimation {
    fn from(t: Tween) -> Self {
        Self::Tween(t)
    }
}

impl From<Timeline> for ManagedAnimation {
    fn from(t: Timeline) -> Self {
        Self::Timeline(t)
    }
}

/// 动画管理器
#[derive(Debug, Default)]
pub struct AnimationManager {
    animations: HashMap<String, ManagedAnimation>,
}

impl AnimationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加动画，同名动画会被替换
    pub fn add(&mut self, name: impl Into<String>, animation: impl Into<ManagedAnimation>) {
        self.animations.insert(name.into(), animation.into());
    }

    /// 推进所有动画，返回本帧完成并被移除的名称（按名称排序）
    pub fn update(&mut self, dt: f32) -> Vec<String> {
        for animation in self.animations.values_mut() {
            animation.update(dt);
        }
        self.remove_completed()
    }

    /// 让所有动画立即完成（快进）并移除
    pub fn finish_all(&mut self) -> Vec<String> {
        for animation in self.animations.values_mut() {
            animation.finish();
        }
        self.remove_completed()
    }

    fn remove_completed(&mut self) -> Vec<String> {
        let mut done: Vec<String> = self
            .animations
            .iter()
            .filter(|(_, a)| a.is_complete())
            .map(|(name, _)| name.clone())
            .collect();
        done.sort();
        for name in &done {
            self.animations.remove(name);
        }
        done
    }

    /// 停止并移除
    pub fn stop(&mut self, name: &str) -> bool {
        self.animations.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ManagedAnimation> {
        self.animations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.animations.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.animations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.animations.is_empty()
    }

    pub fn clear(&mut self) {
        self.animations.clear();
    }
}
