//! # Scene 模块
//!
//! 分层、可观察的场景图。
//!
//! ## 设计原则
//!
//! - 固定四层：Background、Characters、UI、Effects，按此顺序更新与渲染
//! - 层独占其对象，对象独占其子对象；`parent` 只是 id，不持有所有权
//! - 所有属性修改经由 [`SceneGraph`] 进行，并同步通知观察者
//! - 读档是整体替换：先构造并校验全部对象，再一次性换入，观察者只收到一次 `on_scene_loaded`
//!
//! ## 逐字效果与对象动画
//!
//! 文本内联的 `{shake}`/`{wave}` 只作用于单个字符，由对话框内的打字机计算；
//! [`SceneGraph::animate_property`] 驱动整个对象的变换。两者互不覆盖，渲染时偏移相加。

mod choice;
mod draw;
mod graph;
mod object;
mod observer;
mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

pub use choice::{ChoiceMenu, ChoiceOption};
pub use graph::{BACKGROUND_ID, CHOICES_ID, DIALOGUE_ID, SceneGraph};
pub use object::{
    AnimatedProperty, CharacterSlot, DialogueBox, EffectState, OverlayEffect, SceneObject,
    SceneObjectKind, SceneObjectType,
};
pub use observer::{PropertyChange, SceneObserver};
pub use state::{LayerState, SceneObjectState, SceneState};

/// 层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerKind {
    Background,
    Characters,
    Ui,
    Effects,
}

impl LayerKind {
    /// 渲染顺序
    pub const ALL: [LayerKind; 4] = [
        LayerKind::Background,
        LayerKind::Characters,
        LayerKind::Ui,
        LayerKind::Effects,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::Background => 0,
            Self::Characters => 1,
            Self::Ui => 2,
            Self::Effects => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Background => "Background",
            Self::Characters => "Characters",
            Self::Ui => "UI",
            Self::Effects => "Effects",
        }
    }
}

/// 场景层
#[derive(Debug)]
pub struct Layer {
    kind: LayerKind,
    objects: Vec<SceneObject>,
    visible: bool,
    alpha: f32,
}

impl Layer {
    fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            objects: Vec::new(),
            visible: true,
            alpha: 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// 顶层对象（按 zOrder 升序）
    pub fn objects(&self) -> &[SceneObject] {
        &self.objects
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }
}

/// 场景错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SceneError {
    #[error("对象不存在: {id}")]
    NotFound { id: String },

    #[error("对象 id 重复: {id}")]
    DuplicateId { id: String },

    #[error("对象 {id} 的属性 {property} 取值无效: {value}")]
    InvalidProperty {
        id: String,
        property: String,
        value: String,
    },

    #[error("对象 {id} 的属性 {property} 不支持动画")]
    NotAnimatable { id: String, property: String },

    #[error("场景状态不一致: {0}")]
    StateCorruption(String),
}

impl SceneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidProperty { .. } | Self::NotAnimatable { .. } => ErrorKind::InvalidFormat,
            Self::DuplicateId { .. } | Self::StateCorruption(_) => ErrorKind::StateCorruption,
        }
    }
}
