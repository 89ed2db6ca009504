//! 场景状态快照
//!
//! 快照是扁平的记录列表：按层顺序、层内按深度优先排列，
//! 子对象通过 `parent` 引用排在其前面的父对象。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::LayerKind;
use super::object::SceneObjectType;

/// 单个对象的扁平记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneObjectState {
    pub id: String,
    pub object_type: SceneObjectType,
    pub layer: LayerKind,
    #[serde(default)]
    pub parent: Option<String>,
    pub x: f32,
    pub y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation: f32,
    pub anchor_x: f32,
    pub anchor_y: f32,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
    pub alpha: f32,
    pub visible: bool,
    pub z_order: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// 层的可见性与透明度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub kind: LayerKind,
    pub visible: bool,
    pub alpha: f32,
}

/// 场景快照
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneState {
    pub scene_id: String,
    pub objects: Vec<SceneObjectState>,
    #[serde(default)]
    pub active_background: Option<String>,
    #[serde(default)]
    pub visible_characters: Vec<String>,
    #[serde(default)]
    pub layers: Vec<LayerState>,
}

impl SceneState {
    /// 序列化为 JSON 字节（检查点使用）
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
