//! 资源包清单
//!
//! 清单存放在保留资源 `__pack__/manifest.json`：
//!
//! ```json
//! {
//!   "id": "dlc_summer",
//!   "name": "Summer DLC",
//!   "version": "1.2.0",
//!   "dependencies": [{ "id": "base", "minVersion": "1.0", "optional": false }],
//!   "minEngineVersion": "0.1.0"
//! }
//! ```
//!
//! 缺少清单时，包 id 取文件名（不含扩展名）。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::VfsError;

/// 当前引擎版本（用于 `minEngineVersion` 检查）
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackDependency {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl PackDependency {
    pub fn required(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            min_version: None,
            optional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<PackDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_engine_version: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl PackManifest {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            dependencies: Vec::new(),
            min_engine_version: None,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, VfsError> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| VfsError::Malformed(format!("包清单解析失败: {}", e)))?;
        if manifest.id.trim().is_empty() {
            return Err(VfsError::Malformed("包清单缺少 id".to_string()));
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    /// 当前引擎是否满足 `minEngineVersion`
    pub fn engine_compatible(&self) -> bool {
        self.min_engine_version
            .as_deref()
            .is_none_or(|required| version_satisfies(ENGINE_VERSION, required))
    }
}

/// 按数字段比较版本号，缺失段视为 0，非数字段视为 0
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split(['.', '-', '+'])
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn version_satisfies(actual: &str, required: &str) -> bool {
    compare_versions(actual, required) != Ordering::Less
}
