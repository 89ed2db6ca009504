//! # VFS 模块
//!
//! 分层资源包虚拟文件系统。
//!
//! ## 设计原则
//!
//! - 资源 id 是不透明的逻辑路径（`/` 分隔），只作为字符串表中的键
//! - 每个资源 id 由「有效优先级最高」的已启用资源包提供
//! - 挂载、卸载、启用与排序变化后原子地重建索引
//! - 读取返回的缓冲区归调用方所有，卸载不会使其失效
//!
//! ## 模块结构
//!
//! - [`format`]：文件头、资源表、字符串表与内容哈希
//! - [`manifest`]：包清单与依赖版本比较
//! - [`pack`]：单个资源包的打开、校验与解码
//! - [`builder`]：资源包写入（打包工具与测试使用）
//! - [`registry`]：多包注册表与资源索引
//! - [`cached`]：带字节预算的读取缓存
//! - [`keys`]：密钥来源解析

pub mod builder;
pub mod cached;
pub mod format;
pub mod keys;
pub mod manifest;
pub mod pack;
pub mod registry;

use std::path::Path;

use nm_runtime::ErrorKind;
use thiserror::Error;

pub use builder::{BuildEntry, PackBuildOptions, PackBuilder};
pub use cached::CachedVfs;
pub use format::{PackHeader, PackLimits, ResourceEntry, ResourceType};
pub use keys::PackKeys;
pub use manifest::{PackDependency, PackManifest};
pub use pack::{PackOpenOptions, PackReader};
pub use registry::{
    MAX_BASE_PRIORITY, ModConfig, MountResult, PackInfo, PackType, ResourceOverride,
    ResourceRecord, VfsOptions, VirtualFileSystem,
};

/// VFS 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("读写 {path} 失败: {message}")]
    Io { path: String, message: String },

    #[error("资源包魔数无效: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("资源包被截断或区段越界: {0}")]
    Truncated(String),

    #[error("资源包格式错误: {0}")]
    Malformed(String),

    #[error("不支持的资源包版本: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("{what} 数量 {count} 超出上限 {limit}")]
    CountExceedsLimit {
        what: &'static str,
        count: u64,
        limit: u64,
    },

    #[error("资源包签名无效: {0}")]
    SignatureInvalid(String),

    #[error("缺少密钥: {0}")]
    KeyMissing(String),

    #[error("解密失败: {0}")]
    DecryptionFailure(String),

    #[error("资源 {resource} 完整性校验失败: {reason}")]
    IntegrityFailure { resource: String, reason: String },

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("资源包未挂载: {0}")]
    PackNotMounted(String),

    #[error("资源包已挂载: {0}")]
    PackAlreadyMounted(String),

    #[error("资源包 {pack} 缺少依赖: {}", missing.join(", "))]
    DependencyMissing { pack: String, missing: Vec<String> },

    #[error("资源包 {pack} 需要引擎版本 {required}，当前为 {current}")]
    EngineTooOld {
        pack: String,
        required: String,
        current: String,
    },

    #[error("操作已取消")]
    Cancelled,
}

impl VfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::IOError,
            Self::InvalidMagic(_)
            | Self::Truncated(_)
            | Self::Malformed(_)
            | Self::PackAlreadyMounted(_) => ErrorKind::InvalidFormat,
            Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Self::CountExceedsLimit { .. } => ErrorKind::CountExceedsLimit,
            Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Self::KeyMissing(_) => ErrorKind::KeyMissing,
            Self::DecryptionFailure(_) => ErrorKind::DecryptionFailure,
            Self::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            Self::NotFound(_) | Self::PackNotMounted(_) => ErrorKind::NotFound,
            Self::DependencyMissing { .. } | Self::EngineTooOld { .. } => {
                ErrorKind::DependencyMissing
            }
            Self::Cancelled => ErrorKind::Timeout,
        }
    }

    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn integrity(resource: &str, reason: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

/// 规范化资源 id：统一 `/`，去掉 `./`、空段并解析 `..`
pub fn normalize_resource_id(id: &str) -> String {
    let unified = id.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resource_id() {
        assert_eq!(normalize_resource_id("./ui//title.png"), "ui/title.png");
        assert_eq!(normalize_resource_id("bg\\..\\ui\\a.png"), "ui/a.png");
        assert_eq!(normalize_resource_id("a/b/../../c"), "c");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(VfsError::InvalidMagic(0).kind(), ErrorKind::InvalidFormat);
        assert_eq!(VfsError::Cancelled.kind(), ErrorKind::Timeout);
        assert_eq!(
            VfsError::integrity("a", "crc").kind(),
            ErrorKind::IntegrityFailure
        );
        let err = VfsError::DependencyMissing {
            pack: "dlc".into(),
            missing: vec!["base".into(), "core".into()],
        };
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(err.to_string().contains("base, core"));
    }
}
