//! # Resource Error 模块

use nm_runtime::ErrorKind;
use thiserror::Error;

use crate::vfs::VfsError;

/// 资源管理错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// 资源解码失败
    #[error("加载 {kind} 资源失败: {path} - {message}")]
    LoadFailed {
        path: String,
        /// 资源类型（texture, font 等）
        kind: String,
        message: String,
    },

    #[error("无效的资源格式: {path} - {message}")]
    InvalidFormat { path: String, message: String },

    #[error("资源预加载已取消: {path}")]
    Cancelled { path: String },

    #[error(transparent)]
    Vfs(#[from] VfsError),
}

impl ResourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LoadFailed { .. } | Self::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            Self::Cancelled { .. } => ErrorKind::Timeout,
            Self::Vfs(e) => e.kind(),
        }
    }

    pub(crate) fn load_failed(path: &str, kind: &str, message: impl ToString) -> Self {
        Self::LoadFailed {
            path: path.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}
