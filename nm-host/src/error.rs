//! # Error 模块
//!
//! 宿主层统一错误类型。低层错误原样包装，分类通过 `kind()` 透传。

use nm_runtime::localization::LocalizationError;
use nm_runtime::{ErrorKind, SaveError, VnError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::resources::ResourceError;
use crate::vfs::VfsError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("资源包错误: {0}")]
    Vfs(#[from] VfsError),

    #[error("存档错误: {0}")]
    Save(#[from] SaveError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("资源错误: {0}")]
    Resource(#[from] ResourceError),

    #[error("本地化错误: {0}")]
    Localization(#[from] LocalizationError),

    #[error("运行时错误: {0}")]
    Runtime(#[from] VnError),

    #[error("密码学错误: {0}")]
    Crypto(#[from] CryptoError),

    #[error("尚未加载脚本")]
    NoScript,

    #[error("未配置存档目录")]
    NoSaveStore,

    #[error("运行时已隔离: {0}")]
    Isolated(String),

    #[error("{operation} 超时（{seconds:.1} 秒）")]
    Timeout { operation: String, seconds: f64 },
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Vfs(e) => e.kind(),
            Self::Save(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::Resource(e) => e.kind(),
            Self::Localization(e) => e.kind(),
            Self::Runtime(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::NoScript | Self::NoSaveStore => ErrorKind::NotFound,
            Self::Isolated(_) => ErrorKind::ScriptExecution,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passthrough() {
        let err: HostError = VfsError::NotFound("a".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err: HostError = SaveError::AuthenticationFailed.into();
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        let err: HostError = CryptoError::InvalidSignature.into();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
        let err = HostError::Timeout {
            operation: "脚本".into(),
            seconds: 5.0,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
