//! # Error 模块
//!
//! 定义 nm-runtime 中使用的错误类型与统一错误分类。
//!
//! 每个子系统拥有自己的错误枚举，并通过 `kind()` 映射到固定的 [`ErrorKind`] 分类，
//! 宿主层据此决定错误的传播与展示方式。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::BytecodeError;
use crate::localization::LocalizationError;
use crate::save::SaveError;
use crate::scene::SceneError;
use crate::vm::VmFault;

/// 固定的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 格式错误（魔数、截断等）
    InvalidFormat,
    /// 版本不受支持
    UnsupportedVersion,
    /// 校验和或认证标签不匹配
    IntegrityFailure,
    /// 密钥错误或解密失败
    DecryptionFailure,
    /// 签名验证失败
    SignatureInvalid,
    /// 缺少密钥
    KeyMissing,
    /// 资源、槽位或字符串不存在
    NotFound,
    /// 底层存储错误
    IOError,
    /// 数量超出上限
    CountExceedsLimit,
    /// 依赖缺失
    DependencyMissing,
    /// 脚本执行错误
    ScriptExecution,
    /// 看门狗超时
    Timeout,
    /// 场景状态不一致
    StateCorruption,
    /// 存档损坏
    Corrupted,
}

impl ErrorKind {
    /// 分类名称（用于日志与调试面板）
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "InvalidFormat",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::IntegrityFailure => "IntegrityFailure",
            Self::DecryptionFailure => "DecryptionFailure",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::KeyMissing => "KeyMissing",
            Self::NotFound => "NotFound",
            Self::IOError => "IOError",
            Self::CountExceedsLimit => "CountExceedsLimit",
            Self::DependencyMissing => "DependencyMissing",
            Self::ScriptExecution => "ScriptExecution",
            Self::Timeout => "Timeout",
            Self::StateCorruption => "StateCorruption",
            Self::Corrupted => "Corrupted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// nm-runtime 统一错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VnError {
    /// 字节码错误
    #[error("字节码错误: {0}")]
    Bytecode(#[from] BytecodeError),

    /// 虚拟机错误
    #[error("虚拟机错误: {0}")]
    Vm(#[from] VmFault),

    /// 场景错误
    #[error("场景错误: {0}")]
    Scene(#[from] SceneError),

    /// 本地化错误
    #[error("本地化错误: {0}")]
    Localization(#[from] LocalizationError),

    /// 存档错误
    #[error("存档错误: {0}")]
    Save(#[from] SaveError),
}

impl VnError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bytecode(e) => e.kind(),
            Self::Vm(_) => ErrorKind::ScriptExecution,
            Self::Scene(e) => e.kind(),
            Self::Localization(e) => e.kind(),
            Self::Save(e) => e.kind(),
        }
    }
}

/// Result 类型别名
pub type VnResult<T> = Result<T, VnError>;
