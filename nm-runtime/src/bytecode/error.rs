//! 字节码加载错误

use thiserror::Error;

use crate::error::ErrorKind;

/// 字节码加载错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BytecodeError {
    /// 魔数不匹配
    #[error("无效的字节码魔数: 0x{0:08X}")]
    InvalidMagic(u32),

    /// 版本不受支持
    #[error("不支持的字节码版本: {0}")]
    UnsupportedVersion(u16),

    /// 数据被截断
    #[error("字节码被截断：需要 {needed} 字节，剩余 {available} 字节")]
    Truncated { needed: usize, available: usize },

    /// 计数超出上限
    #[error("{what} 数量 {count} 超出上限 {limit}")]
    CountExceedsLimit {
        what: &'static str,
        count: usize,
        limit: usize,
    },

    /// 字符串缺少结尾 NUL
    #[error("第 {index} 个字符串缺少结尾 NUL")]
    Unterminated { index: usize },

    /// 字符串不是合法 UTF-8
    #[error("第 {index} 个字符串不是合法 UTF-8")]
    InvalidUtf8 { index: usize },

    /// 常量标签未知
    #[error("第 {index} 个常量的类型标签 {tag} 无效")]
    InvalidConstantTag { index: usize, tag: u8 },

    /// 负载末尾有多余数据
    #[error("字节码末尾有 {0} 字节多余数据")]
    TrailingBytes(usize),
}

impl BytecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Self::CountExceedsLimit { .. } => ErrorKind::CountExceedsLimit,
            _ => ErrorKind::InvalidFormat,
        }
    }
}
