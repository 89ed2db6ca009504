//! 虚拟机故障

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 故障类型
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VmFaultKind {
    /// 值栈下溢
    #[error("值栈下溢")]
    StackUnderflow,

    /// 类型不匹配
    #[error("类型不匹配：{op} 不接受 {found}")]
    TypeMismatch { op: String, found: String },

    /// 字符串索引无效
    #[error("字符串索引 {0} 无效")]
    UnknownString(u32),

    /// 常量索引无效
    #[error("常量索引 {0} 无效")]
    UnknownConstant(u32),

    /// 除零
    #[error("除数为零")]
    DivisionByZero,

    /// 未知操作码
    #[error("未知操作码 0x{0:02X}")]
    InvalidOpcode(u8),

    /// 跳转越界
    #[error("跳转目标 {0} 越界")]
    JumpOutOfRange(u32),

    /// 调用栈溢出
    #[error("调用栈溢出")]
    CallStackOverflow,

    /// 值栈溢出
    #[error("值栈溢出")]
    StackOverflow,

    /// 原生回调失败
    #[error("原生回调失败: {0}")]
    Native(String),
}

/// 停机故障：故障类型与冻结的指令地址
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("指令 {ip} 处: {kind}")]
pub struct VmFault {
    pub kind: VmFaultKind,
    pub ip: u32,
}

/// 控制信号错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    /// 当前状态不接受此信号
    #[error("当前状态 {state:?} 不接受此信号")]
    NotWaiting { state: super::RunState },

    /// 选项索引无效
    #[error("无效的选择索引 {index}，有效范围是 0..{count}")]
    InvalidChoice { index: usize, count: usize },
}
