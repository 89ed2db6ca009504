//! 操作码定义

use serde::{Deserialize, Serialize};

/// 虚拟机操作码（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Halt = 0x01,
    Jump = 0x02,
    JumpIf = 0x03,
    JumpIfNot = 0x04,
    Call = 0x05,
    Return = 0x06,

    PushInt = 0x10,
    PushConst = 0x11,
    PushString = 0x12,
    PushBool = 0x13,
    Pop = 0x14,
    Dup = 0x15,

    LoadVar = 0x20,
    StoreVar = 0x21,
    LoadFlag = 0x22,
    StoreFlag = 0x23,

    Add = 0x30,
    Sub = 0x31,
    Mul = 0x32,
    Div = 0x33,
    Mod = 0x34,
    Neg = 0x35,

    Eq = 0x40,
    Ne = 0x41,
    Lt = 0x42,
    Le = 0x43,
    Gt = 0x44,
    Ge = 0x45,
    And = 0x46,
    Or = 0x47,
    Not = 0x48,

    ShowBackground = 0x50,
    ShowCharacter = 0x51,
    HideCharacter = 0x52,
    ShowText = 0x53,
    Choice = 0x54,
    Wait = 0x55,
    PlaySound = 0x56,
    PlayMusic = 0x57,
    StopMusic = 0x58,
    Transition = 0x59,
    GotoScene = 0x5A,
    HideDialogue = 0x5B,
}

/// 操作数的含义（用于反汇编与引擎调用参数解析）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// 不使用操作数
    None,
    /// 指令地址
    Address,
    /// 有符号立即数
    Immediate,
    /// 常量池索引
    Constant,
    /// 字符串表索引
    String,
    /// 计数或时长
    Count,
}

impl Opcode {
    /// 全部操作码
    pub const ALL: [Opcode; 44] = [
        Self::Nop,
        Self::Halt,
        Self::Jump,
        Self::JumpIf,
        Self::JumpIfNot,
        Self::Call,
        Self::Return,
        Self::PushInt,
        Self::PushConst,
        Self::PushString,
        Self::PushBool,
        Self::Pop,
        Self::Dup,
        Self::LoadVar,
        Self::StoreVar,
        Self::LoadFlag,
        Self::StoreFlag,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Neg,
        Self::Eq,
        Self::Ne,
        Self::Lt,
        Self::Le,
        Self::Gt,
        Self::Ge,
        Self::And,
        Self::Or,
        Self::Not,
        Self::ShowBackground,
        Self::ShowCharacter,
        Self::HideCharacter,
        Self::ShowText,
        Self::Choice,
        Self::Wait,
        Self::PlaySound,
        Self::PlayMusic,
        Self::StopMusic,
        Self::Transition,
        Self::GotoScene,
        Self::HideDialogue,
    ];

    /// 从字节解码；不在集合内返回 `None`
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    /// 助记符
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Halt => "HALT",
            Self::Jump => "JUMP",
            Self::JumpIf => "JUMP_IF",
            Self::JumpIfNot => "JUMP_IF_NOT",
            Self::Call => "CALL",
            Self::Return => "RETURN",
            Self::PushInt => "PUSH_INT",
            Self::PushConst => "PUSH_CONST",
            Self::PushString => "PUSH_STRING",
            Self::PushBool => "PUSH_BOOL",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::LoadVar => "LOAD_VAR",
            Self::StoreVar => "STORE_VAR",
            Self::LoadFlag => "LOAD_FLAG",
            Self::StoreFlag => "STORE_FLAG",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Neg => "NEG",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::ShowBackground => "SHOW_BACKGROUND",
            Self::ShowCharacter => "SHOW_CHARACTER",
            Self::HideCharacter => "HIDE_CHARACTER",
            Self::ShowText => "SHOW_TEXT",
            Self::Choice => "CHOICE",
            Self::Wait => "WAIT",
            Self::PlaySound => "PLAY_SOUND",
            Self::PlayMusic => "PLAY_MUSIC",
            Self::StopMusic => "STOP_MUSIC",
            Self::Transition => "TRANSITION",
            Self::GotoScene => "GOTO_SCENE",
            Self::HideDialogue => "HIDE_DIALOGUE",
        }
    }

    /// 操作数含义
    pub fn operand_kind(&self) -> OperandKind {
        match self {
            Self::Jump | Self::JumpIf | Self::JumpIfNot | Self::Call => OperandKind::Address,
            Self::PushInt | Self::PushBool => OperandKind::Immediate,
            Self::PushConst => OperandKind::Constant,
            Self::PushString
            | Self::LoadVar
            | Self::StoreVar
            | Self::LoadFlag
            | Self::StoreFlag
            | Self::ShowBackground
            | Self::ShowCharacter
            | Self::HideCharacter
            | Self::ShowText
            | Self::PlaySound
            | Self::PlayMusic
            | Self::Transition
            | Self::GotoScene => OperandKind::String,
            Self::Choice | Self::Wait => OperandKind::Count,
            _ => OperandKind::None,
        }
    }

    /// 是否为引擎操作码（交由宿主回调处理）
    pub fn is_engine(&self) -> bool {
        (*self as u8) >= 0x50
    }

    /// 引擎操作码从值栈弹出的参数个数
    ///
    /// `CHOICE` 的参数个数等于操作数（选项数）。
    pub fn engine_arity(&self, operand: u32) -> usize {
        match self {
            Self::ShowCharacter => 2,
            Self::ShowText | Self::Transition => 1,
            Self::Choice => operand as usize,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_roundtrip_and_unknown() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
        assert_eq!(Opcode::from_u8(0x07), None);
    }

    #[test]
    fn test_engine_opcodes() {
        assert!(Opcode::ShowText.is_engine());
        assert!(!Opcode::Add.is_engine());
        assert_eq!(Opcode::Choice.engine_arity(3), 3);
        assert_eq!(Opcode::ShowCharacter.engine_arity(0), 2);
    }
}
