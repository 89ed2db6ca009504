//! # Bytecode 模块
//!
//! 叙事脚本的字节码格式：文件头、定长指令、常量池、字符串表和节点符号表。
//!
//! ## 文件布局
//!
//! ```text
//! magic u32 "NMSC" │ version u16 │ flags u16 │ instructionCount u32
//! │ constantPoolSize u32 │ stringCount u32 │ symbolTableSize u32
//! │ instructions[{opcode u8, operand u32}]
//! │ constants[{tag u8, value 8B}]
//! │ strings[NUL 结尾 UTF-8]
//! │ symbols[{name u32, instruction u32}]
//! ```

mod builder;
mod error;
mod opcode;
mod program;

pub use builder::{Label, ProgramBuilder};
pub use error::BytecodeError;
pub use opcode::{OperandKind, Opcode};
pub use program::{Constant, Instruction, Program, ProgramHeader, Symbol};

/// 魔数 "NMSC"
pub const MAGIC: u32 = u32::from_le_bytes(*b"NMSC");

/// 唯一支持的字节码版本
pub const BYTECODE_VERSION: u16 = 1;

/// 文件头大小
pub const HEADER_SIZE: usize = 24;

/// 单条指令大小
pub const INSTRUCTION_SIZE: usize = 5;

pub const MAX_INSTRUCTIONS: usize = 1 << 20;
pub const MAX_CONSTANTS: usize = 1 << 20;
pub const MAX_STRINGS: usize = 1 << 20;
pub const MAX_STRING_LEN: usize = 1 << 20;
pub const MAX_SYMBOLS: usize = 1 << 16;
