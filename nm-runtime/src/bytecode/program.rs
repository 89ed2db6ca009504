//! 字节码程序的二进制编解码

use serde::{Deserialize, Serialize};

use super::error::BytecodeError;
use super::opcode::{OperandKind, Opcode};
use super::{
    BYTECODE_VERSION, HEADER_SIZE, INSTRUCTION_SIZE, MAGIC, MAX_CONSTANTS, MAX_INSTRUCTIONS,
    MAX_STRING_LEN, MAX_STRINGS, MAX_SYMBOLS,
};
use crate::codec::{ByteReader, ByteWriter, ShortRead};

/// 单条指令
///
/// `opcode` 保留原始字节，未知操作码在执行时才报错。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: u8,
    pub operand: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: u32) -> Self {
        Self {
            opcode: opcode as u8,
            operand,
        }
    }

    /// 解码操作码
    pub fn decode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }
}

/// 常量池条目
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
}

/// 符号表条目：节点名到指令地址的锚点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// 名称在字符串表中的索引
    pub name: u32,
    /// 锚定的指令地址
    pub instruction: u32,
}

/// 字节码文件头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub instruction_count: u32,
    pub constant_pool_size: u32,
    pub string_count: u32,
    pub symbol_table_size: u32,
}

impl ProgramHeader {
    /// 从字节解码文件头（仅检查长度）
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BytecodeError> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            magic: r.u32().map_err(truncated)?,
            version: r.u16().map_err(truncated)?,
            flags: r.u16().map_err(truncated)?,
            instruction_count: r.u32().map_err(truncated)?,
            constant_pool_size: r.u32().map_err(truncated)?,
            string_count: r.u32().map_err(truncated)?,
            symbol_table_size: r.u32().map_err(truncated)?,
        })
    }

    /// 编码为 24 字节
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut w = ByteWriter::with_capacity(HEADER_SIZE);
        w.u32(self.magic)
            .u16(self.version)
            .u16(self.flags)
            .u32(self.instruction_count)
            .u32(self.constant_pool_size)
            .u32(self.string_count)
            .u32(self.symbol_table_size);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&w.into_inner());
        out
    }
}

fn truncated(e: ShortRead) -> BytecodeError {
    BytecodeError::Truncated {
        needed: e.needed,
        available: e.available,
    }
}

fn check_count(what: &'static str, count: u32, limit: usize) -> Result<usize, BytecodeError> {
    let count = count as usize;
    if count > limit {
        return Err(BytecodeError::CountExceedsLimit { what, count, limit });
    }
    Ok(count)
}

/// 已加载的字节码程序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub flags: u16,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub strings: Vec<String>,
    pub symbols: Vec<Symbol>,
}

impl Program {
    /// 解析字节码
    ///
    /// 所有计数先与剩余负载长度比对，再分配内存；负载必须恰好被消费完。
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BytecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(BytecodeError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let header = ProgramHeader::from_bytes(bytes)?;
        if header.magic != MAGIC {
            return Err(BytecodeError::InvalidMagic(header.magic));
        }
        if header.version != BYTECODE_VERSION {
            return Err(BytecodeError::UnsupportedVersion(header.version));
        }

        let instruction_count =
            check_count("instructions", header.instruction_count, MAX_INSTRUCTIONS)?;
        let constant_count = check_count("constants", header.constant_pool_size, MAX_CONSTANTS)?;
        let string_count = check_count("strings", header.string_count, MAX_STRINGS)?;
        let symbol_count = check_count("symbols", header.symbol_table_size, MAX_SYMBOLS)?;

        let mut r = ByteReader::new(&bytes[HEADER_SIZE..]);

        // 定长区段可以在分配前确认长度
        let fixed = instruction_count * INSTRUCTION_SIZE + constant_count * 9;
        if fixed > r.remaining() {
            return Err(BytecodeError::Truncated {
                needed: fixed,
                available: r.remaining(),
            });
        }

        let mut instructions = Vec::with_capacity(instruction_count);
        for _ in 0..instruction_count {
            let opcode = r.u8().map_err(truncated)?;
            let operand = r.u32().map_err(truncated)?;
            instructions.push(Instruction { opcode, operand });
        }

        let mut constants = Vec::with_capacity(constant_count);
        for index in 0..constant_count {
            let tag = r.u8().map_err(truncated)?;
            let raw = r.array::<8>().map_err(truncated)?;
            constants.push(match tag {
                0 => Constant::Int(i64::from_le_bytes(raw)),
                1 => Constant::Float(f64::from_le_bytes(raw)),
                other => return Err(BytecodeError::InvalidConstantTag { index, tag: other }),
            });
        }

        // 每个字符串至少占 1 字节（NUL）
        if string_count > r.remaining() {
            return Err(BytecodeError::Truncated {
                needed: string_count,
                available: r.remaining(),
            });
        }
        let mut strings = Vec::with_capacity(string_count);
        for index in 0..string_count {
            let raw = r
                .nul_terminated()
                .ok_or(BytecodeError::Unterminated { index })?;
            if raw.len() > MAX_STRING_LEN {
                return Err(BytecodeError::CountExceedsLimit {
                    what: "string length",
                    count: raw.len(),
                    limit: MAX_STRING_LEN,
                });
            }
            let s = std::str::from_utf8(raw).map_err(|_| BytecodeError::InvalidUtf8 { index })?;
            strings.push(s.to_string());
        }

        let symbol_bytes = symbol_count * 8;
        if symbol_bytes > r.remaining() {
            return Err(BytecodeError::Truncated {
                needed: symbol_bytes,
                available: r.remaining(),
            });
        }
        let mut symbols = Vec::with_capacity(symbol_count);
        for _ in 0..symbol_count {
            let name = r.u32().map_err(truncated)?;
            let instruction = r.u32().map_err(truncated)?;
            symbols.push(Symbol { name, instruction });
        }

        if !r.is_empty() {
            return Err(BytecodeError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            flags: header.flags,
            instructions,
            constants,
            strings,
            symbols,
        })
    }

    /// 序列化为字节码
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = ProgramHeader {
            magic: MAGIC,
            version: BYTECODE_VERSION,
            flags: self.flags,
            instruction_count: self.instructions.len() as u32,
            constant_pool_size: self.constants.len() as u32,
            string_count: self.strings.len() as u32,
            symbol_table_size: self.symbols.len() as u32,
        };

        let mut w = ByteWriter::with_capacity(
            HEADER_SIZE + self.instructions.len() * INSTRUCTION_SIZE + self.constants.len() * 9,
        );
        w.bytes(&header.to_bytes());
        for ins in &self.instructions {
            w.u8(ins.opcode).u32(ins.operand);
        }
        for constant in &self.constants {
            match constant {
                Constant::Int(v) => w.u8(0).i64(*v),
                Constant::Float(v) => w.u8(1).f64(*v),
            };
        }
        for s in &self.strings {
            w.bytes(s.as_bytes()).u8(0);
        }
        for sym in &self.symbols {
            w.u32(sym.name).u32(sym.instruction);
        }
        w.into_inner()
    }

    /// 按名称查找节点锚点
    pub fn find_symbol(&self, name: &str) -> Option<u32> {
        self.symbols
            .iter()
            .find(|sym| self.strings.get(sym.name as usize).map(String::as_str) == Some(name))
            .map(|sym| sym.instruction)
    }

    /// 包含指定地址的节点名（地址不大于 ip 的最近锚点）
    pub fn node_at(&self, ip: u32) -> Option<&str> {
        self.symbols
            .iter()
            .filter(|sym| sym.instruction <= ip)
            .max_by_key(|sym| sym.instruction)
            .and_then(|sym| self.strings.get(sym.name as usize))
            .map(String::as_str)
    }

    /// 反汇编单条指令
    pub fn disassemble(&self, ip: u32) -> String {
        let Some(ins) = self.instructions.get(ip as usize) else {
            return format!("{:04} <end>", ip);
        };
        let Some(op) = ins.decode() else {
            return format!("{:04} ??? 0x{:02X} {}", ip, ins.opcode, ins.operand);
        };
        let operand = match op.operand_kind() {
            OperandKind::None => String::new(),
            OperandKind::Address => format!(" @{}", ins.operand),
            OperandKind::Immediate => format!(" {}", ins.operand as i32),
            OperandKind::Count => format!(" {}", ins.operand),
            OperandKind::Constant => match self.constants.get(ins.operand as usize) {
                Some(Constant::Int(v)) => format!(" {}", v),
                Some(Constant::Float(v)) => format!(" {:?}", v),
                None => format!(" #{}?", ins.operand),
            },
            OperandKind::String => match self.strings.get(ins.operand as usize) {
                Some(s) => format!(" {:?}", s),
                None => format!(" ${}?", ins.operand),
            },
        };
        format!("{:04} {}{}", ip, op.mnemonic(), operand)
    }

    /// 反汇编整个程序
    pub fn disassemble_all(&self) -> String {
        let mut out = String::new();
        for ip in 0..self.instructions.len() as u32 {
            for sym in self.symbols.iter().filter(|s| s.instruction == ip) {
                if let Some(name) = self.strings.get(sym.name as usize) {
                    out.push_str(name);
                    out.push_str(":\n");
                }
            }
            out.push_str("  ");
            out.push_str(&self.disassemble(ip));
            out.push('\n');
        }
        out
    }
}
