//! 程序构建器
//!
//! 以汇编方式构造 [`Program`]，字符串自动去重，跳转目标通过标签回填。

use std::collections::HashMap;

use super::opcode::Opcode;
use super::program::{Constant, Instruction, Program, Symbol};

/// 跳转标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// 字节码程序构建器
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    string_index: HashMap<String, u32>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一条指令的地址
    pub fn here(&self) -> u32 {
        self.program.instructions.len() as u32
    }

    /// 追加一条指令，返回其地址
    pub fn emit(&mut self, opcode: Opcode, operand: u32) -> usize {
        self.program.instructions.push(Instruction::new(opcode, operand));
        self.program.instructions.len() - 1
    }

    /// 追加原始字节指令（可以是未定义的操作码）
    pub fn emit_raw(&mut self, opcode: u8, operand: u32) -> usize {
        self.program.instructions.push(Instruction { opcode, operand });
        self.program.instructions.len() - 1
    }

    /// 字符串入表（去重）
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&index) = self.string_index.get(s) {
            return index;
        }
        let index = self.program.strings.len() as u32;
        self.program.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), index);
        index
    }

    /// 常量入池
    pub fn constant(&mut self, constant: Constant) -> u32 {
        if let Some(pos) = self.program.constants.iter().position(|c| *c == constant) {
            return pos as u32;
        }
        self.program.constants.push(constant);
        (self.program.constants.len() - 1) as u32
    }

    /// 新建未绑定标签
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// 将标签绑定到当前地址
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.here());
    }

    /// 在当前地址登记节点锚点
    pub fn node(&mut self, name: &str) {
        let name = self.intern(name);
        let instruction = self.here();
        self.program.symbols.push(Symbol { name, instruction });
    }

    fn emit_to(&mut self, opcode: Opcode, label: Label) {
        let at = self.emit(opcode, 0);
        self.fixups.push((at, label));
    }

    pub fn jump_to(&mut self, label: Label) {
        self.emit_to(Opcode::Jump, label);
    }

    pub fn jump_if(&mut self, label: Label) {
        self.emit_to(Opcode::JumpIf, label);
    }

    pub fn jump_if_not(&mut self, label: Label) {
        self.emit_to(Opcode::JumpIfNot, label);
    }

    pub fn call(&mut self, label: Label) {
        self.emit_to(Opcode::Call, label);
    }

    pub fn push_int(&mut self, value: i32) {
        self.emit(Opcode::PushInt, value as u32);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.emit(Opcode::PushBool, value as u32);
    }

    pub fn push_string(&mut self, value: &str) {
        let index = self.intern(value);
        self.emit(Opcode::PushString, index);
    }

    pub fn push_const_int(&mut self, value: i64) {
        let index = self.constant(Constant::Int(value));
        self.emit(Opcode::PushConst, index);
    }

    pub fn push_const_float(&mut self, value: f64) {
        let index = self.constant(Constant::Float(value));
        self.emit(Opcode::PushConst, index);
    }

    fn emit_named(&mut self, opcode: Opcode, name: &str) {
        let index = self.intern(name);
        self.emit(opcode, index);
    }

    pub fn load_var(&mut self, name: &str) {
        self.emit_named(Opcode::LoadVar, name);
    }

    pub fn store_var(&mut self, name: &str) {
        self.emit_named(Opcode::StoreVar, name);
    }

    pub fn load_flag(&mut self, name: &str) {
        self.emit_named(Opcode::LoadFlag, name);
    }

    pub fn store_flag(&mut self, name: &str) {
        self.emit_named(Opcode::StoreFlag, name);
    }

    pub fn show_background(&mut self, texture: &str) {
        self.emit_named(Opcode::ShowBackground, texture);
    }

    /// 显示角色：依次压入 characterId 与 slot
    pub fn show_character(&mut self, id: &str, character_id: &str, slot: &str) {
        self.push_string(character_id);
        self.push_string(slot);
        self.emit_named(Opcode::ShowCharacter, id);
    }

    pub fn hide_character(&mut self, id: &str) {
        self.emit_named(Opcode::HideCharacter, id);
    }

    /// 显示文本（说话人须已在栈顶）
    pub fn show_text(&mut self, text: &str) {
        self.emit_named(Opcode::ShowText, text);
    }

    /// 压入说话人并显示文本
    pub fn say(&mut self, speaker: &str, text: &str) {
        self.push_string(speaker);
        self.show_text(text);
    }

    /// 显示选项
    pub fn choice(&mut self, options: &[&str]) {
        for option in options {
            self.push_string(option);
        }
        self.emit(Opcode::Choice, options.len() as u32);
    }

    pub fn wait_ms(&mut self, millis: u32) {
        self.emit(Opcode::Wait, millis);
    }

    pub fn play_sound(&mut self, sound: &str) {
        self.emit_named(Opcode::PlaySound, sound);
    }

    pub fn play_music(&mut self, music: &str) {
        self.emit_named(Opcode::PlayMusic, music);
    }

    pub fn stop_music(&mut self) {
        self.emit(Opcode::StopMusic, 0);
    }

    pub fn transition(&mut self, kind: &str, duration: f64) {
        self.push_const_float(duration);
        self.emit_named(Opcode::Transition, kind);
    }

    pub fn goto_scene(&mut self, scene: &str) {
        self.emit_named(Opcode::GotoScene, scene);
    }

    pub fn hide_dialogue(&mut self) {
        self.emit(Opcode::HideDialogue, 0);
    }

    pub fn halt(&mut self) {
        self.emit(Opcode::Halt, 0);
    }

    /// 回填跳转并产出程序
    ///
    /// 未绑定的标签指向程序末尾，执行到该处时正常停机。
    pub fn build(mut self) -> Program {
        let end = self.here();
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].unwrap_or(end);
            self.program.instructions[at].operand = target;
        }
        self.program
    }
}
