//! # VM 模块
//!
//! 叙事脚本虚拟机：逐条执行字节码，通过引擎回调表产生副作用。
//!
//! ## 状态机
//!
//! ```text
//! Idle -> Running -> (Paused <-> Running)
//!      -> (WaitingForContinue | WaitingForChoice | WaitingForTime) -> Running
//!      -> Halted
//! ```
//!
//! `reset()` 无论当前状态都回到 Idle。
//!
//! ## 设计原则
//!
//! - 单条指令的任何失败都不会越过 `step()` 边界：VM 进入 `Halted`，
//!   记录故障类型和冻结的指令地址
//! - 引擎操作码优先交给已注册的回调；未注册时进入待处理队列，由宿主取走
//! - 变量与标记是扁平的全局命名空间，调用栈不做遮蔽

mod fault;
mod value;

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytecode::{BytecodeError, Constant, OperandKind, Opcode, Program};

pub use fault::{SignalError, VmFault, VmFaultKind};
pub use value::Value;

/// 调用栈深度上限
pub const MAX_CALL_DEPTH: usize = 256;

/// 值栈深度上限
pub const MAX_VALUE_STACK: usize = 65_536;

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// 已加载，尚未执行
    Idle,
    /// 执行中
    Running,
    /// 协作式暂停
    Paused,
    /// 等待继续信号（SHOW_TEXT）
    WaitingForContinue,
    /// 等待选择（CHOICE）
    WaitingForChoice,
    /// 等待时间流逝（WAIT）
    WaitingForTime,
    /// 已停机
    Halted,
}

impl RunState {
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::WaitingForContinue | Self::WaitingForChoice | Self::WaitingForTime
        )
    }
}

/// 调用帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    /// 返回地址
    pub return_ip: u32,
    /// 被调用处的节点名（仅用于调试展示）
    pub scope: String,
}

/// 调试用栈帧信息
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrameInfo {
    /// 深度，0 为当前帧
    pub depth: usize,
    /// 所在节点
    pub node: String,
    /// 帧内指令地址
    pub ip: u32,
}

/// 引擎调用
///
/// 由引擎操作码产生，参数已按压栈顺序排列。
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCall {
    pub opcode: Opcode,
    pub operand: u32,
    /// 操作数解析出的字符串（操作数为字符串索引时）
    pub text: Option<String>,
    pub args: Vec<Value>,
}

impl NativeCall {
    /// 第 n 个参数的字符串形式
    pub fn arg_str(&self, index: usize) -> Option<String> {
        self.args.get(index).map(|v| v.to_string())
    }

    /// 第 n 个参数的数值形式
    pub fn arg_f64(&self, index: usize) -> Option<f64> {
        self.args.get(index).and_then(Value::as_float)
    }
}

/// 原生回调
pub type NativeCallback = Box<dyn FnMut(&NativeCall) -> Result<(), String>>;

/// 可序列化的完整 VM 状态（检查点用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub ip: u32,
    pub call_stack: Vec<CallFrame>,
    pub stack: Vec<Value>,
    pub variables: BTreeMap<String, Value>,
    pub flags: BTreeMap<String, bool>,
    pub state: RunState,
    pub paused_from: Option<RunState>,
    pub fault: Option<VmFault>,
    pub wait_remaining: f64,
    pub choice_count: usize,
}

impl VmSnapshot {
    /// 快照中的指令地址是否都落在程序范围内（末尾地址表示正常停机）
    pub fn fits(&self, program: &Program) -> bool {
        let len = program.instructions.len() as u64;
        u64::from(self.ip) <= len && self.call_stack.iter().all(|f| u64::from(f.return_ip) <= len)
    }
}

/// 叙事脚本虚拟机
pub struct ScriptVm {
    program: Program,
    ip: u32,
    call_stack: Vec<CallFrame>,
    stack: Vec<Value>,
    variables: BTreeMap<String, Value>,
    flags: BTreeMap<String, bool>,
    state: RunState,
    paused_from: Option<RunState>,
    fault: Option<VmFault>,
    wait_remaining: f64,
    choice_count: usize,
    callbacks: HashMap<Opcode, NativeCallback>,
    pending: VecDeque<NativeCall>,
    variables_dirty: bool,
    flags_dirty: bool,
    executed: u64,
}

impl Default for ScriptVm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptVm")
            .field("ip", &self.ip)
            .field("state", &self.state)
            .field("fault", &self.fault)
            .field("instructions", &self.program.instructions.len())
            .finish()
    }
}

type Exec = Result<(), VmFaultKind>;

impl ScriptVm {
    /// 创建空虚拟机（无程序，执行即停机）
    pub fn new() -> Self {
        Self {
            program: Program::default(),
            ip: 0,
            call_stack: Vec::new(),
            stack: Vec::new(),
            variables: BTreeMap::new(),
            flags: BTreeMap::new(),
            state: RunState::Idle,
            paused_from: None,
            fault: None,
            wait_remaining: 0.0,
            choice_count: 0,
            callbacks: HashMap::new(),
            pending: VecDeque::new(),
            variables_dirty: false,
            flags_dirty: false,
            executed: 0,
        }
    }

    /// 解析并加载字节码
    pub fn load(&mut self, bytecode: &[u8]) -> Result<(), BytecodeError> {
        let program = Program::from_bytes(bytecode)?;
        self.load_program(program);
        Ok(())
    }

    /// 加载已解析的程序
    pub fn load_program(&mut self, program: Program) {
        debug!(
            instructions = program.instructions.len(),
            strings = program.strings.len(),
            "加载脚本程序"
        );
        self.program = program;
        self.reset();
    }

    /// 重置到第一条指令（保留回调表）
    pub fn reset(&mut self) {
        self.ip = 0;
        self.call_stack.clear();
        self.stack.clear();
        self.variables.clear();
        self.flags.clear();
        self.state = RunState::Idle;
        self.paused_from = None;
        self.fault = None;
        self.wait_remaining = 0.0;
        self.choice_count = 0;
        self.pending.clear();
        self.variables_dirty = true;
        self.flags_dirty = true;
        self.executed = 0;
    }

    /// 注册引擎操作码的回调
    ///
    /// 非引擎操作码返回 `false`，不做注册。
    pub fn register_callback<F>(&mut self, opcode: Opcode, callback: F) -> bool
    where
        F: FnMut(&NativeCall) -> Result<(), String> + 'static,
    {
        if !opcode.is_engine() {
            return false;
        }
        self.callbacks.insert(opcode, Box::new(callback));
        true
    }

    /// 移除回调
    pub fn unregister_callback(&mut self, opcode: Opcode) {
        self.callbacks.remove(&opcode);
    }

    /// 取走未被回调处理的引擎调用
    pub fn drain_native_calls(&mut self) -> Vec<NativeCall> {
        self.pending.drain(..).collect()
    }

    // =========================================================================
    // 执行
    // =========================================================================

    /// 执行单条指令
    ///
    /// 返回 `false` 表示已进入停机、暂停或等待状态。
    pub fn step(&mut self) -> bool {
        match self.state {
            RunState::Idle => self.state = RunState::Running,
            RunState::Running => {}
            _ => return false,
        }

        if self.ip as usize >= self.program.instructions.len() {
            self.state = RunState::Halted;
            return false;
        }

        let ip = self.ip;
        if let Err(kind) = self.execute(ip) {
            warn!(ip, error = %kind, "脚本执行故障，虚拟机停机");
            self.ip = ip;
            self.fault = Some(VmFault { kind, ip });
            self.state = RunState::Halted;
            return false;
        }
        self.executed += 1;
        self.state == RunState::Running
    }

    /// 执行直到挂起
    pub fn run(&mut self) {
        while self.step() {}
    }

    /// 最多执行 `max_instructions` 条指令，返回实际执行数
    pub fn run_for(&mut self, max_instructions: usize) -> usize {
        let mut count = 0;
        while count < max_instructions {
            let before = self.executed;
            let more = self.step();
            if self.executed > before {
                count += 1;
            }
            if !more {
                break;
            }
        }
        count
    }

    /// 协作式暂停
    pub fn pause(&mut self) {
        match self.state {
            RunState::Running | RunState::Idle => {
                self.paused_from = Some(RunState::Running);
                self.state = RunState::Paused;
            }
            s if s.is_waiting() => {
                self.paused_from = Some(s);
                self.state = RunState::Paused;
            }
            _ => {}
        }
    }

    /// 从暂停恢复
    pub fn resume(&mut self) {
        if self.state == RunState::Paused {
            self.state = self.paused_from.take().unwrap_or(RunState::Running);
        }
    }

    /// 释放 `WaitingForContinue`
    pub fn signal_continue(&mut self) -> Result<(), SignalError> {
        if self.state != RunState::WaitingForContinue {
            return Err(SignalError::NotWaiting { state: self.state });
        }
        self.state = RunState::Running;
        Ok(())
    }

    /// 释放 `WaitingForChoice` 并将选择索引压栈
    pub fn signal_choice(&mut self, index: usize) -> Result<(), SignalError> {
        if self.state != RunState::WaitingForChoice {
            return Err(SignalError::NotWaiting { state: self.state });
        }
        if index >= self.choice_count {
            return Err(SignalError::InvalidChoice {
                index,
                count: self.choice_count,
            });
        }
        self.stack.push(Value::Int(index as i64));
        self.choice_count = 0;
        self.state = RunState::Running;
        Ok(())
    }

    /// 推进时间，到期后释放 `WaitingForTime`
    pub fn advance_time(&mut self, dt: f64) {
        if self.state == RunState::WaitingForTime {
            self.wait_remaining -= dt;
            if self.wait_remaining <= 0.0 {
                self.wait_remaining = 0.0;
                self.state = RunState::Running;
            }
        }
    }

    /// 跳转到节点锚点（读档时使用）
    pub fn jump_to_node(&mut self, node: &str) -> bool {
        let Some(target) = self.program.find_symbol(node) else {
            return false;
        };
        self.ip = target;
        self.call_stack.clear();
        self.stack.clear();
        self.fault = None;
        self.paused_from = None;
        self.state = RunState::Idle;
        true
    }

    // =========================================================================
    // 查询
    // =========================================================================

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state == RunState::Paused
    }

    pub fn is_waiting(&self) -> bool {
        self.state.is_waiting()
    }

    pub fn is_halted(&self) -> bool {
        self.state == RunState::Halted
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn instruction_count(&self) -> usize {
        self.program.instructions.len()
    }

    /// 最近一次停机故障
    pub fn last_fault(&self) -> Option<&VmFault> {
        self.fault.as_ref()
    }

    /// 等待中的选项数量
    pub fn pending_choice_count(&self) -> usize {
        self.choice_count
    }

    /// 当前节点名
    pub fn current_node(&self) -> Option<&str> {
        self.program.node_at(self.ip)
    }

    /// 当前指令的反汇编文本
    pub fn current_instruction_text(&self) -> String {
        self.program.disassemble(self.ip)
    }

    /// 当前栈帧（调试用，0 为最内层）
    pub fn current_stack_frames(&self) -> Vec<StackFrameInfo> {
        let mut frames = vec![StackFrameInfo {
            depth: 0,
            node: self.current_node().unwrap_or("<main>").to_string(),
            ip: self.ip,
        }];
        for (i, frame) in self.call_stack.iter().rev().enumerate() {
            let caller_ip = frame.return_ip.saturating_sub(1);
            frames.push(StackFrameInfo {
                depth: i + 1,
                node: self.program.node_at(caller_ip).unwrap_or("<main>").to_string(),
                ip: caller_ip,
            });
        }
        frames
    }

    /// 调用栈（由外到内）
    pub fn call_stack(&self) -> &[CallFrame] {
        &self.call_stack
    }

    pub fn value_stack(&self) -> &[Value] {
        &self.stack
    }

    /// 读取并清除变量脏标记
    pub fn take_variables_dirty(&mut self) -> bool {
        std::mem::take(&mut self.variables_dirty)
    }

    /// 读取并清除标记脏标记
    pub fn take_flags_dirty(&mut self) -> bool {
        std::mem::take(&mut self.flags_dirty)
    }

    /// 估算 VM 内存占用（字节）
    pub fn memory_estimate(&self) -> usize {
        let program = self.program.instructions.len() * 8
            + self.program.strings.iter().map(|s| s.len() + 1).sum::<usize>();
        let stack: usize = self.stack.iter().map(Value::approx_size).sum();
        let vars: usize = self
            .variables
            .iter()
            .map(|(k, v)| k.len() + v.approx_size())
            .sum();
        let flags: usize = self.flags.keys().map(|k| k.len() + 1).sum();
        program + stack + vars + flags + self.call_stack.len() * std::mem::size_of::<CallFrame>()
    }

    // =========================================================================
    // 变量与标记
    // =========================================================================

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
        self.variables_dirty = true;
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn set_int(&mut self, name: impl Into<String>, value: i64) {
        self.set_variable(name, Value::Int(value));
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.variables.get(name).and_then(Value::as_int)
    }

    pub fn set_float(&mut self, name: impl Into<String>, value: f64) {
        self.set_variable(name, Value::Float(value));
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.variables.get(name).and_then(Value::as_float)
    }

    pub fn set_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_variable(name, Value::String(value.into()));
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.variables.get(name).and_then(Value::as_str)
    }

    pub fn set_bool(&mut self, name: impl Into<String>, value: bool) {
        self.set_variable(name, Value::Bool(value));
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.variables.get(name).and_then(Value::as_bool)
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: bool) {
        self.flags.insert(name.into(), value);
        self.flags_dirty = true;
    }

    /// 读取标记，未设置视为 false
    pub fn get_flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn flags(&self) -> &BTreeMap<String, bool> {
        &self.flags
    }

    /// 清空变量与标记（读档前）
    pub fn clear_variables(&mut self) {
        self.variables.clear();
        self.flags.clear();
        self.variables_dirty = true;
        self.flags_dirty = true;
    }

    // =========================================================================
    // 快照
    // =========================================================================

    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            ip: self.ip,
            call_stack: self.call_stack.clone(),
            stack: self.stack.clone(),
            variables: self.variables.clone(),
            flags: self.flags.clone(),
            state: self.state,
            paused_from: self.paused_from,
            fault: self.fault.clone(),
            wait_remaining: self.wait_remaining,
            choice_count: self.choice_count,
        }
    }

    pub fn restore(&mut self, snapshot: VmSnapshot) {
        self.ip = snapshot.ip;
        self.call_stack = snapshot.call_stack;
        self.stack = snapshot.stack;
        self.variables = snapshot.variables;
        self.flags = snapshot.flags;
        self.state = snapshot.state;
        self.paused_from = snapshot.paused_from;
        self.fault = snapshot.fault;
        self.wait_remaining = snapshot.wait_remaining;
        self.choice_count = snapshot.choice_count;
        self.pending.clear();
        self.variables_dirty = true;
        self.flags_dirty = true;
    }

    // =========================================================================
    // 指令分派
    // =========================================================================

    fn pop(&mut self) -> Result<Value, VmFaultKind> {
        self.stack.pop().ok_or(VmFaultKind::StackUnderflow)
    }

    fn push(&mut self, value: Value) -> Exec {
        if self.stack.len() >= MAX_VALUE_STACK {
            return Err(VmFaultKind::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn string(&self, index: u32) -> Result<String, VmFaultKind> {
        self.program
            .strings
            .get(index as usize)
            .cloned()
            .ok_or(VmFaultKind::UnknownString(index))
    }

    fn jump_target(&self, target: u32) -> Result<u32, VmFaultKind> {
        if target as usize > self.program.instructions.len() {
            return Err(VmFaultKind::JumpOutOfRange(target));
        }
        Ok(target)
    }

    fn pop_condition(&mut self, op: Opcode) -> Result<bool, VmFaultKind> {
        let value = self.pop()?;
        value.truthy().ok_or_else(|| mismatch(op, &value))
    }

    fn execute(&mut self, ip: u32) -> Exec {
        let ins = self.program.instructions[ip as usize];
        let Some(op) = ins.decode() else {
            return Err(VmFaultKind::InvalidOpcode(ins.opcode));
        };
        let operand = ins.operand;
        let mut next = ip + 1;

        match op {
            Opcode::Nop => {}
            Opcode::Halt => {
                self.state = RunState::Halted;
            }
            Opcode::Jump => next = self.jump_target(operand)?,
            Opcode::JumpIf => {
                let target = self.jump_target(operand)?;
                if self.pop_condition(op)? {
                    next = target;
                }
            }
            Opcode::JumpIfNot => {
                let target = self.jump_target(operand)?;
                if !self.pop_condition(op)? {
                    next = target;
                }
            }
            Opcode::Call => {
                let target = self.jump_target(operand)?;
                if self.call_stack.len() >= MAX_CALL_DEPTH {
                    return Err(VmFaultKind::CallStackOverflow);
                }
                let scope = self.program.node_at(target).unwrap_or("<anon>").to_string();
                self.call_stack.push(CallFrame {
                    return_ip: next,
                    scope,
                });
                next = target;
            }
            Opcode::Return => match self.call_stack.pop() {
                Some(frame) => next = frame.return_ip,
                None => self.state = RunState::Halted,
            },

            Opcode::PushInt => self.push(Value::Int(operand as i32 as i64))?,
            Opcode::PushBool => self.push(Value::Bool(operand != 0))?,
            Opcode::PushString => {
                let s = self.string(operand)?;
                self.push(Value::String(s))?;
            }
            Opcode::PushConst => {
                let value = match self.program.constants.get(operand as usize) {
                    Some(Constant::Int(v)) => Value::Int(*v),
                    Some(Constant::Float(v)) => Value::Float(*v),
                    None => return Err(VmFaultKind::UnknownConstant(operand)),
                };
                self.push(value)?;
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self.stack.last().cloned().ok_or(VmFaultKind::StackUnderflow)?;
                self.push(top)?;
            }

            Opcode::LoadVar => {
                let name = self.string(operand)?;
                let value = match self.variables.get(&name) {
                    Some(v) => v.clone(),
                    None => {
                        debug!(variable = %name, "读取未定义变量，视为 0");
                        Value::Int(0)
                    }
                };
                self.push(value)?;
            }
            Opcode::StoreVar => {
                let name = self.string(operand)?;
                let value = self.pop()?;
                self.set_variable(name, value);
            }
            Opcode::LoadFlag => {
                let name = self.string(operand)?;
                let value = self.get_flag(&name);
                self.push(Value::Bool(value))?;
            }
            Opcode::StoreFlag => {
                let name = self.string(operand)?;
                let value = self.pop_condition(op)?;
                self.set_flag(name, value);
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = arithmetic(op, a, b)?;
                self.push(result)?;
            }
            Opcode::Neg => {
                let value = self.pop()?;
                let result = match value {
                    Value::Int(v) => Value::Int(v.wrapping_neg()),
                    Value::Float(v) => Value::Float(-v),
                    other => return Err(mismatch(op, &other)),
                };
                self.push(result)?;
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = compare(op, &a, &b)?;
                self.push(Value::Bool(result))?;
            }
            Opcode::And | Opcode::Or => {
                let b = self.pop_condition(op)?;
                let a = self.pop_condition(op)?;
                let result = if op == Opcode::And { a && b } else { a || b };
                self.push(Value::Bool(result))?;
            }
            Opcode::Not => {
                let v = self.pop_condition(op)?;
                self.push(Value::Bool(!v))?;
            }

            _ => self.execute_engine(op, operand)?,
        }

        if self.state != RunState::Halted || op != Opcode::Halt {
            self.ip = next;
        }
        Ok(())
    }

    fn execute_engine(&mut self, op: Opcode, operand: u32) -> Exec {
        let text = if op.operand_kind() == OperandKind::String {
            Some(self.string(operand)?)
        } else {
            None
        };

        let arity = op.engine_arity(operand);
        if arity > self.stack.len() {
            return Err(VmFaultKind::StackUnderflow);
        }
        let args = self.stack.split_off(self.stack.len() - arity);

        let call = NativeCall {
            opcode: op,
            operand,
            text,
            args,
        };

        match self.callbacks.get_mut(&op) {
            Some(callback) => callback(&call).map_err(VmFaultKind::Native)?,
            None => self.pending.push_back(call),
        }

        match op {
            Opcode::ShowText => self.state = RunState::WaitingForContinue,
            Opcode::Choice => {
                self.choice_count = operand as usize;
                self.state = RunState::WaitingForChoice;
            }
            Opcode::Wait if operand > 0 => {
                self.wait_remaining = operand as f64 / 1000.0;
                self.state = RunState::WaitingForTime;
            }
            _ => {}
        }
        Ok(())
    }
}

fn mismatch(op: Opcode, value: &Value) -> VmFaultKind {
    VmFaultKind::TypeMismatch {
        op: op.mnemonic().to_string(),
        found: value.type_name().to_string(),
    }
}

fn arithmetic(op: Opcode, a: Value, b: Value) -> Result<Value, VmFaultKind> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            Ok(Value::Int(match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div if y == 0 => return Err(VmFaultKind::DivisionByZero),
                Opcode::Div => x.wrapping_div(y),
                Opcode::Mod if y == 0 => return Err(VmFaultKind::DivisionByZero),
                _ => x.wrapping_rem(y),
            }))
        }
        (Value::String(_), _) | (_, Value::String(_)) if op == Opcode::Add => {
            Ok(Value::String(format!("{}{}", a, b)))
        }
        _ => {
            let x = a.as_float().ok_or_else(|| mismatch(op, &a))?;
            let y = b.as_float().ok_or_else(|| mismatch(op, &b))?;
            Ok(Value::Float(match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div | Opcode::Mod if y == 0.0 => {
                    return Err(VmFaultKind::DivisionByZero);
                }
                Opcode::Div => x / y,
                _ => x % y,
            }))
        }
    }
}

fn compare(op: Opcode, a: &Value, b: &Value) -> Result<bool, VmFaultKind> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };

    match op {
        Opcode::Eq => Ok(ordering == Some(Ordering::Equal)),
        Opcode::Ne => Ok(ordering != Some(Ordering::Equal)),
        _ => {
            if matches!(a, Value::Bool(_)) || matches!(b, Value::Bool(_)) {
                return Err(mismatch(op, a));
            }
            let offending = if a.as_float().is_none() { a } else { b };
            let ord = ordering.ok_or_else(|| mismatch(op, offending))?;
            Ok(match op {
                Opcode::Lt => ord == Ordering::Less,
                Opcode::Le => ord != Ordering::Greater,
                Opcode::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, ProgramBuilder};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn vm_with(build: impl FnOnce(&mut ProgramBuilder)) -> ScriptVm {
        let mut b = ProgramBuilder::new();
        build(&mut b);
        let mut vm = ScriptVm::new();
        vm.load(&b.build().to_bytes()).unwrap();
        vm
    }

    #[test]
    fn test_halt_on_unknown_opcode_keeps_ip() {
        let program = Program {
            instructions: vec![Instruction {
                opcode: 0xEE,
                operand: 0,
            }],
            ..Program::default()
        };
        let mut vm = ScriptVm::new();
        vm.load(&program.to_bytes()).unwrap();

        assert!(!vm.step());
        assert_eq!(vm.run_state(), RunState::Halted);
        assert_eq!(vm.ip(), 0);
        assert!(!vm.is_running());
        assert_eq!(
            vm.last_fault(),
            Some(&VmFault {
                kind: VmFaultKind::InvalidOpcode(0xEE),
                ip: 0
            })
        );
    }

    #[test]
    fn test_arithmetic_and_store() {
        let mut vm = vm_with(|b| {
            b.push_int(7);
            b.push_int(3);
            b.emit(Opcode::Sub, 0);
            b.push_int(2);
            b.emit(Opcode::Mul, 0);
            b.store_var("x");
            b.push_const_float(1.5);
            b.push_int(2);
            b.emit(Opcode::Add, 0);
            b.store_var("y");
            b.halt();
        });
        vm.run();
        assert!(vm.is_halted());
        assert!(vm.last_fault().is_none());
        assert_eq!(vm.get_int("x"), Some(8));
        assert_eq!(vm.get_float("y"), Some(3.5));
    }

    #[test]
    fn test_division_by_zero_halts() {
        let mut vm = vm_with(|b| {
            b.push_int(1);
            b.push_int(0);
            b.emit(Opcode::Div, 0);
        });
        vm.run();
        let fault = vm.last_fault().unwrap();
        assert_eq!(fault.kind, VmFaultKind::DivisionByZero);
        assert_eq!(fault.ip, 2);
        assert_eq!(vm.ip(), 2);
    }

    #[test]
    fn test_stack_underflow_and_type_mismatch() {
        let mut vm = vm_with(|b| {
            b.emit(Opcode::Pop, 0);
        });
        vm.run();
        assert_eq!(vm.last_fault().unwrap().kind, VmFaultKind::StackUnderflow);

        let mut vm = vm_with(|b| {
            b.push_bool(true);
            b.push_int(1);
            b.emit(Opcode::Mul, 0);
        });
        vm.run();
        assert!(matches!(
            vm.last_fault().unwrap().kind,
            VmFaultKind::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_unknown_string_index() {
        let mut vm = vm_with(|b| {
            b.emit(Opcode::PushString, 42);
        });
        assert!(!vm.step());
        assert_eq!(vm.last_fault().unwrap().kind, VmFaultKind::UnknownString(42));
    }

    #[test]
    fn test_branching_on_flag() {
        let mut vm = vm_with(|b| {
            let skip = b.label();
            b.load_flag("met_alice");
            b.jump_if_not(skip);
            b.push_int(1);
            b.store_var("greeted");
            b.bind(skip);
            b.halt();
        });
        vm.set_flag("met_alice", true);
        vm.run();
        assert_eq!(vm.get_int("greeted"), Some(1));

        vm.reset();
        vm.run();
        assert_eq!(vm.get_int("greeted"), None);
    }

    #[test]
    fn test_show_text_waits_for_continue() {
        let mut vm = vm_with(|b| {
            b.say("Alice", "你好");
            b.say("Bob", "再见");
            b.halt();
        });
        vm.run();
        assert_eq!(vm.run_state(), RunState::WaitingForContinue);
        assert!(vm.is_waiting());

        let calls = vm.drain_native_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].opcode, Opcode::ShowText);
        assert_eq!(calls[0].text.as_deref(), Some("你好"));
        assert_eq!(calls[0].arg_str(0).as_deref(), Some("Alice"));

        // 等待中再 step 不前进
        assert!(!vm.step());

        vm.signal_continue().unwrap();
        vm.run();
        assert_eq!(vm.drain_native_calls()[0].text.as_deref(), Some("再见"));
        vm.signal_continue().unwrap();
        vm.run();
        assert!(vm.is_halted());
    }

    #[test]
    fn test_choice_pushes_index() {
        let mut vm = vm_with(|b| {
            b.choice(&["左", "右"]);
            b.store_var("picked");
            b.halt();
        });
        vm.run();
        assert_eq!(vm.run_state(), RunState::WaitingForChoice);
        assert_eq!(
            vm.signal_choice(5),
            Err(SignalError::InvalidChoice { index: 5, count: 2 })
        );
        vm.signal_choice(1).unwrap();
        vm.run();
        assert_eq!(vm.get_int("picked"), Some(1));
    }

    #[test]
    fn test_wait_suspends_until_time_passes() {
        let mut vm = vm_with(|b| {
            b.wait_ms(500);
            b.push_int(1);
            b.store_var("after");
        });
        vm.run();
        assert_eq!(vm.run_state(), RunState::WaitingForTime);
        vm.advance_time(0.3);
        assert_eq!(vm.run_state(), RunState::WaitingForTime);
        vm.advance_time(0.3);
        assert!(vm.is_running());
        vm.run();
        assert_eq!(vm.get_int("after"), Some(1));
    }

    #[test]
    fn test_registered_callback_receives_args() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut vm = vm_with(|b| {
            b.show_character("alice_obj", "alice", "left");
            b.halt();
        });
        assert!(vm.register_callback(Opcode::ShowCharacter, move |call| {
            sink.borrow_mut().push((
                call.text.clone(),
                call.arg_str(0),
                call.arg_str(1),
            ));
            Ok(())
        }));
        assert!(!vm.register_callback(Opcode::Add, |_| Ok(())));

        vm.run();
        assert!(vm.drain_native_calls().is_empty());
        assert_eq!(
            seen.borrow().as_slice(),
            &[(
                Some("alice_obj".to_string()),
                Some("alice".to_string()),
                Some("left".to_string())
            )]
        );
    }

    #[test]
    fn test_callback_failure_halts() {
        let mut vm = vm_with(|b| {
            b.play_sound("boom.ogg");
        });
        vm.register_callback(Opcode::PlaySound, |_| Err("设备不可用".to_string()));
        vm.run();
        assert_eq!(
            vm.last_fault().unwrap().kind,
            VmFaultKind::Native("设备不可用".to_string())
        );
    }

    #[test]
    fn test_pause_and_resume() {
        let mut vm = vm_with(|b| {
            b.push_int(1);
            b.push_int(2);
            b.halt();
        });
        assert!(vm.step());
        vm.pause();
        assert!(vm.is_paused());
        assert!(!vm.step());
        assert_eq!(vm.ip(), 1);
        vm.resume();
        assert!(vm.is_running());
        vm.run();
        assert!(vm.is_halted());
    }

    #[test]
    fn test_pause_while_waiting_restores_wait() {
        let mut vm = vm_with(|b| {
            b.say("", "...");
        });
        vm.run();
        vm.pause();
        assert!(vm.signal_continue().is_err());
        vm.resume();
        assert_eq!(vm.run_state(), RunState::WaitingForContinue);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut vm = vm_with(|b| {
            b.push_int(1);
            b.store_var("x");
        });
        vm.run();
        vm.reset();
        assert_eq!(vm.run_state(), RunState::Idle);
        assert_eq!(vm.ip(), 0);
        assert!(vm.variables().is_empty());
    }

    #[test]
    fn test_call_and_return_with_frames() {
        let mut vm = vm_with(|b| {
            let sub = b.label();
            b.node("main");
            b.call(sub);
            b.halt();
            b.bind(sub);
            b.node("helper");
            b.push_int(9);
            b.store_var("from_helper");
            b.emit(Opcode::Return, 0);
        });
        vm.step();
        vm.step();
        let frames = vm.current_stack_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].node, "helper");
        assert_eq!(frames[1].node, "main");
        vm.run();
        assert_eq!(vm.get_int("from_helper"), Some(9));
        assert!(vm.is_halted());
        assert!(vm.last_fault().is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut vm = vm_with(|b| {
            b.push_int(5);
            b.store_var("n");
            b.say("", "停一下");
            b.halt();
        });
        vm.set_flag("f", true);
        vm.run();
        let snap = vm.snapshot();
        let json = serde_json::to_string(&snap).unwrap();

        vm.signal_continue().unwrap();
        vm.run();
        assert!(vm.is_halted());

        vm.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(vm.run_state(), RunState::WaitingForContinue);
        assert_eq!(vm.get_int("n"), Some(5));
        assert!(vm.get_flag("f"));
    }

    #[test]
    fn test_snapshot_fits_program() {
        let mut vm = vm_with(|b| {
            b.push_int(1);
            b.push_int(2);
            b.say("", "等待");
            b.halt();
        });
        vm.run();
        let snap = vm.snapshot();
        assert!(snap.fits(vm.program()));

        let mut short = ProgramBuilder::new();
        short.halt();
        assert!(!snap.fits(&short.build()));

        let bad_frame = VmSnapshot {
            ip: 0,
            call_stack: vec![CallFrame {
                return_ip: 999,
                scope: "x".to_string(),
            }],
            ..snap
        };
        assert!(!bad_frame.fits(vm.program()));
    }

    #[test]
    fn test_string_concat_and_compare() {
        let mut vm = vm_with(|b| {
            b.push_string("第");
            b.push_int(3);
            b.emit(Opcode::Add, 0);
            b.store_var("label");
            b.push_int(2);
            b.push_const_float(2.0);
            b.emit(Opcode::Eq, 0);
            b.store_flag("same");
        });
        vm.run();
        assert_eq!(vm.get_string("label"), Some("第3"));
        assert!(vm.get_flag("same"));
    }

    #[test]
    fn test_jump_out_of_range() {
        let mut vm = vm_with(|b| {
            b.emit(Opcode::Jump, 99);
        });
        vm.run();
        assert_eq!(vm.last_fault().unwrap().kind, VmFaultKind::JumpOutOfRange(99));
    }

    #[test]
    fn test_run_for_budget() {
        let mut vm = vm_with(|b| {
            let top = b.label();
            b.bind(top);
            b.emit(Opcode::Nop, 0);
            b.jump_to(top);
        });
        assert_eq!(vm.run_for(100), 100);
        assert!(vm.is_running());
    }

    #[test]
    fn test_current_instruction_text() {
        let vm = vm_with(|b| {
            b.show_background("bg/room.png");
        });
        assert_eq!(vm.current_instruction_text(), "0000 SHOW_BACKGROUND \"bg/room.png\"");
    }
}
