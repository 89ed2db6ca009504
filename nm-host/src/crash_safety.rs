//! # Crash Safety 模块
//!
//! 包裹 VM 执行的保护层：
//!
//! - 检查点环形缓冲（按间隔自动捕获，也可按需捕获）
//! - 运行时错误记录与反应策略（暂停 / 隔离 / 自动恢复）
//! - 按操作类型配置的看门狗
//! - JSON Lines 错误日志与软内存上限
//!
//! 该层只持有快照，不持有 VM 或场景图本身；调用方在每次操作时借出它们。

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use nm_runtime::{ErrorKind, SceneGraph, SceneState, ScriptVm, VmSnapshot};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;

/// 错误历史保留条数
const MAX_ERROR_HISTORY: usize = 256;

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// 挂起 VM
    Critical,
    /// 隔离运行时
    Fatal,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Fatal => "fatal",
        }
    }
}

/// 运行时错误记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeErrorRecord {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    pub scene: String,
    /// 出错时的指令地址
    pub position: Option<u32>,
    pub node: Option<String>,
    pub instruction: Option<String>,
    /// RFC 3339
    pub timestamp: String,
    pub recoverable: bool,
    pub suggested_action: String,
}

impl RuntimeErrorRecord {
    pub fn new(severity: Severity, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            scene: String::new(),
            position: None,
            node: None,
            instruction: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            recoverable: severity < Severity::Fatal,
            suggested_action: suggested_action(kind).to_string(),
        }
    }

    /// 附加 VM 与场景位置
    pub fn at(mut self, vm: &ScriptVm, scene: &SceneGraph) -> Self {
        self.scene = scene.scene_id().to_string();
        self.position = Some(vm.last_fault().map_or(vm.ip(), |f| f.ip));
        self.node = vm.current_node().map(str::to_string);
        if vm.instruction_count() > 0 {
            self.instruction = Some(vm.current_instruction_text());
        }
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = suggestion.into();
        self
    }
}

fn suggested_action(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidFormat | ErrorKind::UnsupportedVersion => "重新编译脚本或升级运行时",
        ErrorKind::IntegrityFailure | ErrorKind::Corrupted => "重新安装或校验资源包",
        ErrorKind::DecryptionFailure | ErrorKind::KeyMissing => "检查资源包密钥配置",
        ErrorKind::SignatureInvalid => "确认资源包来源与公钥",
        ErrorKind::NotFound | ErrorKind::DependencyMissing => "检查资源包挂载与资源路径",
        ErrorKind::IOError => "检查磁盘空间与文件权限",
        ErrorKind::CountExceedsLimit => "调整资源包限制配置",
        ErrorKind::ScriptExecution => "检查脚本逻辑后从检查点恢复",
        ErrorKind::Timeout => "检查脚本是否存在死循环",
        ErrorKind::StateCorruption => "从最近的检查点或存档恢复",
    }
}

/// 检查点：VM 与场景图的完整快照
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: u64,
    pub label: String,
    pub timestamp: String,
    pub vm: VmSnapshot,
    pub scene: SceneState,
}

/// 看门狗类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogKind {
    Script,
    AssetLoad,
    HotReload,
}

impl WatchdogKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Script => "脚本执行",
            Self::AssetLoad => "资源加载",
            Self::HotReload => "热重载",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Script => 0,
            Self::AssetLoad => 1,
            Self::HotReload => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Watchdog {
    armed: bool,
    elapsed: f64,
}

/// 错误处理后的反应
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Continue,
    Pause,
    Isolate,
    /// 已恢复到指定检查点
    Recovered(u64),
}

pub struct CrashGuard {
    config: RuntimeConfig,
    checkpoints: VecDeque<Checkpoint>,
    next_checkpoint_id: u64,
    since_checkpoint: f64,
    errors: VecDeque<RuntimeErrorRecord>,
    recovery_attempts: u32,
    isolated: bool,
    memory_warned: bool,
    watchdogs: [Watchdog; 3],
    error_log: Option<PathBuf>,
}

impl CrashGuard {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            checkpoints: VecDeque::new(),
            next_checkpoint_id: 1,
            since_checkpoint: 0.0,
            errors: VecDeque::new(),
            recovery_attempts: 0,
            isolated: false,
            memory_warned: false,
            watchdogs: [Watchdog::default(); 3],
            error_log: None,
        }
    }

    /// 设置 JSON Lines 错误日志路径
    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn error_log(&self) -> Option<&Path> {
        self.error_log.as_deref()
    }

    fn capacity(&self) -> usize {
        self.config.max_checkpoints.max(1)
    }

    // ========== 检查点 ==========

    pub fn capture_checkpoint(&mut self, label: &str, vm: &ScriptVm, scene: &SceneGraph) -> u64 {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        while self.checkpoints.len() >= self.capacity() {
            self.checkpoints.pop_front();
        }
        self.checkpoints.push_back(Checkpoint {
            id,
            label: label.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            vm: vm.snapshot(),
            scene: scene.save_state(),
        });
        self.since_checkpoint = 0.0;
        id
    }

    /// 按配置的间隔自动捕获，返回新检查点的 id
    pub fn tick(&mut self, dt: f64, vm: &ScriptVm, scene: &SceneGraph) -> Option<u64> {
        if !self.config.enable_auto_checkpoints || self.isolated {
            return None;
        }
        self.since_checkpoint += dt;
        if self.since_checkpoint < self.config.checkpoint_interval_seconds {
            return None;
        }
        Some(self.capture_checkpoint("auto", vm, scene))
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.back()
    }

    pub fn clear_checkpoints(&mut self) {
        self.checkpoints.clear();
        self.since_checkpoint = 0.0;
    }

    /// 恢复到指定检查点
    ///
    /// 先应用场景快照；场景或 VM 快照无法应用时返回 false，两者都保持原样。
    pub fn restore_checkpoint(
        &mut self,
        id: u64,
        vm: &mut ScriptVm,
        scene: &mut SceneGraph,
    ) -> bool {
        let Some(checkpoint) = self.checkpoints.iter().find(|c| c.id == id) else {
            return false;
        };
        if !checkpoint.vm.fits(vm.program()) {
            warn!(checkpoint = id, "检查点与当前脚本不匹配");
            return false;
        }
        if let Err(e) = scene.load_state(&checkpoint.scene) {
            warn!(checkpoint = id, error = %e, "检查点场景快照无法应用");
            return false;
        }
        vm.restore(checkpoint.vm.clone());
        let label = checkpoint.label.clone();
        self.isolated = false;
        self.disarm_all();
        info!(checkpoint = id, label = %label, "已恢复到检查点");
        true
    }

    pub fn restore_latest(&mut self, vm: &mut ScriptVm, scene: &mut SceneGraph) -> Option<u64> {
        let id = self.latest_checkpoint()?.id;
        self.restore_checkpoint(id, vm, scene).then_some(id)
    }

    // ========== 错误处理 ==========

    /// 记录错误并按策略作出反应
    pub fn handle(
        &mut self,
        record: RuntimeErrorRecord,
        vm: &mut ScriptVm,
        scene: &mut SceneGraph,
    ) -> Reaction {
        match record.severity {
            Severity::Info => info!(kind = record.kind.name(), "{}", record.message),
            Severity::Warning => warn!(kind = record.kind.name(), "{}", record.message),
            _ => error!(
                severity = record.severity.name(),
                kind = record.kind.name(),
                node = record.node.as_deref().unwrap_or("-"),
                "{}",
                record.message
            ),
        }
        self.append_log(&record);

        let severity = record.severity;
        let recoverable = record.recoverable;
        if self.errors.len() >= MAX_ERROR_HISTORY {
            self.errors.pop_front();
        }
        self.errors.push_back(record);

        match severity {
            Severity::Info | Severity::Warning => Reaction::Continue,
            Severity::Error if self.config.pause_on_error => {
                vm.pause();
                Reaction::Pause
            }
            Severity::Error => Reaction::Continue,
            Severity::Critical => {
                vm.pause();
                Reaction::Pause
            }
            Severity::Fatal => self.handle_fatal(recoverable, vm, scene),
        }
    }

    fn handle_fatal(
        &mut self,
        recoverable: bool,
        vm: &mut ScriptVm,
        scene: &mut SceneGraph,
    ) -> Reaction {
        if self.config.enable_auto_recovery
            && recoverable
            && self.recovery_attempts < self.config.max_recovery_attempts
        {
            self.recovery_attempts += 1;
            if let Some(id) = self.restore_latest(vm, scene) {
                info!(
                    attempt = self.recovery_attempts,
                    max = self.config.max_recovery_attempts,
                    "致命错误后自动恢复"
                );
                return Reaction::Recovered(id);
            }
        }
        vm.pause();
        if self.config.isolate_runtime {
            self.isolated = true;
            warn!("运行时已隔离，需手动恢复检查点");
            Reaction::Isolate
        } else {
            Reaction::Pause
        }
    }

    fn append_log(&self, record: &RuntimeErrorRecord) {
        let Some(path) = &self.error_log else { return };
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "错误记录无法序列化");
                return;
            }
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), error = %e, "无法创建错误日志目录");
            return;
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "无法写入错误日志");
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &RuntimeErrorRecord> {
        self.errors.iter()
    }

    pub fn last_error(&self) -> Option<&RuntimeErrorRecord> {
        self.errors.back()
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn clear_isolation(&mut self) {
        self.isolated = false;
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn reset_recovery_attempts(&mut self) {
        self.recovery_attempts = 0;
    }

    // ========== 看门狗 ==========

    pub fn timeout_for(&self, kind: WatchdogKind) -> f64 {
        match kind {
            WatchdogKind::Script => self.config.script_timeout_seconds,
            WatchdogKind::AssetLoad => self.config.asset_load_timeout_seconds,
            WatchdogKind::HotReload => self.config.hot_reload_timeout_seconds,
        }
    }

    pub fn arm(&mut self, kind: WatchdogKind) {
        self.watchdogs[kind.index()] = Watchdog {
            armed: true,
            elapsed: 0.0,
        };
    }

    pub fn disarm(&mut self, kind: WatchdogKind) {
        self.watchdogs[kind.index()] = Watchdog::default();
    }

    fn disarm_all(&mut self) {
        self.watchdogs = [Watchdog::default(); 3];
    }

    pub fn is_armed(&self, kind: WatchdogKind) -> bool {
        self.watchdogs[kind.index()].armed
    }

    /// 累加耗时；未武装时自动武装。返回是否超时
    pub fn feed(&mut self, kind: WatchdogKind, seconds: f64) -> bool {
        let timeout = self.timeout_for(kind);
        let dog = &mut self.watchdogs[kind.index()];
        if !dog.armed {
            *dog = Watchdog {
                armed: true,
                elapsed: 0.0,
            };
        }
        dog.elapsed += seconds;
        timeout > 0.0 && dog.elapsed > timeout
    }

    /// 计时执行一个同步操作
    ///
    /// 超时不会打断操作本身，只在完成后返回 `Err(耗时秒数)`。
    pub fn time<T>(&mut self, kind: WatchdogKind, op: impl FnOnce() -> T) -> Result<T, (T, f64)> {
        self.arm(kind);
        let start = Instant::now();
        let value = op();
        let elapsed = start.elapsed().as_secs_f64();
        let expired = self.feed(kind, elapsed);
        self.disarm(kind);
        if expired { Err((value, elapsed)) } else { Ok(value) }
    }

    // ========== 内存 ==========

    /// VM 估算内存超过软上限时返回警告记录（每次越界只报告一次）
    pub fn check_memory(&mut self, vm: &ScriptVm) -> Option<RuntimeErrorRecord> {
        let limit = self.config.max_memory_mb.saturating_mul(1024 * 1024);
        if limit == 0 {
            return None;
        }
        let used = vm.memory_estimate();
        if used <= limit {
            self.memory_warned = false;
            return None;
        }
        if self.memory_warned {
            return None;
        }
        self.memory_warned = true;
        Some(
            RuntimeErrorRecord::new(
                Severity::Warning,
                ErrorKind::CountExceedsLimit,
                format!(
                    "VM 内存估算 {:.1} MB 超过上限 {} MB",
                    used as f64 / (1024.0 * 1024.0),
                    self.config.max_memory_mb
                ),
            )
            .with_suggestion("减少脚本变量或提高 max_memory_mb"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nm_runtime::bytecode::ProgramBuilder;

    fn vm_with_script() -> ScriptVm {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.show_background("bg/a.png");
        b.say("A", "one");
        b.say("A", "two");
        b.halt();
        let mut vm = ScriptVm::new();
        vm.load_program(b.build());
        vm
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            max_checkpoints: 3,
            checkpoint_interval_seconds: 1.0,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn test_checkpoint_ring_is_bounded() {
        let mut guard = CrashGuard::new(config());
        let vm = vm_with_script();
        let scene = SceneGraph::new();
        for i in 0..5 {
            guard.capture_checkpoint(&format!("cp{i}"), &vm, &scene);
        }
        assert_eq!(guard.checkpoint_count(), 3);
        let ids: Vec<u64> = guard.checkpoints().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_auto_checkpoint_interval() {
        let mut guard = CrashGuard::new(config());
        let vm = vm_with_script();
        let scene = SceneGraph::new();
        assert!(guard.tick(0.6, &vm, &scene).is_none());
        assert!(guard.tick(0.6, &vm, &scene).is_some());
        assert!(guard.tick(0.1, &vm, &scene).is_none());
    }

    #[test]
    fn test_restore_checkpoint() {
        let mut guard = CrashGuard::new(config());
        let mut vm = vm_with_script();
        let mut scene = SceneGraph::new();
        vm.set_int("hp", 10);
        scene.show_background("bg/a.png");
        let id = guard.capture_checkpoint("before", &vm, &scene);

        vm.set_int("hp", 0);
        scene.show_background("bg/b.png");
        assert!(guard.restore_checkpoint(id, &mut vm, &mut scene));
        assert_eq!(vm.get_int("hp"), Some(10));
        assert_eq!(scene.save_state().active_background.as_deref(), Some("bg/a.png"));
        assert!(!guard.restore_checkpoint(999, &mut vm, &mut scene));
    }

    #[test]
    fn test_restore_with_bad_scene_leaves_state_untouched() {
        let mut guard = CrashGuard::new(config());
        let mut vm = vm_with_script();
        let mut scene = SceneGraph::new();
        vm.set_int("hp", 10);
        scene.show_background("bg/a.png");
        let id = guard.capture_checkpoint("before", &vm, &scene);
        let checkpoint = guard.checkpoints.back_mut().unwrap();
        let duplicate = checkpoint.scene.objects[0].clone();
        checkpoint.scene.objects.push(duplicate);

        vm.set_int("hp", 0);
        scene.show_background("bg/b.png");
        assert!(!guard.restore_checkpoint(id, &mut vm, &mut scene));
        assert_eq!(vm.get_int("hp"), Some(0));
        assert_eq!(scene.save_state().active_background.as_deref(), Some("bg/b.png"));
    }

    #[test]
    fn test_restore_rejects_checkpoint_from_longer_script() {
        let mut guard = CrashGuard::new(config());
        let mut vm = vm_with_script();
        let mut scene = SceneGraph::new();
        vm.run();
        let id = guard.capture_checkpoint("late", &vm, &scene);

        let mut short = ProgramBuilder::new();
        short.halt();
        vm.load_program(short.build());
        vm.set_int("hp", 1);
        assert!(!guard.restore_checkpoint(id, &mut vm, &mut scene));
        assert_eq!(vm.get_int("hp"), Some(1));
        assert_eq!(vm.ip(), 0);
    }

    #[test]
    fn test_reaction_policy() {
        let mut guard = CrashGuard::new(RuntimeConfig {
            enable_auto_recovery: false,
            ..config()
        });
        let mut vm = vm_with_script();
        let mut scene = SceneGraph::new();
        vm.step();

        let warn = RuntimeErrorRecord::new(Severity::Warning, ErrorKind::NotFound, "缺少资源");
        assert_eq!(guard.handle(warn, &mut vm, &mut scene), Reaction::Continue);
        assert!(!vm.is_paused());

        let critical =
            RuntimeErrorRecord::new(Severity::Critical, ErrorKind::StateCorruption, "状态损坏");
        assert_eq!(guard.handle(critical, &mut vm, &mut scene), Reaction::Pause);
        assert!(vm.is_paused());

        let fatal = RuntimeErrorRecord::new(Severity::Fatal, ErrorKind::ScriptExecution, "崩溃");
        assert!(!fatal.recoverable);
        assert_eq!(guard.handle(fatal, &mut vm, &mut scene), Reaction::Isolate);
        assert!(guard.is_isolated());
        assert_eq!(guard.errors().count(), 3);
    }

    #[test]
    fn test_auto_recovery_respects_attempt_cap() {
        let mut guard = CrashGuard::new(RuntimeConfig {
            max_recovery_attempts: 1,
            ..config()
        });
        let mut vm = vm_with_script();
        let mut scene = SceneGraph::new();
        let id = guard.capture_checkpoint("start", &vm, &scene);

        let fatal = || {
            RuntimeErrorRecord::new(Severity::Fatal, ErrorKind::ScriptExecution, "崩溃")
                .recoverable(true)
        };
        assert_eq!(guard.handle(fatal(), &mut vm, &mut scene), Reaction::Recovered(id));
        assert_eq!(guard.recovery_attempts(), 1);
        assert_eq!(guard.handle(fatal(), &mut vm, &mut scene), Reaction::Isolate);
    }

    #[test]
    fn test_error_log_is_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/errors.jsonl");
        let mut guard = CrashGuard::new(config()).with_error_log(&log);
        let mut vm = vm_with_script();
        let mut scene = SceneGraph::new();
        scene.set_scene_id("intro");
        for msg in ["a", "b"] {
            let record =
                RuntimeErrorRecord::new(Severity::Info, ErrorKind::NotFound, msg).at(&vm, &scene);
            guard.handle(record, &mut vm, &mut scene);
        }
        let text = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "NotFound");
        assert_eq!(lines[1]["message"], "b");
        assert_eq!(lines[1]["scene"], "intro");
    }

    #[test]
    fn test_watchdog_expiry() {
        let mut guard = CrashGuard::new(RuntimeConfig {
            script_timeout_seconds: 1.0,
            ..config()
        });
        assert!(!guard.feed(WatchdogKind::Script, 0.6));
        assert!(guard.is_armed(WatchdogKind::Script));
        assert!(guard.feed(WatchdogKind::Script, 0.6));
        guard.disarm(WatchdogKind::Script);
        assert!(!guard.feed(WatchdogKind::Script, 0.6));

        assert_eq!(guard.time(WatchdogKind::AssetLoad, || 7), Ok(7));
        assert!(!guard.is_armed(WatchdogKind::AssetLoad));
    }

    #[test]
    fn test_memory_guard_warns_once() {
        let mut guard = CrashGuard::new(RuntimeConfig {
            max_memory_mb: 1,
            ..config()
        });
        let mut vm = vm_with_script();
        assert!(guard.check_memory(&vm).is_none());
        vm.set_string("big", "x".repeat(2 * 1024 * 1024));
        let record = guard.check_memory(&vm).unwrap();
        assert_eq!(record.kind, ErrorKind::CountExceedsLimit);
        assert!(guard.check_memory(&vm).is_none());
    }
}
