//! # Runtime Host 模块
//!
//! 把 VM、场景图、过渡、本地化、资源与存档绑定在一起的帧驱动器。
//!
//! ## 帧流程
//!
//! ```text
//! tick(dt)
//!   ├─ scene.update / transition.update / vm.advance_time
//!   ├─ 自动检查点
//!   ├─ 逐条执行指令（指令数与墙钟时间双重预算）
//!   │    ├─ 进入新节点 → CurrentNodeChanged / 断点
//!   │    └─ 引擎调用 → 场景图 / 过渡 / 音频请求 / 场景切换
//!   └─ 故障、看门狗、内存检查 → CrashGuard
//! ```
//!
//! 所有结构都是单线程的，由宿主在主线程上独占持有。

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nm_runtime::bytecode::{Opcode, Program};
use nm_runtime::localization::{LocalizationError, LocalizationFormat};
use nm_runtime::vm::StackFrameInfo;
use nm_runtime::{
    ErrorKind, LocalizationManager, NativeCall, Renderer, RunState, SaveData, SaveError, SceneGraph,
    SceneState, SceneTransition, ScriptVm, Thumbnail, TransitionKind, Value, VmSnapshot, VnError,
};
use tracing::{debug, info, warn};

use crate::config::{HostConfig, RuntimeConfig};
use crate::crash_safety::{CrashGuard, Reaction, RuntimeErrorRecord, Severity, WatchdogKind};
use crate::error::{HostError, HostResult};
use crate::resources::{ResourceCache, ResourceKind};
use crate::save_store::{SaveStore, SaveStoreConfig};
use crate::vfs::{VfsError, VirtualFileSystem};

/// 场景脚本在资源包中的目录
pub const SCRIPT_DIR: &str = "scripts";

/// 存档中保存完整 VM 快照的字符串变量
pub const VM_STATE_KEY: &str = "__vm_state";

/// 存档中保存场景快照的字符串变量
pub const SCENE_STATE_KEY: &str = "__scene_state";

/// 存档中记录当前脚本资源 id 的字符串变量
pub const SCRIPT_KEY: &str = "__script";

/// 每执行这么多条指令检查一次墙钟预算
const WALL_CLOCK_CHECK_INTERVAL: usize = 64;

const MAX_DEBUG_EVENTS: usize = 1024;

/// 播放模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    Stopped,
    Playing,
    Paused,
}

/// 玩家输入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// 推进对话
    Continue,
    ChoiceNext,
    ChoicePrevious,
    /// 确认当前高亮的选项
    ChoiceConfirm,
    /// 直接选择第 n 项
    Choose(usize),
    /// 跳过打字机、过渡与动画
    Skip,
}

/// 音频请求，由宿主的音频后端消费
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioRequest {
    PlaySound(String),
    PlayMusic(String),
    StopMusic,
}

/// 调试事件
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    PlayModeChanged(PlayMode),
    CurrentNodeChanged(String),
    ExecutionStepChanged {
        index: usize,
        total: usize,
        instruction: String,
    },
    CallStackChanged(Vec<String>),
    StackFramesChanged(Vec<StackFrameInfo>),
    VariablesChanged,
    FlagsChanged,
    BreakpointHit(String),
    SceneChanged(String),
    DialogueShown {
        speaker: String,
        text: String,
    },
    ChoicesShown(Vec<String>),
    RuntimeError(RuntimeErrorRecord),
    CheckpointCaptured(u64),
    CheckpointRestored(u64),
}

/// 单帧执行报告
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    /// 本帧执行的指令数
    pub instructions: usize,
    pub elapsed: Duration,
    /// 因指令数或墙钟预算耗尽而停下
    pub budget_exhausted: bool,
    pub breakpoint_hit: bool,
}

pub struct RuntimeHost {
    vm: ScriptVm,
    scene: SceneGraph,
    transition: Option<SceneTransition>,
    localization: LocalizationManager,
    vfs: Option<Arc<VirtualFileSystem>>,
    resources: Option<ResourceCache>,
    saves: Option<SaveStore>,
    /// 当前程序来自 VFS 时的资源 id
    script_id: Option<String>,
    guard: CrashGuard,
    mode: PlayMode,
    breakpoints: BTreeSet<String>,
    last_node: Option<String>,
    last_ip: Option<u32>,
    last_call_depth: usize,
    fault_reported: bool,
    thumbnail: Option<Thumbnail>,
    events: VecDeque<DebugEvent>,
    audio: Vec<AudioRequest>,
}

impl RuntimeHost {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            vm: ScriptVm::new(),
            scene: SceneGraph::new(),
            transition: None,
            localization: LocalizationManager::new("en"),
            vfs: None,
            resources: None,
            saves: None,
            script_id: None,
            guard: CrashGuard::new(config),
            mode: PlayMode::Stopped,
            breakpoints: BTreeSet::new(),
            last_node: None,
            last_ip: None,
            last_call_depth: 0,
            fault_reported: false,
            thumbnail: None,
            events: VecDeque::new(),
            audio: Vec::new(),
        }
    }

    /// 按宿主配置组装：挂载资源包、读取 Mod 顺序、加载字符串表
    pub fn from_config(config: &HostConfig) -> HostResult<Self> {
        let vfs = Arc::new(VirtualFileSystem::from_config(&config.vfs)?);
        for mount in &config.packs {
            let result = vfs.mount(&mount.path, mount.pack_type, mount.priority)?;
            for warning in result.warnings.iter().chain(&result.errors) {
                warn!(pack = %result.info.id, "{}", warning);
            }
        }
        if config.mod_config_path.exists()
            && let Err(e) = vfs.load_mod_config(&config.mod_config_path)
        {
            warn!(path = %config.mod_config_path.display(), error = %e, "Mod 配置无法读取，沿用挂载顺序");
        }

        let saves = SaveStore::new(&config.saves_dir, SaveStoreConfig::from_config(&config.save)?);
        let locales = &config.localization;
        let mut localization = LocalizationManager::new(locales.default_locale.as_str());
        localization.set_current_locale(locales.current_locale.as_str());

        let mut host = Self::new(config.runtime.clone())
            .with_vfs(vfs, config.resources.cache_size_mb)
            .with_save_store(saves)
            .with_error_log(&config.error_log_path)
            .with_localization(localization);
        for file in &config.localization.files {
            host.load_locale_resource(&file.locale, &file.resource, file.format.as_deref())?;
        }
        Ok(host)
    }

    /// 绑定 VFS，同时建立解码资源缓存
    pub fn with_vfs(mut self, vfs: Arc<VirtualFileSystem>, cache_budget_mb: usize) -> Self {
        self.resources = Some(ResourceCache::new(Arc::clone(&vfs), cache_budget_mb));
        self.vfs = Some(vfs);
        self
    }

    pub fn with_save_store(mut self, saves: SaveStore) -> Self {
        self.saves = Some(saves);
        self
    }

    pub fn with_localization(mut self, localization: LocalizationManager) -> Self {
        self.localization = localization;
        self
    }

    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.guard = self.guard.with_error_log(path);
        self
    }

    // ========== 访问器 ==========

    pub fn vm(&self) -> &ScriptVm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut ScriptVm {
        &mut self.vm
    }

    pub fn scene(&self) -> &SceneGraph {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut SceneGraph {
        &mut self.scene
    }

    pub fn transition(&self) -> Option<&SceneTransition> {
        self.transition.as_ref()
    }

    pub fn localization(&self) -> &LocalizationManager {
        &self.localization
    }

    pub fn localization_mut(&mut self) -> &mut LocalizationManager {
        &mut self.localization
    }

    pub fn vfs(&self) -> Option<&Arc<VirtualFileSystem>> {
        self.vfs.as_ref()
    }

    pub fn resources(&self) -> Option<&ResourceCache> {
        self.resources.as_ref()
    }

    pub fn save_store(&self) -> Option<&SaveStore> {
        self.saves.as_ref()
    }

    pub fn crash_guard(&self) -> &CrashGuard {
        &self.guard
    }

    pub fn play_mode(&self) -> PlayMode {
        self.mode
    }

    pub fn is_isolated(&self) -> bool {
        self.guard.is_isolated()
    }

    pub fn script_id(&self) -> Option<&str> {
        self.script_id.as_deref()
    }

    // ========== 脚本加载 ==========

    pub fn load_script(&mut self, bytecode: &[u8]) -> HostResult<()> {
        self.vm.load(bytecode).map_err(VnError::from)?;
        self.script_id = None;
        self.after_script_loaded();
        Ok(())
    }

    pub fn load_program(&mut self, program: Program) {
        self.vm.load_program(program);
        self.script_id = None;
        self.after_script_loaded();
    }

    /// 从 VFS 读取并加载脚本
    pub fn load_script_resource(&mut self, resource_id: &str) -> HostResult<()> {
        let program = self.read_program(resource_id)?;
        self.vm.load_program(program);
        self.script_id = Some(resource_id.to_string());
        self.after_script_loaded();
        Ok(())
    }

    fn read_program(&self, resource_id: &str) -> HostResult<Program> {
        let bytes = self.read_resource(resource_id)?;
        Ok(Program::from_bytes(&bytes).map_err(VnError::from)?)
    }

    fn after_script_loaded(&mut self) {
        self.transition = None;
        self.last_node = None;
        self.last_ip = None;
        self.last_call_depth = 0;
        self.fault_reported = false;
        self.guard.clear_checkpoints();
        self.guard.clear_isolation();
        self.guard.reset_recovery_attempts();
        let id = self.guard.capture_checkpoint("start", &self.vm, &self.scene);
        self.push_event(DebugEvent::CheckpointCaptured(id));
        self.set_mode(PlayMode::Stopped);
        info!(instructions = self.vm.instruction_count(), "脚本已加载");
    }

    fn read_resource(&self, resource_id: &str) -> HostResult<Vec<u8>> {
        let vfs = self
            .vfs
            .as_ref()
            .ok_or_else(|| VfsError::NotFound(resource_id.to_string()))?;
        Ok(vfs.read(resource_id)?)
    }

    /// 从 VFS 加载字符串表；`format` 为空时按扩展名推断
    pub fn load_locale_resource(
        &mut self,
        locale: &str,
        resource_id: &str,
        format: Option<&str>,
    ) -> HostResult<usize> {
        let format = match format {
            Some(name) => LocalizationFormat::from_name(name),
            None => LocalizationFormat::from_path(Path::new(resource_id)),
        }
        .ok_or_else(|| LocalizationError::UnsupportedFormat(resource_id.to_string()))?;
        let bytes = self.read_resource(resource_id)?;
        let text = String::from_utf8(bytes).map_err(|e| LocalizationError::Io {
            path: resource_id.to_string(),
            message: e.to_string(),
        })?;
        Ok(self.localization.load_strings_from_memory(locale, &text, format)?)
    }

    // ========== 播放控制 ==========

    pub fn play(&mut self) -> HostResult<()> {
        if self.guard.is_isolated() {
            let reason = self
                .guard
                .last_error()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            return Err(HostError::Isolated(reason));
        }
        if self.vm.instruction_count() == 0 {
            return Err(HostError::NoScript);
        }
        if self.mode == PlayMode::Stopped && self.vm.is_halted() && self.vm.last_fault().is_none() {
            self.vm.reset();
            self.scene.clear();
            self.last_node = None;
        }
        self.vm.resume();
        self.set_mode(PlayMode::Playing);
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.mode == PlayMode::Playing {
            self.vm.pause();
            self.set_mode(PlayMode::Paused);
        }
    }

    /// 停止并回到脚本开头
    pub fn stop(&mut self) {
        self.vm.reset();
        self.scene.clear();
        self.transition = None;
        self.audio.push(AudioRequest::StopMusic);
        self.guard.clear_checkpoints();
        self.guard.clear_isolation();
        self.last_node = None;
        self.fault_reported = false;
        self.set_mode(PlayMode::Stopped);
    }

    fn set_mode(&mut self, mode: PlayMode) {
        if self.mode != mode {
            self.mode = mode;
            self.push_event(DebugEvent::PlayModeChanged(mode));
        }
    }

    // ========== 断点 ==========

    pub fn add_breakpoint(&mut self, node: impl Into<String>) {
        self.breakpoints.insert(node.into());
    }

    pub fn remove_breakpoint(&mut self, node: &str) -> bool {
        self.breakpoints.remove(node)
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &str> {
        self.breakpoints.iter().map(String::as_str)
    }

    /// 进入新节点时发出事件；命中断点时暂停并返回 true
    fn check_node(&mut self) -> bool {
        let node = self.vm.current_node().map(str::to_string);
        if node == self.last_node {
            return false;
        }
        self.last_node = node.clone();
        let Some(node) = node else { return false };
        self.push_event(DebugEvent::CurrentNodeChanged(node.clone()));
        if self.breakpoints.contains(&node) {
            info!(node = %node, "命中断点");
            self.vm.pause();
            self.set_mode(PlayMode::Paused);
            self.push_event(DebugEvent::BreakpointHit(node));
            return true;
        }
        false
    }

    // ========== 帧推进 ==========

    /// 推进一帧
    pub fn tick(&mut self, dt: f64) -> TickReport {
        let mut report = TickReport::default();
        if self.mode != PlayMode::Playing {
            return report;
        }
        let dt = dt.max(0.0);
        self.scene.update(dt as f32);
        if let Some(transition) = self.transition.as_mut() {
            transition.update(dt as f32);
            if !transition.is_active() {
                self.transition = None;
            }
        }
        self.vm.advance_time(dt);
        if let Some(id) = self.guard.tick(dt, &self.vm, &self.scene) {
            self.push_event(DebugEvent::CheckpointCaptured(id));
        }

        let config = self.guard.config();
        let max_instructions = config.max_instructions_per_frame.max(1);
        let max_frame = Duration::from_secs_f64(config.max_frame_time_ms.max(0.0) / 1000.0);
        let start = Instant::now();
        while matches!(self.vm.run_state(), RunState::Idle | RunState::Running) {
            if report.instructions >= max_instructions {
                report.budget_exhausted = true;
                break;
            }
            if report.instructions > 0
                && report.instructions % WALL_CLOCK_CHECK_INTERVAL == 0
                && start.elapsed() > max_frame
            {
                report.budget_exhausted = true;
                break;
            }
            if self.check_node() {
                report.breakpoint_hit = true;
                break;
            }
            report.instructions += self.vm.run_for(1);
            self.dispatch_pending();
            if self.mode != PlayMode::Playing {
                break;
            }
        }
        report.elapsed = start.elapsed();

        self.check_fault();
        if self.vm.run_state() == RunState::Running && report.budget_exhausted {
            if self.guard.feed(WatchdogKind::Script, dt) {
                self.guard.disarm(WatchdogKind::Script);
                let seconds = self.guard.timeout_for(WatchdogKind::Script);
                let record = RuntimeErrorRecord::new(
                    Severity::Fatal,
                    ErrorKind::Timeout,
                    format!("脚本连续执行超过 {seconds:.1} 秒未让出"),
                )
                .at(&self.vm, &self.scene)
                .recoverable(true);
                self.report(record);
            }
        } else {
            self.guard.disarm(WatchdogKind::Script);
        }
        if let Some(record) = self.guard.check_memory(&self.vm) {
            self.report(record);
        }
        self.emit_state_events();
        report
    }

    /// 调试器单步：执行一条指令后保持暂停
    pub fn step_instruction(&mut self) -> bool {
        if self.mode == PlayMode::Playing || self.guard.is_isolated() {
            return false;
        }
        self.vm.resume();
        let executed = self.vm.run_for(1) > 0;
        self.dispatch_pending();
        self.last_node = self.vm.current_node().map(str::to_string);
        if matches!(self.vm.run_state(), RunState::Idle | RunState::Running) {
            self.vm.pause();
        }
        self.set_mode(PlayMode::Paused);
        self.check_fault();
        self.emit_state_events();
        executed
    }

    fn check_fault(&mut self) {
        match self.vm.last_fault().cloned() {
            Some(fault) if !self.fault_reported => {
                self.fault_reported = true;
                let kind = ErrorKind::ScriptExecution;
                let record = RuntimeErrorRecord::new(Severity::Fatal, kind, fault.to_string())
                    .at(&self.vm, &self.scene)
                    .recoverable(true);
                self.report(record);
            }
            Some(_) => {}
            None => {
                self.fault_reported = false;
                if self.vm.is_halted() && self.mode == PlayMode::Playing {
                    info!("脚本执行完毕");
                    self.set_mode(PlayMode::Stopped);
                }
            }
        }
    }

    fn report(&mut self, record: RuntimeErrorRecord) {
        self.push_event(DebugEvent::RuntimeError(record.clone()));
        match self.guard.handle(record, &mut self.vm, &mut self.scene) {
            Reaction::Continue => {}
            Reaction::Pause | Reaction::Isolate => self.set_mode(PlayMode::Paused),
            Reaction::Recovered(id) => {
                self.transition = None;
                self.last_node = None;
                self.fault_reported = false;
                self.push_event(DebugEvent::CheckpointRestored(id));
            }
        }
    }

    fn emit_state_events(&mut self) {
        let ip = self.vm.ip();
        if self.last_ip != Some(ip) {
            self.last_ip = Some(ip);
            self.push_event(DebugEvent::ExecutionStepChanged {
                index: ip as usize,
                total: self.vm.instruction_count(),
                instruction: self.vm.current_instruction_text(),
            });
        }
        let depth = self.vm.call_stack().len();
        if depth != self.last_call_depth {
            self.last_call_depth = depth;
            let scopes = self.vm.call_stack().iter().map(|f| f.scope.clone()).collect();
            self.push_event(DebugEvent::CallStackChanged(scopes));
            self.push_event(DebugEvent::StackFramesChanged(self.vm.current_stack_frames()));
        }
        if self.vm.take_variables_dirty() {
            self.push_event(DebugEvent::VariablesChanged);
        }
        if self.vm.take_flags_dirty() {
            self.push_event(DebugEvent::FlagsChanged);
        }
    }

    fn push_event(&mut self, event: DebugEvent) {
        if self.events.len() >= MAX_DEBUG_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain_debug_events(&mut self) -> Vec<DebugEvent> {
        self.events.drain(..).collect()
    }

    pub fn drain_audio_requests(&mut self) -> Vec<AudioRequest> {
        std::mem::take(&mut self.audio)
    }

    // ========== 引擎调用分派 ==========

    fn dispatch_pending(&mut self) {
        for call in self.vm.drain_native_calls() {
            self.dispatch(call);
        }
    }

    fn dispatch(&mut self, call: NativeCall) {
        let text = call.text.clone().unwrap_or_default();
        match call.opcode {
            Opcode::ShowBackground => {
                self.scene.show_background(&text);
                self.load_texture(&text);
                self.push_event(DebugEvent::SceneChanged(self.scene.scene_id().to_string()));
            }
            Opcode::ShowCharacter => {
                let character = call.arg_str(0).unwrap_or_default();
                let slot = call.arg_str(1).unwrap_or_default();
                self.scene.show_character(&text, &character, &slot);
                self.push_event(DebugEvent::SceneChanged(self.scene.scene_id().to_string()));
            }
            Opcode::HideCharacter => match self.scene.hide_character(&text) {
                Ok(()) => {
                    self.push_event(DebugEvent::SceneChanged(self.scene.scene_id().to_string()))
                }
                Err(e) => {
                    let record = RuntimeErrorRecord::new(Severity::Warning, e.kind(), e.to_string())
                        .at(&self.vm, &self.scene);
                    self.report(record);
                }
            },
            Opcode::ShowText => {
                let speaker = self.localization.resolve_text(&call.arg_str(0).unwrap_or_default());
                let line = self.localization.resolve_text(&text);
                self.scene.show_dialogue(&speaker, &line);
                self.push_event(DebugEvent::DialogueShown { speaker, text: line });
            }
            Opcode::Choice => {
                let options: Vec<String> = call
                    .args
                    .iter()
                    .map(|v| self.localization.resolve_text(&v.to_string()))
                    .collect();
                self.scene.show_choices(&options);
                self.push_event(DebugEvent::ChoicesShown(options));
            }
            Opcode::PlaySound => self.audio.push(AudioRequest::PlaySound(text)),
            Opcode::PlayMusic => self.audio.push(AudioRequest::PlayMusic(text)),
            Opcode::StopMusic => self.audio.push(AudioRequest::StopMusic),
            Opcode::Transition => {
                let duration = call.arg_f64(0).unwrap_or(0.0);
                self.start_transition(&text, duration);
            }
            Opcode::GotoScene => self.goto_scene(&text),
            Opcode::HideDialogue => self.scene.hide_dialogue(),
            // WAIT 由 VM 自己计时
            Opcode::Wait => {}
            other => debug!(opcode = ?other, "忽略引擎调用"),
        }
    }

    fn load_texture(&mut self, id: &str) {
        if id.is_empty() {
            return;
        }
        let outcome = {
            let Some(cache) = &self.resources else { return };
            self.guard
                .time(WatchdogKind::AssetLoad, || cache.load(id, ResourceKind::Texture))
        };
        let record = match outcome {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => RuntimeErrorRecord::new(Severity::Warning, e.kind(), e.to_string()),
            Err((_, seconds)) => RuntimeErrorRecord::new(
                Severity::Fatal,
                ErrorKind::Timeout,
                format!("加载 {id} 耗时 {seconds:.2} 秒，超过看门狗上限"),
            )
            .recoverable(true),
        };
        let record = record.at(&self.vm, &self.scene);
        self.report(record);
    }

    fn start_transition(&mut self, name: &str, duration: f64) {
        let Some(kind) = TransitionKind::from_name(name) else {
            let record = RuntimeErrorRecord::new(
                Severity::Warning,
                ErrorKind::InvalidFormat,
                format!("未知的过渡效果: {name}"),
            )
            .at(&self.vm, &self.scene);
            self.report(record);
            return;
        };
        let mut transition = SceneTransition::new(kind);
        transition.start(duration as f32);
        self.transition = transition.is_active().then_some(transition);
    }

    /// 切换场景：优先跳到当前程序中的同名节点，否则从 `scripts/<name>.nmb` 加载
    fn goto_scene(&mut self, name: &str) {
        self.scene.set_scene_id(name);
        self.push_event(DebugEvent::SceneChanged(name.to_string()));
        if self.vm.jump_to_node(name) {
            self.last_node = None;
            return;
        }
        if let Err(e) = self.load_scene_script(name) {
            let message = format!("无法切换到场景 {name}: {e}");
            let record = RuntimeErrorRecord::new(Severity::Error, e.kind(), message)
                .at(&self.vm, &self.scene);
            self.report(record);
        }
    }

    /// 换入场景脚本，保留变量与旗标；旧程序的检查点随之作废
    fn load_scene_script(&mut self, name: &str) -> HostResult<()> {
        let resource_id = format!("{SCRIPT_DIR}/{name}.nmb");
        let program = self.read_program(&resource_id)?;
        let variables = self.vm.variables().clone();
        let flags = self.vm.flags().clone();
        self.vm.load_program(program);
        for (name, value) in variables {
            self.vm.set_variable(name, value);
        }
        for (name, value) in flags {
            self.vm.set_flag(name, value);
        }
        self.script_id = Some(resource_id);
        self.last_node = None;
        self.guard.clear_checkpoints();
        self.capture_checkpoint(name);
        Ok(())
    }

    // ========== 输入 ==========

    /// 处理输入，返回输入是否被消费
    pub fn handle_input(&mut self, input: Input) -> bool {
        if self.guard.is_isolated() {
            return false;
        }
        match input {
            Input::Continue => {
                if !self.scene.is_typewriter_complete() {
                    return self.scene.skip_typewriter();
                }
                if let Some(mut transition) = self.transition.take() {
                    transition.finish();
                    return true;
                }
                match self.vm.signal_continue() {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(error = %e, "忽略继续输入");
                        false
                    }
                }
            }
            Input::ChoiceNext => self.scene.select_next_choice(),
            Input::ChoicePrevious => self.scene.select_previous_choice(),
            Input::ChoiceConfirm => {
                let Some(index) = self.scene.choice_menu().map(|m| m.selected_index()) else {
                    return false;
                };
                self.choose(index)
            }
            Input::Choose(index) => self.choose(index),
            Input::Skip => {
                let mut skipped = self.scene.skip_typewriter();
                if let Some(mut transition) = self.transition.take() {
                    transition.finish();
                    skipped = true;
                }
                if self.scene.has_active_animations() {
                    self.scene.finish_animations();
                    skipped = true;
                }
                skipped
            }
        }
    }

    fn choose(&mut self, index: usize) -> bool {
        match self.vm.signal_choice(index) {
            Ok(()) => {
                self.scene.hide_choices();
                true
            }
            Err(e) => {
                warn!(index, error = %e, "选择无效");
                false
            }
        }
    }

    /// 绘制场景与过渡覆盖层
    pub fn render(&self, renderer: &mut dyn Renderer) {
        self.scene.render(renderer);
        if let Some(transition) = &self.transition {
            transition.render(renderer);
        }
    }

    // ========== 检查点 ==========

    pub fn capture_checkpoint(&mut self, label: &str) -> u64 {
        let id = self.guard.capture_checkpoint(label, &self.vm, &self.scene);
        self.push_event(DebugEvent::CheckpointCaptured(id));
        id
    }

    /// 手动恢复检查点；恢复后处于暂停状态
    pub fn restore_checkpoint(&mut self, id: u64) -> bool {
        if !self.guard.restore_checkpoint(id, &mut self.vm, &mut self.scene) {
            return false;
        }
        self.transition = None;
        self.last_node = None;
        self.fault_reported = false;
        self.vm.pause();
        self.set_mode(PlayMode::Paused);
        self.push_event(DebugEvent::CheckpointRestored(id));
        true
    }

    // ========== 存档 ==========

    /// 下次存档附带的缩略图
    pub fn set_save_thumbnail(&mut self, thumbnail: Option<Thumbnail>) {
        self.thumbnail = thumbnail;
    }

    /// 从当前 VM 与场景状态构建存档数据
    ///
    /// 布尔变量与调用栈只存在于 `__vm_state` 快照中。
    pub fn build_save_data(&self) -> HostResult<SaveData> {
        let mut data = SaveData {
            scene_id: self.scene.scene_id().to_string(),
            node_id: self.vm.current_node().unwrap_or_default().to_string(),
            thumbnail: self.thumbnail.clone(),
            ..SaveData::default()
        };
        for (name, value) in self.vm.variables() {
            match value {
                Value::Int(v) => {
                    data.int_variables.insert(name.clone(), *v);
                }
                Value::Float(v) => {
                    data.float_variables.insert(name.clone(), *v);
                }
                Value::String(v) => {
                    data.string_variables.insert(name.clone(), v.clone());
                }
                Value::Bool(_) => {}
            }
        }
        data.flags = self.vm.flags().clone();

        let vm_state = serde_json::to_string(&self.vm.snapshot())
            .map_err(|e| SaveError::InvalidData(format!("VM 快照序列化失败: {e}")))?;
        let scene_state = String::from_utf8(self.scene.save_state().to_json_bytes())
            .map_err(|e| SaveError::InvalidData(format!("场景快照编码失败: {e}")))?;
        data.string_variables.insert(VM_STATE_KEY.to_string(), vm_state);
        data.string_variables.insert(SCENE_STATE_KEY.to_string(), scene_state);
        if let Some(script) = &self.script_id {
            data.string_variables.insert(SCRIPT_KEY.to_string(), script.clone());
        }
        Ok(data)
    }

    /// 应用存档数据
    ///
    /// 有快照时精确恢复；否则从变量表重建并跳到保存时的节点。
    /// 存档记录的脚本与当前不同时先换入该脚本。所有校验在修改任何状态前完成，
    /// 失败时 VM、场景与当前脚本保持不变。
    pub fn apply_save_data(&mut self, mut data: SaveData) -> HostResult<()> {
        let vm_state = data.string_variables.remove(VM_STATE_KEY);
        let scene_state = data.string_variables.remove(SCENE_STATE_KEY);
        let script = data.string_variables.remove(SCRIPT_KEY);

        let program = match &script {
            Some(id) if self.script_id.as_ref() != Some(id) => Some(self.read_program(id)?),
            _ => None,
        };
        let target = program.as_ref().unwrap_or_else(|| self.vm.program());

        let snapshot = vm_state.and_then(|json| match serde_json::from_str::<VmSnapshot>(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "存档中的 VM 快照无法解析，按变量表恢复");
                None
            }
        });
        match &snapshot {
            Some(snapshot) if !snapshot.fits(target) => {
                return Err(SaveError::InvalidData(format!(
                    "VM 快照地址 {} 超出脚本范围（{} 条指令）",
                    snapshot.ip,
                    target.instructions.len()
                ))
                .into());
            }
            None if !data.node_id.is_empty() && target.find_symbol(&data.node_id).is_none() => {
                let message = format!("节点 {} 不存在", data.node_id);
                return Err(SaveError::InvalidData(message).into());
            }
            _ => {}
        }

        let scene_state = scene_state.and_then(|json| {
            SceneState::from_json_bytes(json.as_bytes())
                .inspect_err(|e| warn!(error = %e, "存档中的场景快照无法解析，场景将被清空"))
                .ok()
        });
        // 场景加载是原子的：失败时旧场景保留，VM 尚未改动
        match scene_state {
            Some(state) => self.scene.load_state(&state).map_err(VnError::from)?,
            None => self.scene.clear(),
        }
        self.scene.set_scene_id(data.scene_id.as_str());

        let switched = program.is_some();
        if let Some(program) = program {
            self.vm.load_program(program);
            self.script_id = script;
        }
        match snapshot {
            Some(snapshot) => self.vm.restore(snapshot),
            None => {
                if !data.node_id.is_empty() {
                    self.vm.jump_to_node(&data.node_id);
                }
                self.vm.clear_variables();
                restore_variables(&mut self.vm, &data);
            }
        }

        self.transition = None;
        self.last_node = None;
        self.fault_reported = false;
        if switched {
            self.guard.clear_checkpoints();
        }
        self.guard.clear_isolation();
        self.guard.reset_recovery_attempts();
        if self.mode == PlayMode::Playing {
            self.vm.resume();
        }
        self.capture_checkpoint("load");
        Ok(())
    }

    fn store(&self) -> HostResult<&SaveStore> {
        self.saves.as_ref().ok_or(HostError::NoSaveStore)
    }

    pub fn save_game(&self, slot: u32) -> HostResult<()> {
        let data = self.build_save_data()?;
        self.store()?.save(slot, &data)?;
        info!(slot, scene = %data.scene_id, node = %data.node_id, "已存档");
        Ok(())
    }

    pub fn load_game(&mut self, slot: u32) -> HostResult<()> {
        let data = self.store()?.load(slot)?;
        self.apply_save_data(data)?;
        info!(slot, "已读档");
        Ok(())
    }

    pub fn save_auto(&self) -> HostResult<()> {
        let data = self.build_save_data()?;
        self.store()?.save_auto(&data)?;
        Ok(())
    }

    pub fn load_auto(&mut self) -> HostResult<()> {
        let data = self.store()?.load_auto()?;
        self.apply_save_data(data)
    }
}

fn restore_variables(vm: &mut ScriptVm, data: &SaveData) {
    let ints = data.int_variables.iter().map(|(k, v)| (k, Value::Int(*v)));
    let floats = data.float_variables.iter().map(|(k, v)| (k, Value::Float(*v)));
    let strings = data
        .string_variables
        .iter()
        .map(|(k, v)| (k, Value::String(v.clone())));
    let variables: BTreeMap<&String, Value> = ints.chain(floats).chain(strings).collect();
    for (name, value) in variables {
        vm.set_variable(name.clone(), value);
    }
    for (name, value) in &data.flags {
        vm.set_flag(name.clone(), *value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nm_runtime::bytecode::ProgramBuilder;

    use crate::vfs::{PackBuildOptions, PackBuilder, PackType};

    fn host_with(program: Program) -> RuntimeHost {
        let mut host = RuntimeHost::new(RuntimeConfig::default());
        host.load_program(program);
        host.play().unwrap();
        host
    }

    fn dialogue_script() -> Program {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.show_background("bg/room.png");
        b.say("Alice", "loc:greeting");
        b.push_int(3);
        b.store_var("hp");
        b.node("second");
        b.say("Alice", "bye");
        b.halt();
        b.build()
    }

    fn advance(host: &mut RuntimeHost) {
        host.handle_input(Input::Skip);
        assert!(host.handle_input(Input::Continue));
    }

    #[test]
    fn test_tick_routes_native_calls() {
        let mut host = RuntimeHost::new(RuntimeConfig::default());
        host.localization_mut().set_string("en", "greeting", "Hello!");
        host.load_program(dialogue_script());
        host.play().unwrap();
        host.drain_debug_events();

        host.tick(0.016);
        assert!(host.vm().is_waiting());
        assert_eq!(
            host.scene().save_state().active_background.as_deref(),
            Some("bg/room.png")
        );
        assert_eq!(host.scene().dialogue().map(|d| d.text.as_str()), Some("Hello!"));
        let events = host.drain_debug_events();
        assert!(events.contains(&DebugEvent::CurrentNodeChanged("start".into())));
        assert!(events.contains(&DebugEvent::DialogueShown {
            speaker: "Alice".into(),
            text: "Hello!".into()
        }));

        advance(&mut host);
        host.tick(0.016);
        assert_eq!(host.vm().get_int("hp"), Some(3));
        advance(&mut host);
        host.tick(0.016);
        assert!(host.vm().is_halted());
        assert_eq!(host.play_mode(), PlayMode::Stopped);
    }

    #[test]
    fn test_instruction_budget() {
        let mut b = ProgramBuilder::new();
        b.node("loop");
        let top = b.label();
        b.bind(top);
        b.push_int(1);
        b.store_var("x");
        b.jump_to(top);
        let mut host = RuntimeHost::new(RuntimeConfig {
            max_instructions_per_frame: 10,
            script_timeout_seconds: 0.05,
            enable_auto_recovery: false,
            ..RuntimeConfig::default()
        });
        host.load_program(b.build());
        host.play().unwrap();

        let report = host.tick(0.02);
        assert_eq!(report.instructions, 10);
        assert!(report.budget_exhausted);
        assert!(!host.is_isolated());

        host.tick(0.02);
        host.tick(0.02);
        assert!(host.is_isolated());
        assert_eq!(host.play_mode(), PlayMode::Paused);
        assert_eq!(
            host.crash_guard().last_error().map(|e| e.kind),
            Some(ErrorKind::Timeout)
        );
        assert!(matches!(host.play(), Err(HostError::Isolated(_))));
    }

    #[test]
    fn test_choice_input() {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.choice(&["Left", "Right"]);
        b.store_var("picked");
        b.halt();
        let mut host = host_with(b.build());
        host.tick(0.016);
        assert!(host.scene().choice_menu().is_some());

        assert!(host.handle_input(Input::ChoiceNext));
        assert!(host.handle_input(Input::ChoiceConfirm));
        assert!(host.scene().choice_menu().is_none());
        host.tick(0.016);
        assert_eq!(host.vm().get_int("picked"), Some(1));
    }

    #[test]
    fn test_breakpoint_pauses_on_node_entry() {
        let mut host = RuntimeHost::new(RuntimeConfig::default());
        host.load_program(dialogue_script());
        host.add_breakpoint("second");
        host.play().unwrap();
        host.tick(0.016);
        advance(&mut host);

        let report = host.tick(0.016);
        assert!(report.breakpoint_hit);
        assert_eq!(host.play_mode(), PlayMode::Paused);
        assert_eq!(host.vm().current_node(), Some("second"));
        assert!(host.drain_debug_events().contains(&DebugEvent::BreakpointHit("second".into())));

        host.play().unwrap();
        let report = host.tick(0.016);
        assert!(!report.breakpoint_hit);
        assert!(host.vm().is_waiting());
    }

    #[test]
    fn test_step_instruction() {
        let mut host = RuntimeHost::new(RuntimeConfig::default());
        host.load_program(dialogue_script());
        assert!(host.step_instruction());
        assert_eq!(host.play_mode(), PlayMode::Paused);
        assert_eq!(host.vm().ip(), 1);
        assert!(host.scene().save_state().active_background.is_some());
        let events = host.drain_debug_events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DebugEvent::ExecutionStepChanged { index: 1, .. }))
        );
    }

    #[test]
    fn test_audio_and_transition_requests() {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.play_music("bgm/theme.ogg");
        b.transition("fade", 0.5);
        b.transition("sparkle", 0.5);
        b.play_sound("se/click.wav");
        b.stop_music();
        b.halt();
        let mut host = host_with(b.build());
        host.tick(0.016);

        assert_eq!(
            host.drain_audio_requests(),
            vec![
                AudioRequest::PlayMusic("bgm/theme.ogg".into()),
                AudioRequest::PlaySound("se/click.wav".into()),
                AudioRequest::StopMusic,
            ]
        );
        assert!(host.transition().is_some_and(|t| t.is_active()));
        assert_eq!(
            host.crash_guard().last_error().map(|e| e.kind),
            Some(ErrorKind::InvalidFormat)
        );
    }

    #[test]
    fn test_goto_scene_loads_script_from_vfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut next = ProgramBuilder::new();
        next.node("chapter2");
        next.say("B", "chapter two");
        next.halt();
        let mut builder = PackBuilder::new(PackBuildOptions::default());
        builder.add("scripts/chapter2.nmb", next.build().to_bytes());
        let path = dir.path().join("base.nmpack");
        builder.write_to(&path).unwrap();
        let vfs = Arc::new(VirtualFileSystem::default());
        vfs.mount(&path, PackType::Base, 0).unwrap();

        let mut b = ProgramBuilder::new();
        b.node("start");
        b.push_int(7);
        b.store_var("gold");
        b.goto_scene("chapter2");
        b.say("A", "unreachable");
        b.halt();
        let mut host = RuntimeHost::new(RuntimeConfig::default()).with_vfs(vfs, 8);
        host.load_program(b.build());
        host.play().unwrap();
        host.tick(0.016);

        assert_eq!(host.scene().scene_id(), "chapter2");
        assert_eq!(host.scene().dialogue().map(|d| d.text.as_str()), Some("chapter two"));
        assert_eq!(host.vm().get_int("gold"), Some(7));
    }

    #[test]
    fn test_missing_scene_pauses() {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.goto_scene("nowhere");
        b.halt();
        let mut host = host_with(b.build());
        host.tick(0.016);
        assert_eq!(host.play_mode(), PlayMode::Paused);
        let error = host.crash_guard().last_error().unwrap();
        assert_eq!(error.severity, Severity::Error);
        assert_eq!(error.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_save_and_load_game() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), SaveStoreConfig::default());
        let mut host = RuntimeHost::new(RuntimeConfig::default()).with_save_store(store);
        host.load_program(dialogue_script());
        host.play().unwrap();
        host.tick(0.016);
        advance(&mut host);
        host.tick(0.016);
        host.vm_mut().set_bool("met_alice", true);
        host.vm_mut().set_flag("chapter1", true);
        host.save_game(3).unwrap();

        let data = host.save_store().unwrap().load(3).unwrap();
        assert_eq!(data.node_id, "second");
        assert_eq!(data.int_variables.get("hp"), Some(&3));
        assert!(data.string_variables.contains_key(VM_STATE_KEY));

        host.stop();
        assert_eq!(host.vm().get_int("hp"), None);
        host.load_game(3).unwrap();
        assert_eq!(host.vm().get_int("hp"), Some(3));
        assert_eq!(host.vm().get_bool("met_alice"), Some(true));
        assert!(host.vm().get_flag("chapter1"));
        assert!(host.vm().get_string(VM_STATE_KEY).is_none());
        assert_eq!(host.scene().dialogue().map(|d| d.text.as_str()), Some("bye"));
        assert!(matches!(
            host.load_game(9),
            Err(HostError::Save(SaveError::NotFound(_)))
        ));
    }

    #[test]
    fn test_load_without_snapshot_jumps_to_node() {
        let mut host = RuntimeHost::new(RuntimeConfig::default());
        host.load_program(dialogue_script());
        let mut data = SaveData {
            scene_id: "intro".into(),
            node_id: "second".into(),
            ..SaveData::default()
        };
        data.int_variables.insert("hp".into(), 9);
        host.apply_save_data(data).unwrap();
        assert_eq!(host.vm().get_int("hp"), Some(9));
        assert_eq!(host.vm().current_node(), Some("second"));
        assert_eq!(host.scene().scene_id(), "intro");

        let bad = SaveData {
            node_id: "missing".into(),
            ..SaveData::default()
        };
        assert!(host.apply_save_data(bad).is_err());
    }

    /// 基础包只含第二章脚本，开场脚本通过 GotoScene 切过去
    fn chapter_vfs(dir: &Path) -> Arc<VirtualFileSystem> {
        let mut next = ProgramBuilder::new();
        next.node("chapter2");
        next.say("B", "chapter two");
        next.halt();
        let mut builder = PackBuilder::new(PackBuildOptions::default());
        builder.add("scripts/chapter2.nmb", next.build().to_bytes());
        let path = dir.join("base.nmpack");
        builder.write_to(&path).unwrap();
        let vfs = Arc::new(VirtualFileSystem::default());
        vfs.mount(&path, PackType::Base, 0).unwrap();
        vfs
    }

    fn opening_script() -> Program {
        let mut b = ProgramBuilder::new();
        b.node("start");
        b.push_int(7);
        b.store_var("gold");
        b.goto_scene("chapter2");
        b.say("A", "unreachable");
        b.halt();
        b.build()
    }

    #[test]
    fn test_load_after_scene_switch_restores_scene_script() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = chapter_vfs(dir.path());
        let mut host = RuntimeHost::new(RuntimeConfig::default()).with_vfs(Arc::clone(&vfs), 8);
        host.load_program(opening_script());
        host.play().unwrap();
        host.tick(0.016);
        assert_eq!(host.script_id(), Some("scripts/chapter2.nmb"));
        let data = host.build_save_data().unwrap();
        assert_eq!(
            data.string_variables.get(SCRIPT_KEY).map(String::as_str),
            Some("scripts/chapter2.nmb")
        );
        let saved_ip = host.vm().ip();

        let mut fresh = RuntimeHost::new(RuntimeConfig::default()).with_vfs(vfs, 8);
        fresh.load_program(opening_script());
        fresh.apply_save_data(data).unwrap();
        assert_eq!(fresh.script_id(), Some("scripts/chapter2.nmb"));
        assert!(fresh.vm().program().find_symbol("chapter2").is_some());
        assert_eq!(fresh.vm().ip(), saved_ip);
        assert_eq!(fresh.vm().current_node(), Some("chapter2"));
        assert_eq!(fresh.vm().get_int("gold"), Some(7));
        assert_eq!(fresh.scene().scene_id(), "chapter2");
        assert_eq!(
            fresh.scene().dialogue().map(|d| d.text.as_str()),
            Some("chapter two")
        );
    }

    #[test]
    fn test_load_with_missing_scene_script_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = chapter_vfs(dir.path());
        let mut host = RuntimeHost::new(RuntimeConfig::default()).with_vfs(Arc::clone(&vfs), 8);
        host.load_program(opening_script());
        host.play().unwrap();
        host.tick(0.016);
        let mut data = host.build_save_data().unwrap();
        data.string_variables
            .insert(SCRIPT_KEY.to_string(), "scripts/lost.nmb".to_string());

        let mut fresh = host_with(dialogue_script());
        fresh.tick(0.016);
        let ip = fresh.vm().ip();
        assert!(fresh.apply_save_data(data).is_err());
        assert_eq!(fresh.script_id(), None);
        assert_eq!(fresh.vm().ip(), ip);
        assert_eq!(fresh.vm().current_node(), Some("start"));
        assert_eq!(fresh.scene().scene_id(), "");
    }

    #[test]
    fn test_corrupt_scene_state_leaves_vm_untouched() {
        let mut host = host_with(dialogue_script());
        host.tick(0.016);
        let mut data = host.build_save_data().unwrap();
        let json = data.string_variables.get(SCENE_STATE_KEY).unwrap();
        let mut state = SceneState::from_json_bytes(json.as_bytes()).unwrap();
        let duplicate = state.objects[0].clone();
        state.objects.push(duplicate);
        data.string_variables.insert(
            SCENE_STATE_KEY.to_string(),
            String::from_utf8(state.to_json_bytes()).unwrap(),
        );

        advance(&mut host);
        host.tick(0.016);
        let ip = host.vm().ip();
        assert!(host.apply_save_data(data).is_err());
        assert_eq!(host.vm().ip(), ip);
        assert_eq!(host.vm().get_int("hp"), Some(3));
        assert_eq!(host.vm().current_node(), Some("second"));
        assert_eq!(host.scene().dialogue().map(|d| d.text.as_str()), Some("bye"));
    }

    #[test]
    fn test_snapshot_beyond_program_is_rejected() {
        let mut host = host_with(dialogue_script());
        host.tick(0.016);
        advance(&mut host);
        host.tick(0.016);
        let data = host.build_save_data().unwrap();

        let mut b = ProgramBuilder::new();
        b.node("start");
        b.halt();
        let mut short = RuntimeHost::new(RuntimeConfig::default());
        short.load_program(b.build());
        let err = short.apply_save_data(data).unwrap_err();
        assert!(matches!(err, HostError::Save(SaveError::InvalidData(_))));
        assert_eq!(short.vm().ip(), 0);
        assert_eq!(short.vm().get_int("hp"), None);
        assert_eq!(short.scene().scene_id(), "");
    }

    #[test]
    fn test_play_requires_script() {
        let mut host = RuntimeHost::new(RuntimeConfig::default());
        assert!(matches!(host.play(), Err(HostError::NoScript)));
        assert!(matches!(host.save_game(1), Err(HostError::NoSaveStore)));
    }
}
