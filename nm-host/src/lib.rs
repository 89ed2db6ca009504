//! # NovelMind Host 层
//!
//! 视觉小说播放引擎的宿主层实现，负责所有 IO 与集成工作。
//!
//! ## 架构说明
//!
//! Host 层负责：
//! - 分层资源包（签名、加密、优先级覆盖）
//! - 解码资源缓存与后台预加载
//! - 存档槽位文件
//! - 帧驱动：推进 VM、把引擎调用落到场景图上、路由输入
//! - 崩溃保护：检查点、看门狗、错误隔离
//!
//! 叙事逻辑本身全部在 `nm-runtime` 中，Host 层只做调度与持久化。

pub mod config;
pub mod crash_safety;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod resources;
pub mod runtime_host;
pub mod save_store;
pub mod vfs;

pub use config::{ConfigError, HostConfig, RuntimeConfig, SaveConfig, VfsConfig};
pub use crash_safety::{
    Checkpoint, CrashGuard, Reaction, RuntimeErrorRecord, Severity, WatchdogKind,
};
pub use error::{HostError, HostResult};
pub use resources::{CacheStats, ResourceCache, ResourceError, ResourceKind, ResourcePreloader};
pub use runtime_host::{AudioRequest, DebugEvent, Input, PlayMode, RuntimeHost, TickReport};
pub use save_store::{SaveStore, SaveStoreConfig, Slot, SlotMetadata};
pub use vfs::{CachedVfs, PackBuilder, PackType, VfsError, VirtualFileSystem};
