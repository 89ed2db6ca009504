//! # Config 模块
//!
//! 宿主配置管理，集中管理所有配置项。
//!
//! ## 配置优先级
//!
//! 1. 命令行参数 / 显式设置（最高）
//! 2. 配置文件 (config.json)
//! 3. 环境变量（仅资源包密钥）
//! 4. 默认值（最低）

use std::fs;
use std::path::{Path, PathBuf};

use nm_runtime::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::AesKey;
use crate::vfs::{PackLimits, PackType};

/// 宿主配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// 运行时与崩溃保护
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// 资源包
    #[serde(default)]
    pub vfs: VfsConfig,

    /// 存档
    #[serde(default)]
    pub save: SaveConfig,

    /// 资源缓存
    #[serde(default)]
    pub resources: ResourceConfig,

    /// 本地化
    #[serde(default)]
    pub localization: LocalizationConfig,

    /// 启动时挂载的资源包
    #[serde(default)]
    pub packs: Vec<PackMount>,

    /// 存档目录
    #[serde(default = "default_saves_dir")]
    pub saves_dir: PathBuf,

    /// 错误日志（JSON lines）
    #[serde(default = "default_error_log_path")]
    pub error_log_path: PathBuf,

    /// Mod 加载顺序配置
    #[serde(default = "default_mod_config_path")]
    pub mod_config_path: PathBuf,

    /// 日志级别（trace/debug/info/warn/error）
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// 运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 单次 VM 推进的看门狗上限
    #[serde(default = "default_script_timeout")]
    pub script_timeout_seconds: f64,

    /// 单次资源解码的看门狗上限
    #[serde(default = "default_asset_load_timeout")]
    pub asset_load_timeout_seconds: f64,

    /// 单次热重载的看门狗上限
    #[serde(default = "default_hot_reload_timeout")]
    pub hot_reload_timeout_seconds: f64,

    #[serde(default = "default_true")]
    pub enable_auto_checkpoints: bool,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_seconds: f64,

    /// 检查点环形缓冲大小
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// 致命错误后自动恢复到最近检查点
    #[serde(default = "default_true")]
    pub enable_auto_recovery: bool,

    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    #[serde(default = "default_true")]
    pub pause_on_error: bool,

    #[serde(default = "default_true")]
    pub isolate_runtime: bool,

    /// VM 软内存上限
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,

    #[serde(default = "default_max_instructions_per_frame")]
    pub max_instructions_per_frame: usize,

    /// 单帧脚本执行的墙钟预算
    #[serde(default = "default_max_frame_time_ms")]
    pub max_frame_time_ms: f64,
}

/// 资源包配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VfsConfig {
    /// 完整性失败时卸载出错的资源包
    #[serde(default)]
    pub strict_integrity: bool,

    /// 必须签名的资源包类型
    #[serde(default)]
    pub require_signature: Vec<PackType>,

    #[serde(default)]
    pub aes_key_hex: Option<String>,

    #[serde(default)]
    pub aes_key_file: Option<PathBuf>,

    /// PEM 公钥路径
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,

    /// 读取缓存预算（MB）
    #[serde(default = "default_vfs_cache_mb")]
    pub cache_size_mb: usize,

    #[serde(default)]
    pub limits: PackLimits,
}

/// 存档配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    #[serde(default = "default_true")]
    pub enable_compression: bool,

    #[serde(default)]
    pub enable_encryption: bool,

    /// 十六进制 32 字节密钥
    #[serde(default)]
    pub encryption_key_hex: Option<String>,
}

/// 资源缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// 解码资源缓存大小（MB）
    #[serde(default = "default_resource_cache_mb")]
    pub cache_size_mb: usize,
}

/// 本地化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationConfig {
    #[serde(default = "default_locale")]
    pub default_locale: String,

    #[serde(default = "default_locale")]
    pub current_locale: String,

    /// 启动时从 VFS 读取的字符串表
    #[serde(default)]
    pub files: Vec<LocaleFile>,
}

/// 单个字符串表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleFile {
    pub locale: String,
    /// VFS 资源 id
    pub resource: String,
    /// csv/json/po/xliff；为空时按扩展名推断
    #[serde(default)]
    pub format: Option<String>,
}

/// 启动时挂载的资源包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackMount {
    pub path: PathBuf,
    #[serde(default, rename = "type")]
    pub pack_type: PackType,
    #[serde(default)]
    pub priority: i32,
}

// 默认值函数

fn default_true() -> bool {
    true
}

fn default_saves_dir() -> PathBuf {
    PathBuf::from("saves")
}

fn default_error_log_path() -> PathBuf {
    PathBuf::from("logs/runtime_errors.jsonl")
}

fn default_mod_config_path() -> PathBuf {
    PathBuf::from("mods.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_script_timeout() -> f64 {
    5.0
}

fn default_asset_load_timeout() -> f64 {
    10.0
}

fn default_hot_reload_timeout() -> f64 {
    30.0
}

fn default_checkpoint_interval() -> f64 {
    30.0
}

fn default_max_checkpoints() -> usize {
    10
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_max_memory_mb() -> usize {
    512
}

fn default_max_instructions_per_frame() -> usize {
    10_000
}

fn default_max_frame_time_ms() -> f64 {
    8.0
}

fn default_vfs_cache_mb() -> usize {
    64
}

fn default_resource_cache_mb() -> usize {
    256
}

fn default_locale() -> String {
    "en".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            vfs: VfsConfig::default(),
            save: SaveConfig::default(),
            resources: ResourceConfig::default(),
            localization: LocalizationConfig::default(),
            packs: Vec::new(),
            saves_dir: default_saves_dir(),
            error_log_path: default_error_log_path(),
            mod_config_path: default_mod_config_path(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            script_timeout_seconds: default_script_timeout(),
            asset_load_timeout_seconds: default_asset_load_timeout(),
            hot_reload_timeout_seconds: default_hot_reload_timeout(),
            enable_auto_checkpoints: true,
            checkpoint_interval_seconds: default_checkpoint_interval(),
            max_checkpoints: default_max_checkpoints(),
            enable_auto_recovery: true,
            max_recovery_attempts: default_max_recovery_attempts(),
            pause_on_error: true,
            isolate_runtime: true,
            max_memory_mb: default_max_memory_mb(),
            max_instructions_per_frame: default_max_instructions_per_frame(),
            max_frame_time_ms: default_max_frame_time_ms(),
        }
    }
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            enable_encryption: false,
            encryption_key_hex: None,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: default_resource_cache_mb(),
        }
    }
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            default_locale: default_locale(),
            current_locale: default_locale(),
            files: Vec::new(),
        }
    }
}

impl SaveConfig {
    /// 解析存档密钥；未配置返回 `None`
    pub fn encryption_key(&self) -> Result<Option<AesKey>, ConfigError> {
        self.encryption_key_hex
            .as_deref()
            .filter(|hex| !hex.trim().is_empty())
            .map(AesKey::from_hex)
            .transpose()
            .map_err(|e| ConfigError::ValidationFailed(format!("存档密钥无效: {}", e)))
    }
}

impl HostConfig {
    /// 加载配置文件
    ///
    /// 如果文件不存在或解析失败，返回默认配置并记录警告。
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "配置文件不存在，使用默认配置");
            return Self::default();
        }

        match Self::load_strict(path) {
            Ok(config) => {
                info!(path = %path.display(), "配置文件加载成功");
                config
            }
            Err(e) => {
                warn!(error = %e, "配置文件无法使用，使用默认配置");
                Self::default()
            }
        }
    }

    /// 加载配置文件，失败时返回错误
    pub fn load_strict(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::SerializationFailed(e.to_string()))
    }

    /// 保存配置到文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializationFailed(e.to_string()))?;
        fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rt = &self.runtime;
        let timeouts = [
            ("script_timeout_seconds", rt.script_timeout_seconds),
            ("asset_load_timeout_seconds", rt.asset_load_timeout_seconds),
            ("hot_reload_timeout_seconds", rt.hot_reload_timeout_seconds),
            ("checkpoint_interval_seconds", rt.checkpoint_interval_seconds),
            ("max_frame_time_ms", rt.max_frame_time_ms),
        ];
        for (name, value) in timeouts {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} 必须为正数，当前为 {}",
                    name, value
                )));
            }
        }

        if rt.max_checkpoints == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_checkpoints 至少为 1".to_string(),
            ));
        }

        if rt.max_instructions_per_frame == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_instructions_per_frame 至少为 1".to_string(),
            ));
        }

        if let Some(hex) = &self.vfs.aes_key_hex {
            AesKey::from_hex(hex).map_err(|e| {
                ConfigError::ValidationFailed(format!("资源包密钥无效: {}", e))
            })?;
        }

        self.save.encryption_key()?;

        if self.localization.default_locale.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_locale 不能为空".to_string(),
            ));
        }

        for mount in &self.packs {
            if mount.priority.abs() > crate::vfs::registry::MAX_BASE_PRIORITY {
                warn!(
                    path = %mount.path.display(),
                    priority = mount.priority,
                    "资源包优先级超出 ±999，挂载时将被截断"
                );
            }
        }

        Ok(())
    }
}

/// 配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("配置序列化失败: {0}")]
    SerializationFailed(String),

    #[error("配置 IO 错误: {0}")]
    IoError(String),

    #[error("配置验证失败: {0}")]
    ValidationFailed(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IoError(_) => ErrorKind::IOError,
            Self::SerializationFailed(_) | Self::ValidationFailed(_) => ErrorKind::InvalidFormat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.runtime.max_checkpoints, 10);
        assert_eq!(config.saves_dir, PathBuf::from("saves"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HostConfig = serde_json::from_str(
            r#"{
                "runtime": { "max_instructions_per_frame": 50 },
                "packs": [{ "path": "dlc.nmpack", "type": "dlc", "priority": 5 }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.runtime.max_instructions_per_frame, 50);
        assert!(config.runtime.pause_on_error);
        assert_eq!(config.packs[0].pack_type, PackType::Dlc);
        assert_eq!(config.packs[0].priority, 5);
        assert_eq!(config.localization.default_locale, "en");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = HostConfig::default();
        config.runtime.max_checkpoints = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.runtime.script_timeout_seconds = 0.0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.save.encryption_key_hex = Some("1234".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_load_missing_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let missing = HostConfig::load(dir.path().join("none.json"));
        assert_eq!(missing.log_level, "info");

        let path = dir.path().join("config.json");
        let mut config = HostConfig::default();
        config.localization.current_locale = "ru".to_string();
        config.save(&path).unwrap();
        assert_eq!(HostConfig::load(&path).localization.current_locale, "ru");

        fs::write(&path, "{ broken").unwrap();
        assert!(HostConfig::load_strict(&path).is_err());
        assert_eq!(HostConfig::load(&path).localization.current_locale, "en");
    }
}
