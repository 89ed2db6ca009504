//! 资源包注册表与资源索引
//!
//! 有效优先级 = 类型基数 + basePriority（截断到 ±999）。索引键为
//! `(有效优先级, Mod 加载位置, 挂载序号)`，键最大的已启用包拥有该资源。
//!
//! 读操作持有共享锁，挂载 / 卸载 / 启用 / 排序持有独占锁并整体重建索引。
//! 覆盖事件在释放锁之后派发，监听器可以安全地回调 VFS。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::format::{PACK_ENCRYPTED, PackLimits, ResourceType};
use super::keys::PackKeys;
use super::manifest::{ENGINE_VERSION, PackDependency, version_satisfies};
use super::pack::{PackOpenOptions, PackReader};
use super::{VfsError, normalize_resource_id};
use crate::config::VfsConfig;
use crate::crypto::AesKey;

/// basePriority 的绝对值上限
pub const MAX_BASE_PRIORITY: i32 = 999;

/// 资源包类型，类型基数严格递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    #[default]
    Base,
    Patch,
    Dlc,
    Language,
    Mod,
}

impl PackType {
    pub fn type_base(self) -> i32 {
        match self {
            Self::Base => 0,
            Self::Patch => 1000,
            Self::Dlc => 2000,
            Self::Language => 3000,
            Self::Mod => 4000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Patch => "patch",
            Self::Dlc => "dlc",
            Self::Language => "language",
            Self::Mod => "mod",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [Self::Base, Self::Patch, Self::Dlc, Self::Language, Self::Mod]
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

/// VFS 行为选项
#[derive(Debug, Clone, Default)]
pub struct VfsOptions {
    /// 读取时完整性失败则卸载该包
    pub strict_integrity: bool,
    /// 必须签名的类型
    pub require_signature: Vec<PackType>,
    pub limits: PackLimits,
}

impl VfsOptions {
    pub fn from_config(config: &VfsConfig) -> Self {
        Self {
            strict_integrity: config.strict_integrity,
            require_signature: config.require_signature.clone(),
            limits: config.limits,
        }
    }
}

/// 已挂载资源包的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub pack_type: PackType,
    pub base_priority: i32,
    pub effective_priority: i32,
    pub enabled: bool,
    /// 签名已验证
    pub verified: bool,
    pub encrypted: bool,
    pub resource_count: usize,
    pub dependencies: Vec<PackDependency>,
    pub mount_sequence: u64,
}

/// 挂载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountResult {
    pub info: PackInfo,
    pub warnings: Vec<String>,
    /// 非致命的声明错误（例如依赖自身、重复依赖）
    pub errors: Vec<String>,
    /// 未满足的可选依赖
    pub missing_dependencies: Vec<String>,
}

/// 资源描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub id: String,
    pub resource_type: ResourceType,
    pub uncompressed_size: u64,
    pub stored_size: u64,
    pub checksum: u32,
    pub compressed: bool,
    pub encrypted: bool,
    pub pack_id: String,
}

/// 资源覆盖事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOverride {
    pub resource_id: String,
    /// 最低优先级的提供者
    pub original_pack_id: String,
    /// 当前拥有者
    pub override_pack_id: String,
    pub override_type: PackType,
}

/// Mod 加载顺序的持久化格式
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModConfig {
    #[serde(default)]
    pub load_order: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

type OverrideListener = Box<dyn Fn(&ResourceOverride) + Send + Sync>;

#[derive(Debug)]
struct MountedPack {
    reader: Arc<PackReader>,
    pack_type: PackType,
    base_priority: i32,
    enabled: bool,
    sequence: u64,
}

impl MountedPack {
    fn effective_priority(&self) -> i32 {
        self.pack_type.type_base() + self.base_priority
    }

    fn info(&self) -> PackInfo {
        let manifest = self.reader.manifest();
        PackInfo {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            path: self.reader.path().to_path_buf(),
            pack_type: self.pack_type,
            base_priority: self.base_priority,
            effective_priority: self.effective_priority(),
            enabled: self.enabled,
            verified: self.reader.is_verified(),
            encrypted: self.reader.header().has_flag(PACK_ENCRYPTED),
            resource_count: self.reader.resource_ids().len(),
            dependencies: manifest.dependencies.clone(),
            mount_sequence: self.sequence,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    packs: HashMap<String, MountedPack>,
    /// 资源 id → 拥有者包 id
    index: HashMap<String, String>,
    overrides: Vec<ResourceOverride>,
    /// Mod 加载顺序（可包含尚未挂载的 id）
    mod_order: Vec<String>,
    disabled_mods: HashSet<String>,
    next_sequence: u64,
}

impl Registry {
    fn mod_position(&self, id: &str) -> usize {
        self.mod_order
            .iter()
            .position(|m| m == id)
            .unwrap_or(usize::MAX)
    }

    /// 已启用的包，按优先级升序
    fn ordered_enabled(&self) -> Vec<&MountedPack> {
        let mut packs: Vec<&MountedPack> = self.packs.values().filter(|p| p.enabled).collect();
        packs.sort_by_key(|p| {
            let mod_pos = if p.pack_type == PackType::Mod {
                self.mod_position(p.reader.id())
            } else {
                0
            };
            (p.effective_priority(), mod_pos, p.sequence)
        });
        packs
    }

    /// 启用中且必需依赖 `pack_id` 的包
    fn enabled_dependents(&self, pack_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .packs
            .values()
            .filter(|p| p.enabled)
            .filter(|p| {
                let manifest = p.reader.manifest();
                manifest.dependencies.iter().any(|d| !d.optional && d.id == pack_id)
            })
            .map(|p| p.reader.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// 重建索引，返回本次的覆盖列表
    fn rebuild(&mut self) -> Vec<ResourceOverride> {
        let mut owners: HashMap<String, (String, String, PackType)> = HashMap::new();
        let mut overridden: HashSet<String> = HashSet::new();
        for pack in self.ordered_enabled() {
            let pack_id = pack.reader.id();
            for id in pack.reader.resource_ids() {
                match owners.get_mut(id) {
                    Some(owner) => {
                        owner.1 = pack_id.to_string();
                        owner.2 = pack.pack_type;
                        overridden.insert(id.clone());
                    }
                    None => {
                        owners.insert(
                            id.clone(),
                            (pack_id.to_string(), pack_id.to_string(), pack.pack_type),
                        );
                    }
                }
            }
        }

        let mut overrides: Vec<ResourceOverride> = overridden
            .into_iter()
            .filter_map(|id| {
                owners.get(&id).map(|(original, current, kind)| ResourceOverride {
                    resource_id: id.clone(),
                    original_pack_id: original.clone(),
                    override_pack_id: current.clone(),
                    override_type: *kind,
                })
            })
            .collect();
        overrides.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));

        self.index = owners
            .into_iter()
            .map(|(id, (_, owner, _))| (id, owner))
            .collect();
        self.overrides = overrides.clone();
        overrides
    }

    fn mounted_mods(&self) -> Vec<String> {
        let mut mods: Vec<&MountedPack> = self
            .packs
            .values()
            .filter(|p| p.pack_type == PackType::Mod)
            .collect();
        mods.sort_by_key(|p| (self.mod_position(p.reader.id()), p.sequence));
        mods.into_iter().map(|p| p.reader.id().to_string()).collect()
    }
}

/// 分层虚拟文件系统
pub struct VirtualFileSystem {
    registry: RwLock<Registry>,
    keys: RwLock<PackKeys>,
    options: VfsOptions,
    listeners: Mutex<Vec<OverrideListener>>,
    generation: AtomicU64,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new(VfsOptions::default())
    }
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSystem")
            .field("packs", &self.read_registry().packs.len())
            .field("generation", &self.generation())
            .finish()
    }
}

impl VirtualFileSystem {
    pub fn new(options: VfsOptions) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            keys: RwLock::new(PackKeys::default()),
            options,
            listeners: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// 由配置创建，并按「配置 > 环境变量」解析密钥
    pub fn from_config(config: &VfsConfig) -> Result<Self, VfsError> {
        let vfs = Self::new(VfsOptions::from_config(config));
        vfs.set_keys(PackKeys::resolve(config)?);
        Ok(vfs)
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &VfsOptions {
        &self.options
    }

    pub fn set_keys(&self, keys: PackKeys) {
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = keys;
    }

    /// 显式设置 AES 密钥（优先于配置与环境变量）
    pub fn set_aes_key(&self, key: Option<AesKey>) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).aes_key = key;
    }

    pub fn set_public_key(&self, key: Option<VerifyingKey>) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).public_key = key;
    }

    /// 注册覆盖事件监听器
    pub fn add_override_listener<F>(&self, listener: F)
    where
        F: Fn(&ResourceOverride) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// 索引代数，每次重建加一
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn finish_rebuild(&self, overrides: Vec<ResourceOverride>) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for event in &overrides {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    // =========================================================================
    // 挂载
    // =========================================================================

    pub fn mount(
        &self,
        path: impl AsRef<Path>,
        pack_type: PackType,
        base_priority: i32,
    ) -> Result<MountResult, VfsError> {
        let path = path.as_ref();
        let mut warnings = Vec::new();
        let clamped = base_priority.clamp(-MAX_BASE_PRIORITY, MAX_BASE_PRIORITY);
        if clamped != base_priority {
            warnings.push(format!(
                "优先级 {} 超出 ±{}，已截断为 {}",
                base_priority, MAX_BASE_PRIORITY, clamped
            ));
        }

        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner).clone();
        let open = PackOpenOptions {
            limits: self.options.limits,
            aes_key: keys.aes_key,
            public_key: keys.public_key,
            require_signature: self.options.require_signature.contains(&pack_type),
        };
        let reader = PackReader::open(path, &open)?;
        warnings.extend(reader.warnings().iter().cloned());
        let manifest = reader.manifest().clone();

        let mut registry = self.write_registry();
        if registry.packs.contains_key(&manifest.id) {
            return Err(VfsError::PackAlreadyMounted(manifest.id));
        }
        if !manifest.engine_compatible() {
            return Err(VfsError::EngineTooOld {
                pack: manifest.id,
                required: manifest.min_engine_version.unwrap_or_default(),
                current: ENGINE_VERSION.to_string(),
            });
        }

        let mut errors = Vec::new();
        let mut missing_required = Vec::new();
        let mut missing_optional = Vec::new();
        let mut seen = HashSet::new();
        for dep in &manifest.dependencies {
            if dep.id == manifest.id {
                errors.push("资源包声明了对自身的依赖".to_string());
                continue;
            }
            if !seen.insert(dep.id.as_str()) {
                errors.push(format!("重复的依赖声明: {}", dep.id));
                continue;
            }
            match registry.packs.get(&dep.id).filter(|p| p.enabled) {
                Some(found) => {
                    let version = &found.reader.manifest().version;
                    if let Some(min) = &dep.min_version
                        && !version_satisfies(version, min)
                    {
                        warnings.push(format!(
                            "依赖 {} 的版本 {} 低于要求的 {}",
                            dep.id, version, min
                        ));
                    }
                }
                None if dep.optional => {
                    warnings.push(format!("可选依赖 {} 未挂载", dep.id));
                    missing_optional.push(dep.id.clone());
                }
                None => missing_required.push(dep.id.clone()),
            }
        }
        if !missing_required.is_empty() {
            return Err(VfsError::DependencyMissing {
                pack: manifest.id,
                missing: missing_required,
            });
        }

        let id = manifest.id.clone();
        if pack_type == PackType::Mod && !registry.mod_order.contains(&id) {
            registry.mod_order.push(id.clone());
        }
        let enabled = !(pack_type == PackType::Mod && registry.disabled_mods.contains(&id));
        let sequence = registry.next_sequence;
        registry.next_sequence += 1;
        let mounted = MountedPack {
            reader: Arc::new(reader),
            pack_type,
            base_priority: clamped,
            enabled,
            sequence,
        };
        let info = mounted.info();
        registry.packs.insert(id.clone(), mounted);
        let overrides = registry.rebuild();
        drop(registry);
        self.finish_rebuild(overrides);

        info!(
            pack = %id,
            pack_type = pack_type.name(),
            priority = info.effective_priority,
            resources = info.resource_count,
            "资源包已挂载"
        );
        for w in &warnings {
            warn!(pack = %id, "{}", w);
        }
        Ok(MountResult {
            info,
            warnings,
            errors,
            missing_dependencies: missing_optional,
        })
    }

    /// 卸载资源包；已返回给调用方的缓冲区不受影响
    pub fn unmount(&self, pack_id: &str) -> Result<PackInfo, VfsError> {
        let mut registry = self.write_registry();
        let removed = registry
            .packs
            .remove(pack_id)
            .ok_or_else(|| VfsError::PackNotMounted(pack_id.to_string()))?;
        let overrides = registry.rebuild();
        drop(registry);
        self.finish_rebuild(overrides);
        info!(pack = pack_id, "资源包已卸载");
        Ok(removed.info())
    }

    pub fn unmount_all(&self) {
        let mut registry = self.write_registry();
        registry.packs.clear();
        let overrides = registry.rebuild();
        drop(registry);
        self.finish_rebuild(overrides);
    }

    /// 启用或停用资源包并重建索引
    ///
    /// 停用时返回仍处于启用状态、且必需依赖该包的资源包 id（按 id 排序）；
    /// 停用照常生效，这些包的依赖此后不再满足。
    pub fn set_pack_enabled(&self, pack_id: &str, enabled: bool) -> Result<Vec<String>, VfsError> {
        let mut registry = self.write_registry();
        let pack = registry
            .packs
            .get_mut(pack_id)
            .ok_or_else(|| VfsError::PackNotMounted(pack_id.to_string()))?;
        if pack.enabled == enabled {
            return Ok(Vec::new());
        }
        pack.enabled = enabled;
        let is_mod = pack.pack_type == PackType::Mod;
        let dependents = if enabled {
            Vec::new()
        } else {
            registry.enabled_dependents(pack_id)
        };
        if !dependents.is_empty() {
            warn!(pack = pack_id, dependents = ?dependents, "停用的资源包仍被其他包依赖");
        }
        if is_mod {
            if enabled {
                registry.disabled_mods.remove(pack_id);
            } else {
                registry.disabled_mods.insert(pack_id.to_string());
            }
        }
        let overrides = registry.rebuild();
        drop(registry);
        self.finish_rebuild(overrides);
        Ok(dependents)
    }

    pub fn is_mounted(&self, pack_id: &str) -> bool {
        self.read_registry().packs.contains_key(pack_id)
    }

    pub fn pack_info(&self, pack_id: &str) -> Option<PackInfo> {
        self.read_registry().packs.get(pack_id).map(MountedPack::info)
    }

    /// 所有已挂载的包，按优先级升序（未启用的排在最后）
    pub fn list_packs(&self) -> Vec<PackInfo> {
        let registry = self.read_registry();
        let enabled = registry.ordered_enabled();
        let mut infos: Vec<PackInfo> = enabled.into_iter().map(MountedPack::info).collect();
        let mut disabled: Vec<&MountedPack> =
            registry.packs.values().filter(|p| !p.enabled).collect();
        disabled.sort_by_key(|p| p.sequence);
        infos.extend(disabled.into_iter().map(MountedPack::info));
        infos
    }

    // =========================================================================
    // 读取
    // =========================================================================

    /// 读取完整解码的资源
    pub fn read(&self, resource_id: &str) -> Result<Vec<u8>, VfsError> {
        let id = normalize_resource_id(resource_id);
        let (owner, reader) = {
            let registry = self.read_registry();
            let owner = registry
                .index
                .get(&id)
                .ok_or_else(|| VfsError::NotFound(id.clone()))?
                .clone();
            let reader = registry
                .packs
                .get(&owner)
                .map(|p| Arc::clone(&p.reader))
                .ok_or_else(|| VfsError::NotFound(id.clone()))?;
            (owner, reader)
        };

        match reader.read(&id) {
            Err(err @ VfsError::IntegrityFailure { .. }) => {
                error!(resource = %id, pack = %owner, error = %err, "资源完整性校验失败");
                if self.options.strict_integrity && self.unmount(&owner).is_ok() {
                    warn!(pack = %owner, "严格模式：已卸载出错的资源包");
                }
                Err(err)
            }
            other => other,
        }
    }

    pub fn exists(&self, resource_id: &str) -> bool {
        self.read_registry()
            .index
            .contains_key(&normalize_resource_id(resource_id))
    }

    pub fn get_info(&self, resource_id: &str) -> Option<ResourceRecord> {
        let id = normalize_resource_id(resource_id);
        let registry = self.read_registry();
        let owner = registry.index.get(&id)?;
        let entry = registry.packs.get(owner)?.reader.entry(&id)?;
        Some(ResourceRecord {
            id,
            resource_type: entry.resource_type,
            uncompressed_size: entry.uncompressed_size,
            stored_size: entry.compressed_size,
            checksum: entry.checksum,
            compressed: entry.is_compressed(),
            encrypted: entry.is_encrypted(),
            pack_id: owner.clone(),
        })
    }

    /// 列出资源 id（排序），可按类型过滤
    pub fn list_resources(&self, resource_type: Option<ResourceType>) -> Vec<String> {
        let registry = self.read_registry();
        let mut ids: Vec<String> = registry
            .index
            .iter()
            .filter(|(id, owner)| match resource_type {
                None => true,
                Some(t) => registry
                    .packs
                    .get(*owner)
                    .and_then(|p| p.reader.entry(id))
                    .is_some_and(|e| e.resource_type == t),
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 列出某目录前缀下的资源
    pub fn list_dir(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize_resource_id(prefix);
        let prefix = if prefix.is_empty() {
            prefix
        } else {
            format!("{}/", prefix)
        };
        let mut ids: Vec<String> = self
            .read_registry()
            .index
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn get_resource_owner(&self, resource_id: &str) -> Option<String> {
        self.read_registry()
            .index
            .get(&normalize_resource_id(resource_id))
            .cloned()
    }

    pub fn list_active_overrides(&self) -> Vec<ResourceOverride> {
        self.read_registry().overrides.clone()
    }

    // =========================================================================
    // Mod 加载顺序
    // =========================================================================

    /// 已挂载 Mod 的加载顺序（靠后者优先）
    pub fn get_mod_load_order(&self) -> Vec<String> {
        self.read_registry().mounted_mods()
    }

    /// 设置加载顺序；未列出的已挂载 Mod 按原顺序追加到末尾
    pub fn set_mod_load_order(&self, order: &[String]) {
        let mut registry = self.write_registry();
        let current = registry.mounted_mods();
        let mut next: Vec<String> = Vec::new();
        for id in order.iter().chain(current.iter()) {
            if !next.contains(id) {
                next.push(id.clone());
            }
        }
        registry.mod_order = next;
        let overrides = registry.rebuild();
        drop(registry);
        self.finish_rebuild(overrides);
    }

    pub fn move_mod_up(&self, mod_id: &str) -> bool {
        self.shift_mod(mod_id, -1)
    }

    pub fn move_mod_down(&self, mod_id: &str) -> bool {
        self.shift_mod(mod_id, 1)
    }

    fn shift_mod(&self, mod_id: &str, delta: isize) -> bool {
        let mut order = self.get_mod_load_order();
        let Some(pos) = order.iter().position(|m| m == mod_id) else {
            return false;
        };
        let target = pos as isize + delta;
        if target < 0 || target as usize >= order.len() {
            return false;
        }
        order.swap(pos, target as usize);
        self.set_mod_load_order(&order);
        true
    }

    pub fn mod_config(&self) -> ModConfig {
        let registry = self.read_registry();
        let mut disabled: Vec<String> = registry.disabled_mods.iter().cloned().collect();
        disabled.sort();
        ModConfig {
            load_order: registry.mod_order.clone(),
            disabled,
        }
    }

    pub fn save_mod_config(&self, path: impl AsRef<Path>) -> Result<(), VfsError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.mod_config())
            .map_err(|e| VfsError::Malformed(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| VfsError::io(parent, e))?;
        }
        std::fs::write(path, json).map_err(|e| VfsError::io(path, e))
    }

    /// 读取 Mod 配置并应用到已挂载与之后挂载的 Mod
    pub fn load_mod_config(&self, path: impl AsRef<Path>) -> Result<(), VfsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| VfsError::io(path, e))?;
        let config: ModConfig = serde_json::from_str(&text)
            .map_err(|e| VfsError::Malformed(format!("Mod 配置解析失败: {}", e)))?;
        self.apply_mod_config(config);
        Ok(())
    }

    pub fn apply_mod_config(&self, config: ModConfig) {
        let mut registry = self.write_registry();
        let current = registry.mounted_mods();
        let mut order = Vec::new();
        for id in config.load_order.iter().chain(current.iter()) {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        registry.mod_order = order;
        registry.disabled_mods = config.disabled.into_iter().collect();
        let disabled = registry.disabled_mods.clone();
        for pack in registry.packs.values_mut() {
            if pack.pack_type == PackType::Mod {
                pack.enabled = !disabled.contains(pack.reader.id());
            }
        }
        let overrides = registry.rebuild();
        drop(registry);
        self.finish_rebuild(overrides);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::builder::{PackBuildOptions, PackBuilder};
    use crate::vfs::manifest::PackManifest;
    use std::sync::Mutex;

    fn pack(dir: &Path, id: &str, files: &[(&str, &[u8])], deps: Vec<PackDependency>) -> PathBuf {
        let mut manifest = PackManifest::new(id);
        manifest.dependencies = deps;
        let mut builder = PackBuilder::new(PackBuildOptions {
            manifest: Some(manifest),
            ..PackBuildOptions::default()
        });
        for (name, data) in files {
            builder.add(name, data.to_vec());
        }
        let path = dir.join(format!("{}.nmpack", id));
        builder.write_to(&path).unwrap();
        path
    }

    #[test]
    fn test_priority_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        let base = pack(dir.path(), "base", &[("a.txt", b"base"), ("b.txt", b"base-b")], vec![]);
        let patch = pack(dir.path(), "patch", &[("a.txt", b"patch")], vec![]);
        let patch2 = pack(dir.path(), "patch2", &[("a.txt", b"patch2")], vec![]);

        vfs.mount(&patch, PackType::Patch, 0).unwrap();
        vfs.mount(&base, PackType::Base, 999).unwrap();
        assert_eq!(vfs.read("a.txt").unwrap(), b"patch");
        assert_eq!(vfs.read("b.txt").unwrap(), b"base-b");

        // 同类型同优先级，后挂载者胜出
        vfs.mount(&patch2, PackType::Patch, 0).unwrap();
        assert_eq!(vfs.get_resource_owner("a.txt").as_deref(), Some("patch2"));

        vfs.set_pack_enabled("patch2", false).unwrap();
        assert_eq!(vfs.read("a.txt").unwrap(), b"patch");

        let held = vfs.read("a.txt").unwrap();
        vfs.unmount("patch").unwrap();
        assert_eq!(held, b"patch");
        assert_eq!(vfs.read("a.txt").unwrap(), b"base");
        assert!(matches!(vfs.unmount("patch"), Err(VfsError::PackNotMounted(_))));
    }

    #[test]
    fn test_priority_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        let base = pack(dir.path(), "base", &[("a", b"1")], vec![]);
        let result = vfs.mount(&base, PackType::Base, 5000).unwrap();
        assert_eq!(result.info.base_priority, 999);
        assert_eq!(result.info.effective_priority, 999);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_override_events_once_per_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        vfs.add_override_listener(move |e| sink.lock().unwrap().push(e.clone()));

        let base = pack(dir.path(), "base", &[("ui/title.png", b"A"), ("x", b"1")], vec![]);
        let dlc = pack(dir.path(), "dlc", &[("ui/title.png", b"B")], vec![]);
        vfs.mount(&base, PackType::Base, 0).unwrap();
        assert!(events.lock().unwrap().is_empty());
        vfs.mount(&dlc, PackType::Dlc, 0).unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![ResourceOverride {
                resource_id: "ui/title.png".into(),
                original_pack_id: "base".into(),
                override_pack_id: "dlc".into(),
                override_type: PackType::Dlc,
            }]
        );
        assert_eq!(vfs.list_active_overrides(), events);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        vfs.mount(pack(dir.path(), "base", &[("a", b"1"), ("b", b"2")], vec![]), PackType::Base, 0)
            .unwrap();
        vfs.mount(pack(dir.path(), "lang", &[("a", b"3")], vec![]), PackType::Language, 0)
            .unwrap();
        let view = |vfs: &VirtualFileSystem| {
            let owner = vfs.get_resource_owner("a");
            (vfs.list_resources(None), vfs.list_active_overrides(), owner)
        };
        let before = view(&vfs);
        let generation = vfs.generation();
        vfs.set_mod_load_order(&[]);
        vfs.set_mod_load_order(&[]);
        assert_eq!(vfs.generation(), generation + 2);
        assert_eq!(before, view(&vfs));
    }

    #[test]
    fn test_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        let dlc = pack(
            dir.path(),
            "dlc",
            &[("d", b"d")],
            vec![
                PackDependency::required("base"),
                PackDependency {
                    id: "extras".into(),
                    min_version: None,
                    optional: true,
                },
            ],
        );
        let err = vfs.mount(&dlc, PackType::Dlc, 0).unwrap_err();
        assert!(matches!(
            err,
            VfsError::DependencyMissing { ref missing, .. } if missing == &["base"]
        ));
        assert!(!vfs.is_mounted("dlc"));

        vfs.mount(pack(dir.path(), "base", &[("a", b"1")], vec![]), PackType::Base, 0)
            .unwrap();
        let result = vfs.mount(&dlc, PackType::Dlc, 0).unwrap();
        assert_eq!(result.missing_dependencies, vec!["extras".to_string()]);

        assert!(matches!(
            vfs.mount(&dlc, PackType::Dlc, 0),
            Err(VfsError::PackAlreadyMounted(_))
        ));
    }

    #[test]
    fn test_disabling_required_pack_reports_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        vfs.mount(pack(dir.path(), "base", &[("a", b"1")], vec![]), PackType::Base, 0)
            .unwrap();
        let dlc = pack(dir.path(), "dlc", &[("d", b"d")], vec![PackDependency::required("base")]);
        vfs.mount(&dlc, PackType::Dlc, 0).unwrap();
        let extra = PackDependency {
            id: "base".into(),
            min_version: None,
            optional: true,
        };
        vfs.mount(pack(dir.path(), "lang", &[("l", b"l")], vec![extra]), PackType::Language, 0)
            .unwrap();

        assert_eq!(vfs.set_pack_enabled("base", false).unwrap(), ["dlc"]);
        assert!(vfs.read("a").is_err());
        assert_eq!(vfs.read("d").unwrap(), b"d");
        assert!(vfs.set_pack_enabled("base", true).unwrap().is_empty());

        vfs.set_pack_enabled("dlc", false).unwrap();
        assert!(vfs.set_pack_enabled("base", false).unwrap().is_empty());
    }

    #[test]
    fn test_dependency_version_mismatch_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        vfs.mount(pack(dir.path(), "base", &[("a", b"1")], vec![]), PackType::Base, 0)
            .unwrap();
        let dlc = pack(
            dir.path(),
            "dlc",
            &[("d", b"d")],
            vec![PackDependency {
                id: "base".into(),
                min_version: Some("3.0".into()),
                optional: false,
            }],
        );
        let result = vfs.mount(&dlc, PackType::Dlc, 0).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("3.0")));
    }

    #[test]
    fn test_list_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        vfs.mount(
            pack(
                dir.path(),
                "base",
                &[("ui/a.png", b"png"), ("ui/b.json", b"{}"), ("c.txt", b"c")],
                vec![],
            ),
            PackType::Base,
            0,
        )
        .unwrap();
        assert_eq!(vfs.list_resources(None), vec!["c.txt", "ui/a.png", "ui/b.json"]);
        assert_eq!(vfs.list_resources(Some(ResourceType::Texture)), vec!["ui/a.png"]);
        assert_eq!(vfs.list_dir("ui"), vec!["ui/a.png", "ui/b.json"]);
        let info = vfs.get_info("./ui/a.png").unwrap();
        assert_eq!(info.uncompressed_size, 3);
        assert_eq!(info.pack_id, "base");
        assert!(vfs.exists("c.txt"));
        assert!(!vfs.exists("__pack__/manifest.json"));
        assert!(matches!(vfs.read("nope"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_mod_load_order_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::default();
        vfs.mount(pack(dir.path(), "m1", &[("x", b"m1")], vec![]), PackType::Mod, 0)
            .unwrap();
        vfs.mount(pack(dir.path(), "m2", &[("x", b"m2")], vec![]), PackType::Mod, 0)
            .unwrap();
        assert_eq!(vfs.get_mod_load_order(), vec!["m1", "m2"]);
        assert_eq!(vfs.read("x").unwrap(), b"m2");

        assert!(vfs.move_mod_down("m1"));
        assert_eq!(vfs.get_mod_load_order(), vec!["m2", "m1"]);
        assert_eq!(vfs.read("x").unwrap(), b"m1");
        assert!(!vfs.move_mod_down("m1"));
        assert!(vfs.move_mod_up("m1"));
        assert_eq!(vfs.read("x").unwrap(), b"m2");

        vfs.set_pack_enabled("m2", false).unwrap();
        let config_path = dir.path().join("mods.json");
        vfs.save_mod_config(&config_path).unwrap();

        let fresh = VirtualFileSystem::default();
        fresh.load_mod_config(&config_path).unwrap();
        fresh.mount(dir.path().join("m2.nmpack"), PackType::Mod, 0).unwrap();
        fresh.mount(dir.path().join("m1.nmpack"), PackType::Mod, 0).unwrap();
        assert_eq!(fresh.get_mod_load_order(), vec!["m1", "m2"]);
        assert!(!fresh.pack_info("m2").unwrap().enabled);
        assert_eq!(fresh.read("x").unwrap(), b"m1");
    }

    #[test]
    fn test_strict_integrity_unmounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = pack(dir.path(), "base", &[("a", b"abc")], vec![]);
        let mut bytes = std::fs::read(&path).unwrap();
        let manifest_len = PackManifest::new("base").to_json().len();
        let target = bytes.len() - manifest_len - 1;
        bytes[target] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let vfs = VirtualFileSystem::new(VfsOptions {
            strict_integrity: true,
            ..VfsOptions::default()
        });
        vfs.mount(&path, PackType::Base, 0).unwrap();
        assert!(matches!(vfs.read("a"), Err(VfsError::IntegrityFailure { .. })));
        assert!(!vfs.is_mounted("base"));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(PackType::from_name("DLC"), Some(PackType::Dlc));
        assert!(PackType::Base.type_base() < PackType::Patch.type_base());
        assert!(PackType::Language.type_base() < PackType::Mod.type_base());
    }
}
