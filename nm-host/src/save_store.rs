//! # SaveStore 模块
//!
//! 存档文件管理：槽位文件的读写、压缩、加密与完整性校验。
//!
//! ## 文件布局
//!
//! ```text
//! saves/
//! ├── save_0.nmsav
//! ├── save_0.nmsav.bak   上一次写入前的文件
//! ├── save_1.nmsav
//! └── autosave.nmsav
//! ```
//!
//! ## 文件格式（v2，小端，文件头 68 字节）
//!
//! ```text
//! magic "SNMV" │ version u16 │ flags u16 │ payloadSize u32 │ rawSize u32
//! │ timestamp u64 │ checksum u32 │ thumbWidth u32 │ thumbHeight u32
//! │ thumbStored u32 │ IV[12] │ tag[16] │ payload[payloadSize]
//! ```
//!
//! 写入顺序：规范化负载 → CRC32 → 压缩（仅当变小）→ AES-256-GCM。
//! 加密的附加认证数据为 IV 之前的 40 字节文件头，篡改文件头同样无法解密。
//!
//! v1 文件头为 `magic │ version u16 │ flags u16 │ payloadSize u32 │ timestamp u64
//! │ checksum u32`，负载见 [`nm_runtime::save::legacy`]。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use nm_runtime::codec::{ByteReader, ByteWriter};
use nm_runtime::save::{self, SaveData, SaveError, legacy};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SaveConfig};
use crate::crypto::{self, AesKey, NONCE_LEN, TAG_LEN};

/// 文件魔数（文件中的字节序列为 `SNMV`）
pub const SAVE_MAGIC: u32 = u32::from_le_bytes(*b"SNMV");
pub const SAVE_VERSION: u16 = 2;
pub const LEGACY_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 68;
pub const LEGACY_HEADER_SIZE: usize = 24;
/// 参与认证的文件头前缀长度
const AAD_LEN: usize = 40;
/// 最大存档槽位数（0..MAX_SLOTS-1）
pub const MAX_SLOTS: u32 = 100;

pub const FLAG_COMPRESSED: u16 = 1;
pub const FLAG_ENCRYPTED: u16 = 2;

const AUTOSAVE_FILE: &str = "autosave.nmsav";

/// 存档槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Numbered(u32),
    Auto,
}

impl Slot {
    fn file_name(self) -> String {
        match self {
            Self::Numbered(n) => format!("save_{}.nmsav", n),
            Self::Auto => AUTOSAVE_FILE.to_string(),
        }
    }

    fn label(self) -> String {
        match self {
            Self::Numbered(n) => format!("槽位 {}", n),
            Self::Auto => "自动存档".to_string(),
        }
    }
}

/// 存档文件头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveHeader {
    pub version: u16,
    pub flags: u16,
    pub payload_size: u32,
    pub raw_size: u32,
    /// Unix 秒
    pub timestamp: u64,
    pub checksum: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub thumb_stored: u32,
    pub iv: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

impl SaveHeader {
    /// 解析 v1 或 v2 文件头
    pub fn parse(bytes: &[u8]) -> Result<Self, SaveError> {
        let truncated = |needed: usize| SaveError::Truncated {
            needed,
            available: bytes.len(),
        };
        let mut r = ByteReader::new(bytes);
        let magic = r.u32().map_err(|_| truncated(4))?;
        if magic != SAVE_MAGIC {
            return Err(SaveError::InvalidMagic(magic));
        }
        let version = r.u16().map_err(|_| truncated(6))?;
        match version {
            SAVE_VERSION => {
                if bytes.len() < HEADER_SIZE {
                    return Err(truncated(HEADER_SIZE));
                }
                let short = |_| truncated(HEADER_SIZE);
                Ok(Self {
                    version,
                    flags: r.u16().map_err(short)?,
                    payload_size: r.u32().map_err(short)?,
                    raw_size: r.u32().map_err(short)?,
                    timestamp: r.u64().map_err(short)?,
                    checksum: r.u32().map_err(short)?,
                    thumb_width: r.u32().map_err(short)?,
                    thumb_height: r.u32().map_err(short)?,
                    thumb_stored: r.u32().map_err(short)?,
                    iv: r.array().map_err(short)?,
                    tag: r.array().map_err(short)?,
                })
            }
            LEGACY_VERSION => {
                if bytes.len() < LEGACY_HEADER_SIZE {
                    return Err(truncated(LEGACY_HEADER_SIZE));
                }
                let short = |_| truncated(LEGACY_HEADER_SIZE);
                let flags = r.u16().map_err(short)?;
                let payload_size = r.u32().map_err(short)?;
                Ok(Self {
                    version,
                    flags,
                    payload_size,
                    raw_size: 0,
                    timestamp: r.u64().map_err(short)?,
                    checksum: r.u32().map_err(short)?,
                    thumb_width: 0,
                    thumb_height: 0,
                    thumb_stored: 0,
                    iv: [0; NONCE_LEN],
                    tag: [0; TAG_LEN],
                })
            }
            other => Err(SaveError::UnsupportedVersion(other)),
        }
    }

    pub fn header_len(&self) -> usize {
        if self.version == LEGACY_VERSION {
            LEGACY_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// 序列化为 v2 文件头
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut w = ByteWriter::with_capacity(HEADER_SIZE);
        w.u32(SAVE_MAGIC)
            .u16(SAVE_VERSION)
            .u16(self.flags)
            .u32(self.payload_size)
            .u32(self.raw_size)
            .u64(self.timestamp)
            .u32(self.checksum)
            .u32(self.thumb_width)
            .u32(self.thumb_height)
            .u32(self.thumb_stored)
            .bytes(&self.iv)
            .bytes(&self.tag);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&w.into_inner());
        out
    }
}

/// 槽位元数据（只读文件头，不解密负载）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMetadata {
    pub slot: Slot,
    pub version: u16,
    pub timestamp: u64,
    pub has_thumbnail: bool,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub thumbnail_size: u32,
    pub compressed: bool,
    pub encrypted: bool,
    pub file_size: u64,
}

impl SlotMetadata {
    /// 本地时间 `YYYY-MM-DD HH:MM:SS`
    pub fn formatted_time(&self) -> String {
        i64::try_from(self.timestamp)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|utc| {
                utc.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default()
    }
}

/// 存档仓库配置
#[derive(Debug, Clone, Default)]
pub struct SaveStoreConfig {
    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub encryption_key: Option<AesKey>,
}

impl SaveStoreConfig {
    pub fn from_config(config: &SaveConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            enable_compression: config.enable_compression,
            enable_encryption: config.enable_encryption,
            encryption_key: config.encryption_key()?,
        })
    }
}

/// 存档仓库
pub struct SaveStore {
    saves_dir: PathBuf,
    config: SaveStoreConfig,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SaveStore {
    pub fn new(saves_dir: impl AsRef<Path>, config: SaveStoreConfig) -> Self {
        Self {
            saves_dir: saves_dir.as_ref().to_path_buf(),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_save_path(&mut self, saves_dir: impl AsRef<Path>) {
        self.saves_dir = saves_dir.as_ref().to_path_buf();
    }

    pub fn save_path(&self) -> &Path {
        &self.saves_dir
    }

    pub fn set_config(&mut self, config: SaveStoreConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &SaveStoreConfig {
        &self.config
    }

    /// 确保存档目录存在
    pub fn ensure_dir(&self) -> Result<(), SaveError> {
        fs::create_dir_all(&self.saves_dir)
            .map_err(|e| SaveError::Io(format!("无法创建存档目录 {}: {}", self.saves_dir.display(), e)))
    }

    fn check_slot(slot: u32) -> Result<Slot, SaveError> {
        if slot >= MAX_SLOTS {
            return Err(SaveError::SlotOutOfRange {
                slot,
                max: MAX_SLOTS - 1,
            });
        }
        Ok(Slot::Numbered(slot))
    }

    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        self.saves_dir.join(slot.file_name())
    }

    pub fn backup_path(&self, slot: Slot) -> PathBuf {
        let mut name = self.slot_path(slot).into_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    // =========================================================================
    // 槽位 API
    // =========================================================================

    pub fn save(&self, slot: u32, data: &SaveData) -> Result<(), SaveError> {
        self.save_slot(Self::check_slot(slot)?, data)
    }

    pub fn load(&self, slot: u32) -> Result<SaveData, SaveError> {
        self.load_slot(Self::check_slot(slot)?)
    }

    pub fn delete_save(&self, slot: u32) -> Result<(), SaveError> {
        self.delete_slot(Self::check_slot(slot)?)
    }

    pub fn slot_exists(&self, slot: u32) -> bool {
        Self::check_slot(slot).is_ok_and(|s| self.slot_path(s).is_file())
    }

    pub fn get_slot_timestamp(&self, slot: u32) -> Result<u64, SaveError> {
        self.get_slot_metadata(slot).map(|m| m.timestamp)
    }

    pub fn get_slot_metadata(&self, slot: u32) -> Result<SlotMetadata, SaveError> {
        self.metadata(Self::check_slot(slot)?)
    }

    pub fn save_auto(&self, data: &SaveData) -> Result<(), SaveError> {
        self.save_slot(Slot::Auto, data)
    }

    pub fn load_auto(&self) -> Result<SaveData, SaveError> {
        self.load_slot(Slot::Auto)
    }

    pub fn auto_save_exists(&self) -> bool {
        self.slot_path(Slot::Auto).is_file()
    }

    pub fn delete_auto(&self) -> Result<(), SaveError> {
        self.delete_slot(Slot::Auto)
    }

    /// 列出所有可读取文件头的槽位
    pub fn list_saves(&self) -> Vec<SlotMetadata> {
        let mut saves: Vec<SlotMetadata> = (0..MAX_SLOTS)
            .map(Slot::Numbered)
            .chain(std::iter::once(Slot::Auto))
            .filter(|s| self.slot_path(*s).is_file())
            .filter_map(|s| self.metadata(s).ok())
            .collect();
        saves.sort_by_key(|m| match m.slot {
            Slot::Numbered(n) => n,
            Slot::Auto => u32::MAX,
        });
        saves
    }

    /// 第一个空槽位
    pub fn next_available_slot(&self) -> Option<u32> {
        (0..MAX_SLOTS).find(|&slot| !self.slot_exists(slot))
    }

    pub fn has_backup(&self, slot: Slot) -> bool {
        self.backup_path(slot).is_file()
    }

    /// 用 `.bak` 覆盖当前存档
    pub fn restore_backup(&self, slot: Slot) -> Result<(), SaveError> {
        let path = self.slot_path(slot);
        let backup = self.backup_path(slot);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !backup.is_file() {
            return Err(SaveError::NotFound(format!("{} 的备份", slot.label())));
        }
        let bytes = fs::read(&backup).map_err(|e| io_error(&backup, e))?;
        write_atomic(&path, &bytes)?;
        info!(slot = %slot.label(), "已从备份恢复存档");
        Ok(())
    }

    // =========================================================================
    // 内部实现
    // =========================================================================

    fn save_slot(&self, slot: Slot, data: &SaveData) -> Result<(), SaveError> {
        let bytes = self.encode_file(data, now_seconds())?;
        self.ensure_dir()?;
        let path = self.slot_path(slot);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if path.is_file() {
            let backup = self.backup_path(slot);
            fs::copy(&path, &backup).map_err(|e| io_error(&backup, e))?;
        }
        write_atomic(&path, &bytes)?;
        info!(slot = %slot.label(), bytes = bytes.len(), "存档保存成功");
        Ok(())
    }

    fn load_slot(&self, slot: Slot) -> Result<SaveData, SaveError> {
        let path = self.slot_path(slot);
        let lock = self.file_lock(&path);
        let bytes = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SaveError::NotFound(slot.label()));
                }
                Err(e) => return Err(io_error(&path, e)),
            }
        };
        let data = self.decode_file(&bytes).inspect_err(|e| {
            warn!(slot = %slot.label(), error = %e, "存档读取失败");
        })?;
        debug!(slot = %slot.label(), scene = %data.scene_id, "存档读取成功");
        Ok(data)
    }

    fn delete_slot(&self, slot: Slot) -> Result<(), SaveError> {
        let path = self.slot_path(slot);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(slot = %slot.label(), "存档已删除");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SaveError::NotFound(slot.label()))
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn metadata(&self, slot: Slot) -> Result<SlotMetadata, SaveError> {
        let path = self.slot_path(slot);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SaveError::NotFound(slot.label()));
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        let file_size = file.metadata().map_err(|e| io_error(&path, e))?.len();
        let mut head = Vec::with_capacity(HEADER_SIZE);
        Read::by_ref(&mut file)
            .take(HEADER_SIZE as u64)
            .read_to_end(&mut head)
            .map_err(|e| io_error(&path, e))?;
        let header = SaveHeader::parse(&head)?;
        Ok(SlotMetadata {
            slot,
            version: header.version,
            timestamp: header.timestamp,
            has_thumbnail: header.thumb_width > 0 && header.thumb_height > 0,
            thumbnail_width: header.thumb_width,
            thumbnail_height: header.thumb_height,
            thumbnail_size: header.thumb_stored,
            compressed: header.has_flag(FLAG_COMPRESSED),
            encrypted: header.has_flag(FLAG_ENCRYPTED),
            file_size,
        })
    }

    fn encryption_key(&self) -> Result<Option<&AesKey>, SaveError> {
        if !self.config.enable_encryption {
            return Ok(None);
        }
        self.config
            .encryption_key
            .as_ref()
            .map(Some)
            .ok_or(SaveError::KeyMissing)
    }

    /// 编码完整文件
    pub fn encode_file(&self, data: &SaveData, timestamp: u64) -> Result<Vec<u8>, SaveError> {
        let key = self.encryption_key()?;
        let raw = data.encode()?;
        let checksum = save::checksum(&raw);

        let mut flags = 0;
        let mut payload = if self.config.enable_compression {
            match zlib(&raw)? {
                packed if packed.len() < raw.len() => {
                    flags |= FLAG_COMPRESSED;
                    packed
                }
                _ => raw.clone(),
            }
        } else {
            raw.clone()
        };

        let (thumb_width, thumb_height, thumb_stored) = data
            .thumbnail
            .as_ref()
            .map(|t| (t.width, t.height, t.rgba.len() as u32))
            .unwrap_or_default();
        let mut header = SaveHeader {
            version: SAVE_VERSION,
            flags,
            payload_size: payload.len() as u32,
            raw_size: raw.len() as u32,
            timestamp,
            checksum,
            thumb_width,
            thumb_height,
            thumb_stored,
            iv: [0; NONCE_LEN],
            tag: [0; TAG_LEN],
        };

        if let Some(key) = key {
            header.flags |= FLAG_ENCRYPTED;
            header.iv = crypto::random_bytes();
            let aad = header.to_bytes();
            header.tag = crypto::seal_in_place(key, &header.iv, &aad[..AAD_LEN], &mut payload)
                .map_err(|_| SaveError::AuthenticationFailed)?;
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// 解码完整文件（v1 或 v2）
    pub fn decode_file(&self, bytes: &[u8]) -> Result<SaveData, SaveError> {
        let header = SaveHeader::parse(bytes)?;
        let body = &bytes[header.header_len()..];
        let expected = header.payload_size as usize;
        if body.len() != expected {
            return Err(SaveError::Malformed(format!(
                "负载长度 {} 与文件头声明的 {} 不符",
                body.len(),
                expected
            )));
        }

        if header.version == LEGACY_VERSION {
            return decode_legacy(&header, body);
        }

        let mut payload = body.to_vec();
        if header.has_flag(FLAG_ENCRYPTED) {
            let key = self
                .config
                .encryption_key
                .as_ref()
                .ok_or(SaveError::KeyMissing)?;
            let aad = header.to_bytes();
            crypto::open_in_place(key, &header.iv, &aad[..AAD_LEN], &mut payload, &header.tag)
                .map_err(|_| SaveError::AuthenticationFailed)?;
        }

        let raw_size = header.raw_size as usize;
        let raw = if header.has_flag(FLAG_COMPRESSED) {
            unzlib(&payload, raw_size)?
        } else {
            payload
        };
        if raw.len() != raw_size {
            return Err(SaveError::SizeMismatch {
                expected: raw_size,
                actual: raw.len(),
            });
        }

        let actual = save::checksum(&raw);
        if actual != header.checksum {
            return Err(SaveError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        SaveData::decode(&raw)
    }
}

fn decode_legacy(header: &SaveHeader, body: &[u8]) -> Result<SaveData, SaveError> {
    let actual = save::checksum(body);
    if actual != header.checksum {
        return Err(SaveError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    legacy::decode_payload(body)
}

fn zlib(data: &[u8]) -> Result<Vec<u8>, SaveError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| SaveError::Io(format!("压缩失败: {}", e)))
}

fn unzlib(data: &[u8], raw_size: usize) -> Result<Vec<u8>, SaveError> {
    let mut out = Vec::with_capacity(raw_size);
    ZlibDecoder::new(data)
        .take(raw_size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| SaveError::Decompression(e.to_string()))?;
    Ok(out)
}

/// 写入临时文件、fsync，再重命名覆盖
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SaveError> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_error(path, e)
    })
}

fn io_error(path: &Path, e: std::io::Error) -> SaveError {
    SaveError::Io(format!("{}: {}", path.display(), e))
}

fn now_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use nm_runtime::{ErrorKind, Thumbnail};

    fn sample() -> SaveData {
        let mut data = SaveData::new("intro", "node_7");
        data.int_variables.insert("chapter".into(), 2);
        data.float_variables.insert("affection".into(), 0.5);
        data.flags.insert("met_alice".into(), true);
        data.string_variables.insert("name".into(), "Alice".into());
        data.thumbnail = Some(Thumbnail::new(4, 4, vec![200; 64]).unwrap());
        data
    }

    fn encrypted_config() -> SaveStoreConfig {
        SaveStoreConfig {
            enable_compression: true,
            enable_encryption: true,
            encryption_key: Some(AesKey::new([9; 32])),
        }
    }

    #[test]
    fn test_round_trip_plain() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), SaveStoreConfig::default());
        store.save(0, &sample()).unwrap();
        assert_eq!(store.load(0).unwrap(), sample());
        assert!(dir.path().join("save_0.nmsav").is_file());
    }

    #[test]
    fn test_round_trip_encrypted_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), encrypted_config());
        store.save(3, &sample()).unwrap();
        assert_eq!(store.load(3).unwrap(), sample());

        let meta = store.get_slot_metadata(3).unwrap();
        assert!(meta.has_thumbnail && meta.encrypted);
        assert_eq!((meta.thumbnail_width, meta.thumbnail_height, meta.thumbnail_size), (4, 4, 64));
        assert!(meta.timestamp > 0);
        assert_eq!(store.get_slot_timestamp(3).unwrap(), meta.timestamp);
        assert_eq!(meta.formatted_time().len(), 19);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SaveStore::new(dir.path(), encrypted_config());
        store.save(1, &sample()).unwrap();
        store.set_config(SaveStoreConfig {
            encryption_key: Some(AesKey::new([1; 32])),
            ..encrypted_config()
        });
        let err = store.load(1).unwrap_err();
        assert_eq!(err, SaveError::AuthenticationFailed);
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
    }

    #[test]
    fn test_encryption_without_key_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(
            dir.path(),
            SaveStoreConfig {
                enable_encryption: true,
                ..SaveStoreConfig::default()
            },
        );
        assert_eq!(store.save(0, &sample()), Err(SaveError::KeyMissing));
        assert!(!store.slot_exists(0));
    }

    #[test]
    fn test_flipped_payload_byte_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for config in [SaveStoreConfig::default(), encrypted_config()] {
            let store = SaveStore::new(dir.path(), config);
            store.save(2, &sample()).unwrap();
            let path = store.slot_path(Slot::Numbered(2));
            let mut bytes = fs::read(&path).unwrap();
            bytes[HEADER_SIZE + 5] ^= 0x40;
            fs::write(&path, &bytes).unwrap();

            let err = store.load(2).unwrap_err();
            assert!(matches!(
                err.kind(),
                ErrorKind::Corrupted | ErrorKind::IntegrityFailure
            ));
            assert!(store.slot_exists(2));
            assert!(store.get_slot_metadata(2).is_ok());
        }
    }

    #[test]
    fn test_slot_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), SaveStoreConfig::default());
        assert!(store.save(MAX_SLOTS - 1, &sample()).is_ok());
        assert!(matches!(
            store.save(MAX_SLOTS, &sample()),
            Err(SaveError::SlotOutOfRange { slot: 100, max: 99 })
        ));
        assert!(!store.slot_exists(MAX_SLOTS));
        assert_eq!(store.next_available_slot(), Some(0));
    }

    #[test]
    fn test_autosave_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), SaveStoreConfig::default());
        assert!(!store.auto_save_exists());
        store.save_auto(&sample()).unwrap();
        assert!(store.auto_save_exists());
        assert_eq!(store.load_auto().unwrap(), sample());

        store.save(5, &sample()).unwrap();
        let listed: Vec<Slot> = store.list_saves().into_iter().map(|m| m.slot).collect();
        assert_eq!(listed, vec![Slot::Numbered(5), Slot::Auto]);

        store.delete_save(5).unwrap();
        assert!(matches!(store.delete_save(5), Err(SaveError::NotFound(_))));
        assert!(matches!(store.load(5), Err(SaveError::NotFound(_))));
    }

    #[test]
    fn test_backup_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), SaveStoreConfig::default());
        let first = SaveData::new("a", "n1");
        store.save(0, &first).unwrap();
        assert!(!store.has_backup(Slot::Numbered(0)));
        store.save(0, &sample()).unwrap();
        assert!(store.has_backup(Slot::Numbered(0)));

        store.restore_backup(Slot::Numbered(0)).unwrap();
        assert_eq!(store.load(0).unwrap(), first);
    }

    #[test]
    fn test_legacy_file_loads_like_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveStore::new(dir.path(), SaveStoreConfig::default());
        let mut data = sample();
        data.thumbnail = None;

        let payload = legacy::encode_payload(&data);
        let mut w = ByteWriter::new();
        w.u32(SAVE_MAGIC)
            .u16(LEGACY_VERSION)
            .u16(0)
            .u32(payload.len() as u32)
            .u64(1_700_000_000)
            .u32(save::checksum(&payload))
            .bytes(&payload);
        store.ensure_dir().unwrap();
        fs::write(store.slot_path(Slot::Numbered(7)), w.into_inner()).unwrap();

        assert_eq!(store.load(7).unwrap(), data);
        let meta = store.get_slot_metadata(7).unwrap();
        assert_eq!((meta.version, meta.timestamp), (1, 1_700_000_000));
        assert!(!meta.has_thumbnail);
    }

    #[test]
    fn test_header_errors() {
        let store = SaveStore::new("unused", SaveStoreConfig::default());
        assert!(matches!(store.decode_file(b"SNM"), Err(SaveError::Truncated { .. })));
        assert!(matches!(
            store.decode_file(b"XXXX\x02\x00"),
            Err(SaveError::InvalidMagic(_))
        ));
        let mut bytes = store.encode_file(&sample(), 1).unwrap();
        bytes[4] = 9;
        assert_eq!(store.decode_file(&bytes), Err(SaveError::UnsupportedVersion(9)));
    }
}
