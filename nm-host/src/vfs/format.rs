//! 资源包二进制格式
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │ PackHeader (64)      │
//! ├──────────────────────┤ resourceTableOffset
//! │ ResourceEntry × N    │ 每条 44 字节
//! ├──────────────────────┤ stringTableOffset
//! │ StringTable          │ count u32, { len u32, utf8 }*
//! ├──────────────────────┤ dataOffset
//! │ 数据区               │ 条目 dataOffset 相对于此处
//! └──────────────────────┘ totalSize
//! ```
//!
//! 所有数值均为小端。内容哈希为 SHA-256 截断到 16 字节，覆盖
//! 「哈希字段清零的文件头 + 资源表 + 字符串表」。

use std::collections::HashMap;

use nm_runtime::codec::{ByteReader, ByteWriter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::VfsError;

pub const PACK_MAGIC: u32 = 0x534D_524E;
pub const PACK_VERSION_MAJOR: u16 = 1;
pub const PACK_VERSION_MINOR: u16 = 0;
pub const PACK_HEADER_SIZE: usize = 64;
pub const ENTRY_SIZE: usize = 44;
pub const CONTENT_HASH_SIZE: usize = 16;

/// 文件头中内容哈希的偏移
const HASH_OFFSET: usize = PACK_HEADER_SIZE - CONTENT_HASH_SIZE;

/// 包级标记
pub const PACK_COMPRESSED: u32 = 1;
pub const PACK_ENCRYPTED: u32 = 2;
pub const PACK_SIGNED: u32 = 4;

/// 条目级标记
pub const ENTRY_COMPRESSED: u8 = 1;
pub const ENTRY_ENCRYPTED: u8 = 2;

/// 保留资源前缀，不进入资源索引
pub const RESERVED_PREFIX: &str = "__pack__/";
/// 包清单资源
pub const MANIFEST_ID: &str = "__pack__/manifest.json";

/// 资源类型（仅作元数据，类型不符从不视为错误）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Texture,
    Audio,
    Music,
    Font,
    Script,
    Scene,
    Localization,
    Data,
}

impl ResourceType {
    pub const ALL: [ResourceType; 8] = [
        Self::Texture,
        Self::Audio,
        Self::Music,
        Self::Font,
        Self::Script,
        Self::Scene,
        Self::Localization,
        Self::Data,
    ];

    /// 未知值按 `Data` 处理
    pub fn from_u8(value: u8) -> Self {
        Self::ALL.get(value as usize).copied().unwrap_or(Self::Data)
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Texture => "texture",
            Self::Audio => "audio",
            Self::Music => "music",
            Self::Font => "font",
            Self::Script => "script",
            Self::Scene => "scene",
            Self::Localization => "localization",
            Self::Data => "data",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// 按扩展名推断（打包工具使用）
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "bmp" => Self::Texture,
            "wav" | "ogg" => Self::Audio,
            "mp3" | "flac" => Self::Music,
            "ttf" | "otf" | "atlas" => Self::Font,
            "nmsc" | "nmb" => Self::Script,
            "scene" => Self::Scene,
            "csv" | "po" | "xliff" | "xlf" => Self::Localization,
            _ => Self::Data,
        }
    }
}

/// 资源包数量与大小上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackLimits {
    #[serde(default = "default_max_resources")]
    pub max_resources: usize,
    #[serde(default = "default_max_strings")]
    pub max_strings: usize,
    #[serde(default = "default_max_string_bytes")]
    pub max_string_bytes: usize,
    #[serde(default = "default_max_resource_bytes")]
    pub max_resource_bytes: u64,
}

fn default_max_resources() -> usize {
    1_000_000
}

fn default_max_strings() -> usize {
    10_000_000
}

fn default_max_string_bytes() -> usize {
    1_000_000
}

fn default_max_resource_bytes() -> u64 {
    500_000_000
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            max_resources: default_max_resources(),
            max_strings: default_max_strings(),
            max_string_bytes: default_max_string_bytes(),
            max_resource_bytes: default_max_resource_bytes(),
        }
    }
}

fn limit_error(what: &'static str, count: u64, limit: u64) -> VfsError {
    VfsError::CountExceedsLimit { what, count, limit }
}

/// 资源包文件头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub resource_count: u32,
    pub resource_table_offset: u64,
    pub string_table_offset: u64,
    pub data_offset: u64,
    pub total_size: u64,
    pub content_hash: [u8; CONTENT_HASH_SIZE],
}

impl PackHeader {
    pub fn new(flags: u32) -> Self {
        Self {
            magic: PACK_MAGIC,
            version_major: PACK_VERSION_MAJOR,
            version_minor: PACK_VERSION_MINOR,
            flags,
            resource_count: 0,
            resource_table_offset: PACK_HEADER_SIZE as u64,
            string_table_offset: 0,
            data_offset: 0,
            total_size: 0,
            content_hash: [0; CONTENT_HASH_SIZE],
        }
    }

    /// 解析并校验魔数与主版本
    pub fn parse(bytes: &[u8]) -> Result<Self, VfsError> {
        if bytes.len() < PACK_HEADER_SIZE {
            return Err(VfsError::Truncated(format!(
                "文件头需要 {} 字节，实际 {} 字节",
                PACK_HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut r = ByteReader::new(&bytes[..PACK_HEADER_SIZE]);
        let short = |_| VfsError::Truncated("文件头".to_string());
        let header = Self {
            magic: r.u32().map_err(short)?,
            version_major: r.u16().map_err(short)?,
            version_minor: r.u16().map_err(short)?,
            flags: r.u32().map_err(short)?,
            resource_count: r.u32().map_err(short)?,
            resource_table_offset: r.u64().map_err(short)?,
            string_table_offset: r.u64().map_err(short)?,
            data_offset: r.u64().map_err(short)?,
            total_size: r.u64().map_err(short)?,
            content_hash: r.array().map_err(short)?,
        };
        if header.magic != PACK_MAGIC {
            return Err(VfsError::InvalidMagic(header.magic));
        }
        if header.version_major != PACK_VERSION_MAJOR {
            return Err(VfsError::UnsupportedVersion {
                major: header.version_major,
                minor: header.version_minor,
            });
        }
        Ok(header)
    }

    /// 在任何读取之前，用文件长度检查所有偏移与数量
    pub fn validate(&self, file_len: u64, limits: &PackLimits) -> Result<(), VfsError> {
        if self.resource_count as usize > limits.max_resources {
            return Err(limit_error(
                "资源",
                self.resource_count as u64,
                limits.max_resources as u64,
            ));
        }
        if self.total_size != file_len {
            return Err(VfsError::Truncated(format!(
                "声明大小 {}，文件实际 {} 字节",
                self.total_size, file_len
            )));
        }
        let table_end = (self.resource_count as u64)
            .checked_mul(ENTRY_SIZE as u64)
            .and_then(|len| self.resource_table_offset.checked_add(len));
        let ordered = self.resource_table_offset >= PACK_HEADER_SIZE as u64
            && table_end.is_some_and(|end| end <= self.string_table_offset)
            && self.string_table_offset <= self.data_offset
            && self.data_offset <= file_len;
        if !ordered {
            return Err(VfsError::Truncated(format!(
                "区段偏移越界: 资源表 {}, 字符串表 {}, 数据区 {}, 文件 {}",
                self.resource_table_offset, self.string_table_offset, self.data_offset, file_len
            )));
        }
        Ok(())
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn resource_table_len(&self) -> usize {
        self.resource_count as usize * ENTRY_SIZE
    }

    pub fn string_table_len(&self) -> usize {
        (self.data_offset - self.string_table_offset) as usize
    }

    pub fn to_bytes(&self) -> [u8; PACK_HEADER_SIZE] {
        let mut w = ByteWriter::with_capacity(PACK_HEADER_SIZE);
        w.u32(self.magic)
            .u16(self.version_major)
            .u16(self.version_minor)
            .u32(self.flags)
            .u32(self.resource_count)
            .u64(self.resource_table_offset)
            .u64(self.string_table_offset)
            .u64(self.data_offset)
            .u64(self.total_size)
            .bytes(&self.content_hash);
        let mut out = [0u8; PACK_HEADER_SIZE];
        out.copy_from_slice(&w.into_inner());
        out
    }
}

/// 计算内容哈希
pub fn content_hash(
    header: &[u8; PACK_HEADER_SIZE],
    resource_table: &[u8],
    string_table: &[u8],
) -> [u8; CONTENT_HASH_SIZE] {
    let mut zeroed = *header;
    zeroed[HASH_OFFSET..].fill(0);
    let mut hasher = Sha256::new();
    hasher.update(zeroed);
    hasher.update(resource_table);
    hasher.update(string_table);
    let digest = hasher.finalize();
    let mut out = [0u8; CONTENT_HASH_SIZE];
    out.copy_from_slice(&digest[..CONTENT_HASH_SIZE]);
    out
}

/// 签名覆盖的字节：完整文件头 + 资源表 + 字符串表
pub fn signed_region(
    header: &[u8; PACK_HEADER_SIZE],
    resource_table: &[u8],
    string_table: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACK_HEADER_SIZE + resource_table.len() + string_table.len());
    out.extend_from_slice(header);
    out.extend_from_slice(resource_table);
    out.extend_from_slice(string_table);
    out
}

/// 资源表条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub name_offset: u32,
    pub resource_type: ResourceType,
    pub flags: u8,
    /// 相对于包数据区
    pub data_offset: u64,
    /// 存储大小（加密时含 16 字节标签）
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// 解码后数据的 CRC32
    pub checksum: u32,
    pub iv: [u8; 8],
}

impl ResourceEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, VfsError> {
        let mut r = ByteReader::new(bytes);
        let short = |_| VfsError::Truncated("资源表条目".to_string());
        let name_offset = r.u32().map_err(short)?;
        let resource_type = ResourceType::from_u8(r.u8().map_err(short)?);
        let flags = r.u8().map_err(short)?;
        let _reserved = r.u16().map_err(short)?;
        Ok(Self {
            name_offset,
            resource_type,
            flags,
            data_offset: r.u64().map_err(short)?,
            compressed_size: r.u64().map_err(short)?,
            uncompressed_size: r.u64().map_err(short)?,
            checksum: r.u32().map_err(short)?,
            iv: r.array().map_err(short)?,
        })
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.u32(self.name_offset)
            .u8(self.resource_type.to_u8())
            .u8(self.flags)
            .u16(0)
            .u64(self.data_offset)
            .u64(self.compressed_size)
            .u64(self.uncompressed_size)
            .u32(self.checksum)
            .bytes(&self.iv);
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ENTRY_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & ENTRY_ENCRYPTED != 0
    }

    /// AES-GCM nonce：`iv[8] || 0u32`
    pub fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.iv);
        nonce
    }

    /// 数量与范围检查；`data_len` 为数据区长度
    pub fn validate(&self, id: &str, data_len: u64, limits: &PackLimits) -> Result<(), VfsError> {
        if self.uncompressed_size > limits.max_resource_bytes {
            return Err(limit_error(
                "资源字节",
                self.uncompressed_size,
                limits.max_resource_bytes,
            ));
        }
        let in_bounds = self
            .data_offset
            .checked_add(self.compressed_size)
            .is_some_and(|end| end <= data_len);
        if !in_bounds {
            return Err(VfsError::Truncated(format!(
                "资源 {} 的数据范围 {}+{} 超出数据区 {}",
                id, self.data_offset, self.compressed_size, data_len
            )));
        }
        Ok(())
    }
}

/// 字符串表写入器，返回每个字符串记录的偏移
#[derive(Debug, Default)]
pub struct StringTableWriter {
    strings: Vec<String>,
    offsets: HashMap<String, u32>,
    len: u32,
}

impl StringTableWriter {
    pub fn new() -> Self {
        Self {
            len: 4,
            ..Default::default()
        }
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }
        let offset = self.len;
        self.len += 4 + s.len() as u32;
        self.offsets.insert(s.to_string(), offset);
        self.strings.push(s.to_string());
        offset
    }

    pub fn finish(self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.len as usize);
        w.u32(self.strings.len() as u32);
        for s in &self.strings {
            w.str_u32(s);
        }
        w.into_inner()
    }
}

/// 解析字符串表为「偏移 → 字符串」
pub fn parse_string_table(
    bytes: &[u8],
    limits: &PackLimits,
) -> Result<HashMap<u32, String>, VfsError> {
    let mut r = ByteReader::new(bytes);
    let short = |_| VfsError::Truncated("字符串表".to_string());
    let count = r.u32().map_err(short)? as usize;
    if count > limits.max_strings {
        return Err(limit_error("字符串", count as u64, limits.max_strings as u64));
    }
    // 每条记录至少 4 字节
    if count > r.remaining() / 4 {
        return Err(VfsError::Truncated(format!(
            "字符串表声明 {} 条，仅剩 {} 字节",
            count,
            r.remaining()
        )));
    }

    let mut strings = HashMap::with_capacity(count);
    for _ in 0..count {
        let offset = r.position() as u32;
        let len = r.u32().map_err(short)? as usize;
        if len > limits.max_string_bytes {
            return Err(limit_error(
                "字符串字节",
                len as u64,
                limits.max_string_bytes as u64,
            ));
        }
        let raw = r.bytes(len).map_err(short)?;
        let s = std::str::from_utf8(raw)
            .map_err(|_| VfsError::Malformed(format!("字符串表偏移 {} 不是合法 UTF-8", offset)))?;
        strings.insert(offset, s.to_string());
    }
    Ok(strings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PackHeader {
        let mut h = PackHeader::new(PACK_SIGNED);
        h.resource_count = 2;
        h.string_table_offset = 64 + 88;
        h.data_offset = 64 + 88 + 20;
        h.total_size = 64 + 88 + 20 + 100;
        h
    }

    #[test]
    fn test_header_layout() {
        let h = header();
        let bytes = h.to_bytes();
        assert_eq!(&bytes[..4], b"NRMS");
        assert_eq!(PackHeader::parse(&bytes).unwrap(), h);
        h.validate(h.total_size, &PackLimits::default()).unwrap();
    }

    #[test]
    fn test_header_rejections() {
        let mut bytes = header().to_bytes();
        bytes[0] = 0;
        assert!(matches!(PackHeader::parse(&bytes), Err(VfsError::InvalidMagic(_))));

        let mut h = header();
        h.version_major = 2;
        assert!(matches!(
            PackHeader::parse(&h.to_bytes()),
            Err(VfsError::UnsupportedVersion { major: 2, .. })
        ));

        let h = header();
        assert!(matches!(
            h.validate(h.total_size - 1, &PackLimits::default()),
            Err(VfsError::Truncated(_))
        ));

        let mut h = header();
        h.string_table_offset = 64 + 40;
        assert!(h.validate(h.total_size, &PackLimits::default()).is_err());

        assert!(matches!(PackHeader::parse(&[0u8; 10]), Err(VfsError::Truncated(_))));
    }

    #[test]
    fn test_resource_count_limit_boundary() {
        let limits = PackLimits {
            max_resources: 2,
            ..PackLimits::default()
        };
        let h = header();
        h.validate(h.total_size, &limits).unwrap();

        let mut over = header();
        over.resource_count = 3;
        over.string_table_offset = 64 + 132;
        over.data_offset = over.string_table_offset;
        over.total_size = over.data_offset;
        assert!(matches!(
            over.validate(over.total_size, &limits),
            Err(VfsError::CountExceedsLimit { count: 3, limit: 2, .. })
        ));
    }

    #[test]
    fn test_entry_layout() {
        let entry = ResourceEntry {
            name_offset: 4,
            resource_type: ResourceType::Texture,
            flags: ENTRY_COMPRESSED | ENTRY_ENCRYPTED,
            data_offset: 10,
            compressed_size: 20,
            uncompressed_size: 30,
            checksum: 0xDEAD_BEEF,
            iv: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let mut w = ByteWriter::new();
        entry.write(&mut w);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), ENTRY_SIZE);
        assert_eq!(ResourceEntry::parse(&bytes).unwrap(), entry);
        assert_eq!(&entry.nonce()[..8], &entry.iv);
        assert_eq!(&entry.nonce()[8..], &[0, 0, 0, 0]);

        entry.validate("a", 30, &PackLimits::default()).unwrap();
        assert!(entry.validate("a", 29, &PackLimits::default()).is_err());
    }

    #[test]
    fn test_string_table_offsets() {
        let mut w = StringTableWriter::new();
        let a = w.intern("ui/title.png");
        let b = w.intern("bg/room.png");
        assert_eq!(w.intern("ui/title.png"), a);
        let bytes = w.finish();
        let table = parse_string_table(&bytes, &PackLimits::default()).unwrap();
        assert_eq!(table[&a], "ui/title.png");
        assert_eq!(table[&b], "bg/room.png");
        assert_eq!(a, 4);
    }

    #[test]
    fn test_string_table_rejects_oversized_count() {
        let mut w = ByteWriter::new();
        w.u32(1_000);
        assert!(matches!(
            parse_string_table(&w.into_inner(), &PackLimits::default()),
            Err(VfsError::Truncated(_))
        ));
    }

    #[test]
    fn test_content_hash_ignores_hash_field() {
        let mut h = header();
        let a = content_hash(&h.to_bytes(), b"rt", b"st");
        h.content_hash = a;
        assert_eq!(content_hash(&h.to_bytes(), b"rt", b"st"), a);
        assert_ne!(content_hash(&h.to_bytes(), b"rt", b"sT"), a);
    }

    #[test]
    fn test_resource_type_inference() {
        assert_eq!(ResourceType::from_path("ui/title.PNG"), ResourceType::Texture);
        assert_eq!(ResourceType::from_path("loc/ru.po"), ResourceType::Localization);
        assert_eq!(ResourceType::from_path("README"), ResourceType::Data);
        assert_eq!(ResourceType::from_u8(200), ResourceType::Data);
        assert_eq!(ResourceType::from_name("music"), Some(ResourceType::Music));
    }
}
