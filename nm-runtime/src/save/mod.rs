//! # Save 模块
//!
//! 存档数据模型与规范化负载编码。文件头、压缩与加密由宿主层的存档仓库处理。
//!
//! ## 设计原则
//!
//! - 所有映射使用 `BTreeMap`，同一份数据总是编码出相同的字节
//! - 解码严格：所有计数先与上限比较，再读取内容；多余的尾部字节视为损坏
//! - 校验和（CRC32）覆盖规范化负载，而不是压缩或加密后的字节
//!
//! ## 负载布局（v2，小端）
//!
//! ```text
//! sceneId str │ nodeId str
//! │ intCount u32   { key str, value i64 }
//! │ floatCount u32 { key str, value f64 }
//! │ flagCount u32  { key str, value u8 }
//! │ stringCount u32 { key str, value str }
//! │ thumbWidth u32 │ thumbHeight u32 │ thumbLen u32 │ rgba[thumbLen]
//! ```
//!
//! `str` 为 u32 长度前缀的 UTF-8。v1 负载见 [`legacy`]。

pub mod legacy;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::codec::{ByteReader, ByteWriter, ShortRead};
use crate::error::ErrorKind;

/// 每个映射的条目上限
pub const MAX_MAP_ENTRIES: usize = 100_000;
/// 单个字符串的字节上限
pub const MAX_STRING_BYTES: usize = 1 << 20;
/// 缩略图边长上限
pub const MAX_THUMBNAIL_DIMENSION: u32 = 4096;

/// 存档错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaveError {
    #[error("存档魔数无效: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("存档文件被截断: 需要 {needed} 字节，剩余 {available} 字节")]
    Truncated { needed: usize, available: usize },

    #[error("不支持的存档版本: {0}")]
    UnsupportedVersion(u16),

    #[error("存档校验和不匹配: 期望 0x{expected:08X}，实际 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("存档解压后大小不符: 期望 {expected}，实际 {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("存档负载损坏: {0}")]
    Malformed(String),

    #[error("{what} 数量 {count} 超出上限 {limit}")]
    CountExceedsLimit {
        what: &'static str,
        count: usize,
        limit: usize,
    },

    #[error("存档数据无效: {0}")]
    InvalidData(String),

    #[error("已启用存档加密但未提供密钥")]
    KeyMissing,

    #[error("存档密钥长度无效: {0} 字节（需要 32 字节）")]
    InvalidKey(usize),

    #[error("存档认证失败（数据被篡改或密钥错误）")]
    AuthenticationFailed,

    #[error("存档解压失败: {0}")]
    Decompression(String),

    #[error("存档槽位超出范围: {slot}（上限 {max}）")]
    SlotOutOfRange { slot: u32, max: u32 },

    #[error("存档不存在: {0}")]
    NotFound(String),

    #[error("存档读写失败: {0}")]
    Io(String),
}

impl SaveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMagic(_) | Self::Truncated { .. } | Self::InvalidData(_) => {
                ErrorKind::InvalidFormat
            }
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Self::ChecksumMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::Malformed(_)
            | Self::Decompression(_) => ErrorKind::Corrupted,
            Self::CountExceedsLimit { .. } => ErrorKind::CountExceedsLimit,
            Self::KeyMissing | Self::InvalidKey(_) => ErrorKind::KeyMissing,
            Self::AuthenticationFailed => ErrorKind::IntegrityFailure,
            Self::SlotOutOfRange { .. } | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::IOError,
        }
    }
}

impl From<ShortRead> for SaveError {
    fn from(e: ShortRead) -> Self {
        SaveError::Malformed(format!(
            "负载被截断: 需要 {} 字节，剩余 {} 字节",
            e.needed, e.available
        ))
    }
}

/// 存档缩略图（RGBA8），宽高均不为 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Thumbnail {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, SaveError> {
        let thumbnail = Self { width, height, rgba };
        thumbnail.validate()?;
        Ok(thumbnail)
    }

    pub fn validate(&self) -> Result<(), SaveError> {
        if self.width == 0 || self.height == 0 {
            return Err(SaveError::InvalidData(format!(
                "缩略图尺寸 {}x{} 不能为空",
                self.width, self.height
            )));
        }
        if self.width > MAX_THUMBNAIL_DIMENSION || self.height > MAX_THUMBNAIL_DIMENSION {
            return Err(SaveError::InvalidData(format!(
                "缩略图尺寸 {}x{} 超出上限 {}",
                self.width, self.height, MAX_THUMBNAIL_DIMENSION
            )));
        }
        let expected = self.width as usize * self.height as usize * 4;
        if self.rgba.len() != expected {
            return Err(SaveError::InvalidData(format!(
                "缩略图字节数 {} 与尺寸 {}x{} 不符",
                self.rgba.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// 存档数据
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveData {
    pub scene_id: String,
    pub node_id: String,
    pub int_variables: BTreeMap<String, i64>,
    pub float_variables: BTreeMap<String, f64>,
    pub flags: BTreeMap<String, bool>,
    pub string_variables: BTreeMap<String, String>,
    pub thumbnail: Option<Thumbnail>,
}

fn check_count(what: &'static str, count: usize) -> Result<(), SaveError> {
    if count > MAX_MAP_ENTRIES {
        return Err(SaveError::CountExceedsLimit {
            what,
            count,
            limit: MAX_MAP_ENTRIES,
        });
    }
    Ok(())
}

fn check_str(s: &str) -> Result<(), SaveError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(SaveError::CountExceedsLimit {
            what: "字符串字节",
            count: s.len(),
            limit: MAX_STRING_BYTES,
        });
    }
    Ok(())
}

impl SaveData {
    pub fn new(scene_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// 检查上限与缩略图尺寸
    pub fn validate(&self) -> Result<(), SaveError> {
        check_str(&self.scene_id)?;
        check_str(&self.node_id)?;
        check_count("整数变量", self.int_variables.len())?;
        check_count("浮点变量", self.float_variables.len())?;
        check_count("标记", self.flags.len())?;
        check_count("字符串变量", self.string_variables.len())?;

        let keys = self
            .int_variables
            .keys()
            .chain(self.float_variables.keys())
            .chain(self.flags.keys())
            .chain(self.string_variables.keys());
        for key in keys {
            check_str(key)?;
        }
        for value in self.string_variables.values() {
            check_str(value)?;
        }
        if let Some(thumbnail) = &self.thumbnail {
            thumbnail.validate()?;
        }
        Ok(())
    }

    /// 编码为规范化负载
    pub fn encode(&self) -> Result<Vec<u8>, SaveError> {
        self.validate()?;
        let mut w = ByteWriter::with_capacity(256);
        w.str_u32(&self.scene_id).str_u32(&self.node_id);

        w.u32(self.int_variables.len() as u32);
        for (k, v) in &self.int_variables {
            w.str_u32(k).i64(*v);
        }
        w.u32(self.float_variables.len() as u32);
        for (k, v) in &self.float_variables {
            w.str_u32(k).f64(*v);
        }
        w.u32(self.flags.len() as u32);
        for (k, v) in &self.flags {
            w.str_u32(k).u8(*v as u8);
        }
        w.u32(self.string_variables.len() as u32);
        for (k, v) in &self.string_variables {
            w.str_u32(k).str_u32(v);
        }

        match &self.thumbnail {
            Some(t) => {
                w.u32(t.width).u32(t.height).u32(t.rgba.len() as u32).bytes(&t.rgba);
            }
            None => {
                w.u32(0).u32(0).u32(0);
            }
        }
        Ok(w.into_inner())
    }

    /// 严格解码 v2 负载
    pub fn decode(payload: &[u8]) -> Result<Self, SaveError> {
        let mut r = PayloadReader::new(payload);
        let mut data = SaveData::new(r.string()?, r.string()?);

        for _ in 0..r.count("整数变量")? {
            let key = r.string()?;
            data.int_variables.insert(key, r.inner.i64()?);
        }
        for _ in 0..r.count("浮点变量")? {
            let key = r.string()?;
            data.float_variables.insert(key, r.inner.f64()?);
        }
        for _ in 0..r.count("标记")? {
            let key = r.string()?;
            data.flags.insert(key, r.bool()?);
        }
        for _ in 0..r.count("字符串变量")? {
            let key = r.string()?;
            data.string_variables.insert(key, r.string()?);
        }

        let width = r.inner.u32()?;
        let height = r.inner.u32()?;
        let len = r.inner.u32()? as usize;
        if width > MAX_THUMBNAIL_DIMENSION || height > MAX_THUMBNAIL_DIMENSION {
            return Err(SaveError::Malformed(format!("缩略图尺寸 {}x{} 超出上限", width, height)));
        }
        if len != width as usize * height as usize * 4 {
            return Err(SaveError::Malformed(format!(
                "缩略图字节数 {} 与尺寸 {}x{} 不符",
                len, width, height
            )));
        }
        // 全零表示没有缩略图，其余空尺寸都不是编码器的输出
        if len == 0 && (width != 0 || height != 0) {
            return Err(SaveError::Malformed(format!("缩略图尺寸 {}x{} 为空", width, height)));
        }
        if len > 0 {
            data.thumbnail = Some(Thumbnail {
                width,
                height,
                rgba: r.inner.bytes(len)?.to_vec(),
            });
        }

        r.finish()?;
        Ok(data)
    }
}

/// CRC32（IEEE）
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// 带上限检查的负载读取器
pub(crate) struct PayloadReader<'a> {
    pub(crate) inner: ByteReader<'a>,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(payload: &'a [u8]) -> Self {
        Self {
            inner: ByteReader::new(payload),
        }
    }

    pub(crate) fn count(&mut self, what: &'static str) -> Result<usize, SaveError> {
        let count = self.inner.u32()? as usize;
        check_count(what, count)?;
        Ok(count)
    }

    pub(crate) fn string(&mut self) -> Result<String, SaveError> {
        let len = self.inner.u32()? as usize;
        if len > MAX_STRING_BYTES {
            return Err(SaveError::CountExceedsLimit {
                what: "字符串字节",
                count: len,
                limit: MAX_STRING_BYTES,
            });
        }
        let bytes = self.inner.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SaveError::Malformed("字符串不是合法的 UTF-8".to_string()))
    }

    pub(crate) fn bool(&mut self) -> Result<bool, SaveError> {
        match self.inner.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SaveError::Malformed(format!("布尔值无效: {}", other))),
        }
    }

    pub(crate) fn finish(self) -> Result<(), SaveError> {
        if !self.inner.is_empty() {
            return Err(SaveError::Malformed(format!(
                "负载末尾有 {} 个多余字节",
                self.inner.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn sample() -> SaveData {
        let mut data = SaveData::new("intro", "node_7");
        data.int_variables.insert("chapter".to_string(), 2);
        data.float_variables.insert("affection".to_string(), 0.75);
        data.flags.insert("met_alice".to_string(), true);
        data.string_variables.insert("player".to_string(), "Kai".to_string());
        data.thumbnail = Some(Thumbnail::new(2, 1, vec![255, 0, 0, 255, 0, 255, 0, 255]).unwrap());
        data
    }

    #[test]
    fn test_roundtrip_and_canonical_bytes() {
        let data = sample();
        let bytes = data.encode().unwrap();
        assert_eq!(SaveData::decode(&bytes).unwrap(), data);
        assert_eq!(data.clone().encode().unwrap(), bytes);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        let err = SaveData::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_truncated_payload_is_corrupted() {
        let bytes = sample().encode().unwrap();
        for len in [0, 3, 10, bytes.len() - 1] {
            let err = SaveData::decode(&bytes[..len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Corrupted, "len = {}", len);
        }
    }

    #[test]
    fn test_declared_count_bounded_before_reading() {
        let mut w = ByteWriter::new();
        w.str_u32("s").str_u32("n").u32(u32::MAX);
        let err = SaveData::decode(&w.into_inner()).unwrap_err();
        assert!(matches!(err, SaveError::CountExceedsLimit { .. }));
    }

    #[test]
    fn test_thumbnail_size_checked() {
        assert!(Thumbnail::new(2, 2, vec![0; 15]).is_err());
        assert!(Thumbnail::new(5000, 1, vec![0; 20000]).is_err());
        let mut data = SaveData::new("a", "b");
        data.thumbnail = Some(Thumbnail {
            width: 1,
            height: 1,
            rgba: vec![0; 3],
        });
        assert_eq!(data.encode().unwrap_err().kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_empty_thumbnail_rejected() {
        assert!(Thumbnail::new(0, 4, Vec::new()).is_err());
        assert!(Thumbnail::new(4, 0, Vec::new()).is_err());
        let mut data = SaveData::new("a", "b");
        data.thumbnail = Some(Thumbnail {
            width: 0,
            height: 7,
            rgba: Vec::new(),
        });
        assert_eq!(data.encode().unwrap_err().kind(), ErrorKind::InvalidFormat);

        // 缩略图字段位于负载末尾：宽、高、长度各 4 字节
        let mut bytes = SaveData::new("a", "b").encode().unwrap();
        let height_at = bytes.len() - 8;
        bytes[height_at..height_at + 4].copy_from_slice(&7u32.to_le_bytes());
        let err = SaveData::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_checksum_detects_flip() {
        let bytes = sample().encode().unwrap();
        let mut flipped = bytes.clone();
        flipped[5] ^= 0xFF;
        assert_ne!(checksum(&bytes), checksum(&flipped));
    }
}
