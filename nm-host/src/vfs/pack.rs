//! 单个资源包的打开、校验与资源解码
//!
//! 打开顺序：文件头 → 偏移检查 → 读取资源表与字符串表 → 内容哈希 → 签名 →
//! 密钥检查 → 解析条目。任何一步失败都不会留下打开的包。
//!
//! 资源解码顺序：读取存储字节 → 解密（条目标记加密时）→ 解压（条目标记压缩时）
//! → 校验大小与 CRC32。

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ed25519_dalek::VerifyingKey;
use flate2::read::ZlibDecoder;
use tracing::{debug, warn};

use super::format::{
    self, PACK_ENCRYPTED, PACK_HEADER_SIZE, PACK_SIGNED, PackHeader, PackLimits, ResourceEntry,
    ENTRY_SIZE, MANIFEST_ID, RESERVED_PREFIX,
};
use super::manifest::PackManifest;
use super::{VfsError, normalize_resource_id};
use crate::crypto::{self, AesKey, TAG_LEN};

/// 分离签名文件路径：`<pack>.sig`
pub fn signature_path(pack_path: &Path) -> PathBuf {
    let mut s = pack_path.as_os_str().to_os_string();
    s.push(".sig");
    PathBuf::from(s)
}

/// 打开选项
#[derive(Debug, Clone, Default)]
pub struct PackOpenOptions {
    pub limits: PackLimits,
    pub aes_key: Option<AesKey>,
    pub public_key: Option<VerifyingKey>,
    /// 未签名的包直接拒绝
    pub require_signature: bool,
}

/// 已打开的资源包
#[derive(Debug)]
pub struct PackReader {
    path: PathBuf,
    header: PackHeader,
    file: Mutex<File>,
    entries: HashMap<String, ResourceEntry>,
    /// 资源表顺序（不含保留资源）
    ids: Vec<String>,
    manifest: PackManifest,
    aes_key: Option<AesKey>,
    verified: bool,
    warnings: Vec<String>,
}

impl PackReader {
    pub fn open(path: &Path, options: &PackOpenOptions) -> Result<Self, VfsError> {
        let mut file = File::open(path).map_err(|e| VfsError::io(path, e))?;
        let file_len = file.metadata().map_err(|e| VfsError::io(path, e))?.len();

        let mut header_bytes = [0u8; PACK_HEADER_SIZE];
        if file_len < PACK_HEADER_SIZE as u64 {
            return Err(VfsError::Truncated(format!(
                "{} 只有 {} 字节",
                path.display(),
                file_len
            )));
        }
        file.read_exact(&mut header_bytes)
            .map_err(|e| VfsError::io(path, e))?;
        let header = PackHeader::parse(&header_bytes)?;
        header.validate(file_len, &options.limits)?;

        let resource_table = read_region(
            &mut file,
            header.resource_table_offset,
            header.resource_table_len(),
        )
        .map_err(|e| VfsError::io(path, e))?;
        let string_table = read_region(
            &mut file,
            header.string_table_offset,
            header.string_table_len(),
        )
        .map_err(|e| VfsError::io(path, e))?;

        let hash = format::content_hash(&header_bytes, &resource_table, &string_table);
        if hash != header.content_hash {
            return Err(VfsError::integrity(
                &path.display().to_string(),
                "内容哈希不匹配",
            ));
        }

        let verified = verify_signature(
            path,
            &header,
            &header_bytes,
            &resource_table,
            &string_table,
            options,
        )?;

        if header.has_flag(PACK_ENCRYPTED) && options.aes_key.is_none() {
            return Err(VfsError::KeyMissing(format!(
                "资源包 {} 已加密，未配置 AES 密钥",
                path.display()
            )));
        }

        let names = format::parse_string_table(&string_table, &options.limits)?;
        let data_len = header.total_size - header.data_offset;
        let mut entries = HashMap::with_capacity(header.resource_count as usize);
        let mut ids = Vec::with_capacity(header.resource_count as usize);
        let mut warnings = Vec::new();
        for chunk in resource_table.chunks_exact(ENTRY_SIZE) {
            let entry = ResourceEntry::parse(chunk)?;
            let name = names.get(&entry.name_offset).ok_or_else(|| {
                VfsError::Malformed(format!("条目引用了不存在的字符串偏移 {}", entry.name_offset))
            })?;
            let id = normalize_resource_id(name);
            entry.validate(&id, data_len, &options.limits)?;
            if entries.contains_key(&id) {
                warnings.push(format!("资源 {} 在包内重复，保留第一条", id));
                continue;
            }
            if !id.starts_with(RESERVED_PREFIX) {
                ids.push(id.clone());
            }
            entries.insert(id, entry);
        }

        let mut reader = Self {
            path: path.to_path_buf(),
            header,
            file: Mutex::new(file),
            entries,
            ids,
            manifest: PackManifest::new(file_stem(path)),
            aes_key: options.aes_key.clone(),
            verified,
            warnings,
        };
        if reader.entries.contains_key(MANIFEST_ID) {
            let bytes = reader.read_raw(MANIFEST_ID)?;
            reader.manifest = PackManifest::parse(&bytes)?;
        }
        debug!(
            path = %reader.path.display(),
            id = %reader.manifest.id,
            resources = reader.ids.len(),
            verified,
            "资源包已打开"
        );
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &PackHeader {
        &self.header
    }

    pub fn manifest(&self) -> &PackManifest {
        &self.manifest
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// 签名是否已验证
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// 可索引的资源 id（资源表顺序）
    pub fn resource_ids(&self) -> &[String] {
        &self.ids
    }

    pub fn entry(&self, id: &str) -> Option<&ResourceEntry> {
        if id.starts_with(RESERVED_PREFIX) {
            return None;
        }
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry(id).is_some()
    }

    /// 读取并完整解码资源
    pub fn read(&self, id: &str) -> Result<Vec<u8>, VfsError> {
        if id.starts_with(RESERVED_PREFIX) {
            return Err(VfsError::NotFound(id.to_string()));
        }
        self.read_raw(id)
    }

    fn read_raw(&self, id: &str) -> Result<Vec<u8>, VfsError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
        let offset = self.header.data_offset + entry.data_offset;
        let stored = {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            read_region(&mut file, offset, entry.compressed_size as usize)
                .map_err(|e| VfsError::io(&self.path, e))?
        };
        decode_entry(id, entry, stored, self.aes_key.as_ref())
    }
}

/// 解密、解压并校验单个条目
pub(crate) fn decode_entry(
    id: &str,
    entry: &ResourceEntry,
    mut stored: Vec<u8>,
    key: Option<&AesKey>,
) -> Result<Vec<u8>, VfsError> {
    if entry.is_encrypted() {
        let key = key.ok_or_else(|| VfsError::KeyMissing(format!("资源 {} 已加密", id)))?;
        if stored.len() < TAG_LEN {
            return Err(VfsError::integrity(id, "密文短于认证标签"));
        }
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&stored[..TAG_LEN]);
        let mut ciphertext = stored.split_off(TAG_LEN);
        crypto::open_in_place(key, &entry.nonce(), id.as_bytes(), &mut ciphertext, &tag)
            .map_err(|_| VfsError::integrity(id, "认证标签不匹配"))?;
        stored = ciphertext;
    }

    let expected = entry.uncompressed_size as usize;
    let data = if entry.is_compressed() {
        let mut out = Vec::with_capacity(expected);
        ZlibDecoder::new(stored.as_slice())
            .take(entry.uncompressed_size + 1)
            .read_to_end(&mut out)
            .map_err(|e| VfsError::integrity(id, format!("解压失败: {}", e)))?;
        out
    } else {
        stored
    };
    if data.len() != expected {
        return Err(VfsError::integrity(
            id,
            format!("大小不符: 期望 {}，实际 {}", expected, data.len()),
        ));
    }

    let actual = crc32fast::hash(&data);
    if actual != entry.checksum {
        warn!(resource = id, expected = entry.checksum, actual, "资源 CRC 校验失败");
        return Err(VfsError::integrity(
            id,
            format!("CRC32 不匹配: 期望 0x{:08X}，实际 0x{:08X}", entry.checksum, actual),
        ));
    }
    Ok(data)
}

fn verify_signature(
    path: &Path,
    header: &PackHeader,
    header_bytes: &[u8; PACK_HEADER_SIZE],
    resource_table: &[u8],
    string_table: &[u8],
    options: &PackOpenOptions,
) -> Result<bool, VfsError> {
    let signed = header.has_flag(PACK_SIGNED);
    if !signed {
        if options.require_signature {
            return Err(VfsError::SignatureInvalid(format!(
                "{} 未签名，但该类型的资源包必须签名",
                path.display()
            )));
        }
        return Ok(false);
    }

    let public_key = options.public_key.as_ref().ok_or_else(|| {
        VfsError::KeyMissing(format!("资源包 {} 已签名，未配置公钥", path.display()))
    })?;
    let sig_path = signature_path(path);
    let signature = std::fs::read(&sig_path).map_err(|_| {
        VfsError::SignatureInvalid(format!("缺少签名文件 {}", sig_path.display()))
    })?;
    let message = format::signed_region(header_bytes, resource_table, string_table);
    crypto::verify(public_key, &message, &signature)
        .map_err(|_| VfsError::SignatureInvalid(path.display().to_string()))?;
    Ok(true)
}

fn read_region(file: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pack".to_string())
}
