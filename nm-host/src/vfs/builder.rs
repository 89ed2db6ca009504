//! 资源包写入
//!
//! 每个条目依次经过：CRC32（原始数据）→ 可选压缩（仅当变小）→ 可选加密。
//! 构建可以放在独立线程中执行：进度通过 mpsc 通道发出，取消通过共享的
//! `AtomicBool` 在每个条目边界检查。

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use ed25519_dalek::SigningKey;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use nm_runtime::codec::ByteWriter;
use tracing::info;

use super::format::{
    self, ENTRY_COMPRESSED, ENTRY_ENCRYPTED, ENTRY_SIZE, MANIFEST_ID, PACK_COMPRESSED,
    PACK_ENCRYPTED, PACK_HEADER_SIZE, PACK_SIGNED, PackHeader, ResourceEntry, ResourceType,
    StringTableWriter,
};
use super::manifest::PackManifest;
use super::pack::signature_path;
use super::{VfsError, normalize_resource_id};
use crate::crypto::{self, AesKey, SIGNATURE_LEN};

/// 构建选项
#[derive(Debug, Clone, Default)]
pub struct PackBuildOptions {
    pub compress: bool,
    pub aes_key: Option<AesKey>,
    pub signing_key: Option<SigningKey>,
    /// 写入 `__pack__/manifest.json`
    pub manifest: Option<PackManifest>,
}

/// 待写入的资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEntry {
    pub id: String,
    pub resource_type: ResourceType,
    pub data: Vec<u8>,
}

/// 构建进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildProgress {
    Entry {
        index: usize,
        total: usize,
        id: String,
    },
    Finished {
        bytes: u64,
    },
}

/// 构建产物
#[derive(Debug, Clone)]
pub struct BuiltPack {
    pub bytes: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
    pub resource_count: usize,
}

pub struct PackBuilder {
    options: PackBuildOptions,
    entries: Vec<BuildEntry>,
    cancel: Arc<AtomicBool>,
    progress: Option<Sender<BuildProgress>>,
}

impl PackBuilder {
    pub fn new(options: PackBuildOptions) -> Self {
        Self {
            options,
            entries: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// 添加资源，类型按扩展名推断；同名资源被替换
    pub fn add(&mut self, id: &str, data: Vec<u8>) {
        self.add_typed(id, ResourceType::from_path(id), data);
    }

    pub fn add_typed(&mut self, id: &str, resource_type: ResourceType, data: Vec<u8>) {
        let id = normalize_resource_id(id);
        let entry = BuildEntry {
            id,
            resource_type,
            data,
        };
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 共享的取消标记
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = flag;
    }

    pub fn set_progress(&mut self, sender: Sender<BuildProgress>) {
        self.progress = Some(sender);
    }

    fn report(&self, event: BuildProgress) {
        if let Some(sender) = &self.progress {
            // 接收端已关闭时忽略
            let _ = sender.send(event);
        }
    }

    pub fn build(&self) -> Result<BuiltPack, VfsError> {
        let mut all: Vec<(&str, ResourceType, std::borrow::Cow<'_, [u8]>)> = self
            .entries
            .iter()
            .map(|e| (e.id.as_str(), e.resource_type, e.data.as_slice().into()))
            .collect();
        if let Some(manifest) = &self.options.manifest {
            all.push((MANIFEST_ID, ResourceType::Data, manifest.to_json().into()));
        }

        let total = all.len();
        let mut strings = StringTableWriter::new();
        let mut table = ByteWriter::with_capacity(total * ENTRY_SIZE);
        let mut data = Vec::new();
        let mut any_compressed = false;

        for (index, (id, resource_type, raw)) in all.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(VfsError::Cancelled);
            }
            self.report(BuildProgress::Entry {
                index,
                total,
                id: id.to_string(),
            });

            let mut flags = 0u8;
            let mut stored = raw.to_vec();
            if self.options.compress {
                let packed = zlib(&stored)?;
                if packed.len() < stored.len() {
                    stored = packed;
                    flags |= ENTRY_COMPRESSED;
                    any_compressed = true;
                }
            }

            let mut iv = [0u8; 8];
            if let Some(key) = &self.options.aes_key {
                iv = crypto::random_bytes();
                let mut entry_nonce = [0u8; 12];
                entry_nonce[..8].copy_from_slice(&iv);
                let tag = crypto::seal_in_place(key, &entry_nonce, id.as_bytes(), &mut stored)
                    .map_err(|e| VfsError::DecryptionFailure(e.to_string()))?;
                let mut sealed = Vec::with_capacity(tag.len() + stored.len());
                sealed.extend_from_slice(&tag);
                sealed.extend_from_slice(&stored);
                stored = sealed;
                flags |= ENTRY_ENCRYPTED;
            }

            let entry = ResourceEntry {
                name_offset: strings.intern(id),
                resource_type: *resource_type,
                flags,
                data_offset: data.len() as u64,
                compressed_size: stored.len() as u64,
                uncompressed_size: raw.len() as u64,
                checksum: crc32fast::hash(raw),
                iv,
            };
            entry.write(&mut table);
            data.extend_from_slice(&stored);
        }

        let resource_table = table.into_inner();
        let string_table = strings.finish();

        let mut flags = 0;
        if any_compressed {
            flags |= PACK_COMPRESSED;
        }
        if self.options.aes_key.is_some() {
            flags |= PACK_ENCRYPTED;
        }
        if self.options.signing_key.is_some() {
            flags |= PACK_SIGNED;
        }
        let mut header = PackHeader::new(flags);
        header.resource_count = total as u32;
        header.resource_table_offset = PACK_HEADER_SIZE as u64;
        header.string_table_offset = header.resource_table_offset + resource_table.len() as u64;
        header.data_offset = header.string_table_offset + string_table.len() as u64;
        header.total_size = header.data_offset + data.len() as u64;
        header.content_hash =
            format::content_hash(&header.to_bytes(), &resource_table, &string_table);
        let header_bytes = header.to_bytes();

        let signature = self.options.signing_key.as_ref().map(|key| {
            crypto::sign(
                key,
                &format::signed_region(&header_bytes, &resource_table, &string_table),
            )
        });

        let mut bytes = Vec::with_capacity(header.total_size as usize);
        bytes.extend_from_slice(&header_bytes);
        bytes.extend_from_slice(&resource_table);
        bytes.extend_from_slice(&string_table);
        bytes.extend_from_slice(&data);
        self.report(BuildProgress::Finished {
            bytes: bytes.len() as u64,
        });

        Ok(BuiltPack {
            bytes,
            signature,
            resource_count: total,
        })
    }

    /// 构建并写入文件；签名写入 `<path>.sig`，未签名时删除旧签名
    pub fn write_to(&self, path: &Path) -> Result<BuiltPack, VfsError> {
        let built = self.build()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| VfsError::io(parent, e))?;
        }
        std::fs::write(path, &built.bytes).map_err(|e| VfsError::io(path, e))?;
        let sig_path = signature_path(path);
        match &built.signature {
            Some(sig) => std::fs::write(&sig_path, sig).map_err(|e| VfsError::io(&sig_path, e))?,
            None if sig_path.exists() => {
                std::fs::remove_file(&sig_path).map_err(|e| VfsError::io(&sig_path, e))?
            }
            None => {}
        }
        info!(
            path = %path.display(),
            resources = built.resource_count,
            bytes = built.bytes.len(),
            signed = built.signature.is_some(),
            "资源包已写入"
        );
        Ok(built)
    }
}

fn zlib(data: &[u8]) -> Result<Vec<u8>, VfsError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| VfsError::Malformed(format!("压缩失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_layout_is_contiguous() {
        let mut builder = PackBuilder::new(PackBuildOptions::default());
        builder.add("a.txt", b"aaaa".to_vec());
        builder.add("b.png", b"bb".to_vec());
        let built = builder.build().unwrap();
        let header = PackHeader::parse(&built.bytes).unwrap();
        assert_eq!(header.resource_count, 2);
        assert_eq!(header.string_table_offset, 64 + 2 * 44);
        assert_eq!(header.total_size as usize, built.bytes.len());
        assert_eq!(&built.bytes[built.bytes.len() - 6..], b"aaaabb");
        assert!(built.signature.is_none());
    }

    #[test]
    fn test_add_replaces_same_id() {
        let mut builder = PackBuilder::new(PackBuildOptions::default());
        builder.add("./ui/a.png", b"old".to_vec());
        builder.add("ui/a.png", b"new".to_vec());
        assert_eq!(builder.len(), 1);
        assert_eq!(builder.entries[0].data, b"new");
    }

    #[test]
    fn test_incompressible_entry_is_stored_raw() {
        let options = PackBuildOptions {
            compress: true,
            ..PackBuildOptions::default()
        };
        let mut builder = PackBuilder::new(options);
        builder.add("tiny.bin", vec![1, 2, 3]);
        let built = builder.build().unwrap();
        let header = PackHeader::parse(&built.bytes).unwrap();
        assert!(!header.has_flag(PACK_COMPRESSED));
        let entry = ResourceEntry::parse(&built.bytes[64..64 + ENTRY_SIZE]).unwrap();
        assert!(!entry.is_compressed());
    }

    #[test]
    fn test_cancel_and_progress() {
        let mut builder = PackBuilder::new(PackBuildOptions::default());
        builder.add("a", vec![0; 8]);
        builder.add("b", vec![0; 8]);
        let (tx, rx) = mpsc::channel();
        builder.set_progress(tx);
        builder.build().unwrap();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], BuildProgress::Finished { bytes: 64 + 88 + 14 + 16 });

        builder.cancel_flag().store(true, Ordering::Relaxed);
        assert_eq!(builder.build().unwrap_err(), VfsError::Cancelled);
    }
}
