//! 带字节 LRU 的 VFS 读缓存
//!
//! 缓存记录 VFS 的索引代数；代数变化（挂载、卸载、启用、排序）时整体清空，
//! 保证不会返回已被覆盖或已卸载资源的旧内容。

use std::sync::{Arc, Mutex, PoisonError};

use super::{VfsError, VirtualFileSystem, normalize_resource_id};
use crate::resources::cache::{CacheStats, LruCache};

struct CacheState {
    generation: u64,
    lru: LruCache<Arc<[u8]>>,
}

pub struct CachedVfs {
    vfs: Arc<VirtualFileSystem>,
    state: Mutex<CacheState>,
}

impl CachedVfs {
    pub fn new(vfs: Arc<VirtualFileSystem>, budget_bytes: usize) -> Self {
        let generation = vfs.generation();
        Self {
            vfs,
            state: Mutex::new(CacheState {
                generation,
                lru: LruCache::new(budget_bytes),
            }),
        }
    }

    pub fn vfs(&self) -> &Arc<VirtualFileSystem> {
        &self.vfs
    }

    /// 读取资源；命中时返回缓存内容的副本
    pub fn read(&self, resource_id: &str) -> Result<Vec<u8>, VfsError> {
        self.read_shared(resource_id).map(|data| data.to_vec())
    }

    /// 读取资源，返回共享缓冲区
    pub fn read_shared(&self, resource_id: &str) -> Result<Arc<[u8]>, VfsError> {
        let id = normalize_resource_id(resource_id);
        {
            let mut state = self.lock_current();
            if let Some(data) = state.lru.get(&id) {
                return Ok(data);
            }
        }

        let generation = self.vfs.generation();
        let data: Arc<[u8]> = self.vfs.read(&id)?.into();
        let mut state = self.lock_current();
        // 读取期间索引变化则不回填
        if state.generation == generation {
            state.lru.insert(id, Arc::clone(&data), data.len());
        }
        Ok(data)
    }

    pub fn invalidate(&self, resource_id: &str) {
        self.lock_current()
            .lru
            .remove(&normalize_resource_id(resource_id));
    }

    pub fn clear(&self) {
        self.lock_current().lru.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.lock_current().lru.stats()
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, CacheState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.vfs.generation();
        if state.generation != generation {
            state.lru.clear();
            state.generation = generation;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::builder::{PackBuildOptions, PackBuilder};
    use crate::vfs::manifest::PackManifest;
    use crate::vfs::registry::PackType;

    fn write_pack(dir: &std::path::Path, id: &str, data: &[u8]) -> std::path::PathBuf {
        let mut builder = PackBuilder::new(PackBuildOptions {
            manifest: Some(PackManifest::new(id)),
            ..PackBuildOptions::default()
        });
        builder.add("a.txt", data.to_vec());
        let path = dir.join(format!("{}.nmpack", id));
        builder.write_to(&path).unwrap();
        path
    }

    #[test]
    fn test_hit_and_invalidation_on_mount() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Arc::new(VirtualFileSystem::default());
        vfs.mount(write_pack(dir.path(), "base", b"base"), PackType::Base, 0)
            .unwrap();
        let cached = CachedVfs::new(Arc::clone(&vfs), 1024);

        assert_eq!(cached.read("a.txt").unwrap(), b"base");
        assert_eq!(cached.read("a.txt").unwrap(), b"base");
        assert_eq!(cached.stats().hits, 1);

        vfs.mount(write_pack(dir.path(), "patch", b"patch"), PackType::Patch, 0)
            .unwrap();
        assert_eq!(cached.read("a.txt").unwrap(), b"patch");

        vfs.unmount("patch").unwrap();
        assert_eq!(cached.read("a.txt").unwrap(), b"base");
        assert!(cached.read("missing").is_err());
    }
}
