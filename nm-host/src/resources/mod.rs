//! # Resources 模块
//!
//! 解码后资源的缓存：纹理、字体、字体图集与原始字节。
//!
//! ## 设计原则
//!
//! - 数据统一从 VFS 读取，缓存不感知资源包
//! - 缓存内的资源以 `Arc` 共享；驱逐只释放缓存自己的引用
//! - map 与字节计数由同一把互斥锁保护，插入时驱逐到预算以内
//! - VFS 索引代数变化时整体清空

pub mod cache;
mod error;
mod preloader;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vfs::VirtualFileSystem;
pub use cache::{CacheStats, LruCache};
pub use error::ResourceError;
pub use preloader::{PreloadOutcome, ResourcePreloader};

/// RGBA8 纹理
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Texture {
    pub fn size_bytes(&self) -> usize {
        self.rgba.len()
    }
}

/// 字体文件的原始数据（TTF/OTF），由渲染后端解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontFace {
    pub id: String,
    pub data: Vec<u8>,
}

/// 字体图集中的单个字形
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Glyph {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub offset_x: f32,
    #[serde(default)]
    pub offset_y: f32,
    pub advance: f32,
}

/// 字体图集描述（JSON）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontAtlas {
    /// 图集纹理的资源 id
    pub texture: String,
    pub size: f32,
    pub line_height: f32,
    /// 字符 → 字形
    pub glyphs: HashMap<char, Glyph>,
}

/// 资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    FontFace,
    FontAtlas,
    Raw,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Texture => "texture",
            Self::FontFace => "font",
            Self::FontAtlas => "font_atlas",
            Self::Raw => "raw",
        }
    }
}

/// 缓存中的资源
#[derive(Debug, Clone)]
pub enum CachedResource {
    Texture(Arc<Texture>),
    FontFace(Arc<FontFace>),
    FontAtlas(Arc<FontAtlas>),
    Raw(Arc<[u8]>),
}

impl CachedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Texture(_) => ResourceKind::Texture,
            Self::FontFace(_) => ResourceKind::FontFace,
            Self::FontAtlas(_) => ResourceKind::FontAtlas,
            Self::Raw(_) => ResourceKind::Raw,
        }
    }

    /// 估算的内存占用
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Texture(t) => t.size_bytes(),
            Self::FontFace(f) => f.data.len(),
            Self::FontAtlas(a) => a.glyphs.len() * std::mem::size_of::<Glyph>() + 64,
            Self::Raw(bytes) => bytes.len(),
        }
    }
}

/// 按种类解码
pub fn decode(
    id: &str,
    kind: ResourceKind,
    bytes: Vec<u8>,
) -> Result<CachedResource, ResourceError> {
    Ok(match kind {
        ResourceKind::Texture => CachedResource::Texture(Arc::new(decode_texture(id, &bytes)?)),
        ResourceKind::FontFace => CachedResource::FontFace(Arc::new(FontFace {
            id: id.to_string(),
            data: bytes,
        })),
        ResourceKind::FontAtlas => {
            let atlas: FontAtlas = serde_json::from_slice(&bytes).map_err(|e| {
                ResourceError::InvalidFormat {
                    path: id.to_string(),
                    message: e.to_string(),
                }
            })?;
            CachedResource::FontAtlas(Arc::new(atlas))
        }
        ResourceKind::Raw => CachedResource::Raw(bytes.into()),
    })
}

/// 使用 image crate 解码为 RGBA8
pub fn decode_texture(id: &str, bytes: &[u8]) -> Result<Texture, ResourceError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ResourceError::load_failed(id, "texture", e))?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(Texture {
        width,
        height,
        rgba: rgba.into_raw(),
    })
}

struct CacheState {
    generation: u64,
    lru: LruCache<CachedResource>,
}

/// 解码资源缓存
pub struct ResourceCache {
    vfs: Arc<VirtualFileSystem>,
    state: Mutex<CacheState>,
}

impl ResourceCache {
    pub fn new(vfs: Arc<VirtualFileSystem>, budget_mb: usize) -> Self {
        let generation = vfs.generation();
        Self {
            vfs,
            state: Mutex::new(CacheState {
                generation,
                lru: LruCache::with_budget_mb(budget_mb),
            }),
        }
    }

    pub fn vfs(&self) -> &Arc<VirtualFileSystem> {
        &self.vfs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.vfs.generation();
        if state.generation != generation {
            state.lru.clear();
            state.generation = generation;
        }
        state
    }

    fn key(id: &str, kind: ResourceKind) -> String {
        format!("{}:{}", kind.name(), crate::vfs::normalize_resource_id(id))
    }

    /// 获取资源，未命中时从 VFS 读取并解码
    pub fn load(&self, id: &str, kind: ResourceKind) -> Result<CachedResource, ResourceError> {
        let key = Self::key(id, kind);
        if let Some(hit) = self.lock().lru.get(&key) {
            return Ok(hit);
        }
        let bytes = self.vfs.read(id)?;
        let resource = decode(id, kind, bytes)?;
        self.insert(id, resource.clone());
        Ok(resource)
    }

    /// 放入已解码的资源（预加载线程的结果）
    pub fn insert(&self, id: &str, resource: CachedResource) {
        let key = Self::key(id, resource.kind());
        let size = resource.size_bytes();
        if !self.lock().lru.insert(key, resource, size) {
            debug!(resource = id, size, "资源超过缓存预算，不缓存");
        }
    }

    pub fn texture(&self, id: &str) -> Result<Arc<Texture>, ResourceError> {
        match self.load(id, ResourceKind::Texture)? {
            CachedResource::Texture(t) => Ok(t),
            other => Err(mismatch(id, other.kind())),
        }
    }

    pub fn font_face(&self, id: &str) -> Result<Arc<FontFace>, ResourceError> {
        match self.load(id, ResourceKind::FontFace)? {
            CachedResource::FontFace(f) => Ok(f),
            other => Err(mismatch(id, other.kind())),
        }
    }

    pub fn font_atlas(&self, id: &str) -> Result<Arc<FontAtlas>, ResourceError> {
        match self.load(id, ResourceKind::FontAtlas)? {
            CachedResource::FontAtlas(a) => Ok(a),
            other => Err(mismatch(id, other.kind())),
        }
    }

    pub fn raw(&self, id: &str) -> Result<Arc<[u8]>, ResourceError> {
        match self.load(id, ResourceKind::Raw)? {
            CachedResource::Raw(bytes) => Ok(bytes),
            other => Err(mismatch(id, other.kind())),
        }
    }

    pub fn contains(&self, id: &str, kind: ResourceKind) -> bool {
        self.lock().lru.contains(&Self::key(id, kind))
    }

    /// Pin 资源（当前帧正在使用）
    pub fn pin(&self, id: &str, kind: ResourceKind) {
        self.lock().lru.pin(&Self::key(id, kind));
    }

    pub fn unpin(&self, id: &str, kind: ResourceKind) {
        self.lock().lru.unpin(&Self::key(id, kind));
    }

    pub fn unpin_all(&self) {
        self.lock().lru.unpin_all();
    }

    pub fn evict(&self, id: &str, kind: ResourceKind) {
        self.lock().lru.remove(&Self::key(id, kind));
    }

    pub fn clear(&self) {
        self.lock().lru.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().lru.stats()
    }
}

fn mismatch(id: &str, kind: ResourceKind) -> ResourceError {
    ResourceError::InvalidFormat {
        path: id.to_string(),
        message: format!("缓存条目类型为 {}", kind.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{PackBuildOptions, PackBuilder, PackManifest, PackType};

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    pub(crate) fn mounted_vfs(dir: &std::path::Path) -> Arc<VirtualFileSystem> {
        let mut builder = PackBuilder::new(PackBuildOptions {
            manifest: Some(PackManifest::new("base")),
            ..PackBuildOptions::default()
        });
        builder.add("bg/room.png", png_bytes(4, 2));
        builder.add(
            "fonts/main.atlas.json",
            br#"{"texture":"fonts/main.png","size":16,"line_height":20,
                "glyphs":{"A":{"x":0,"y":0,"width":8,"height":12,"advance":9}}}"#
                .to_vec(),
        );
        builder.add("data/blob.bin", vec![7; 32]);
        builder.add("bad.png", b"not a png".to_vec());
        let path = dir.join("base.nmpack");
        builder.write_to(&path).unwrap();
        let vfs = Arc::new(VirtualFileSystem::default());
        vfs.mount(&path, PackType::Base, 0).unwrap();
        vfs
    }

    #[test]
    fn test_texture_decode_and_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(mounted_vfs(dir.path()), 16);
        let tex = cache.texture("bg/room.png").unwrap();
        assert_eq!((tex.width, tex.height), (4, 2));
        assert_eq!(tex.rgba.len(), 32);
        assert_eq!(&tex.rgba[..4], &[10, 20, 30, 255]);

        let again = cache.texture("bg/room.png").unwrap();
        assert!(Arc::ptr_eq(&tex, &again));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_font_atlas_and_raw() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(mounted_vfs(dir.path()), 16);
        let atlas = cache.font_atlas("fonts/main.atlas.json").unwrap();
        assert_eq!(atlas.glyphs[&'A'].advance, 9.0);
        assert_eq!(cache.raw("data/blob.bin").unwrap().len(), 32);
        assert!(cache.contains("data/blob.bin", ResourceKind::Raw));
    }

    #[test]
    fn test_decode_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(mounted_vfs(dir.path()), 16);
        let err = cache.texture("bad.png").unwrap_err();
        assert_eq!(err.kind(), nm_runtime::ErrorKind::InvalidFormat);
        let err = cache.texture("missing.png").unwrap_err();
        assert_eq!(err.kind(), nm_runtime::ErrorKind::NotFound);
    }

    #[test]
    fn test_eviction_keeps_outstanding_handles() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(mounted_vfs(dir.path()), 16);
        let tex = cache.texture("bg/room.png").unwrap();
        cache.evict("bg/room.png", ResourceKind::Texture);
        assert!(!cache.contains("bg/room.png", ResourceKind::Texture));
        assert_eq!(tex.width, 4);
    }
}
