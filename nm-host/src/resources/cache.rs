//! # Cache 模块
//!
//! 按字节预算驱逐的 LRU 缓存，供资源缓存与 VFS 读缓存共用。

use std::collections::{HashMap, VecDeque};

use tracing::warn;

/// 默认预算：256 MB
pub const DEFAULT_CACHE_BUDGET_MB: usize = 256;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    size_bytes: usize,
    /// 引用计数（pin 状态）
    pin_count: u32,
}

impl<V> CacheEntry<V> {
    fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// LRU 缓存
///
/// - 插入时驱逐到预算以内
/// - 被 pin 的条目不会被驱逐
/// - 单个条目超过预算时不缓存
#[derive(Debug)]
pub struct LruCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// 最近使用的在后面
    lru_order: VecDeque<String>,
    budget_bytes: usize,
    used_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Clone> LruCache<V> {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru_order: VecDeque::new(),
            budget_bytes,
            used_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn with_budget_mb(budget_mb: usize) -> Self {
        Self::new(budget_mb * 1024 * 1024)
    }

    /// 获取（命中时更新 LRU）
    pub fn get(&mut self, key: &str) -> Option<V> {
        let value = self.entries.get(key).map(|e| e.value.clone());
        match value {
            Some(value) => {
                self.hits += 1;
                self.touch(key);
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// 只读获取，不更新 LRU 与统计
    pub fn peek(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 插入；返回是否真正缓存
    pub fn insert(&mut self, key: String, value: V, size_bytes: usize) -> bool {
        self.remove(&key);
        if size_bytes > self.budget_bytes {
            return false;
        }

        while self.used_bytes + size_bytes > self.budget_bytes {
            if !self.evict_one() {
                warn!(
                    used_mb = self.used_bytes as f64 / 1024.0 / 1024.0,
                    budget_mb = self.budget_bytes as f64 / 1024.0 / 1024.0,
                    "缓存超出预算，但剩余条目全部被 pin，强制插入"
                );
                break;
            }
        }

        self.used_bytes += size_bytes;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                size_bytes,
                pin_count: 0,
            },
        );
        self.lru_order.push_back(key);
        true
    }

    pub fn pin(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.pin_count += 1;
        }
    }

    pub fn unpin(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }

    /// 帧结束时调用
    pub fn unpin_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.pin_count = 0;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
        self.remove_from_lru(key);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru_order.clear();
        self.used_bytes = 0;
    }

    /// 调整预算，必要时立即驱逐
    pub fn set_budget(&mut self, budget_bytes: usize) {
        self.budget_bytes = budget_bytes;
        while self.used_bytes > self.budget_bytes && self.evict_one() {}
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            used_bytes: self.used_bytes,
            budget_bytes: self.budget_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate: if self.hits + self.misses > 0 {
                self.hits as f64 / (self.hits + self.misses) as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    fn touch(&mut self, key: &str) {
        self.remove_from_lru(key);
        self.lru_order.push_back(key.to_string());
    }

    fn remove_from_lru(&mut self, key: &str) {
        self.lru_order.retain(|k| k != key);
    }

    /// 驱逐最久未用且未 pin 的条目
    fn evict_one(&mut self) -> bool {
        let key_to_evict = self
            .lru_order
            .iter()
            .find(|k| self.entries.get(*k).is_some_and(|e| !e.is_pinned()))
            .cloned();

        if let Some(key) = key_to_evict
            && let Some(entry) = self.entries.remove(&key)
        {
            self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
            self.remove_from_lru(&key);
            self.evictions += 1;
            return true;
        }
        false
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction_respects_budget() {
        let mut cache = LruCache::new(10);
        cache.insert("a".into(), 1, 4);
        cache.insert("b".into(), 2, 4);
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c".into(), 3, 4);

        assert!(!cache.contains("b"));
        assert!(cache.contains("a") && cache.contains("c"));
        assert_eq!(cache.used_bytes(), 8);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_pinned_entries_survive() {
        let mut cache = LruCache::new(8);
        cache.insert("a".into(), 1, 4);
        cache.insert("b".into(), 2, 4);
        cache.pin("a");
        cache.insert("c".into(), 3, 4);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));

        cache.unpin_all();
        cache.insert("d".into(), 4, 4);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_oversized_entry_is_not_cached() {
        let mut cache = LruCache::new(4);
        assert!(!cache.insert("big".into(), 0u8, 5));
        assert!(cache.is_empty());
        assert_eq!(cache.get("big"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_reinsert_replaces_size() {
        let mut cache = LruCache::new(100);
        cache.insert("a".into(), "x", 30);
        cache.insert("a".into(), "y", 10);
        assert_eq!(cache.used_bytes(), 10);
        assert_eq!(cache.peek("a"), Some("y"));
        cache.set_budget(5);
        assert!(cache.is_empty());
    }
}
