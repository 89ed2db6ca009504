//! 后台资源预加载
//!
//! 工作线程从 VFS 读取并解码，结果通过 mpsc 队列交回主线程；
//! 主线程调用 [`ResourcePreloader::poll`] 时才写入缓存，回调不会在工作线程上执行。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::{CachedResource, ResourceCache, ResourceError, ResourceKind, decode};
use crate::vfs::VirtualFileSystem;

struct PreloadRequest {
    id: String,
    kind: ResourceKind,
}

/// 单个预加载的结果
#[derive(Debug)]
pub struct PreloadOutcome {
    pub id: String,
    pub kind: ResourceKind,
    pub result: Result<(), ResourceError>,
}

pub struct ResourcePreloader {
    sender: Option<Sender<PreloadRequest>>,
    receiver: Receiver<(String, ResourceKind, Result<CachedResource, ResourceError>)>,
    cancel: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl ResourcePreloader {
    pub fn new(vfs: Arc<VirtualFileSystem>) -> Self {
        let (sender, request_rx) = mpsc::channel::<PreloadRequest>();
        let (result_tx, receiver) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name("nm-preloader".to_string())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    let result = if worker_cancel.load(Ordering::Relaxed) {
                        Err(ResourceError::Cancelled {
                            path: request.id.clone(),
                        })
                    } else {
                        vfs.read(&request.id)
                            .map_err(ResourceError::from)
                            .and_then(|bytes| decode(&request.id, request.kind, bytes))
                    };
                    if result_tx.send((request.id, request.kind, result)).is_err() {
                        break;
                    }
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "无法启动预加载线程，预加载请求将被忽略");
                None
            }
        };

        Self {
            sender: Some(sender),
            receiver,
            cancel,
            pending,
            handle,
        }
    }

    /// 排队预加载
    pub fn enqueue(&self, id: &str, kind: ResourceKind) {
        let Some(sender) = &self.sender else { return };
        if self.handle.is_none() {
            return;
        }
        let request = PreloadRequest {
            id: id.to_string(),
            kind,
        };
        if sender.send(request).is_ok() {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// 取消尚未开始的请求；已排队的请求以 `Cancelled` 结束
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// 恢复接受新的请求
    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }

    pub fn is_loading(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// 在主线程上取回已完成的结果，成功者写入缓存
    pub fn poll(&self, cache: &ResourceCache) -> Vec<PreloadOutcome> {
        let mut outcomes = Vec::new();
        while let Ok((id, kind, result)) = self.receiver.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            let result = result.map(|resource| {
                debug!(resource = %id, kind = kind.name(), "预加载完成");
                cache.insert(&id, resource);
            });
            outcomes.push(PreloadOutcome { id, kind, result });
        }
        outcomes
    }

    /// 阻塞直到所有已排队的请求完成
    pub fn wait(&self, cache: &ResourceCache) -> Vec<PreloadOutcome> {
        let mut outcomes = Vec::new();
        while self.is_loading() {
            match self.receiver.recv() {
                Ok((id, kind, result)) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    let result = result.map(|resource| cache.insert(&id, resource));
                    outcomes.push(PreloadOutcome { id, kind, result });
                }
                Err(_) => break,
            }
        }
        outcomes.extend(self.poll(cache));
        outcomes
    }
}

impl Drop for ResourcePreloader {
    fn drop(&mut self) {
        self.cancel();
        self.sender.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("预加载线程异常退出");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tests::mounted_vfs;

    #[test]
    fn test_results_arrive_on_poll() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted_vfs(dir.path());
        let cache = ResourceCache::new(Arc::clone(&vfs), 16);
        let preloader = ResourcePreloader::new(vfs);

        preloader.enqueue("bg/room.png", ResourceKind::Texture);
        preloader.enqueue("missing.png", ResourceKind::Texture);
        let outcomes = preloader.wait(&cache);

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.id == "bg/room.png" && o.result.is_ok()));
        assert!(outcomes.iter().any(|o| o.id == "missing.png" && o.result.is_err()));
        assert!(cache.contains("bg/room.png", ResourceKind::Texture));
        assert!(!preloader.is_loading());
    }

    #[test]
    fn test_cancelled_requests() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted_vfs(dir.path());
        let cache = ResourceCache::new(Arc::clone(&vfs), 16);
        let preloader = ResourcePreloader::new(vfs);
        preloader.cancel();
        preloader.enqueue("bg/room.png", ResourceKind::Texture);
        let outcomes = preloader.wait(&cache);
        assert!(matches!(outcomes[0].result, Err(ResourceError::Cancelled { .. })));
        assert!(!cache.contains("bg/room.png", ResourceKind::Texture));
    }
}
