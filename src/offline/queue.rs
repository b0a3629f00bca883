use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Result, ScanError};
use crate::infra::metrics;
use crate::model::ScanEvent;
use super::storage::{MemoryStorage, StorageBackend};

/// 队列内容在本地存储中的固定键
pub const DEFAULT_STORAGE_KEY: &str = "smartcampost_offline_events";

/// 一次变更的持久化结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// 已落盘
    Durable,
    /// 写入失败，仅内存中有效（降级模式）
    Degraded,
}

/// 队列统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// 待同步事件数
    pub pending_events: usize,
    /// 最后一次写入是否成功落盘
    pub durable: bool,
    /// 最早的采集时间
    pub oldest_captured_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// 本地离线事件队列
///
/// 有序、只追加；内容在每次变更后整体写回存储，进程被强杀最多丢失正在进行中的那一次变更。
/// 采集路径与同步路径共享同一个实例，所有变更都是整体替换 / 追加，不做字段级原地修改。
pub struct LocalEventQueue<S: StorageBackend> {
    /// 内存中的权威副本
    events: Mutex<Vec<ScanEvent>>,
    /// 存储后端
    storage: S,
    /// 存储键
    key: String,
    /// 最后一次写入是否成功
    durable: AtomicBool,
}

impl<S: StorageBackend> LocalEventQueue<S> {
    /// 打开队列并从存储恢复内容
    ///
    /// 存储读取失败返回错误；内容损坏时记录日志并以空队列启动，
    /// 原始数据保留到下一次成功写入为止。
    pub fn open(storage: S) -> Result<Self> {
        Self::open_with_key(storage, DEFAULT_STORAGE_KEY)
    }

    pub fn open_with_key(storage: S, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let restored = match storage.load(&key)? {
            Some(raw) => match serde_json::from_slice::<Vec<ScanEvent>>(&raw) {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to decode offline events under {}: {}", key, e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if !restored.is_empty() {
            info!("Restored {} offline scan events from storage", restored.len());
        }
        metrics::record_queue_depth(restored.len());

        Ok(Self {
            events: Mutex::new(restored),
            storage,
            key,
            durable: AtomicBool::new(true),
        })
    }

    /// 追加到队尾，不做去重（重复由 clientEventId 在服务端处理）
    pub fn enqueue(&self, event: ScanEvent) -> Persistence {
        let mut events = self.events.lock();
        debug!(
            "Queueing scan event {} ({} for parcel {})",
            event.client_event_id, event.event_type, event.parcel_id
        );
        events.push(event);
        self.flush(&events)
    }

    /// 当前内容的有序快照
    pub fn snapshot(&self) -> Vec<ScanEvent> {
        self.events.lock().clone()
    }

    /// 删除指定位置的事件，剩余事件保持相对顺序；越界下标忽略
    pub fn remove_many(&self, indices: &[usize]) -> Persistence {
        let mut events = self.events.lock();
        let removed = Self::remove_indices(&mut events, indices.iter().copied().collect());
        if removed == 0 {
            return Persistence::from_flag(self.is_durable());
        }
        debug!("Removed {} events from offline queue", removed);
        self.flush(&events)
    }

    /// 删除已被服务器确认的事件（按 clientEventId 定位）
    ///
    /// 下标在锁内计算，期间追加的新事件不受影响。
    pub fn remove_acknowledged(&self, client_event_ids: &HashSet<String>) -> (usize, Persistence) {
        let mut events = self.events.lock();
        let indices: BTreeSet<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| client_event_ids.contains(&e.client_event_id))
            .map(|(i, _)| i)
            .collect();
        let removed = Self::remove_indices(&mut events, indices);
        if removed == 0 {
            return (0, Persistence::from_flag(self.is_durable()));
        }
        (removed, self.flush(&events))
    }

    /// 无条件清空（仅用户显式操作）
    pub fn clear(&self) -> Persistence {
        let mut events = self.events.lock();
        let count = events.len();
        events.clear();
        metrics::record_queue_depth(0);

        match self.storage.remove(&self.key) {
            Ok(()) => {
                info!("Cleared {} offline scan events", count);
                self.durable.store(true, Ordering::SeqCst);
                Persistence::Durable
            }
            Err(e) => {
                error!("Failed to clear offline events in storage: {}", e);
                self.durable.store(false, Ordering::SeqCst);
                Persistence::Degraded
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// 最后一次写入是否成功落盘
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    /// 获取队列统计信息
    pub fn stats(&self) -> QueueStats {
        let events = self.events.lock();
        QueueStats {
            pending_events: events.len(),
            durable: self.is_durable(),
            oldest_captured_at: events.iter().map(|e| e.captured_at).min(),
        }
    }

    /// 存储后端健康检查
    pub fn health_check(&self) -> Result<()> {
        self.storage.health_check()
    }

    fn remove_indices(events: &mut Vec<ScanEvent>, indices: BTreeSet<usize>) -> usize {
        if indices.is_empty() {
            return 0;
        }
        let before = events.len();
        let mut position = 0usize;
        events.retain(|_| {
            let keep = !indices.contains(&position);
            position += 1;
            keep
        });
        before - events.len()
    }

    /// 把整个队列写回存储（调用方持有锁）
    fn flush(&self, events: &[ScanEvent]) -> Persistence {
        metrics::record_queue_depth(events.len());

        let result = serde_json::to_vec(events)
            .map_err(ScanError::from)
            .and_then(|raw| self.storage.store(&self.key, &raw));

        match result {
            Ok(()) => {
                if !self.durable.swap(true, Ordering::SeqCst) {
                    info!("Offline queue storage recovered, queue is durable again");
                }
                Persistence::Durable
            }
            Err(e) => {
                // 内存副本仍然是本进程内的权威数据
                warn!("Failed to persist offline queue ({} events): {}", events.len(), e);
                self.durable.store(false, Ordering::SeqCst);
                metrics::record_storage_failure();
                Persistence::Degraded
            }
        }
    }
}

impl Persistence {
    fn from_flag(durable: bool) -> Self {
        if durable {
            Persistence::Durable
        } else {
            Persistence::Degraded
        }
    }
}

/// 创建内存队列（测试和 `--storage memory` 使用）
pub fn create_memory_queue() -> LocalEventQueue<MemoryStorage> {
    LocalEventQueue {
        events: Mutex::new(Vec::new()),
        storage: MemoryStorage::new(),
        key: DEFAULT_STORAGE_KEY.to_string(),
        durable: AtomicBool::new(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScanEventType;
    use std::sync::Arc;

    fn event(parcel: &str) -> ScanEvent {
        ScanEvent::new(parcel, ScanEventType::InTransit)
    }

    fn parcels(queue: &LocalEventQueue<impl StorageBackend>) -> Vec<String> {
        queue.snapshot().into_iter().map(|e| e.parcel_id).collect()
    }

    /// 写入总是失败的存储
    struct BrokenStorage;

    impl StorageBackend for BrokenStorage {
        fn load(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn store(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(ScanError::Storage("quota exceeded".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Err(ScanError::Storage("quota exceeded".to_string()))
        }
        fn health_check(&self) -> Result<()> {
            Err(ScanError::Storage("quota exceeded".to_string()))
        }
    }

    #[test]
    fn test_enqueue_preserves_order_and_duplicates() {
        let queue = create_memory_queue();
        let a = event("A");
        queue.enqueue(a.clone());
        queue.enqueue(event("B"));
        queue.enqueue(a);

        assert_eq!(parcels(&queue), vec!["A", "B", "A"]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());

        let before = {
            let queue = LocalEventQueue::open(storage.clone()).unwrap();
            for parcel in ["A", "B", "C", "D"] {
                assert_eq!(queue.enqueue(event(parcel)), Persistence::Durable);
            }
            queue.remove_many(&[1]);
            queue.snapshot()
        };

        let reopened = LocalEventQueue::open(storage).unwrap();
        assert_eq!(reopened.snapshot(), before);
        assert_eq!(parcels(&reopened), vec!["A", "C", "D"]);
    }

    #[test]
    fn test_remove_many_keeps_relative_order() {
        let queue = create_memory_queue();
        for parcel in ["A", "B", "C", "D", "E"] {
            queue.enqueue(event(parcel));
        }

        queue.remove_many(&[4, 0, 2, 2, 99]);
        assert_eq!(parcels(&queue), vec!["B", "D"]);
    }

    #[test]
    fn test_remove_acknowledged_ignores_later_appends() {
        let queue = create_memory_queue();
        let a = event("A");
        let b = event("B");
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        queue.enqueue(event("late"));

        let acked: HashSet<String> = [a.client_event_id, b.client_event_id].into_iter().collect();
        let (removed, persistence) = queue.remove_acknowledged(&acked);

        assert_eq!(removed, 2);
        assert_eq!(persistence, Persistence::Durable);
        assert_eq!(parcels(&queue), vec!["late"]);
    }

    #[test]
    fn test_clear_removes_stored_contents() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = LocalEventQueue::open(storage.clone()).unwrap();
        queue.enqueue(event("A"));
        queue.clear();

        assert!(queue.is_empty());
        assert!(storage.load(DEFAULT_STORAGE_KEY).unwrap().is_none());
        assert!(LocalEventQueue::open(storage).unwrap().is_empty());
    }

    #[test]
    fn test_storage_failure_degrades_but_keeps_events() {
        let queue = LocalEventQueue::open(BrokenStorage).unwrap();
        assert_eq!(queue.enqueue(event("A")), Persistence::Degraded);
        assert_eq!(queue.enqueue(event("B")), Persistence::Degraded);

        assert!(!queue.is_durable());
        assert_eq!(parcels(&queue), vec!["A", "B"]);
        assert!(!queue.stats().durable);
    }

    #[test]
    fn test_corrupt_contents_start_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.store(DEFAULT_STORAGE_KEY, b"{not json").unwrap();

        let queue = LocalEventQueue::open(storage.clone()).unwrap();
        assert!(queue.is_empty());
        // 原始数据保留，直到下一次成功写入
        assert!(storage.load(DEFAULT_STORAGE_KEY).unwrap().is_some());
    }
}
