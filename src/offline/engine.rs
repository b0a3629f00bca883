use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::api::ScanEventApi;
use crate::error::{Result, ScanError};
use crate::infra::metrics;
use crate::infra::ConnectivityMonitor;
use crate::model::{SyncBatch, SyncFailure, SyncResult};
use super::queue::{LocalEventQueue, Persistence};
use super::storage::StorageBackend;

/// 同步引擎配置
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// 单次同步请求超时
    pub request_timeout: Duration,
    /// 随批次上报的设备 ID
    pub device_id: Option<String>,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            device_id: None,
        }
    }
}

/// 一次已完成同步的汇总
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub batch_id: String,
    /// 提交的事件数
    pub submitted: usize,
    /// 被确认并从队列删除的事件数
    pub acknowledged: usize,
    /// 保留在队列中等待下次同步的事件数
    pub retained: usize,
    /// 服务器返回的失败明细
    pub failures: Vec<SyncFailure>,
    /// 服务器的计数是否自洽
    pub reconciled: bool,
    /// 删除后队列是否已落盘
    pub durable: bool,
    pub completed_at: DateTime<Utc>,
}

/// `sync_now` 的结果
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// 队列为空，没有发起请求
    NothingToSync,
    /// 离线，没有发起请求
    Offline,
    /// 已有同步在进行中
    AlreadySyncing,
    /// 服务器返回了结果，队列已按结果协调
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// 根据服务器结果算出的删除计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// 可以删除的 clientEventId
    pub acknowledged: HashSet<String>,
    /// 批次中需要保留的下标（升序）
    pub retained_indices: Vec<usize>,
    /// 计数是否自洽；不自洽时整批保留
    pub consistent: bool,
}

/// 由提交的批次和服务器结果计算哪些事件已被确认
///
/// 规则（从严到宽）：
/// 1. 服务器给出了 `syncedEvents` 时，只删除其中列出且属于本批次的事件；
/// 2. 否则计数自洽（`totalEvents` 等于批次大小，且成功数加去重后的失败下标数等于总数）时，
///    删除所有不在失败下标中的事件；
/// 3. 否则整批保留。
///
/// 越界的失败下标忽略，重复下标只算一次。失败事件的 clientEventId 永远不会被删除。
pub fn plan_reconciliation(batch: &SyncBatch, result: &SyncResult) -> ReconciliationPlan {
    let len = batch.len();

    let mut failed: BTreeSet<usize> = result
        .failures
        .iter()
        .map(|f| f.event_index)
        .filter(|idx| *idx < len)
        .collect();

    // 按 localId 报告的失败同样保留
    if !result.failed_events.is_empty() {
        let failed_ids: HashSet<&str> = result.failed_events.iter().map(|f| f.local_id.as_str()).collect();
        failed.extend(
            batch
                .events
                .iter()
                .enumerate()
                .filter(|(_, e)| failed_ids.contains(e.client_event_id.as_str()))
                .map(|(i, _)| i),
        );
    }

    let candidates: BTreeSet<usize> = if !result.synced_events.is_empty() {
        let synced: HashSet<&str> = result.synced_events.iter().map(|s| s.local_id.as_str()).collect();
        batch
            .events
            .iter()
            .enumerate()
            .filter(|(i, e)| !failed.contains(i) && synced.contains(e.client_event_id.as_str()))
            .map(|(i, _)| i)
            .collect()
    } else if result.total_events == len && result.success_count + failed.len() == len {
        (0..len).filter(|i| !failed.contains(i)).collect()
    } else {
        return ReconciliationPlan {
            acknowledged: HashSet::new(),
            retained_indices: (0..len).collect(),
            consistent: false,
        };
    };

    // 同一个 clientEventId 只要有一次失败就不删除
    let failed_ids: HashSet<&str> = failed
        .iter()
        .map(|i| batch.events[*i].client_event_id.as_str())
        .collect();

    let acknowledged: HashSet<String> = candidates
        .iter()
        .map(|i| &batch.events[*i].client_event_id)
        .filter(|id| !failed_ids.contains(id.as_str()))
        .cloned()
        .collect();

    let retained_indices = (0..len)
        .filter(|i| !acknowledged.contains(&batch.events[*i].client_event_id))
        .collect();

    ReconciliationPlan {
        acknowledged,
        retained_indices,
        consistent: true,
    }
}

/// 同步中标记，离开作用域时自动清除并唤醒等待者
struct SyncingGuard<'a> {
    flag: &'a AtomicBool,
    idle: &'a Notify,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

/// 离线事件同步引擎
///
/// 同一时刻最多一次同步。提交的是队列快照，删除按 clientEventId 定位，
/// 同步期间新采集的事件不会被误删。请求没有拿到结果时队列保持不变。
pub struct SyncEngine<S: StorageBackend> {
    queue: Arc<LocalEventQueue<S>>,
    api: Arc<dyn ScanEventApi>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SyncEngineConfig,
    syncing: AtomicBool,
    idle: Notify,
    last_report: Mutex<Option<SyncReport>>,
    last_error: Mutex<Option<ScanError>>,
}

impl<S: StorageBackend> SyncEngine<S> {
    pub fn new(
        queue: Arc<LocalEventQueue<S>>,
        api: Arc<dyn ScanEventApi>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            queue,
            api,
            connectivity,
            config,
            syncing: AtomicBool::new(false),
            idle: Notify::new(),
            last_report: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// 立即同步一次
    ///
    /// 队列为空、离线或已在同步时直接返回，不发请求。
    /// 网络错误、超时、非 2xx 返回 `Err`，队列不变。
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        if self.queue.is_empty() {
            return Ok(SyncOutcome::NothingToSync);
        }

        if !self.connectivity.is_online() {
            debug!("Skipping sync: offline");
            return Ok(SyncOutcome::Offline);
        }

        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Skipping sync: another sync is in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        }
        let _guard = SyncingGuard {
            flag: &self.syncing,
            idle: &self.idle,
        };

        // 等锁期间可能已被其他同步清空
        let snapshot = self.queue.snapshot();
        if snapshot.is_empty() {
            return Ok(SyncOutcome::NothingToSync);
        }

        let batch = SyncBatch::new(snapshot, self.config.device_id.clone());
        info!("Syncing {} offline scan events (batch {})", batch.len(), batch.batch_id);

        let response = match tokio::time::timeout(self.config.request_timeout, self.api.sync_offline(&batch)).await {
            Ok(response) => response,
            Err(elapsed) => Err(ScanError::from(elapsed)),
        };

        let result = match response {
            Ok(result) => result,
            Err(e) => {
                warn!("Sync of batch {} failed, queue kept intact: {}", batch.batch_id, e);
                metrics::record_sync_error(e.is_retryable());
                *self.last_error.lock() = Some(e.clone());
                return Err(e);
            }
        };

        let report = self.reconcile(&batch, result);
        *self.last_error.lock() = None;
        *self.last_report.lock() = Some(report.clone());
        Ok(SyncOutcome::Completed(report))
    }

    fn reconcile(&self, batch: &SyncBatch, result: SyncResult) -> SyncReport {
        let plan = plan_reconciliation(batch, &result);

        if !plan.consistent {
            warn!(
                "Sync result for batch {} is inconsistent (total={}, success={}, failures={}, submitted={}); keeping all events",
                batch.batch_id,
                result.total_events,
                result.success_count,
                result.failures.len(),
                batch.len()
            );
        }

        let (removed, persistence) = self.queue.remove_acknowledged(&plan.acknowledged);
        let retained = plan.retained_indices.len();

        for failure in &result.failures {
            debug!(
                "Event {} of batch {} rejected: {}",
                failure.event_index, batch.batch_id, failure.reason
            );
        }

        info!(
            "Sync of batch {} finished: {} acknowledged, {} retained",
            batch.batch_id, removed, retained
        );
        metrics::record_sync_batch(removed, retained);

        SyncReport {
            batch_id: batch.batch_id.clone(),
            submitted: batch.len(),
            acknowledged: removed,
            retained,
            failures: result.failures,
            reconciled: plan.consistent,
            durable: persistence == Persistence::Durable,
            completed_at: Utc::now(),
        }
    }

    /// 是否正在同步
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// 等待正在进行的同步结束；没有同步时立即返回
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // 先登记再检查标记，避免错过检查与等待之间的唤醒
            notified.as_mut().enable();
            if !self.is_syncing() {
                return;
            }
            notified.await;
        }
    }

    /// 待同步事件数
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// 最近一次完成的同步
    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().clone()
    }

    /// 最近一次同步错误（成功后清除）
    pub fn last_error(&self) -> Option<ScanError> {
        self.last_error.lock().clone()
    }

    pub fn queue(&self) -> &Arc<LocalEventQueue<S>> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApi;
    use crate::model::{ScanEvent, ScanEventType, SyncedEvent};
    use crate::offline::storage::MemoryStorage;
    use crate::offline::queue::create_memory_queue;

    fn event(parcel: &str) -> ScanEvent {
        ScanEvent::new(parcel, ScanEventType::ArrivedHub)
    }

    fn parcels<S: StorageBackend>(queue: &LocalEventQueue<S>) -> Vec<String> {
        queue.snapshot().into_iter().map(|e| e.parcel_id).collect()
    }

    fn setup(online: bool) -> (Arc<LocalEventQueue<MemoryStorage>>, Arc<MockApi>, SyncEngine<MemoryStorage>) {
        let queue = Arc::new(create_memory_queue());
        let api = Arc::new(MockApi::new());
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let engine = SyncEngine::new(queue.clone(), api.clone(), monitor, SyncEngineConfig::default());
        (queue, api, engine)
    }

    #[tokio::test]
    async fn test_failed_index_is_retained() {
        let (queue, api, engine) = setup(true);
        for parcel in ["A", "B", "C"] {
            queue.enqueue(event(parcel));
        }
        api.push_sync_response(Ok(SyncResult::new(3, 2, vec![SyncFailure::new(1, "parcel locked")])));

        let outcome = engine.sync_now().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.retained, 1);
        assert!(report.reconciled);
        assert_eq!(parcels(&queue), vec!["B"]);
    }

    #[tokio::test]
    async fn test_all_success_empties_queue() {
        let (queue, api, engine) = setup(true);
        queue.enqueue(event("A"));
        queue.enqueue(event("B"));

        let outcome = engine.sync_now().await.unwrap();
        assert_eq!(outcome.report().unwrap().acknowledged, 2);
        assert!(queue.is_empty());
        assert_eq!(api.sync_calls(), 1);
        assert!(engine.last_report().is_some());
    }

    #[tokio::test]
    async fn test_empty_queue_makes_no_request() {
        let (_queue, api, engine) = setup(true);
        assert!(matches!(engine.sync_now().await.unwrap(), SyncOutcome::NothingToSync));
        assert_eq!(api.sync_calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_makes_no_request() {
        let (queue, api, engine) = setup(false);
        queue.enqueue(event("A"));

        assert!(matches!(engine.sync_now().await.unwrap(), SyncOutcome::Offline));
        assert_eq!(api.sync_calls(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_queue() {
        let (queue, api, engine) = setup(true);
        queue.enqueue(event("A"));
        queue.enqueue(event("B"));
        let before = queue.snapshot();

        api.push_sync_response(Err(ScanError::Http {
            status: 503,
            body: "maintenance".to_string(),
        }));

        let err = engine.sync_now().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(queue.snapshot(), before);
        assert!(engine.last_error().is_some());
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_timeout_keeps_queue() {
        let queue = Arc::new(create_memory_queue());
        let api = Arc::new(MockApi::new());
        api.set_sync_delay(Duration::from_millis(200));
        let engine = SyncEngine::new(
            queue.clone(),
            api.clone(),
            Arc::new(ConnectivityMonitor::new(true)),
            SyncEngineConfig {
                request_timeout: Duration::from_millis(20),
                device_id: None,
            },
        );
        queue.enqueue(event("A"));

        let err = engine.sync_now().await.unwrap_err();
        assert!(matches!(err, ScanError::Timeout(_)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_sync_is_suppressed() {
        let (queue, api, engine) = setup(true);
        api.set_sync_delay(Duration::from_millis(100));
        queue.enqueue(event("A"));

        let (first, second) = tokio::join!(engine.sync_now(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.sync_now().await
        });

        assert!(matches!(first.unwrap(), SyncOutcome::Completed(_)));
        assert!(matches!(second.unwrap(), SyncOutcome::AlreadySyncing));
        assert_eq!(api.sync_calls(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_events_captured_during_sync_survive() {
        let (queue, api, engine) = setup(true);
        api.set_sync_delay(Duration::from_millis(50));
        queue.enqueue(event("A"));

        let (outcome, _) = tokio::join!(engine.sync_now(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.enqueue(event("late"));
        });

        assert_eq!(outcome.unwrap().report().unwrap().acknowledged, 1);
        assert_eq!(parcels(&queue), vec!["late"]);
    }

    #[test]
    fn test_inconsistent_counts_keep_everything() {
        let batch = SyncBatch::new(vec![event("A"), event("B")], None);
        // 总数与批次不符
        let plan = plan_reconciliation(&batch, &SyncResult::new(5, 5, Vec::new()));
        assert!(!plan.consistent);
        assert!(plan.acknowledged.is_empty());
        assert_eq!(plan.retained_indices, vec![0, 1]);

        // 成功数 + 失败数不等于总数
        let plan = plan_reconciliation(&batch, &SyncResult::new(2, 1, Vec::new()));
        assert!(!plan.consistent);
    }

    #[test]
    fn test_out_of_range_and_duplicate_failures() {
        let batch = SyncBatch::new(vec![event("A"), event("B"), event("C")], None);
        let failures = vec![
            SyncFailure::new(2, "x"),
            SyncFailure::new(2, "x again"),
            SyncFailure::new(7, "out of range"),
        ];
        let plan = plan_reconciliation(&batch, &SyncResult::new(3, 2, failures));
        assert!(plan.consistent);
        assert_eq!(plan.retained_indices, vec![2]);
        assert_eq!(plan.acknowledged.len(), 2);
    }

    #[test]
    fn test_synced_events_take_precedence() {
        let a = event("A");
        let b = event("B");
        let batch = SyncBatch::new(vec![a.clone(), b.clone()], None);

        let mut result = SyncResult::new(2, 2, Vec::new());
        result.synced_events = vec![SyncedEvent {
            local_id: a.client_event_id.clone(),
            server_id: Some("srv-1".to_string()),
            server_timestamp: None,
        }];

        let plan = plan_reconciliation(&batch, &result);
        assert!(plan.acknowledged.contains(&a.client_event_id));
        assert!(!plan.acknowledged.contains(&b.client_event_id));
        assert_eq!(plan.retained_indices, vec![1]);
    }

    #[test]
    fn test_duplicate_event_with_one_failure_is_kept() {
        let a = event("A");
        let batch = SyncBatch::new(vec![a.clone(), a.clone()], None);
        let plan = plan_reconciliation(&batch, &SyncResult::new(2, 1, vec![SyncFailure::new(1, "dup")]));
        assert!(plan.acknowledged.is_empty());
        assert_eq!(plan.retained_indices, vec![0, 1]);
    }
}
