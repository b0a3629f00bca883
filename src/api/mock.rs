use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::model::{
    LiveScanEvent, ScanEvent, SyncBatch, SyncResult, VerificationResult, VerificationStatus,
};
use super::api_trait::{QrVerificationApi, ScanEventApi};

/// Mock API（用于测试和演示）
///
/// 不调用真实服务，按预设脚本返回结果并记录每次调用。
/// 没有预设时：同步全部成功，上报成功，校验返回 VALID。
#[derive(Default)]
pub struct MockApi {
    sync_script: Mutex<VecDeque<Result<SyncResult>>>,
    sync_delay: Mutex<Option<Duration>>,
    submitted: Mutex<Vec<SyncBatch>>,
    sync_calls: AtomicUsize,

    record_script: Mutex<VecDeque<Result<()>>>,
    recorded: Mutex<Vec<ScanEvent>>,

    verify_by_content: Mutex<HashMap<String, Result<VerificationResult>>>,
    verify_default: Mutex<Option<Result<VerificationResult>>>,
    verify_calls: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预设下一次同步的返回
    pub fn push_sync_response(&self, response: Result<SyncResult>) {
        self.sync_script.lock().push_back(response);
    }

    /// 每次同步前等待（用于测试重入）
    pub fn set_sync_delay(&self, delay: Duration) {
        *self.sync_delay.lock() = Some(delay);
    }

    /// 预设下一次单条上报的结果
    pub fn push_record_response(&self, response: Result<()>) {
        self.record_script.lock().push_back(response);
    }

    /// 为指定内容预设校验结果
    pub fn set_verify_response(&self, content: impl Into<String>, response: Result<VerificationResult>) {
        self.verify_by_content.lock().insert(content.into(), response);
    }

    /// 未命中内容时的默认校验结果
    pub fn set_default_verify_response(&self, response: Result<VerificationResult>) {
        *self.verify_default.lock() = Some(response);
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// 已提交的批次
    pub fn submitted_batches(&self) -> Vec<SyncBatch> {
        self.submitted.lock().clone()
    }

    /// 已直接上报的事件
    pub fn recorded_events(&self) -> Vec<ScanEvent> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl ScanEventApi for MockApi {
    async fn sync_offline(&self, batch: &SyncBatch) -> Result<SyncResult> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        info!(
            "[MOCK API] Sync batch: batch_id={}, events={}",
            batch.batch_id,
            batch.len()
        );

        let delay = *self.sync_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.submitted.lock().push(batch.clone());
        let scripted = self.sync_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(SyncResult::new(batch.len(), batch.len(), Vec::new())))
    }

    async fn record(&self, event: &ScanEvent) -> Result<LiveScanEvent> {
        let scripted = self.record_script.lock().pop_front();
        scripted.unwrap_or(Ok(()))?;

        self.recorded.lock().push(event.clone());
        Ok(LiveScanEvent {
            id: format!("srv-{}", event.client_event_id),
            parcel_id: event.parcel_id.clone(),
            tracking_ref: event.tracking_ref.clone(),
            event_type: event.event_type.to_string(),
            timestamp: Utc::now(),
            location_note: event.location_note.clone(),
            latitude: event.latitude,
            longitude: event.longitude,
            agency_name: None,
            agent_name: None,
            parcel_status_after: None,
        })
    }
}

#[async_trait]
impl QrVerificationApi for MockApi {
    async fn verify(&self, raw_content: &str) -> Result<VerificationResult> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(response) = self.verify_by_content.lock().get(raw_content) {
            return response.clone();
        }
        if let Some(response) = self.verify_default.lock().as_ref() {
            return response.clone();
        }
        Ok(VerificationResult::new(true, VerificationStatus::Valid))
    }
}
