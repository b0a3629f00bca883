//! 扫描采集流程：防抖 → 解析 / 校验 → 在线直接上报或写入离线队列

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::api::ScanEventApi;
use crate::error::{Result, ScanError};
use crate::infra::ConnectivityMonitor;
use crate::model::{LiveScanEvent, QrPayload, ScanEvent, ScanEventType};
use crate::offline::{LocalEventQueue, Persistence, StorageBackend};
use crate::qr::{self, ParsedQr, QrVerifier, ScanDebouncer, VerificationOutcome};
use crate::scanner::{LocationProvider, ScanRecord, ScanSession};

/// 采集配置
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// 扫描时默认记录的事件类型
    pub default_event_type: ScanEventType,
    /// 离线时是否接受未经服务端校验的结构化 QR 码
    pub allow_unverified_offline: bool,
    pub agent_id: Option<String>,
    pub agency_id: Option<String>,
    pub location_note: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_event_type: ScanEventType::InTransit,
            allow_unverified_offline: true,
            agent_id: None,
            agency_id: None,
            location_note: None,
        }
    }
}

/// 事件进入离线队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    /// 当前离线
    Offline,
    /// 在线上报遇到暂时性错误
    RecordFailed,
}

/// 一次采集的结果
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// 防抖窗口内的重复扫描
    Debounced,
    /// 已直接上报服务器
    Recorded { event: ScanEvent, server: LiveScanEvent },
    /// 已写入离线队列
    Queued {
        event: ScanEvent,
        persistence: Persistence,
        reason: QueueReason,
    },
    /// 校验未通过（畸形、伪造、无效）
    Rejected(VerificationOutcome),
    /// 无法完成校验，且不允许未校验入队
    NeedsVerification { message: String },
}

impl CaptureOutcome {
    pub fn is_captured(&self) -> bool {
        matches!(self, CaptureOutcome::Recorded { .. } | CaptureOutcome::Queued { .. })
    }

    pub fn event(&self) -> Option<&ScanEvent> {
        match self {
            CaptureOutcome::Recorded { event, .. } | CaptureOutcome::Queued { event, .. } => Some(event),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CaptureOutcome::Debounced => "Duplicate scan ignored".to_string(),
            CaptureOutcome::Recorded { event, .. } => {
                format!("{} recorded for parcel {}", event.event_type, event.parcel_id)
            }
            CaptureOutcome::Queued { event, persistence, .. } => match persistence {
                Persistence::Durable => format!("{} queued for parcel {}", event.event_type, event.parcel_id),
                Persistence::Degraded => format!(
                    "{} queued for parcel {} (not saved to disk)",
                    event.event_type, event.parcel_id
                ),
            },
            CaptureOutcome::Rejected(outcome) => outcome.user_message(),
            CaptureOutcome::NeedsVerification { message } => message.clone(),
        }
    }
}

/// 扫描采集流程
///
/// 采集路径从不等待同步；离线或上报暂时失败时事件进入队列，由同步引擎稍后处理。
pub struct CapturePipeline<S: StorageBackend> {
    verifier: Arc<QrVerifier>,
    debouncer: ScanDebouncer,
    queue: Arc<LocalEventQueue<S>>,
    api: Arc<dyn ScanEventApi>,
    connectivity: Arc<ConnectivityMonitor>,
    location: Arc<dyn LocationProvider>,
    config: CaptureConfig,
}

impl<S: StorageBackend> CapturePipeline<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: Arc<QrVerifier>,
        debouncer: ScanDebouncer,
        queue: Arc<LocalEventQueue<S>>,
        api: Arc<dyn ScanEventApi>,
        connectivity: Arc<ConnectivityMonitor>,
        location: Arc<dyn LocationProvider>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            verifier,
            debouncer,
            queue,
            api,
            connectivity,
            location,
            config,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// 处理一次扫描（使用当前时间做防抖）
    pub async fn handle_scan(&self, raw: &str, event_type: ScanEventType) -> Result<CaptureOutcome> {
        self.handle_scan_at(raw, event_type, Utc::now().timestamp_millis()).await
    }

    /// 处理一次扫描，`now_ms` 用于防抖判断
    pub async fn handle_scan_at(&self, raw: &str, event_type: ScanEventType, now_ms: i64) -> Result<CaptureOutcome> {
        if !self.debouncer.accept(raw, now_ms) {
            return Ok(CaptureOutcome::Debounced);
        }

        if !self.connectivity.is_online() {
            return self.capture_unverified(raw, event_type).await;
        }

        match self.verifier.verify(raw).await {
            VerificationOutcome::Valid { payload, result } => {
                let parcel_id = result.parcel_id.clone().or_else(|| payload.parcel_id.clone());
                let Some(parcel_id) = parcel_id else {
                    return Err(ScanError::Validation(format!(
                        "Verified QR code {} does not identify a parcel",
                        payload.tracking_ref
                    )));
                };
                let event = self.build_event(parcel_id, &payload, event_type).await;
                self.record_event(event).await
            }
            VerificationOutcome::Unknown { message, .. } => {
                // 在线时校验结果未知不能放行，由操作员稍后重扫
                warn!("Scan held back, verification unavailable: {}", message);
                Ok(CaptureOutcome::NeedsVerification { message })
            }
            rejected => {
                if rejected.is_forgery_attempt() {
                    warn!("Scan rejected as suspected forgery");
                }
                Ok(CaptureOutcome::Rejected(rejected))
            }
        }
    }

    /// 离线无法校验时的处理：只有自带 parcelId 的结构化载荷可以入队
    async fn capture_unverified(&self, raw: &str, event_type: ScanEventType) -> Result<CaptureOutcome> {
        let parsed = qr::parse(raw);
        let payload = match parsed {
            ParsedQr::Malformed(reason) => {
                return Ok(CaptureOutcome::Rejected(VerificationOutcome::Malformed { reason }));
            }
            ParsedQr::Structured(payload) if self.config.allow_unverified_offline => payload,
            _ => {
                return Ok(CaptureOutcome::NeedsVerification {
                    message: "QR code needs online verification before it can be used".to_string(),
                });
            }
        };

        let Some(parcel_id) = payload.parcel_id.clone() else {
            return Ok(CaptureOutcome::NeedsVerification {
                message: "QR code does not carry a parcel id; verify it when back online".to_string(),
            });
        };

        let event = self.build_event(parcel_id, &payload, event_type).await;
        let persistence = self.queue.enqueue(event.clone());
        info!(
            "Queued unverified scan for parcel {} ({} pending)",
            event.parcel_id,
            self.queue.len()
        );
        Ok(CaptureOutcome::Queued {
            event,
            persistence,
            reason: QueueReason::Offline,
        })
    }

    async fn build_event(&self, parcel_id: String, payload: &QrPayload, event_type: ScanEventType) -> ScanEvent {
        let mut event = ScanEvent::new(parcel_id, event_type)
            .with_tracking_ref(payload.tracking_ref.clone())
            .with_agent(self.config.agent_id.clone(), self.config.agency_id.clone());
        if let Some(note) = &self.config.location_note {
            event = event.with_location_note(note.clone());
        }
        if let Some(fix) = self.location.current().await {
            event = event.with_location(fix.point, fix.source);
        }
        event
    }

    /// 上报一个事件：在线时直接调用接口，离线或暂时失败时写入队列
    ///
    /// 服务器明确拒绝（4xx）时返回错误，不入队。
    pub async fn record_event(&self, event: ScanEvent) -> Result<CaptureOutcome> {
        if !self.connectivity.is_online() {
            let persistence = self.queue.enqueue(event.clone());
            return Ok(CaptureOutcome::Queued {
                event,
                persistence,
                reason: QueueReason::Offline,
            });
        }

        match self.api.record(&event).await {
            Ok(server) => Ok(CaptureOutcome::Recorded { event, server }),
            Err(e) if e.is_retryable() => {
                warn!("Recording scan for parcel {} failed, queueing: {}", event.parcel_id, e);
                let persistence = self.queue.enqueue(event.clone());
                Ok(CaptureOutcome::Queued {
                    event,
                    persistence,
                    reason: QueueReason::RecordFailed,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 在会话上循环采集，直到会话停止或设备关闭
    ///
    /// 单次采集的错误交给回调展示，不结束会话；设备错误结束会话。
    pub async fn run_session<F>(
        &self,
        session: &mut ScanSession,
        event_type: ScanEventType,
        mut on_outcome: F,
    ) -> Result<usize>
    where
        F: FnMut(&str, &Result<CaptureOutcome>),
    {
        let mut captured = 0usize;
        while let Some(raw) = session.next_decoded().await? {
            let result = self.handle_scan(&raw, event_type).await;
            on_outcome(&raw, &result);

            let (success, message) = match &result {
                Ok(CaptureOutcome::Debounced) => continue,
                Ok(outcome) => (outcome.is_captured(), outcome.message()),
                Err(e) => (false, e.to_string()),
            };
            if success {
                captured += 1;
            }

            session.record(ScanRecord {
                tracking_ref: result
                    .as_ref()
                    .ok()
                    .and_then(|o| o.event())
                    .and_then(|e| e.tracking_ref.clone()),
                raw_text: raw,
                success,
                message,
                scanned_at: Utc::now(),
            });
        }
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApi;
    use crate::model::{VerificationResult, VerificationStatus};
    use crate::offline::{create_memory_queue, MemoryStorage};
    use crate::scanner::{FixedLocation, ManualEntryDevice, ScanMode};
    use std::time::Duration;

    const STRUCTURED: &str = r#"{"type":"SMARTCAMPOST_PARCEL","trackingRef":"SCP-2026-0001","parcelId":"42"}"#;

    struct Fixture {
        api: Arc<MockApi>,
        queue: Arc<LocalEventQueue<MemoryStorage>>,
        monitor: Arc<ConnectivityMonitor>,
        pipeline: CapturePipeline<MemoryStorage>,
    }

    fn fixture(online: bool) -> Fixture {
        let api = Arc::new(MockApi::new());
        let queue = Arc::new(create_memory_queue());
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let verifier = Arc::new(QrVerifier::new(api.clone(), Duration::from_secs(2)));
        let pipeline = CapturePipeline::new(
            verifier,
            ScanDebouncer::new(2_000),
            queue.clone(),
            api.clone(),
            monitor.clone(),
            Arc::new(FixedLocation::new(3.848, 11.502)),
            CaptureConfig::default(),
        );
        Fixture {
            api,
            queue,
            monitor,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_duplicate_scan_within_window_verifies_once() {
        let f = fixture(true);
        let first = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Accepted, 1_000).await.unwrap();
        let second = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Accepted, 1_800).await.unwrap();

        assert!(first.is_captured());
        assert!(matches!(second, CaptureOutcome::Debounced));
        assert_eq!(f.api.verify_calls(), 1);
        assert_eq!(f.api.recorded_events().len(), 1);
    }

    #[tokio::test]
    async fn test_online_valid_scan_is_recorded_with_location() {
        let f = fixture(true);
        let outcome = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Delivered, 0).await.unwrap();

        let event = outcome.event().unwrap();
        assert_eq!(event.parcel_id, "42");
        assert_eq!(event.tracking_ref.as_deref(), Some("SCP-2026-0001"));
        assert_eq!(event.latitude, Some(3.848));
        assert!(matches!(outcome, CaptureOutcome::Recorded { .. }));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_offline_structured_scan_is_queued_without_verification() {
        let f = fixture(false);
        let outcome = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::InTransit, 0).await.unwrap();

        assert!(matches!(outcome, CaptureOutcome::Queued { reason: QueueReason::Offline, .. }));
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.api.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_legacy_scan_needs_verification() {
        let f = fixture(false);
        let outcome = f.pipeline.handle_scan_at("SCP-2026-0001", ScanEventType::InTransit, 0).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::NeedsVerification { .. }));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_forgery_is_rejected_and_not_queued() {
        let f = fixture(true);
        f.api.set_verify_response(
            STRUCTURED,
            Ok(VerificationResult::new(false, VerificationStatus::Tampered)),
        );

        let outcome = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Accepted, 0).await.unwrap();
        match outcome {
            CaptureOutcome::Rejected(inner) => assert!(inner.is_forgery_attempt()),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(f.queue.is_empty());
        assert!(f.api.recorded_events().is_empty());
    }

    #[tokio::test]
    async fn test_online_verification_failure_is_not_queued() {
        let f = fixture(true);
        f.api.set_verify_response(STRUCTURED, Err(ScanError::Network("connection refused".to_string())));

        let outcome = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Accepted, 0).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::NeedsVerification { .. }));
        assert!(!outcome.is_captured());
        assert!(f.queue.is_empty());
        assert!(f.api.recorded_events().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_verification_is_not_queued() {
        let f = fixture(true);
        f.api.set_verify_response(
            STRUCTURED,
            Ok(VerificationResult::new(false, VerificationStatus::RateLimitExceeded)),
        );

        let outcome = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Accepted, 0).await.unwrap();
        match outcome {
            CaptureOutcome::NeedsVerification { message } => assert!(!message.is_empty()),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_retryable_record_failure_falls_back_to_queue() {
        let f = fixture(true);
        f.api.push_record_response(Err(ScanError::Network("connection reset".to_string())));

        let outcome = f.pipeline.handle_scan_at(STRUCTURED, ScanEventType::Accepted, 0).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Queued { reason: QueueReason::RecordFailed, .. }));
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_record_is_surfaced() {
        let f = fixture(true);
        f.api.push_record_response(Err(ScanError::Http {
            status: 422,
            body: "invalid transition".to_string(),
        }));

        let event = ScanEvent::new("42", ScanEventType::Delivered);
        assert!(f.pipeline.record_event(event).await.is_err());
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_record_event_offline_queues() {
        let f = fixture(true);
        f.monitor.set_online(false);
        let outcome = f.pipeline.record_event(ScanEvent::new("42", ScanEventType::Returned)).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Queued { .. }));
        assert!(f.api.recorded_events().is_empty());
    }

    #[tokio::test]
    async fn test_single_mode_session_stops_after_first_capture() {
        let f = fixture(true);
        let input = format!("abc\n{}\nSCP-2026-0002\n", STRUCTURED);
        let device = Box::new(ManualEntryDevice::new("stdin", std::io::Cursor::new(input.into_bytes())));
        let mut session = ScanSession::start(device, ScanMode::Single).await.unwrap();

        let mut seen = Vec::new();
        let captured = f
            .pipeline
            .run_session(&mut session, ScanEventType::Accepted, |raw, _| seen.push(raw.to_string()))
            .await
            .unwrap();

        assert_eq!(captured, 1);
        assert_eq!(seen.len(), 2);
        assert!(!session.is_active());
        let history: Vec<_> = session.history().collect();
        assert!(history[0].success);
        assert!(!history[1].success);
    }
}
