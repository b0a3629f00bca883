use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::scan_event::ScanEvent;

/// 一次同步尝试提交的批次
///
/// 同步时创建，尝试结束（成功或失败）后丢弃，不会持久化。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    pub batch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(serialize_with = "serialize_batch_events")]
    pub events: Vec<ScanEvent>,
}

impl SyncBatch {
    /// 用队列快照创建批次，批次 ID 每次重新生成
    pub fn new(events: Vec<ScanEvent>, device_id: Option<String>) -> Self {
        Self {
            batch_id: format!("batch-{}", Uuid::new_v4()),
            device_id,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// 批次中单条事件的线上形式：事件本身加上后端读取的 `localId` / `deviceTimestamp`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEventPayload<'a> {
    #[serde(flatten)]
    event: &'a ScanEvent,
    local_id: &'a str,
    device_timestamp: DateTime<Utc>,
}

impl<'a> From<&'a ScanEvent> for BatchEventPayload<'a> {
    fn from(event: &'a ScanEvent) -> Self {
        Self {
            event,
            local_id: &event.client_event_id,
            device_timestamp: event.captured_at,
        }
    }
}

fn serialize_batch_events<S>(events: &[ScanEvent], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(events.len()))?;
    for event in events {
        seq.serialize_element(&BatchEventPayload::from(event))?;
    }
    seq.end()
}

/// 后端对未设置的列表和字符串写出 `null`，按缺省值处理
fn null_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 单条失败记录（`eventIndex` 指向提交批次中的位置）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub event_index: usize,
    #[serde(default, alias = "errorMessage", deserialize_with = "null_default")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parcel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl SyncFailure {
    pub fn new(event_index: usize, reason: impl Into<String>) -> Self {
        Self {
            event_index,
            reason: reason.into(),
            parcel_id: None,
            event_type: None,
        }
    }
}

/// 服务器确认已入库的事件（`localId` 对应 `clientEventId`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedEvent {
    #[serde(default, deserialize_with = "null_default")]
    pub local_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// 服务器按 `localId` 报告的失败事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    #[serde(default, deserialize_with = "null_default")]
    pub local_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub error: String,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

/// 同步接口返回结果
///
/// 不变量：`success_count + failures.len() <= total_events`，同一个下标在 failures 中最多出现一次。
/// 服务器返回的数据可能违反这一点，协调逻辑会按保守方式处理。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub total_events: usize,
    pub success_count: usize,
    #[serde(default)]
    pub failure_count: Option<usize>,
    #[serde(default, deserialize_with = "null_default")]
    pub failures: Vec<SyncFailure>,
    #[serde(default)]
    pub synced_count: Option<usize>,
    #[serde(default)]
    pub failed_count: Option<usize>,
    #[serde(default, deserialize_with = "null_default")]
    pub synced_events: Vec<SyncedEvent>,
    #[serde(default, deserialize_with = "null_default")]
    pub failed_events: Vec<FailedEvent>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn new(total_events: usize, success_count: usize, failures: Vec<SyncFailure>) -> Self {
        Self {
            batch_id: None,
            total_events,
            success_count,
            failure_count: Some(failures.len()),
            failures,
            synced_count: None,
            failed_count: None,
            synced_events: Vec::new(),
            failed_events: Vec::new(),
            synced_at: None,
            server_timestamp: None,
        }
    }

    /// 全部成功
    pub fn all_succeeded(&self) -> bool {
        self.success_count == self.total_events && self.failures.is_empty()
    }

    /// 服务器处理时间，优先 `syncedAt`
    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at.or(self.server_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScanEventType;

    #[test]
    fn test_backend_response_shape() {
        let raw = r#"{
            "batchId": "batch-1",
            "totalEvents": 3,
            "successCount": 2,
            "failureCount": 1,
            "failures": [{"eventIndex": 1, "parcelId": "p2", "eventType": "DELIVERED", "errorMessage": "parcel not found"}],
            "syncedAt": "2026-03-01T08:00:00Z"
        }"#;
        let result: SyncResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.total_events, 3);
        assert_eq!(result.failures[0].event_index, 1);
        assert_eq!(result.failures[0].reason, "parcel not found");
        assert!(!result.all_succeeded());
    }

    #[test]
    fn test_full_backend_response_with_nulls() {
        // 后端同时写出 syncedAt 和 serverTimestamp，未设置的列表和字符串为 null
        let raw = r#"{
            "batchId": "batch-7",
            "totalEvents": 2,
            "successCount": 1,
            "failureCount": 1,
            "failures": [{"eventIndex": 1, "parcelId": null, "eventType": null, "errorMessage": null}],
            "syncedAt": "2026-03-01T08:00:00Z",
            "syncedCount": 0,
            "failedCount": 0,
            "syncedEvents": null,
            "failedEvents": null,
            "serverTimestamp": "2026-03-01T08:00:01Z"
        }"#;
        let result: SyncResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].reason, "");
        assert!(result.synced_events.is_empty());
        assert!(result.failed_events.is_empty());
        assert_eq!(result.synced_count, Some(0));
        assert_eq!(
            result.processed_at().unwrap().to_rfc3339(),
            "2026-03-01T08:00:00+00:00"
        );
        assert!(result.server_timestamp.is_some());
    }

    #[test]
    fn test_null_failures_and_correlated_events() {
        let raw = r#"{
            "totalEvents": 2,
            "successCount": 2,
            "failureCount": 0,
            "failures": null,
            "syncedEvents": [
                {"localId": "a", "serverId": "5f0c7f3e-8d1b-4c59-9a57-0c1f3f1d2b11", "serverTimestamp": "2026-03-01T08:00:01Z"},
                {"localId": "b", "serverId": null, "serverTimestamp": null}
            ],
            "failedEvents": [{"localId": "c", "error": null, "retryable": false}],
            "serverTimestamp": "2026-03-01T08:00:01Z"
        }"#;
        let result: SyncResult = serde_json::from_str(raw).unwrap();
        assert!(result.all_succeeded());
        assert_eq!(result.synced_events.len(), 2);
        assert_eq!(result.synced_events[1].local_id, "b");
        assert_eq!(result.failed_events[0].error, "");
        assert!(!result.failed_events[0].retryable);
        assert!(result.synced_at.is_none());
        assert_eq!(result.processed_at(), result.server_timestamp);
    }

    #[test]
    fn test_minimal_response_shape() {
        let raw = r#"{"totalEvents": 2, "successCount": 2}"#;
        let result: SyncResult = serde_json::from_str(raw).unwrap();
        assert!(result.all_succeeded());
        assert!(result.failures.is_empty());
    }

    #[test]
    fn test_batch_ids_are_fresh() {
        let events = vec![ScanEvent::new("p", ScanEventType::InTransit)];
        let a = SyncBatch::new(events.clone(), None);
        let b = SyncBatch::new(events, None);
        assert_ne!(a.batch_id, b.batch_id);
        assert!(a.batch_id.starts_with("batch-"));

        let json = serde_json::to_value(&a).unwrap();
        assert!(json.get("batchId").is_some());
        assert!(json.get("deviceId").is_none());
        assert_eq!(json["events"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_batch_events_carry_local_id_and_device_timestamp() {
        let captured_at = "2026-02-10T07:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let event = ScanEvent::new("parcel-9", ScanEventType::ArrivedHub).with_captured_at(captured_at);
        let id = event.client_event_id.clone();
        let batch = SyncBatch::new(vec![event], Some("device-1".to_string()));

        let json = serde_json::to_value(&batch).unwrap();
        let wire = &json["events"][0];
        assert_eq!(json["deviceId"], "device-1");
        assert_eq!(wire["localId"], id.as_str());
        assert_eq!(wire["clientEventId"], id.as_str());
        assert_eq!(wire["parcelId"], "parcel-9");
        assert_eq!(wire["eventType"], "ARRIVED_HUB");
        assert_eq!(wire["deviceTimestamp"], wire["capturedAt"]);
        let sent: DateTime<Utc> = serde_json::from_value(wire["deviceTimestamp"].clone()).unwrap();
        assert_eq!(sent, captured_at);
    }
}
