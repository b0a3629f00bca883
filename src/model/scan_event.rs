use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 扫描事件类型（与后端 ScanEventType 保持一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanEventType {
    /// 客户创建包裹
    Created,
    /// 网点受理，生成正式 QR 码
    Accepted,
    /// 已投递到始发网点
    AtOriginAgency,
    /// 快递员已揽收
    TakenInCharge,
    /// 运输中
    InTransit,
    /// 到达中转站
    ArrivedHub,
    /// 离开中转站
    DepartedHub,
    /// 到达目的地
    ArrivedDestination,
    /// 到达目的网点
    ArrivedDestAgency,
    /// 派送中
    OutForDelivery,
    /// 已签收
    Delivered,
    /// 收件人网点自提
    PickedUpAtAgency,
    /// 退回
    Returned,
    /// 派送失败后退回寄件人
    ReturnedToSender,
    /// 派送失败
    DeliveryFailed,
    /// 改期派送
    Rescheduled,
    /// 已取消
    Cancelled,
    /// 已发送签收验证码
    OtpSent,
    /// 验证码校验通过
    OtpVerified,
    /// 已采集签收凭证
    ProofCaptured,
}

impl ScanEventType {
    pub const ALL: [ScanEventType; 20] = [
        ScanEventType::Created,
        ScanEventType::Accepted,
        ScanEventType::AtOriginAgency,
        ScanEventType::TakenInCharge,
        ScanEventType::InTransit,
        ScanEventType::ArrivedHub,
        ScanEventType::DepartedHub,
        ScanEventType::ArrivedDestination,
        ScanEventType::ArrivedDestAgency,
        ScanEventType::OutForDelivery,
        ScanEventType::Delivered,
        ScanEventType::PickedUpAtAgency,
        ScanEventType::Returned,
        ScanEventType::ReturnedToSender,
        ScanEventType::DeliveryFailed,
        ScanEventType::Rescheduled,
        ScanEventType::Cancelled,
        ScanEventType::OtpSent,
        ScanEventType::OtpVerified,
        ScanEventType::ProofCaptured,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanEventType::Created => "CREATED",
            ScanEventType::Accepted => "ACCEPTED",
            ScanEventType::AtOriginAgency => "AT_ORIGIN_AGENCY",
            ScanEventType::TakenInCharge => "TAKEN_IN_CHARGE",
            ScanEventType::InTransit => "IN_TRANSIT",
            ScanEventType::ArrivedHub => "ARRIVED_HUB",
            ScanEventType::DepartedHub => "DEPARTED_HUB",
            ScanEventType::ArrivedDestination => "ARRIVED_DESTINATION",
            ScanEventType::ArrivedDestAgency => "ARRIVED_DEST_AGENCY",
            ScanEventType::OutForDelivery => "OUT_FOR_DELIVERY",
            ScanEventType::Delivered => "DELIVERED",
            ScanEventType::PickedUpAtAgency => "PICKED_UP_AT_AGENCY",
            ScanEventType::Returned => "RETURNED",
            ScanEventType::ReturnedToSender => "RETURNED_TO_SENDER",
            ScanEventType::DeliveryFailed => "DELIVERY_FAILED",
            ScanEventType::Rescheduled => "RESCHEDULED",
            ScanEventType::Cancelled => "CANCELLED",
            ScanEventType::OtpSent => "OTP_SENT",
            ScanEventType::OtpVerified => "OTP_VERIFIED",
            ScanEventType::ProofCaptured => "PROOF_CAPTURED",
        }
    }
}

impl fmt::Display for ScanEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanEventType {
    type Err = String;

    /// 大小写不敏感，`-` 与 `_` 等价（方便命令行输入 `in-transit`）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ScanEventType::ALL
            .iter()
            .find(|t| t.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown scan event type: {}", s))
    }
}

/// 位置来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationSource {
    Gps,
    Network,
    Manual,
    #[default]
    #[serde(other)]
    Unknown,
}

/// 经纬度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// 离线扫描事件
///
/// 入队后不可变；队列只改变它的成员关系（同步确认后移除）。
/// `client_event_id` 在采集时生成，重试期间保持不变，作为服务端幂等键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    pub client_event_id: String,
    pub parcel_id: String,
    pub event_type: ScanEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub location_source: LocationSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// 客户端采集时间（不是服务器接收时间）
    pub captured_at: DateTime<Utc>,
}

impl ScanEvent {
    /// 创建新的扫描事件，采集时间取当前时间
    pub fn new(parcel_id: impl Into<String>, event_type: ScanEventType) -> Self {
        Self {
            client_event_id: Uuid::new_v4().to_string(),
            parcel_id: parcel_id.into(),
            event_type,
            tracking_ref: None,
            agency_id: None,
            agent_id: None,
            location_note: None,
            latitude: None,
            longitude: None,
            location_source: LocationSource::Unknown,
            comment: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_tracking_ref(mut self, tracking_ref: impl Into<String>) -> Self {
        self.tracking_ref = Some(tracking_ref.into());
        self
    }

    pub fn with_location(mut self, point: GeoPoint, source: LocationSource) -> Self {
        self.latitude = Some(point.latitude);
        self.longitude = Some(point.longitude);
        self.location_source = source;
        self
    }

    pub fn with_location_note(mut self, note: impl Into<String>) -> Self {
        self.location_note = Some(note.into());
        self
    }

    pub fn with_agent(mut self, agent_id: Option<String>, agency_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self.agency_id = agency_id;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
            _ => None,
        }
    }
}

/// 实时单条上报请求（在线时直接调用 `POST /api/scan-events`）
///
/// `localId` 与离线批次使用同一个 `client_event_id`，上报超时后转入队列重发时服务端可以去重。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEventCreateRequest<'a> {
    pub local_id: &'a str,
    pub parcel_id: &'a str,
    pub event_type: ScanEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_note: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub location_source: LocationSource,
    pub device_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'a str>,
}

impl<'a> From<&'a ScanEvent> for ScanEventCreateRequest<'a> {
    fn from(event: &'a ScanEvent) -> Self {
        Self {
            local_id: &event.client_event_id,
            parcel_id: &event.parcel_id,
            event_type: event.event_type,
            agency_id: event.agency_id.as_deref(),
            agent_id: event.agent_id.as_deref(),
            location_note: event.location_note.as_deref(),
            latitude: event.latitude,
            longitude: event.longitude,
            location_source: event.location_source,
            device_timestamp: event.captured_at,
            comment: event.comment.as_deref(),
        }
    }
}

/// 服务器推送 / 返回的扫描事件
///
/// 事件类型保留为字符串：其他角色产生的事件可能带有本客户端尚不认识的类型。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveScanEvent {
    pub id: String,
    pub parcel_id: String,
    #[serde(default)]
    pub tracking_ref: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub location_note: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub agency_name: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub parcel_status_after: Option<String>,
}

impl LiveScanEvent {
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parse_is_lenient() {
        assert_eq!("in-transit".parse::<ScanEventType>().unwrap(), ScanEventType::InTransit);
        assert_eq!("DELIVERED".parse::<ScanEventType>().unwrap(), ScanEventType::Delivered);
        assert_eq!(" arrived_hub ".parse::<ScanEventType>().unwrap(), ScanEventType::ArrivedHub);
        assert!("teleported".parse::<ScanEventType>().is_err());
    }

    #[test]
    fn test_scan_event_wire_format() {
        let event = ScanEvent::new("parcel-1", ScanEventType::OutForDelivery)
            .with_location(GeoPoint { latitude: 3.848, longitude: 11.502 }, LocationSource::Gps);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["parcelId"], "parcel-1");
        assert_eq!(json["eventType"], "OUT_FOR_DELIVERY");
        assert_eq!(json["locationSource"], "GPS");
        assert!(json.get("clientEventId").is_some());
        assert!(json.get("capturedAt").is_some());
        assert!(json.get("comment").is_none());
    }

    #[test]
    fn test_create_request_carries_local_id() {
        let event = ScanEvent::new("parcel-2", ScanEventType::Delivered)
            .with_agent(Some("agent-1".to_string()), None)
            .with_comment("left at reception");
        let json = serde_json::to_value(ScanEventCreateRequest::from(&event)).unwrap();

        assert_eq!(json["localId"], event.client_event_id.as_str());
        assert_eq!(json["parcelId"], "parcel-2");
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["comment"], "left at reception");
        assert!(json.get("agencyId").is_none());
        let sent: DateTime<Utc> = serde_json::from_value(json["deviceTimestamp"].clone()).unwrap();
        assert_eq!(sent, event.captured_at);
    }

    #[test]
    fn test_client_event_ids_are_unique() {
        let a = ScanEvent::new("p", ScanEventType::Accepted);
        let b = ScanEvent::new("p", ScanEventType::Accepted);
        assert_ne!(a.client_event_id, b.client_event_id);
    }

    #[test]
    fn test_live_event_tolerates_unknown_fields() {
        let raw = r#"{"id":"e1","parcelId":"p1","eventType":"ARRIVED_HUB",
            "timestamp":"2026-01-02T10:00:00Z","latitude":4.05,"longitude":9.7,"extra":true}"#;
        let event: LiveScanEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.parcel_id, "p1");
        assert_eq!(event.location(), Some(GeoPoint { latitude: 4.05, longitude: 9.7 }));
    }
}
