use serde_json::Value;

use crate::error::{Result, ScanError};
use crate::model::{QrPayload, QrPayloadType, SecureQrPayload, SecureTokenKind, SMARTCAMPOST_PARCEL};

/// 裸追踪号的长度范围（按字符计）
pub const TRACKING_REF_MIN_LEN: usize = 6;
pub const TRACKING_REF_MAX_LEN: usize = 50;

/// 紧凑签名格式的字段数：`V1|P|TOKEN|REF|TS|SIG`
const SECURE_FIELD_COUNT: usize = 6;

/// 本地解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedQr {
    /// JSON 结构化载荷或签名紧凑格式
    Structured(QrPayload),
    /// 旧版裸追踪号
    LegacyTrackingRef(QrPayload),
    /// 无法识别，不会发送到服务器
    Malformed(String),
}

impl ParsedQr {
    pub fn payload(&self) -> Option<&QrPayload> {
        match self {
            ParsedQr::Structured(payload) | ParsedQr::LegacyTrackingRef(payload) => Some(payload),
            ParsedQr::Malformed(_) => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, ParsedQr::Structured(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ParsedQr::Malformed(_))
    }

    /// 取出载荷；无法识别时返回 [`ScanError::InvalidQrFormat`]
    pub fn into_payload(self) -> Result<QrPayload> {
        match self {
            ParsedQr::Structured(payload) | ParsedQr::LegacyTrackingRef(payload) => Ok(payload),
            ParsedQr::Malformed(reason) => Err(ScanError::InvalidQrFormat(reason)),
        }
    }
}

/// 解析扫描到的原始文本
///
/// 顺序：JSON 对象 → 紧凑签名格式 → 裸追踪号。
/// JSON 对象的 `type` 不是 `SMARTCAMPOST_PARCEL` 时直接判为无效，不降级为追踪号。
pub fn parse(raw: &str) -> ParsedQr {
    if raw.is_empty() {
        return ParsedQr::Malformed("QR content is empty".to_string());
    }

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(raw) {
        return parse_structured(&object);
    }

    if looks_like_secure(raw) {
        return parse_secure(raw);
    }

    parse_legacy(raw)
}

fn parse_structured(object: &serde_json::Map<String, Value>) -> ParsedQr {
    match object.get("type").and_then(Value::as_str) {
        Some(SMARTCAMPOST_PARCEL) => {}
        _ => return ParsedQr::Malformed("Invalid QR code type".to_string()),
    }

    let tracking_ref = match object
        .get("trackingRef")
        .or_else(|| object.get("tracking_ref"))
        .and_then(Value::as_str)
    {
        Some(reference) if !reference.trim().is_empty() => reference.to_string(),
        _ => return ParsedQr::Malformed("Structured QR code has no tracking reference".to_string()),
    };

    let parcel_id = object
        .get("parcelId")
        .or_else(|| object.get("parcel_id"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    let version = match object.get("version") {
        None => 1,
        Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) => n,
            None => return ParsedQr::Malformed("Structured QR code has an invalid version".to_string()),
        },
    };

    ParsedQr::Structured(QrPayload {
        tracking_ref,
        parcel_id,
        payload_type: QrPayloadType::SmartcampostParcel,
        version,
        secure: None,
    })
}

/// `V<数字>|` 开头
fn looks_like_secure(raw: &str) -> bool {
    let mut chars = raw.chars();
    chars.next() == Some('V') && raw.contains('|') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn parse_secure(raw: &str) -> ParsedQr {
    let parts: Vec<&str> = raw.split('|').collect();
    if parts.len() != SECURE_FIELD_COUNT {
        return ParsedQr::Malformed(format!(
            "Secure QR code must have {} fields, got {}",
            SECURE_FIELD_COUNT,
            parts.len()
        ));
    }

    let version = match parts[0][1..].parse::<u32>() {
        Ok(v) => v,
        Err(_) => return ParsedQr::Malformed("Secure QR code has an invalid version".to_string()),
    };
    let kind = match SecureTokenKind::from_code(parts[1]) {
        Some(kind) => kind,
        None => return ParsedQr::Malformed(format!("Unknown secure QR code kind: {}", parts[1])),
    };
    let timestamp = match parts[4].parse::<i64>() {
        Ok(ts) => ts,
        Err(_) => return ParsedQr::Malformed("Secure QR code has an invalid timestamp".to_string()),
    };
    if parts[2].is_empty() || parts[3].is_empty() || parts[5].is_empty() {
        return ParsedQr::Malformed("Secure QR code has empty fields".to_string());
    }

    let secure = SecureQrPayload {
        version,
        kind,
        token: parts[2].to_string(),
        reference: parts[3].to_string(),
        timestamp,
        signature: parts[5].to_string(),
    };

    ParsedQr::Structured(QrPayload {
        tracking_ref: secure.reference.clone(),
        parcel_id: None,
        payload_type: QrPayloadType::SecureToken,
        version,
        secure: Some(secure),
    })
}

fn parse_legacy(raw: &str) -> ParsedQr {
    let len = raw.chars().count();
    if (TRACKING_REF_MIN_LEN..=TRACKING_REF_MAX_LEN).contains(&len) {
        ParsedQr::LegacyTrackingRef(QrPayload::tracking_ref(raw))
    } else {
        ParsedQr::Malformed(format!(
            "Tracking reference must be {}-{} characters, got {}",
            TRACKING_REF_MIN_LEN, TRACKING_REF_MAX_LEN, len
        ))
    }
}
