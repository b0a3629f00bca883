use serde::{Deserialize, Serialize};

/// 结构化 QR 码的类型标识
pub const SMARTCAMPOST_PARCEL: &str = "SMARTCAMPOST_PARCEL";

/// QR 载荷类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QrPayloadType {
    /// JSON 结构化载荷（`type = SMARTCAMPOST_PARCEL`，带版本号）
    SmartcampostParcel,
    /// 签名紧凑格式 `V1|P|TOKEN|REF|TS|SIG`
    SecureToken,
    /// 裸追踪号（旧版 QR 码）
    TrackingRef,
}

impl QrPayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QrPayloadType::SmartcampostParcel => SMARTCAMPOST_PARCEL,
            QrPayloadType::SecureToken => "SECURE_TOKEN",
            QrPayloadType::TrackingRef => "TRACKING_REF",
        }
    }

    /// 结构上看起来可信（不是随手扫到的一串字符）
    pub fn is_structured(&self) -> bool {
        !matches!(self, QrPayloadType::TrackingRef)
    }
}

/// 签名令牌类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecureTokenKind {
    /// 永久（包裹）
    #[serde(rename = "P")]
    Permanent,
    /// 临时（上门揽收）
    #[serde(rename = "T")]
    Temporary,
}

impl SecureTokenKind {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(SecureTokenKind::Permanent),
            "T" => Some(SecureTokenKind::Temporary),
            _ => None,
        }
    }
}

/// 签名紧凑格式的各字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureQrPayload {
    pub version: u32,
    pub kind: SecureTokenKind,
    pub token: String,
    pub reference: String,
    pub timestamp: i64,
    pub signature: String,
}

/// 解析后的 QR 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub tracking_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parcel_id: Option<String>,
    #[serde(rename = "type")]
    pub payload_type: QrPayloadType,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<SecureQrPayload>,
}

impl QrPayload {
    /// 旧版裸追踪号
    pub fn tracking_ref(reference: impl Into<String>) -> Self {
        Self {
            tracking_ref: reference.into(),
            parcel_id: None,
            payload_type: QrPayloadType::TrackingRef,
            version: 1,
            secure: None,
        }
    }

    pub fn is_structured(&self) -> bool {
        self.payload_type.is_structured()
    }
}

/// 服务器校验状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Valid,
    TokenNotFound,
    TokenRevoked,
    #[serde(alias = "TOKEN_EXPIRED")]
    Expired,
    SignatureInvalid,
    Tampered,
    #[serde(alias = "PARCEL_NOT_FOUND")]
    UnknownParcel,
    PickupNotFound,
    RateLimitExceeded,
    VerificationError,
    #[serde(other)]
    Unknown,
}

impl VerificationStatus {
    /// 服务器是否给出了明确的真伪结论
    ///
    /// 限流、服务端异常、未知状态不算结论，不能据此判定伪造。
    pub fn is_verdict(&self) -> bool {
        !matches!(
            self,
            VerificationStatus::RateLimitExceeded
                | VerificationStatus::VerificationError
                | VerificationStatus::Unknown
        )
    }

    /// 面向用户的提示
    pub fn message(&self) -> &'static str {
        match self {
            VerificationStatus::Valid => "QR code verified successfully",
            VerificationStatus::TokenNotFound => "QR code not recognised - possible forgery",
            VerificationStatus::TokenRevoked => "This QR code has been revoked",
            VerificationStatus::Expired => "This temporary QR code has expired",
            VerificationStatus::SignatureInvalid => "Invalid signature - forged QR code",
            VerificationStatus::Tampered => "QR code content has been tampered with",
            VerificationStatus::UnknownParcel => "Parcel not found",
            VerificationStatus::PickupNotFound => "Pickup request not found",
            VerificationStatus::RateLimitExceeded => "Too many verification attempts",
            VerificationStatus::VerificationError => "Verification failed on the server",
            VerificationStatus::Unknown => "Unknown verification status",
        }
    }
}

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// 服务器校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    pub status: VerificationStatus,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tampering_detected: bool,
    #[serde(default)]
    pub parcel_id: Option<String>,
    #[serde(default)]
    pub tracking_ref: Option<String>,
    #[serde(default)]
    pub parcel_status: Option<String>,
}

impl VerificationResult {
    pub fn new(valid: bool, status: VerificationStatus) -> Self {
        Self {
            valid,
            status,
            risk_level: None,
            message: status.message().to_string(),
            tampering_detected: false,
            parcel_id: None,
            tracking_ref: None,
            parcel_status: None,
        }
    }

    pub fn with_parcel_id(mut self, parcel_id: impl Into<String>) -> Self {
        self.parcel_id = Some(parcel_id.into());
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = Some(risk_level);
        self
    }

    /// 面向用户的说明，服务器没给 message 时使用状态默认文案
    pub fn display_message(&self) -> &str {
        if self.message.is_empty() {
            self.status.message()
        } else {
            &self.message
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aliases_and_fallback() {
        let s: VerificationStatus = serde_json::from_str("\"TOKEN_EXPIRED\"").unwrap();
        assert_eq!(s, VerificationStatus::Expired);
        let s: VerificationStatus = serde_json::from_str("\"PARCEL_NOT_FOUND\"").unwrap();
        assert_eq!(s, VerificationStatus::UnknownParcel);
        let s: VerificationStatus = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(s, VerificationStatus::Unknown);
    }

    #[test]
    fn test_verdict_classification() {
        assert!(VerificationStatus::SignatureInvalid.is_verdict());
        assert!(VerificationStatus::Valid.is_verdict());
        assert!(!VerificationStatus::RateLimitExceeded.is_verdict());
        assert!(!VerificationStatus::VerificationError.is_verdict());
    }

    #[test]
    fn test_verification_result_from_backend() {
        let raw = r#"{"valid":false,"status":"SIGNATURE_INVALID","message":"bad sig",
            "riskLevel":"HIGH","tamperingDetected":true,"tokenId":"t-1"}"#;
        let result: VerificationResult = serde_json::from_str(raw).unwrap();
        assert!(!result.valid);
        assert_eq!(result.risk_level, Some(RiskLevel::High));
        assert!(result.tampering_detected);
        assert_eq!(result.display_message(), "bad sig");
    }

    #[test]
    fn test_payload_type_structured() {
        assert!(QrPayloadType::SmartcampostParcel.is_structured());
        assert!(QrPayloadType::SecureToken.is_structured());
        assert!(!QrPayloadType::TrackingRef.is_structured());
    }
}
