use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::QrVerificationApi;
use crate::error::ScanError;
use crate::infra::metrics;
use crate::model::{QrPayload, RiskLevel, VerificationResult, VerificationStatus};
use super::parser::{self, ParsedQr};

/// 一次扫描的校验结论
#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    /// 服务器确认有效
    Valid {
        payload: QrPayload,
        result: VerificationResult,
    },
    /// 结构可信但服务器判定无效，按安全事件处理
    ForgerySuspected {
        payload: QrPayload,
        result: VerificationResult,
    },
    /// 服务器判定无效，但不像是伪造（例如随手扫到的追踪号不存在）
    Rejected {
        payload: QrPayload,
        result: VerificationResult,
    },
    /// 没有拿到结论：网络错误、超时、限流、服务端异常
    Unknown { payload: QrPayload, message: String },
    /// 本地解析失败，没有发送到服务器
    Malformed { reason: String },
}

impl VerificationOutcome {
    pub fn payload(&self) -> Option<&QrPayload> {
        match self {
            VerificationOutcome::Valid { payload, .. }
            | VerificationOutcome::ForgerySuspected { payload, .. }
            | VerificationOutcome::Rejected { payload, .. }
            | VerificationOutcome::Unknown { payload, .. } => Some(payload),
            VerificationOutcome::Malformed { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&VerificationResult> {
        match self {
            VerificationOutcome::Valid { result, .. }
            | VerificationOutcome::ForgerySuspected { result, .. }
            | VerificationOutcome::Rejected { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationOutcome::Valid { .. })
    }

    pub fn is_forgery_attempt(&self) -> bool {
        matches!(self, VerificationOutcome::ForgerySuspected { .. })
    }

    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            VerificationOutcome::Valid { .. } => "valid",
            VerificationOutcome::ForgerySuspected { .. } => "forgery_suspected",
            VerificationOutcome::Rejected { .. } => "rejected",
            VerificationOutcome::Unknown { .. } => "unknown",
            VerificationOutcome::Malformed { .. } => "malformed",
        }
    }

    /// 面向用户的提示
    pub fn user_message(&self) -> String {
        match self {
            VerificationOutcome::Valid { result, .. }
            | VerificationOutcome::ForgerySuspected { result, .. }
            | VerificationOutcome::Rejected { result, .. } => result.display_message().to_string(),
            VerificationOutcome::Unknown { message, .. } => message.clone(),
            VerificationOutcome::Malformed { reason } => format!("Invalid QR format: {}", reason),
        }
    }
}

/// 校验器状态
///
/// `last_result` 和 `error` 分开保存：一次失败的重新校验不会抹掉之前的有效结果。
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierState {
    pub is_verifying: bool,
    pub last_result: Option<VerificationResult>,
    pub error: Option<String>,
    pub is_forgery: bool,
}

/// 判断服务器结论是否构成伪造
///
/// 结构化载荷（JSON / 签名紧凑格式）被明确判为无效即视为伪造；
/// 裸追踪号只有在服务器报告篡改或签名无效时才算。
pub fn is_forgery_attempt(parsed: &ParsedQr, result: &VerificationResult) -> bool {
    if result.valid {
        return false;
    }
    match parsed {
        ParsedQr::Structured(_) => result.status.is_verdict() || result.tampering_detected,
        ParsedQr::LegacyTrackingRef(_) => {
            result.tampering_detected
                || matches!(
                    result.status,
                    VerificationStatus::SignatureInvalid | VerificationStatus::Tampered
                )
        }
        ParsedQr::Malformed(_) => false,
    }
}

/// QR 载荷校验器
///
/// 本地解析 → 服务端校验 → 伪造分类。畸形输入不会发送到服务器。
pub struct QrVerifier {
    api: Arc<dyn QrVerificationApi>,
    timeout: Duration,
    state: RwLock<VerifierState>,
}

impl QrVerifier {
    pub fn new(api: Arc<dyn QrVerificationApi>, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            state: RwLock::new(VerifierState::default()),
        }
    }

    /// 校验一段扫描文本
    pub async fn verify(&self, raw: &str) -> VerificationOutcome {
        let parsed = parser::parse(raw);
        let outcome = match &parsed {
            ParsedQr::Malformed(reason) => {
                debug!("Rejected malformed QR content locally: {}", reason);
                VerificationOutcome::Malformed { reason: reason.clone() }
            }
            ParsedQr::Structured(payload) | ParsedQr::LegacyTrackingRef(payload) => {
                self.verify_remote(raw, &parsed, payload.clone()).await
            }
        };

        metrics::record_verification(outcome.label());
        outcome
    }

    async fn verify_remote(&self, raw: &str, parsed: &ParsedQr, payload: QrPayload) -> VerificationOutcome {
        self.state.write().is_verifying = true;

        let response = match tokio::time::timeout(self.timeout, self.api.verify(raw)).await {
            Ok(response) => response,
            Err(elapsed) => Err(ScanError::from(elapsed)),
        };

        let mut state = self.state.write();
        state.is_verifying = false;

        let result = match response {
            Ok(result) => result,
            Err(e) => {
                warn!("QR verification for {} failed: {}", payload.tracking_ref, e);
                let message = unknown_message(&e);
                state.error = Some(message.clone());
                return VerificationOutcome::Unknown { payload, message };
            }
        };

        state.error = None;
        state.last_result = Some(result.clone());
        state.is_forgery = false;

        if result.valid {
            info!("QR code verified: {} ({:?})", payload.tracking_ref, result.status);
            return VerificationOutcome::Valid { payload, result };
        }

        if is_forgery_attempt(parsed, &result) {
            state.is_forgery = true;
            drop(state);
            Self::report_forgery(&payload, &result);
            return VerificationOutcome::ForgerySuspected { payload, result };
        }

        if !result.status.is_verdict() {
            let message = result.display_message().to_string();
            state.error = Some(message.clone());
            return VerificationOutcome::Unknown { payload, message };
        }

        info!(
            "QR code rejected: {} ({:?}: {})",
            payload.tracking_ref,
            result.status,
            result.display_message()
        );
        VerificationOutcome::Rejected { payload, result }
    }

    fn report_forgery(payload: &QrPayload, result: &VerificationResult) {
        // 服务器没给风险等级时按最高处理
        let risk = result.risk_level.unwrap_or(RiskLevel::High);
        error!(
            target: "security",
            tracking_ref = %payload.tracking_ref,
            payload_type = payload.payload_type.as_str(),
            status = ?result.status,
            risk_level = ?risk,
            tampering_detected = result.tampering_detected,
            "Suspected QR forgery: {}",
            result.display_message()
        );
        metrics::record_forgery();
    }

    /// 当前状态快照
    pub fn state(&self) -> VerifierState {
        self.state.read().clone()
    }

    pub fn is_verifying(&self) -> bool {
        self.state.read().is_verifying
    }

    pub fn last_result(&self) -> Option<VerificationResult> {
        self.state.read().last_result.clone()
    }

    pub fn is_forgery(&self) -> bool {
        self.state.read().is_forgery
    }

    /// 清空状态（开始新的扫描流程）
    pub fn reset(&self) {
        *self.state.write() = VerifierState::default();
    }
}

fn unknown_message(err: &ScanError) -> String {
    match err {
        ScanError::Timeout(_) => "Verification timed out, please try again".to_string(),
        ScanError::Network(_) | ScanError::Offline(_) => {
            "Unable to reach the verification service, please try again".to_string()
        }
        other => format!("Verification unavailable: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApi;

    const STRUCTURED: &str = r#"{"type":"SMARTCAMPOST_PARCEL","trackingRef":"SCP-2026-0001","parcelId":"42","version":1}"#;

    fn verifier(api: Arc<MockApi>) -> QrVerifier {
        QrVerifier::new(api, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_structured_invalid_is_forgery() {
        let api = Arc::new(MockApi::new());
        api.set_verify_response(
            STRUCTURED,
            Ok(VerificationResult::new(false, VerificationStatus::SignatureInvalid).with_risk_level(RiskLevel::High)),
        );
        let verifier = verifier(api.clone());

        let outcome = verifier.verify(STRUCTURED).await;
        assert!(outcome.is_forgery_attempt());
        assert!(verifier.is_forgery());
        assert_eq!(api.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_secure_token_not_found_is_forgery() {
        let raw = "V1|P|tok-404|SCP-2026-0001|1767225600|sig";
        let api = Arc::new(MockApi::new());
        api.set_verify_response(raw, Ok(VerificationResult::new(false, VerificationStatus::TokenNotFound)));

        assert!(verifier(api).verify(raw).await.is_forgery_attempt());
    }

    #[tokio::test]
    async fn test_garbled_text_never_reaches_server() {
        let api = Arc::new(MockApi::new());
        let verifier = verifier(api.clone());

        let outcome = verifier.verify("abc").await;
        assert!(matches!(outcome, VerificationOutcome::Malformed { .. }));
        assert!(!outcome.is_forgery_attempt());
        assert!(outcome.user_message().starts_with("Invalid QR format"));
        assert_eq!(api.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_legacy_unknown_parcel_is_rejected_not_forgery() {
        let api = Arc::new(MockApi::new());
        api.set_default_verify_response(Ok(VerificationResult::new(false, VerificationStatus::UnknownParcel)));

        let outcome = verifier(api).verify("SCP-2026-9999").await;
        assert!(matches!(outcome, VerificationOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_legacy_tampering_is_forgery() {
        let api = Arc::new(MockApi::new());
        let mut result = VerificationResult::new(false, VerificationStatus::Tampered);
        result.tampering_detected = true;
        api.set_default_verify_response(Ok(result));

        assert!(verifier(api).verify("SCP-2026-9999").await.is_forgery_attempt());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_previous_result() {
        let api = Arc::new(MockApi::new());
        api.set_verify_response(
            STRUCTURED,
            Ok(VerificationResult::new(true, VerificationStatus::Valid).with_parcel_id("42")),
        );
        let verifier = verifier(api.clone());
        assert!(verifier.verify(STRUCTURED).await.is_valid());

        api.set_verify_response(STRUCTURED, Err(ScanError::Network("connection reset".to_string())));
        let outcome = verifier.verify(STRUCTURED).await;

        assert!(matches!(outcome, VerificationOutcome::Unknown { .. }));
        let state = verifier.state();
        assert!(state.error.is_some());
        assert!(state.last_result.unwrap().valid);
        assert!(!state.is_verifying);
    }

    #[tokio::test]
    async fn test_rate_limit_is_unknown() {
        let api = Arc::new(MockApi::new());
        api.set_default_verify_response(Ok(VerificationResult::new(false, VerificationStatus::RateLimitExceeded)));

        let outcome = verifier(api).verify(STRUCTURED).await;
        assert!(matches!(outcome, VerificationOutcome::Unknown { .. }));
        assert!(!outcome.is_forgery_attempt());
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let api = Arc::new(MockApi::new());
        let verifier = verifier(api);
        verifier.verify(STRUCTURED).await;
        assert!(verifier.last_result().is_some());

        verifier.reset();
        assert!(verifier.last_result().is_none());
        assert!(!verifier.is_forgery());
    }
}
