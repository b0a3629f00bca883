// QR 载荷校验模块
// 负责扫描文本的本地解析、防抖以及服务端校验与伪造识别

pub mod debounce;
pub mod parser;
pub mod verifier;

pub use debounce::{is_within_window, ScanDebouncer, DEFAULT_DEBOUNCE_WINDOW_MS};
pub use parser::{parse, ParsedQr, TRACKING_REF_MAX_LEN, TRACKING_REF_MIN_LEN};
pub use verifier::{is_forgery_attempt, QrVerifier, VerificationOutcome, VerifierState};
