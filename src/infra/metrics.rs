//! Prometheus 指标：离线队列深度、同步批次与失败数、QR 校验结果、实时流消息数
//!
//! 通过 `init()` 安装全局 Recorder；未初始化时所有 `record_*` 调用都是空操作。

use std::net::SocketAddr;
use std::sync::OnceLock;

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// 指标名称
const GAUGE_QUEUE_DEPTH: &str = "smartcampost_offline_queue_depth";
const COUNTER_STORAGE_FAILURES: &str = "smartcampost_offline_storage_failures_total";
const COUNTER_SYNC_BATCHES: &str = "smartcampost_sync_batches_total";
const COUNTER_SYNC_EVENTS_ACKED: &str = "smartcampost_sync_events_acknowledged_total";
const COUNTER_SYNC_EVENTS_RETAINED: &str = "smartcampost_sync_events_retained_total";
const COUNTER_SYNC_ERRORS: &str = "smartcampost_sync_errors_total";
const COUNTER_VERIFICATIONS: &str = "smartcampost_qr_verifications_total";
const COUNTER_FORGERY: &str = "smartcampost_qr_forgery_suspected_total";
const COUNTER_SCANS_DEBOUNCED: &str = "smartcampost_scans_debounced_total";
const COUNTER_STREAM_MESSAGES: &str = "smartcampost_stream_messages_total";
const COUNTER_STREAM_DECODE_ERRORS: &str = "smartcampost_stream_decode_errors_total";

/// 安装 Prometheus Recorder 并在 `addr` 上暴露 `/metrics`。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if INSTALLED.get().is_some() {
        return Err("metrics already initialized".into());
    }
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    INSTALLED
        .set(addr)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 是否已初始化
pub fn is_initialized() -> bool {
    INSTALLED.get().is_some()
}

/// 更新离线队列深度（Gauge）。
pub fn record_queue_depth(depth: usize) {
    metrics::gauge!(GAUGE_QUEUE_DEPTH).set(depth as f64);
}

/// 记录一次本地存储写入失败。
pub fn record_storage_failure() {
    metrics::counter!(COUNTER_STORAGE_FAILURES).increment(1);
}

/// 记录一次完成的同步：被确认数与保留数。
pub fn record_sync_batch(acknowledged: usize, retained: usize) {
    metrics::counter!(COUNTER_SYNC_BATCHES).increment(1);
    metrics::counter!(COUNTER_SYNC_EVENTS_ACKED).increment(acknowledged as u64);
    metrics::counter!(COUNTER_SYNC_EVENTS_RETAINED).increment(retained as u64);
}

/// 记录一次没有拿到结果的同步（网络 / 超时 / 服务器错误）。
pub fn record_sync_error(retryable: bool) {
    metrics::counter!(COUNTER_SYNC_ERRORS, "retryable" => retryable.to_string()).increment(1);
}

/// 记录一次 QR 校验结论。
pub fn record_verification(outcome: &'static str) {
    metrics::counter!(COUNTER_VERIFICATIONS, "outcome" => outcome).increment(1);
}

/// 记录一次疑似伪造。
pub fn record_forgery() {
    metrics::counter!(COUNTER_FORGERY).increment(1);
}

/// 记录一次被防抖合并的扫描。
pub fn record_scan_debounced() {
    metrics::counter!(COUNTER_SCANS_DEBOUNCED).increment(1);
}

/// 记录一条实时流消息。
pub fn record_stream_message(event: &str) {
    metrics::counter!(COUNTER_STREAM_MESSAGES, "event" => event.to_string()).increment(1);
}

/// 记录一条无法解码、被丢弃的实时流消息。
pub fn record_stream_decode_error() {
    metrics::counter!(COUNTER_STREAM_DECODE_ERRORS).increment(1);
}
