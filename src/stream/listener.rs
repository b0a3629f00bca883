use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::infra::metrics;
use crate::model::LiveScanEvent;
use super::sse::{SseDecoder, SseMessage, DEFAULT_EVENT};

/// 扫描事件的事件名
pub const SCAN_EVENT: &str = "scan-event";

/// 事件处理函数
pub type EventHandler = Arc<dyn Fn(&LiveScanEvent) + Send + Sync>;

/// 订阅结束原因
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// 服务器正常关闭连接
    Closed,
    /// 传输错误；是否重新订阅由调用方决定
    TransportError(ScanError),
}

/// 监听统计
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    decode_errors: AtomicU64,
    unhandled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub decode_errors: u64,
    pub unhandled: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// 实时事件流监听器
///
/// 同一条连接上可以有多个具名事件，按事件名分发给已注册的处理函数。
/// 无法解码的消息记录日志后丢弃，不影响后续消息。
#[derive(Default)]
pub struct StreamListener {
    handlers: HashMap<String, Vec<EventHandler>>,
    stats: Arc<ListenerStats>,
}

impl StreamListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册事件处理函数
    pub fn on<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&LiveScanEvent) + Send + Sync + 'static,
    {
        self.handlers.entry(event.into()).or_default().push(Arc::new(handler));
        self
    }

    /// 同一个处理函数同时挂到 `scan-event` 和通用 `message` 上
    pub fn on_scan_events<F>(self, handler: F) -> Self
    where
        F: Fn(&LiveScanEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        let for_default = handler.clone();
        self.on(SCAN_EVENT, move |e: &LiveScanEvent| handler(e))
            .on(DEFAULT_EVENT, move |e: &LiveScanEvent| for_default(e))
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    /// 处理一条完整的消息，返回是否交给了处理函数
    pub fn dispatch(&self, message: &SseMessage) -> bool {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::record_stream_message(&message.event);

        let Some(handlers) = self.handlers.get(&message.event) else {
            debug!("No handler for stream event '{}'", message.event);
            self.stats.unhandled.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let event: LiveScanEvent = match serde_json::from_str(&message.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Discarding malformed '{}' stream message: {} (data: {})",
                    message.event, e, message.data
                );
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_stream_decode_error();
                return false;
            }
        };

        for handler in handlers {
            handler(&event);
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 消费字节流直到结束或出错
    pub async fn run<S>(&self, mut stream: S) -> StreamEnd
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for message in decoder.feed(&bytes) {
                        self.dispatch(&message);
                    }
                }
                Err(e) => {
                    warn!("Scan event stream transport error, closing subscription: {}", e);
                    return StreamEnd::TransportError(e);
                }
            }
        }

        info!("Scan event stream closed by server");
        StreamEnd::Closed
    }

    /// 在后台任务中消费字节流
    pub fn subscribe<S>(self, stream: S) -> Subscription
    where
        S: Stream<Item = Result<Bytes>> + Unpin + Send + 'static,
    {
        let stats = self.stats.clone();
        let handle = tokio::spawn(async move { self.run(stream).await });
        Subscription {
            handle: Some(handle),
            stats,
        }
    }
}

/// 后台订阅句柄；drop 时关闭订阅
pub struct Subscription {
    handle: Option<JoinHandle<StreamEnd>>,
    stats: Arc<ListenerStats>,
}

impl Subscription {
    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }

    /// 等待订阅结束
    pub async fn closed(mut self) -> StreamEnd {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| StreamEnd::TransportError(ScanError::Internal(format!("Stream task failed: {}", e)))),
            None => StreamEnd::Closed,
        }
    }

    /// 主动关闭
    pub fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use parking_lot::Mutex;

    fn chunks(parts: Vec<Result<String>>) -> impl Stream<Item = Result<Bytes>> + Unpin + Send + 'static {
        stream::iter(
            parts
                .into_iter()
                .map(|p| p.map(Bytes::from))
                .collect::<Vec<_>>(),
        )
    }

    const VALID: &str = r#"{"id":"e-1","parcelId":"P1","eventType":"DELIVERED","timestamp":"2026-03-01T08:00:00Z"}"#;

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = StreamListener::new().on(SCAN_EVENT, move |e| sink.lock().push(e.id.clone()));
        let stats = listener.stats();

        let body = format!("event: scan-event\ndata: {{not json\n\nevent: scan-event\ndata: {}\n\n", VALID);
        let end = listener.run(chunks(vec![Ok(body)])).await;

        assert!(matches!(end, StreamEnd::Closed));
        assert_eq!(*seen.lock(), vec!["e-1".to_string()]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.dispatched, 1);
    }

    #[tokio::test]
    async fn test_dispatch_by_event_name() {
        let scans = Arc::new(AtomicU64::new(0));
        let counter = scans.clone();
        let listener = StreamListener::new().on(SCAN_EVENT, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let unknown = SseMessage {
            event: "heartbeat".to_string(),
            data: VALID.to_string(),
            id: None,
        };
        assert!(!listener.dispatch(&unknown));

        let scan = SseMessage {
            event: SCAN_EVENT.to_string(),
            data: VALID.to_string(),
            id: None,
        };
        assert!(listener.dispatch(&scan));
        assert_eq!(scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_generic_message_handled_like_scan_event() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let listener = StreamListener::new().on_scan_events(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let body = format!("data: {}\n\n", VALID);
        listener.run(chunks(vec![Ok(body)])).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_ends_subscription() {
        let listener = StreamListener::new().on_scan_events(|_| {});
        let subscription = listener.subscribe(chunks(vec![
            Ok(": hello\n\n".to_string()),
            Err(ScanError::Network("connection reset".to_string())),
            Ok("data: never read\n\n".to_string()),
        ]));

        let end = subscription.closed().await;
        assert!(matches!(end, StreamEnd::TransportError(ScanError::Network(_))));
    }
}
