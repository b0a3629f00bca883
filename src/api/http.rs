use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};
use url::Url;

use crate::error::{Result, ScanError};
use crate::model::{
    LiveScanEvent, ScanEvent, ScanEventCreateRequest, SyncBatch, SyncResult, VerificationResult,
};
use super::api_trait::{QrVerificationApi, ScanEventApi};

/// HTTP 客户端参数
#[derive(Debug, Clone)]
pub struct HttpApiOptions {
    /// API 基础地址，例如 `https://api.smartcampost.cm/api`
    pub base_url: Url,
    /// Bearer token（可选）
    pub auth_token: Option<String>,
    /// 普通请求的总超时
    pub request_timeout: Duration,
    /// 建立连接的超时（实时流只受这个限制）
    pub connect_timeout: Duration,
}

/// SmartCAMPOST REST 客户端
///
/// 普通请求和实时流使用两个 `reqwest::Client`：
/// 实时流是长连接，不能套用请求总超时。
pub struct HttpApiClient {
    client: Client,
    stream_client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpApiClient {
    pub fn new(options: HttpApiOptions) -> Result<Self> {
        if options.base_url.cannot_be_a_base() {
            return Err(ScanError::Configuration(format!(
                "API base URL cannot be a base: {}",
                options.base_url
            )));
        }

        let client = Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| ScanError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let stream_client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| ScanError::Configuration(format!("Failed to build stream client: {}", e)))?;

        Ok(Self {
            client,
            stream_client,
            base_url: options.base_url,
            auth_token: options.auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// 拼接接口地址，每个片段单独做百分号编码
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ScanError::Configuration(format!("Invalid API base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// 非 2xx 转成 `ScanError::Http`，2xx 解析 JSON
    async fn decode<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("[API] {} failed: status={}, body={}", operation, status, body);
            return Err(ScanError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ScanError::Serialization(format!("{} returned an unexpected body: {}", operation, e)))
    }

    /// 打开实时扫描事件流（`GET /stream/scans`），返回原始字节流
    pub async fn open_scan_stream(&self) -> Result<BoxStream<'static, Result<Bytes>>> {
        let url = self.endpoint(&["stream", "scans"])?;
        info!("[API] Opening scan event stream: {}", url);

        let response = self
            .authorize(self.stream_client.get(url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ScanError::from))
            .boxed())
    }
}

#[async_trait]
impl ScanEventApi for HttpApiClient {
    async fn sync_offline(&self, batch: &SyncBatch) -> Result<SyncResult> {
        let url = self.endpoint(&["offline", "sync"])?;
        info!(
            "[API] Syncing offline batch: batch_id={}, events={}",
            batch.batch_id,
            batch.len()
        );

        let response = self.authorize(self.client.post(url)).json(batch).send().await?;
        let result: SyncResult = Self::decode(response, "offline sync").await?;

        debug!(
            "[API] Sync result: batch_id={}, total={}, success={}, failures={}",
            batch.batch_id,
            result.total_events,
            result.success_count,
            result.failures.len()
        );
        Ok(result)
    }

    async fn record(&self, event: &ScanEvent) -> Result<LiveScanEvent> {
        let url = self.endpoint(&["scan-events"])?;
        let body = ScanEventCreateRequest::from(event);

        let response = self.authorize(self.client.post(url)).json(&body).send().await?;
        let recorded: LiveScanEvent = Self::decode(response, "record scan event").await?;

        info!(
            "[API] Recorded scan event: id={}, parcel_id={}, type={}",
            recorded.id, recorded.parcel_id, recorded.event_type
        );
        Ok(recorded)
    }
}

#[async_trait]
impl QrVerificationApi for HttpApiClient {
    async fn verify(&self, raw_content: &str) -> Result<VerificationResult> {
        let url = self.endpoint(&["qr", "verify", raw_content])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        Self::decode(response, "QR verification").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpApiClient {
        HttpApiClient::new(HttpApiOptions {
            base_url: Url::parse(base).unwrap(),
            auth_token: None,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let api = client("http://localhost:8080/api/");
        assert_eq!(
            api.endpoint(&["offline", "sync"]).unwrap().as_str(),
            "http://localhost:8080/api/offline/sync"
        );

        let api = client("http://localhost:8080/api");
        assert_eq!(
            api.endpoint(&["stream", "scans"]).unwrap().as_str(),
            "http://localhost:8080/api/stream/scans"
        );
    }

    #[test]
    fn test_endpoint_encodes_raw_qr_content() {
        let api = client("http://localhost:8080/api");
        let url = api.endpoint(&["qr", "verify", "V1|P|tok/en|REF|1|sig"]).unwrap();
        assert!(url.path().starts_with("/api/qr/verify/"));
        assert!(!url.path()["/api/qr/verify/".len()..].contains('/'));
    }

    #[test]
    fn test_rejects_non_base_url() {
        let result = HttpApiClient::new(HttpApiOptions {
            base_url: Url::parse("mailto:ops@smartcampost.cm").unwrap(),
            auth_token: None,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
        });
        assert!(result.is_err());
    }
}
