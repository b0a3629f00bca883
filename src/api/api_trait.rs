use async_trait::async_trait;

use crate::error::Result;
use crate::model::{LiveScanEvent, ScanEvent, SyncBatch, SyncResult, VerificationResult};

/// 扫描事件远程接口
///
/// 后端视为黑盒服务边界，这里只描述核心逻辑需要的契约。
#[async_trait]
pub trait ScanEventApi: Send + Sync {
    /// 批量同步离线事件（`POST /offline/sync`）
    async fn sync_offline(&self, batch: &SyncBatch) -> Result<SyncResult>;

    /// 在线时直接上报单条事件（`POST /scan-events`）
    async fn record(&self, event: &ScanEvent) -> Result<LiveScanEvent>;
}

/// QR 码服务端校验接口
#[async_trait]
pub trait QrVerificationApi: Send + Sync {
    /// 校验扫描到的原始文本（`GET /qr/verify/{content}`）
    async fn verify(&self, raw_content: &str) -> Result<VerificationResult>;
}
