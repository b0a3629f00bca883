use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::{GeoPoint, LocationSource};

/// 一次定位结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub point: GeoPoint,
    pub source: LocationSource,
    pub at: DateTime<Utc>,
}

/// 定位来源
///
/// 只用于给扫描事件打上采集位置，拿不到位置时返回 `None`，不阻塞采集。
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current(&self) -> Option<LocationFix>;
}

/// 固定位置（配置文件中的网点坐标）
pub struct FixedLocation {
    point: GeoPoint,
}

impl FixedLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            point: GeoPoint { latitude, longitude },
        }
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current(&self) -> Option<LocationFix> {
        Some(LocationFix {
            point: self.point,
            source: LocationSource::Manual,
            at: Utc::now(),
        })
    }
}

/// 没有定位能力
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current(&self) -> Option<LocationFix> {
        None
    }
}

/// 持续定位：后台周期读取，保留最近一次结果
pub struct LocationWatch {
    receiver: watch::Receiver<Option<LocationFix>>,
    handle: JoinHandle<()>,
}

impl LocationWatch {
    pub fn spawn(provider: Arc<dyn LocationProvider>, interval: Duration) -> Self {
        let (sender, receiver) = watch::channel(None);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Some(fix) = provider.current().await {
                    debug!("Location updated: {:?}", fix.point);
                    if sender.send(Some(fix)).is_err() {
                        break;
                    }
                }
            }
        });
        Self { receiver, handle }
    }

    /// 最近一次定位
    pub fn latest(&self) -> Option<LocationFix> {
        *self.receiver.borrow()
    }
}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
