use std::sync::Arc;

use tracing::info;

use crate::api::{HttpApiClient, HttpApiOptions, QrVerificationApi, ScanEventApi};
use crate::capture::CapturePipeline;
use crate::config::{ClientConfig, StorageKind};
use crate::error::{Result, ScanError};
use crate::infra::{ConnectivityMonitor, ProbeHandle, ReachabilityConfig, ReachabilityProbe};
use crate::offline::{
    LocalEventQueue, MemoryStorage, SchedulerHandle, SledStorage, StorageBackend, SyncEngine, SyncScheduler,
};
use crate::qr::{QrVerifier, ScanDebouncer};
use crate::scanner::{FixedLocation, LocationProvider, NoLocation};

/// 运行时使用的存储类型
pub type SharedStorage = Arc<dyn StorageBackend>;

/// 客户端上下文：按配置组装好的各组件
///
/// 所有组件共享同一个连通性监视器和同一个离线队列。
pub struct ClientContext {
    pub config: ClientConfig,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub queue: Arc<LocalEventQueue<SharedStorage>>,
    pub api: Arc<HttpApiClient>,
    pub verifier: Arc<QrVerifier>,
    pub engine: Arc<SyncEngine<SharedStorage>>,
    pub pipeline: CapturePipeline<SharedStorage>,
}

impl ClientContext {
    /// 按配置创建上下文
    ///
    /// `initially_online` 为 false 时监视器从离线状态开始，直到探测或调用方改变它。
    pub fn build(config: ClientConfig, initially_online: bool) -> Result<Self> {
        let storage = open_storage(&config)?;
        let queue = Arc::new(LocalEventQueue::open_with_key(storage, config.queue.storage_key.clone())?);
        info!("📦 Offline queue loaded: {} pending event(s)", queue.len());

        let base_url = config
            .api
            .base_url()
            .map_err(|e| ScanError::Configuration(e.to_string()))?;
        let api = Arc::new(HttpApiClient::new(HttpApiOptions {
            base_url,
            auth_token: config.api.auth_token.clone(),
            request_timeout: config.api.request_timeout(),
            connect_timeout: config.api.connect_timeout(),
        })?);

        let connectivity = Arc::new(ConnectivityMonitor::new(initially_online));
        let verifier = Arc::new(QrVerifier::new(
            api.clone() as Arc<dyn QrVerificationApi>,
            config.api.verify_timeout(),
        ));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            api.clone() as Arc<dyn ScanEventApi>,
            connectivity.clone(),
            config.sync_engine_config(),
        ));

        let location: Arc<dyn LocationProvider> = match (config.scanner.latitude, config.scanner.longitude) {
            (Some(latitude), Some(longitude)) => Arc::new(FixedLocation::new(latitude, longitude)),
            _ => Arc::new(NoLocation),
        };

        let pipeline = CapturePipeline::new(
            verifier.clone(),
            ScanDebouncer::new(config.scanner.debounce_window_ms),
            queue.clone(),
            api.clone() as Arc<dyn ScanEventApi>,
            connectivity.clone(),
            location,
            config.capture_config(),
        );

        Ok(Self {
            config,
            connectivity,
            queue,
            api,
            verifier,
            engine,
            pipeline,
        })
    }

    /// 启动后台可达性探测
    pub fn spawn_probe(&self) -> Result<ProbeHandle> {
        let base_url = self.api.base_url().clone();
        let probe = ReachabilityProbe::new(
            &base_url,
            ReachabilityConfig {
                interval: std::time::Duration::from_secs(self.config.sync.probe_interval_secs.max(1)),
                connect_timeout: self.config.api.connect_timeout(),
            },
            self.connectivity.clone(),
        )?;
        Ok(probe.spawn())
    }

    /// 探测一次后端可达性
    pub async fn probe_now(&self) -> Result<bool> {
        let probe = ReachabilityProbe::new(
            self.api.base_url(),
            ReachabilityConfig {
                connect_timeout: self.config.api.connect_timeout(),
                ..ReachabilityConfig::default()
            },
            self.connectivity.clone(),
        )?;
        Ok(probe.probe_once().await)
    }

    /// 启动自动同步调度器
    pub fn start_scheduler(&self) -> SchedulerHandle {
        SyncScheduler::new(
            self.engine.clone(),
            self.connectivity.clone(),
            self.config.scheduler_config(),
        )
        .start()
    }
}

fn open_storage(config: &ClientConfig) -> Result<SharedStorage> {
    match config.queue.storage {
        StorageKind::Sled => {
            std::fs::create_dir_all(&config.queue.data_dir).map_err(|e| {
                ScanError::Storage(format!(
                    "Failed to create data dir {}: {}",
                    config.queue.data_dir.display(),
                    e
                ))
            })?;
            Ok(Arc::new(SledStorage::open(&config.queue.data_dir)?))
        }
        StorageKind::Memory => {
            info!("💾 Using in-memory storage, queued events will not survive a restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}
