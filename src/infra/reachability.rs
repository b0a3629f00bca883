use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, ScanError};
use super::connectivity::ConnectivityMonitor;

/// 可达性探测配置
#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    /// 探测间隔
    pub interval: Duration,
    /// 单次连接超时
    pub connect_timeout: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// 网络可达性信号源
///
/// 命令行环境下没有浏览器的 online/offline 事件，这里用到 API 主机的 TCP 连接结果
/// 作为运行时信号喂给 [`ConnectivityMonitor`]，状态去重由监视器负责。
pub struct ReachabilityProbe {
    target: String,
    config: ReachabilityConfig,
    monitor: Arc<ConnectivityMonitor>,
}

impl ReachabilityProbe {
    pub fn new(api_base_url: &Url, config: ReachabilityConfig, monitor: Arc<ConnectivityMonitor>) -> Result<Self> {
        let host = api_base_url
            .host_str()
            .ok_or_else(|| ScanError::Configuration(format!("API URL has no host: {}", api_base_url)))?;
        let port = api_base_url
            .port_or_known_default()
            .ok_or_else(|| ScanError::Configuration(format!("API URL has no port: {}", api_base_url)))?;

        Ok(Self {
            target: format!("{}:{}", host, port),
            config,
            monitor,
        })
    }

    /// 探测一次并上报结果
    pub async fn probe_once(&self) -> bool {
        let reachable = matches!(
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.target)).await,
            Ok(Ok(_))
        );
        debug!("Reachability probe {} -> {}", self.target, reachable);
        self.monitor.set_online(reachable);
        reachable
    }

    /// 后台周期探测；返回的句柄被 drop 时停止
    pub fn spawn(self) -> ProbeHandle {
        info!("Starting reachability probe for {}", self.target);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                ticker.tick().await;
                self.probe_once().await;
            }
        });
        ProbeHandle { handle }
    }
}

/// 探测任务句柄
pub struct ProbeHandle {
    handle: JoinHandle<()>,
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
