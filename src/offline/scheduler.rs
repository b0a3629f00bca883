use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infra::ConnectivityMonitor;
use super::engine::{SyncEngine, SyncOutcome};
use super::storage::StorageBackend;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 恢复在线时自动同步
    pub sync_on_reconnect: bool,
    /// 在线期间的周期重试间隔（`None` 表示不做周期重试）
    pub retry_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_on_reconnect: true,
            retry_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// 自动同步调度器
///
/// 监听连通性变化：离线 → 在线且队列非空时触发一次同步。
/// 可选的周期重试覆盖服务器 5xx 等留下的积压。并发保护由 [`SyncEngine`] 负责。
pub struct SyncScheduler<S: StorageBackend + 'static> {
    engine: Arc<SyncEngine<S>>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SchedulerConfig,
}

impl<S: StorageBackend + 'static> SyncScheduler<S> {
    pub fn new(engine: Arc<SyncEngine<S>>, connectivity: Arc<ConnectivityMonitor>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            connectivity,
            config,
        }
    }

    /// 启动后台任务
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transitions = self.connectivity.subscribe();

        info!(
            "Starting sync scheduler (sync_on_reconnect={}, retry_interval={:?})",
            self.config.sync_on_reconnect, self.config.retry_interval
        );

        let handle = tokio::spawn(self.run(transitions, shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            handle: Some(handle),
        }
    }

    async fn run(
        self,
        mut transitions: broadcast::Receiver<crate::infra::ConnectivityTransition>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // 启动时已在线且有积压，先同步一次
        if self.config.sync_on_reconnect && self.connectivity.is_online() {
            self.trigger("startup").await;
        }

        let mut retry = self.config.retry_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                transition = transitions.recv() => {
                    match transition {
                        Ok(t) if t.came_online() && self.config.sync_on_reconnect => {
                            self.trigger("reconnect").await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Sync scheduler missed {} connectivity transitions", skipped);
                            if self.connectivity.is_online() {
                                self.trigger("reconnect").await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = async {
                    match retry.as_mut() {
                        Some(ticker) => { ticker.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if self.connectivity.is_online() {
                        self.trigger("retry").await;
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn trigger(&self, reason: &str) {
        loop {
            if self.engine.pending_count() == 0 {
                return;
            }

            match self.engine.sync_now().await {
                Ok(SyncOutcome::AlreadySyncing) => {
                    // 正在进行的同步只提交了它的快照，结束后重新检查积压
                    debug!("Auto sync ({}) deferred until the running sync finishes", reason);
                    self.engine.wait_idle().await;
                }
                Ok(SyncOutcome::Completed(report)) => {
                    info!(
                        "Auto sync ({}) done: {} acknowledged, {} retained",
                        reason, report.acknowledged, report.retained
                    );
                    return;
                }
                Ok(other) => {
                    debug!("Auto sync ({}) skipped: {:?}", reason, other);
                    return;
                }
                Err(e) => {
                    warn!("Auto sync ({}) failed: {}", reason, e);
                    return;
                }
            }
        }
    }
}

/// 调度器句柄；drop 时停止后台任务
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// 请求停止并等待后台任务退出
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
