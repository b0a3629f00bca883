use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::info;

/// 在线状态变化通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityTransition {
    pub online: bool,
    pub at: DateTime<Utc>,
}

impl ConnectivityTransition {
    /// 离线 → 在线
    pub fn came_online(&self) -> bool {
        self.online
    }
}

/// 网络连通性监视器
///
/// 只暴露一个布尔信号，由运行时的可达性事件驱动（不轮询）。
/// 每次状态真正变化时广播且只广播一次；状态不变的重复上报不会产生通知。
/// 操作系统认为可达但实际链路不通属于预期内的误报，表现为普通的请求失败。
pub struct ConnectivityMonitor {
    online: AtomicBool,
    sender: broadcast::Sender<ConnectivityTransition>,
}

impl ConnectivityMonitor {
    /// 创建监视器并设置初始状态（初始状态不产生通知）
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            online: AtomicBool::new(initially_online),
            sender,
        }
    }

    /// 当前是否在线
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// 上报一次可达性信号，返回状态是否发生了变化
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }

        info!(
            "Connectivity changed: {}",
            if online { "offline -> online" } else { "online -> offline" }
        );
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.sender.send(ConnectivityTransition {
            online,
            at: Utc::now(),
        });
        true
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityTransition> {
        self.sender.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn test_notifies_once_per_change() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));

        let first = rx.recv().await.unwrap();
        assert!(!first.online);
        let second = rx.recv().await.unwrap();
        assert!(second.came_online());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(monitor.is_online());
    }

    #[test]
    fn test_set_without_subscribers_does_not_panic() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(monitor.set_online(true));
        assert!(monitor.is_online());
    }
}
