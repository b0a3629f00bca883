// Infrastructure layer - 基础设施层
// 负责运行时信号与观测：连通性、可达性探测、监控指标

pub mod connectivity;
pub mod metrics;
pub mod reachability;

// 重新导出主要类型
pub use connectivity::{ConnectivityMonitor, ConnectivityTransition};
pub use reachability::{ProbeHandle, ReachabilityConfig, ReachabilityProbe};
