// 离线采集与同步模块
// 负责扫描事件的本地持久化队列、批量同步以及恢复在线后的自动同步

pub mod engine;
pub mod queue;
pub mod scheduler;
pub mod storage;

// 重新导出主要类型
pub use engine::{plan_reconciliation, ReconciliationPlan, SyncEngine, SyncEngineConfig, SyncOutcome, SyncReport};
pub use queue::{create_memory_queue, LocalEventQueue, Persistence, QueueStats, DEFAULT_STORAGE_KEY};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SyncScheduler};
pub use storage::{MemoryStorage, SledStorage, StorageBackend};
