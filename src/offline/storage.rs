use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{Result, ScanError};

/// 本地持久化键值存储 Trait
///
/// 接口是同步的：入队不能挂起，每次写入返回前必须已经落盘。
pub trait StorageBackend: Send + Sync {
    /// 读取键对应的值
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 写入并刷盘
    fn store(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 删除键
    fn remove(&self, key: &str) -> Result<()>;

    /// 健康检查
    fn health_check(&self) -> Result<()>;
}

impl<S: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<S> {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).load(key)
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).store(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn health_check(&self) -> Result<()> {
        (**self).health_check()
    }
}

/// 内存存储后端（用于测试和开发）
///
/// 多个队列实例共享同一个 `Arc<MemoryStorage>` 即可模拟进程重启。
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        debug!("Stored {} bytes under {}", value.len(), key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        // 内存存储总是健康的
        Ok(())
    }
}

/// Sled 数据库存储后端
pub struct SledStorage {
    /// Sled 数据库实例
    db: sled::Db,
    /// 数据库路径
    path: String,
}

impl SledStorage {
    /// 打开（或创建）Sled 存储
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| ScanError::Storage(format!("Failed to open sled database: {}", e)))?;

        info!("Opened Sled database at: {}", path.display());

        Ok(Self {
            db,
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl StorageBackend for SledStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key)
            .map_err(|e| ScanError::Storage(format!("Failed to read {}: {}", key, e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| ScanError::Storage(format!("Failed to write {}: {}", key, e)))?;
        self.db
            .flush()
            .map_err(|e| ScanError::Storage(format!("Failed to flush {}: {}", key, e)))?;

        debug!("Stored {} bytes under {} in Sled", value.len(), key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db
            .remove(key)
            .map_err(|e| ScanError::Storage(format!("Failed to delete {}: {}", key, e)))?;
        self.db.flush()?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        // 尝试写入和读取一个测试键
        let test_key = "health_check";
        let test_value = b"ok";

        self.db
            .insert(test_key, test_value)
            .map_err(|e| ScanError::Storage(format!("Health check write failed: {}", e)))?;

        let retrieved = self
            .db
            .get(test_key)
            .map_err(|e| ScanError::Storage(format!("Health check read failed: {}", e)))?;

        if retrieved.as_deref() != Some(test_value.as_slice()) {
            return Err(ScanError::Storage("Health check value mismatch".to_string()));
        }

        self.db
            .remove(test_key)
            .map_err(|e| ScanError::Storage(format!("Health check cleanup failed: {}", e)))?;

        Ok(())
    }
}
