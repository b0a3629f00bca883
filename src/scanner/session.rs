use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use super::device::{CaptureDevice, DeviceInfo};

/// 保留的扫描历史条数
pub const HISTORY_CAPACITY: usize = 10;

/// 扫描模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// 第一次成功识别后自动停止
    #[default]
    Single,
    /// 持续扫描直到显式停止
    Continuous,
}

/// 一条扫描历史
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub raw_text: String,
    pub success: bool,
    pub tracking_ref: Option<String>,
    pub message: String,
    pub scanned_at: DateTime<Utc>,
}

/// 扫描会话
///
/// 持有设备的唯一方式。`stop`、drop、启动失败、读取出错四条路径都会释放设备。
pub struct ScanSession {
    device: Box<dyn CaptureDevice>,
    info: DeviceInfo,
    mode: ScanMode,
    history: VecDeque<ScanRecord>,
}

impl ScanSession {
    /// 占用设备并开始扫描；启动失败时设备已被释放
    pub async fn start(mut device: Box<dyn CaptureDevice>, mode: ScanMode) -> Result<Self> {
        let info = device.info();
        if let Err(e) = device.start().await {
            warn!("Failed to start capture device {}: {}", info.id, e);
            device.stop();
            return Err(e);
        }

        info!("Scan session started on {} ({:?} mode)", info.label, mode);
        Ok(Self {
            device,
            info,
            mode,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        })
    }

    /// 等待下一次解码；会话已停止或设备关闭时返回 `None`
    pub async fn next_decoded(&mut self) -> Result<Option<String>> {
        if !self.device.is_active() {
            return Ok(None);
        }

        match self.device.next_decoded().await {
            Ok(Some(text)) => Ok(Some(text)),
            Ok(None) => {
                self.stop();
                Ok(None)
            }
            Err(e) => {
                warn!("Capture device {} failed: {}", self.info.id, e);
                self.stop();
                Err(e)
            }
        }
    }

    /// 记录一次扫描结果；单次模式下成功后自动停止
    pub fn record(&mut self, record: ScanRecord) {
        let success = record.success;
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_back();
        }
        self.history.push_front(record);

        if success && self.mode == ScanMode::Single {
            self.stop();
        }
    }

    /// 最近的扫描记录，新的在前
    pub fn history(&self) -> impl Iterator<Item = &ScanRecord> {
        self.history.iter()
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        self.device.is_active()
    }

    /// 停止扫描并释放设备（可重复调用）
    pub fn stop(&mut self) {
        if self.device.is_active() {
            info!("Scan session on {} stopped", self.info.label);
        }
        self.device.stop();
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.device.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::scanner::device::Facing;
    use crate::scanner::manual::ManualEntryDevice;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// 记录是否被释放的设备
    struct ProbeDevice {
        active: bool,
        fail_start: bool,
        fail_read: bool,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CaptureDevice for ProbeDevice {
        fn info(&self) -> DeviceInfo {
            DeviceInfo {
                id: "probe".to_string(),
                label: "probe".to_string(),
                facing: Facing::Environment,
            }
        }
        async fn start(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(ScanError::Device("camera busy".to_string()));
            }
            self.active = true;
            Ok(())
        }
        async fn next_decoded(&mut self) -> Result<Option<String>> {
            if self.fail_read {
                return Err(ScanError::Device("frame read failed".to_string()));
            }
            Ok(Some("SCP-000001".to_string()))
        }
        fn stop(&mut self) {
            self.active = false;
            self.released.store(true, Ordering::SeqCst);
        }
        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn probe(fail_start: bool, fail_read: bool) -> (Box<dyn CaptureDevice>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let device = ProbeDevice {
            active: false,
            fail_start,
            fail_read,
            released: released.clone(),
        };
        (Box::new(device), released)
    }

    fn record(success: bool) -> ScanRecord {
        ScanRecord {
            raw_text: "SCP-000001".to_string(),
            success,
            tracking_ref: None,
            message: String::new(),
            scanned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let (device, released) = probe(false, false);
        let session = ScanSession::start(device, ScanMode::Continuous).await.unwrap();
        assert!(!released.load(Ordering::SeqCst));
        drop(session);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_released_on_start_error() {
        let (device, released) = probe(true, false);
        assert!(ScanSession::start(device, ScanMode::Single).await.is_err());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_released_on_read_error() {
        let (device, released) = probe(false, true);
        let mut session = ScanSession::start(device, ScanMode::Continuous).await.unwrap();
        assert!(session.next_decoded().await.is_err());
        assert!(released.load(Ordering::SeqCst));
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_single_mode_stops_after_success() {
        let (device, released) = probe(false, false);
        let mut session = ScanSession::start(device, ScanMode::Single).await.unwrap();

        session.record(record(false));
        assert!(session.is_active());
        session.record(record(true));
        assert!(!session.is_active());
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(session.next_decoded().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_history_keeps_last_ten() {
        let device = Box::new(ManualEntryDevice::new("stdin", &b""[..]));
        let mut session = ScanSession::start(device, ScanMode::Continuous).await.unwrap();
        for i in 0..12 {
            let mut r = record(true);
            r.raw_text = format!("SCP-{:06}", i);
            session.record(r);
        }

        let history: Vec<&ScanRecord> = session.history().collect();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].raw_text, "SCP-000011");
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_end_of_input_stops_session() {
        let device = Box::new(ManualEntryDevice::new("stdin", &b"SCP-000001\n"[..]));
        let mut session = ScanSession::start(device, ScanMode::Continuous).await.unwrap();
        assert_eq!(session.next_decoded().await.unwrap().as_deref(), Some("SCP-000001"));
        assert_eq!(session.next_decoded().await.unwrap(), None);
        assert!(!session.is_active());
    }
}
