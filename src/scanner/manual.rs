use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use crate::error::{Result, ScanError};
use super::device::{CaptureDevice, DeviceInfo, Facing};

/// 手动输入设备
///
/// 从任意按行读取的输入源（终端 stdin、扫码枪的键盘输入、测试用的字节串）读取扫码文本。
/// 空行忽略，行尾换行去掉，其余内容原样交给解析器。
pub struct ManualEntryDevice<R> {
    id: String,
    reader: R,
    active: bool,
}

impl<R> ManualEntryDevice<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(id: impl Into<String>, reader: R) -> Self {
        Self {
            id: id.into(),
            reader,
            active: false,
        }
    }
}

#[async_trait]
impl<R> CaptureDevice for ManualEntryDevice<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            label: format!("Manual entry ({})", self.id),
            facing: Facing::External,
        }
    }

    async fn start(&mut self) -> Result<()> {
        self.active = true;
        debug!("Manual entry device {} started", self.id);
        Ok(())
    }

    async fn next_decoded(&mut self) -> Result<Option<String>> {
        if !self.active {
            return Err(ScanError::Device(format!("Device {} is not started", self.id)));
        }

        let mut line = String::new();
        loop {
            line.clear();
            let read = self.reader.read_line(&mut line).await?;
            if read == 0 {
                return Ok(None);
            }

            let text = line.trim_end_matches(['\r', '\n']);
            if !text.trim().is_empty() {
                return Ok(Some(text.to_string()));
            }
        }
    }

    fn stop(&mut self) {
        if self.active {
            debug!("Manual entry device {} stopped", self.id);
        }
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
