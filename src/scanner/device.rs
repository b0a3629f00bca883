use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Result, ScanError};

/// 摄像头朝向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// 后置（扫描包裹时优先）
    Environment,
    /// 前置
    User,
    /// 非摄像头设备（手动输入、扫码枪）
    External,
}

/// 采集设备信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub facing: Facing,
}

/// 扫码采集设备
///
/// `stop` 是同步且幂等的：会话在 drop 时也要能释放设备。
#[async_trait]
pub trait CaptureDevice: Send {
    fn info(&self) -> DeviceInfo;

    /// 占用设备并开始采集
    async fn start(&mut self) -> Result<()>;

    /// 等待下一次成功解码的文本；设备关闭时返回 `None`
    async fn next_decoded(&mut self) -> Result<Option<String>>;

    /// 释放设备
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

type DeviceFactory = Box<dyn Fn() -> Box<dyn CaptureDevice> + Send + Sync>;

/// 可用采集设备列表
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<(DeviceInfo, DeviceFactory)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, info: DeviceInfo, factory: F)
    where
        F: Fn() -> Box<dyn CaptureDevice> + Send + Sync + 'static,
    {
        self.devices.push((info, Box::new(factory)));
    }

    /// 枚举设备
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|(info, _)| info.clone()).collect()
    }

    /// 默认设备：优先后置摄像头，否则第一个
    pub fn preferred(&self) -> Option<&DeviceInfo> {
        self.devices
            .iter()
            .map(|(info, _)| info)
            .find(|info| info.facing == Facing::Environment)
            .or_else(|| self.devices.first().map(|(info, _)| info))
    }

    /// 按朝向挑选（切换前后摄像头）
    pub fn with_facing(&self, facing: Facing) -> Option<&DeviceInfo> {
        self.devices.iter().map(|(info, _)| info).find(|info| info.facing == facing)
    }

    pub fn open(&self, id: &str) -> Result<Box<dyn CaptureDevice>> {
        self.devices
            .iter()
            .find(|(info, _)| info.id == id)
            .map(|(_, factory)| factory())
            .ok_or_else(|| ScanError::Device(format!("No capture device with id {}", id)))
    }

    pub fn open_preferred(&self) -> Result<Box<dyn CaptureDevice>> {
        let id = self
            .preferred()
            .map(|info| info.id.clone())
            .ok_or_else(|| ScanError::Device("No capture devices available".to_string()))?;
        self.open(&id)
    }
}
