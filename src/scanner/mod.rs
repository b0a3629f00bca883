// 扫码采集模块
// 负责采集设备抽象、扫描会话的生命周期以及采集位置

pub mod device;
pub mod location;
pub mod manual;
pub mod session;

pub use device::{CaptureDevice, DeviceInfo, DeviceRegistry, Facing};
pub use location::{FixedLocation, LocationFix, LocationProvider, LocationWatch, NoLocation};
pub use manual::ManualEntryDevice;
pub use session::{ScanMode, ScanRecord, ScanSession, HISTORY_CAPACITY};
