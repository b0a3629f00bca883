//! 数据模型模块

// 扫描事件
pub mod scan_event;

// 离线同步批次与结果
pub mod sync;

// QR 码载荷与校验结果
pub mod qrcode;

// 重新导出常用类型
pub use qrcode::*;
pub use scan_event::*;
pub use sync::*;
