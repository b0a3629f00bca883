// 实时事件流模块
// 负责订阅服务端推送的扫描事件并更新客户端视图状态

pub mod listener;
pub mod sse;
pub mod view_state;

pub use listener::{
    EventHandler, ListenerStats, ListenerStatsSnapshot, StreamEnd, StreamListener, Subscription, SCAN_EVENT,
};
pub use sse::{SseDecoder, SseMessage, DEFAULT_EVENT};
pub use view_state::{LiveViewState, MapMarker};
