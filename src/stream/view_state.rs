use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{GeoPoint, LiveScanEvent};

/// 最近事件列表的长度
const RECENT_CAPACITY: usize = 50;
/// 每个包裹时间线保留的事件数
pub const TIMELINE_CAPACITY: usize = 200;
/// 同时跟踪的包裹数，超出时淘汰最久没有更新的包裹
pub const MAX_TRACKED_PARCELS: usize = 1000;

/// 地图上某个包裹的当前位置
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMarker {
    pub parcel_id: String,
    pub tracking_ref: Option<String>,
    pub location: GeoPoint,
    pub event_type: String,
    pub location_note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ParcelView {
    timeline: Vec<LiveScanEvent>,
    marker: Option<MapMarker>,
    /// 最近一次更新的序号
    touched: u64,
}

/// 由实时事件驱动的视图状态
///
/// 每个事件都按点更新处理，不假设跨重连的全序：
/// 时间线按事件 ID 去重、按时间戳排序；地图标记以最后收到的事件为准。
/// 长时间运行时内存有界：时间线只保留最新的 [`TIMELINE_CAPACITY`] 条，
/// 包裹数超过 [`MAX_TRACKED_PARCELS`] 时淘汰最久没有更新的包裹。
#[derive(Debug)]
pub struct LiveViewState {
    parcels: HashMap<String, ParcelView>,
    recent: VecDeque<LiveScanEvent>,
    applied: u64,
    timeline_capacity: usize,
    max_parcels: usize,
}

impl Default for LiveViewState {
    fn default() -> Self {
        Self::with_limits(TIMELINE_CAPACITY, MAX_TRACKED_PARCELS)
    }
}

impl LiveViewState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(timeline_capacity: usize, max_parcels: usize) -> Self {
        Self {
            parcels: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            applied: 0,
            timeline_capacity: timeline_capacity.max(1),
            max_parcels: max_parcels.max(1),
        }
    }

    /// 应用一个事件；同一 ID 的重复事件返回 false
    ///
    /// 时间线已满且事件比其中所有事件都旧时同样忽略。
    pub fn apply(&mut self, event: LiveScanEvent) -> bool {
        if !self.parcels.contains_key(&event.parcel_id) && self.parcels.len() >= self.max_parcels {
            self.evict_stalest();
        }

        let sequence = self.applied + 1;
        let capacity = self.timeline_capacity;
        let parcel = self.parcels.entry(event.parcel_id.clone()).or_default();
        if parcel.timeline.iter().any(|e| e.id == event.id) {
            return false;
        }

        let position = parcel.timeline.partition_point(|e| e.timestamp <= event.timestamp);
        if position == 0 && parcel.timeline.len() >= capacity {
            return false;
        }
        parcel.timeline.insert(position, event.clone());
        if parcel.timeline.len() > capacity {
            let overflow = parcel.timeline.len() - capacity;
            parcel.timeline.drain(..overflow);
        }

        if let Some(location) = event.location() {
            parcel.marker = Some(MapMarker {
                parcel_id: event.parcel_id.clone(),
                tracking_ref: event.tracking_ref.clone(),
                location,
                event_type: event.event_type.clone(),
                location_note: event.location_note.clone(),
                timestamp: event.timestamp,
            });
        }
        parcel.touched = sequence;

        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_back();
        }
        self.recent.push_front(event);
        self.applied = sequence;
        true
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .parcels
            .iter()
            .min_by_key(|(_, parcel)| parcel.touched)
            .map(|(id, _)| id.clone());
        if let Some(id) = stalest {
            self.parcels.remove(&id);
        }
    }

    /// 包裹时间线（按时间升序）
    pub fn timeline(&self, parcel_id: &str) -> &[LiveScanEvent] {
        self.parcels
            .get(parcel_id)
            .map(|parcel| parcel.timeline.as_slice())
            .unwrap_or(&[])
    }

    pub fn marker(&self, parcel_id: &str) -> Option<&MapMarker> {
        self.parcels.get(parcel_id).and_then(|parcel| parcel.marker.as_ref())
    }

    pub fn markers(&self) -> impl Iterator<Item = &MapMarker> {
        self.parcels.values().filter_map(|parcel| parcel.marker.as_ref())
    }

    /// 最近收到的事件，新的在前
    pub fn recent(&self) -> impl Iterator<Item = &LiveScanEvent> {
        self.recent.iter()
    }

    pub fn parcel_count(&self) -> usize {
        self.parcels.len()
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }
}
