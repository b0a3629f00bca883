use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::infra::metrics;

/// 默认防抖窗口（毫秒）
pub const DEFAULT_DEBOUNCE_WINDOW_MS: i64 = 2000;

/// 距离上一次接受是否仍在窗口内
///
/// 纯函数：不读时钟。时钟回拨（`now < last`）也视为窗口内。
pub fn is_within_window(last_accepted_ms: Option<i64>, now_ms: i64, window_ms: i64) -> bool {
    match last_accepted_ms {
        Some(last) => now_ms - last < window_ms,
        None => false,
    }
}

/// 扫描防抖器
///
/// 以解码出的文本为键，只在接受时更新时间戳；被合并掉的重复扫描不会延长窗口。
pub struct ScanDebouncer {
    window_ms: i64,
    last_accepted: DashMap<String, i64>,
}

impl ScanDebouncer {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            last_accepted: DashMap::new(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// 判断本次扫描是否应当处理；返回 true 时记录时间戳
    ///
    /// 检查和更新在同一个分片锁内完成，并发的相同扫描只有一个会被接受。
    pub fn accept(&self, text: &str, now_ms: i64) -> bool {
        let accepted = match self.last_accepted.entry(text.to_string()) {
            Entry::Occupied(mut entry) => {
                if is_within_window(Some(*entry.get()), now_ms, self.window_ms) {
                    false
                } else {
                    entry.insert(now_ms);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now_ms);
                true
            }
        };

        if !accepted {
            metrics::record_scan_debounced();
            return false;
        }

        // 分片锁已释放，retain 需要逐个加锁
        self.prune(now_ms);
        true
    }

    /// 丢弃已经过期的记录
    fn prune(&self, now_ms: i64) {
        let window = self.window_ms;
        self.last_accepted.retain(|_, last| is_within_window(Some(*last), now_ms, window));
    }

    /// 清空所有记录（会话重新开始时调用）
    pub fn reset(&self) {
        self.last_accepted.clear();
    }

    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }
}

impl Default for ScanDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW_MS)
    }
}
