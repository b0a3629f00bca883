use bytes::{Buf, BytesMut};
use tracing::warn;

/// 未指定 `event:` 时的事件名
pub const DEFAULT_EVENT: &str = "message";

/// 单行最大长度，超出的行整行丢弃
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// 一条完整的 SSE 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// 增量 SSE 解码器
///
/// 按字节块喂入，遇到空行分发一条消息。`:` 开头的注释行（心跳）忽略，
/// 多行 `data:` 以 `\n` 连接。只处理 `event` / `data` / `id` 字段，`retry` 忽略。
/// 缓冲区不超过 [`MAX_LINE_LEN`]；换行查找从上次停下的位置继续。
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// 缓冲区中已确认没有换行的前缀长度
    scanned: usize,
    /// 正在跳过一行超长内容，直到下一个换行
    discarding: bool,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段字节，返回其中已经完整的消息
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') else {
                if self.buffer.len() > MAX_LINE_LEN {
                    if !self.discarding {
                        warn!("SSE line exceeds {} bytes, discarding it", MAX_LINE_LEN);
                    }
                    self.buffer.clear();
                    self.discarding = true;
                }
                self.scanned = self.buffer.len();
                break;
            };

            let line = self.buffer.split_to(self.scanned + offset);
            self.buffer.advance(1);
            self.scanned = 0;

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > MAX_LINE_LEN {
                warn!("SSE line exceeds {} bytes, discarding it", MAX_LINE_LEN);
                continue;
            }

            let mut line = String::from_utf8_lossy(&line).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }

            if let Some(message) = self.process_line(&line) {
                messages.push(message);
            }
        }

        messages
    }

    /// 尚未组成完整行的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            // id 在连接内保持到被覆盖为止
            id: self.id.clone(),
        })
    }
}
