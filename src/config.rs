use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::capture::CaptureConfig;
use crate::model::ScanEventType;
use crate::offline::{SchedulerConfig, SyncEngineConfig, DEFAULT_STORAGE_KEY};
use crate::qr::DEFAULT_DEBOUNCE_WINDOW_MS;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "smartcampost.toml";

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub scanner: ScannerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// 后端接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 基础地址（包含 `/api` 前缀）
    pub base_url: String,
    /// Bearer token（序列化输出时打码）
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_redacted")]
    pub auth_token: Option<String>,
    /// 设备 ID，随同步批次上报
    pub device_id: Option<String>,
    /// 普通请求超时（秒）
    pub request_timeout_secs: u64,
    /// QR 校验超时（秒）
    pub verify_timeout_secs: u64,
    /// 批量同步超时（秒）
    pub sync_timeout_secs: u64,
    /// 建立连接超时（秒），实时流只受这个限制
    pub connect_timeout_secs: u64,
}

/// 打码后的 token 占位
const REDACTED: &str = "***";

fn serialize_redacted<S>(value: &Option<String>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(_) => serializer.serialize_some(REDACTED),
        None => serializer.serialize_none(),
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            device_id: None,
            request_timeout_secs: 15,
            verify_timeout_secs: 10,
            sync_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

impl ApiConfig {
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url).with_context(|| format!("Invalid API base URL: {}", self.base_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 本地存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// 落盘（sled）
    Sled,
    /// 仅内存（测试 / 演示）
    Memory,
}

/// 离线队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub storage: StorageKind,
    pub data_dir: PathBuf,
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Sled,
            data_dir: PathBuf::from("./data/offline"),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 恢复在线时自动同步
    pub auto_sync: bool,
    /// 在线期间的重试间隔（秒），0 表示不做周期重试
    pub retry_interval_secs: u64,
    /// 可达性探测间隔（秒）
    pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            retry_interval_secs: 60,
            probe_interval_secs: 15,
        }
    }
}

/// 扫码配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub debounce_window_ms: i64,
    /// 持续扫描（否则第一次成功后停止）
    pub continuous: bool,
    pub default_event_type: ScanEventType,
    /// 离线时接受自带 parcelId 的结构化 QR 码
    pub allow_unverified_offline: bool,
    pub agent_id: Option<String>,
    pub agency_id: Option<String>,
    pub location_note: Option<String>,
    /// 网点固定坐标
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            continuous: false,
            default_event_type: ScanEventType::InTransit,
            allow_unverified_offline: true,
            agent_id: None,
            agency_id: None,
            location_note: None,
            latitude: None,
            longitude: None,
        }
    }
}

/// 监控配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus 监听端口，不设置则不启用
    pub port: Option<u16>,
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            scanner: ScannerConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("Invalid config file format")?;
        Ok(toml_config.into())
    }

    /// 从环境变量合并配置（SMARTCAMPOST_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("SMARTCAMPOST_API_URL") {
            self.api.base_url = url;
        }
        if let Ok(token) = env::var("SMARTCAMPOST_API_TOKEN") {
            self.api.auth_token = Some(token);
        }
        if let Ok(device_id) = env::var("SMARTCAMPOST_DEVICE_ID") {
            self.api.device_id = Some(device_id);
        }
        if let Ok(timeout) = env::var("SMARTCAMPOST_SYNC_TIMEOUT_SECS") {
            self.api.sync_timeout_secs = timeout.parse().unwrap_or(self.api.sync_timeout_secs);
        }
        if let Ok(data_dir) = env::var("SMARTCAMPOST_DATA_DIR") {
            self.queue.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(storage) = env::var("SMARTCAMPOST_STORAGE") {
            self.queue.storage = parse_storage_kind(&storage)?;
        }
        if let Ok(auto_sync) = env::var("SMARTCAMPOST_AUTO_SYNC") {
            self.sync.auto_sync = auto_sync.parse().unwrap_or(self.sync.auto_sync);
        }
        if let Ok(window) = env::var("SMARTCAMPOST_DEBOUNCE_MS") {
            self.scanner.debounce_window_ms = window.parse().unwrap_or(self.scanner.debounce_window_ms);
        }
        if let Ok(agent_id) = env::var("SMARTCAMPOST_AGENT_ID") {
            self.scanner.agent_id = Some(agent_id);
        }
        if let Ok(agency_id) = env::var("SMARTCAMPOST_AGENCY_ID") {
            self.scanner.agency_id = Some(agency_id);
        }
        if let Ok(port) = env::var("SMARTCAMPOST_METRICS_PORT") {
            self.metrics.port = port.parse().ok().or(self.metrics.port);
        }
        if let Ok(log_level) = env::var("SMARTCAMPOST_LOG_LEVEL") {
            self.logging.level = log_level;
        }
        if let Ok(log_format) = env::var("SMARTCAMPOST_LOG_FORMAT") {
            self.logging.format = Some(log_format);
        }

        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(url) = &cli.api_url {
            self.api.base_url = url.clone();
        }
        if let Some(token) = &cli.token {
            self.api.auth_token = Some(token.clone());
        }
        if let Some(data_dir) = &cli.data_dir {
            self.queue.data_dir = PathBuf::from(data_dir);
        }
        if cli.memory_storage {
            self.queue.storage = StorageKind::Memory;
        }
        if let Some(port) = cli.metrics_port {
            self.metrics.port = Some(port);
        }
        if let Some(log_level) = cli.get_log_level() {
            self.logging.level = log_level;
        }
        if let Some(log_format) = cli.get_log_format() {
            self.logging.format = Some(log_format);
        }
        if let Some(log_file) = &cli.log_file {
            self.logging.file = Some(log_file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        // 1. 配置文件（如果存在），否则默认值
        let mut config = match &cli.config_file {
            Some(config_file) if Path::new(config_file).exists() => {
                info!("📄 Loading config file: {}", config_file);
                Self::from_toml_file(config_file)?
            }
            Some(config_file) => {
                warn!("⚠️ Config file not found: {}", config_file);
                Self::new()
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                info!("📄 Loading default config file: {}", DEFAULT_CONFIG_FILE);
                Self::from_toml_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::new(),
        };

        // 2. 环境变量
        config.merge_from_env()?;

        // 3. 命令行参数（最高优先级）
        config.merge_from_cli(cli);

        config.validate()?;
        Ok(config)
    }

    /// 检查配置是否可用
    pub fn validate(&self) -> Result<()> {
        let url = self.api.base_url()?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            bail!("API base URL must be an http(s) URL with a host: {}", self.api.base_url);
        }
        if self.api.request_timeout_secs == 0 || self.api.verify_timeout_secs == 0 || self.api.sync_timeout_secs == 0 {
            bail!("API timeouts must be greater than zero");
        }
        if self.scanner.debounce_window_ms < 0 {
            bail!("scanner.debounce_window_ms must not be negative");
        }
        if self.queue.storage_key.is_empty() {
            bail!("queue.storage_key must not be empty");
        }
        if self.scanner.latitude.is_some() != self.scanner.longitude.is_some() {
            bail!("scanner.latitude and scanner.longitude must be set together");
        }
        Ok(())
    }

    pub fn sync_engine_config(&self) -> SyncEngineConfig {
        SyncEngineConfig {
            request_timeout: self.api.sync_timeout(),
            device_id: self.api.device_id.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sync_on_reconnect: self.sync.auto_sync,
            retry_interval: match self.sync.retry_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            default_event_type: self.scanner.default_event_type,
            allow_unverified_offline: self.scanner.allow_unverified_offline,
            agent_id: self.scanner.agent_id.clone(),
            agency_id: self.scanner.agency_id.clone(),
            location_note: self.scanner.location_note.clone(),
        }
    }
}

fn parse_storage_kind(value: &str) -> Result<StorageKind> {
    match value.to_ascii_lowercase().as_str() {
        "sled" | "disk" => Ok(StorageKind::Sled),
        "memory" | "mem" => Ok(StorageKind::Memory),
        other => bail!("Unknown storage kind: {}", other),
    }
}

/// 启动早期读取的日志配置（完整配置加载前需要先初始化日志）
#[derive(Debug, Default)]
pub struct EarlyLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

/// 快速读取配置文件的 `[logging]` 段；文件不存在或格式错误时返回空配置
pub fn load_early_logging_config(config_file: Option<&str>) -> EarlyLoggingConfig {
    let path = config_file.unwrap_or(DEFAULT_CONFIG_FILE);
    let Ok(content) = fs::read_to_string(path) else {
        return EarlyLoggingConfig::default();
    };

    match toml::from_str::<TomlConfig>(&content) {
        Ok(TomlConfig {
            logging: Some(logging), ..
        }) => EarlyLoggingConfig {
            level: logging.level,
            format: logging.format,
            file: logging.file,
        },
        _ => EarlyLoggingConfig::default(),
    }
}

/// 默认配置文件内容（`generate-config` 使用）
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# SmartCAMPOST 扫描客户端配置文件
# 此文件由 smartcampost-scan generate-config 生成

[api]
base_url = "http://localhost:8080/api"
# auth_token = ""
# device_id = "agent-phone-01"
request_timeout_secs = 15
verify_timeout_secs = 10
sync_timeout_secs = 30
connect_timeout_secs = 5

[queue]
storage = "sled"
data_dir = "./data/offline"
storage_key = "smartcampost_offline_events"

[sync]
auto_sync = true
retry_interval_secs = 60
probe_interval_secs = 15

[scanner]
debounce_window_ms = 2000
continuous = false
default_event_type = "IN_TRANSIT"
allow_unverified_offline = true
# agent_id = ""
# agency_id = ""
# location_note = "Yaoundé central sorting"
# latitude = 3.8480
# longitude = 11.5021

[metrics]
# port = 9464

[logging]
level = "info"
format = "compact"
# file = "./logs/smartcampost-scan.log"
"#;

/// TOML 配置文件结构（用于反序列化）
#[derive(Debug, Deserialize)]
struct TomlConfig {
    api: Option<TomlApiConfig>,
    queue: Option<TomlQueueConfig>,
    sync: Option<TomlSyncConfig>,
    scanner: Option<TomlScannerConfig>,
    metrics: Option<TomlMetricsConfig>,
    logging: Option<TomlLoggingConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlApiConfig {
    base_url: Option<String>,
    auth_token: Option<String>,
    device_id: Option<String>,
    request_timeout_secs: Option<u64>,
    verify_timeout_secs: Option<u64>,
    sync_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlQueueConfig {
    storage: Option<StorageKind>,
    data_dir: Option<PathBuf>,
    storage_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlSyncConfig {
    auto_sync: Option<bool>,
    retry_interval_secs: Option<u64>,
    probe_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlScannerConfig {
    debounce_window_ms: Option<i64>,
    continuous: Option<bool>,
    default_event_type: Option<ScanEventType>,
    allow_unverified_offline: Option<bool>,
    agent_id: Option<String>,
    agency_id: Option<String>,
    location_note: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TomlMetricsConfig {
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingConfig {
    level: Option<String>,
    format: Option<String>,
    file: Option<String>,
}

impl From<TomlConfig> for ClientConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = Self::default();

        if let Some(api) = toml.api {
            if let Some(base_url) = api.base_url {
                config.api.base_url = base_url;
            }
            config.api.auth_token = api.auth_token.or(config.api.auth_token);
            config.api.device_id = api.device_id.or(config.api.device_id);
            if let Some(secs) = api.request_timeout_secs {
                config.api.request_timeout_secs = secs;
            }
            if let Some(secs) = api.verify_timeout_secs {
                config.api.verify_timeout_secs = secs;
            }
            if let Some(secs) = api.sync_timeout_secs {
                config.api.sync_timeout_secs = secs;
            }
            if let Some(secs) = api.connect_timeout_secs {
                config.api.connect_timeout_secs = secs;
            }
        }

        if let Some(queue) = toml.queue {
            if let Some(storage) = queue.storage {
                config.queue.storage = storage;
            }
            if let Some(data_dir) = queue.data_dir {
                config.queue.data_dir = data_dir;
            }
            if let Some(key) = queue.storage_key {
                config.queue.storage_key = key;
            }
        }

        if let Some(sync) = toml.sync {
            if let Some(auto_sync) = sync.auto_sync {
                config.sync.auto_sync = auto_sync;
            }
            if let Some(secs) = sync.retry_interval_secs {
                config.sync.retry_interval_secs = secs;
            }
            if let Some(secs) = sync.probe_interval_secs {
                config.sync.probe_interval_secs = secs;
            }
        }

        if let Some(scanner) = toml.scanner {
            if let Some(window) = scanner.debounce_window_ms {
                config.scanner.debounce_window_ms = window;
            }
            if let Some(continuous) = scanner.continuous {
                config.scanner.continuous = continuous;
            }
            if let Some(event_type) = scanner.default_event_type {
                config.scanner.default_event_type = event_type;
            }
            if let Some(allow) = scanner.allow_unverified_offline {
                config.scanner.allow_unverified_offline = allow;
            }
            config.scanner.agent_id = scanner.agent_id;
            config.scanner.agency_id = scanner.agency_id;
            config.scanner.location_note = scanner.location_note;
            config.scanner.latitude = scanner.latitude;
            config.scanner.longitude = scanner.longitude;
        }

        if let Some(metrics) = toml.metrics {
            config.metrics.port = metrics.port;
        }

        if let Some(logging) = toml.logging {
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            config.logging.format = logging.format;
            config.logging.file = logging.file;
        }

        config
    }
}
