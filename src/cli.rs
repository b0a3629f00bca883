use clap::{Parser, Subcommand};

use crate::model::ScanEventType;

// 确保 Parser trait 被使用
impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// SmartCAMPOST 扫描客户端 - 离线扫码采集与同步
#[derive(Parser, Debug, Default)]
#[command(name = "smartcampost-scan")]
#[command(version)]
#[command(about = "SmartCAMPOST 包裹扫码采集、离线队列与同步工具", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// 后端 API 地址
    #[arg(long, global = true, value_name = "URL", help = "后端 API 基础地址，例如 https://host/api")]
    pub api_url: Option<String>,

    /// 访问令牌
    #[arg(long, global = true, value_name = "TOKEN", help = "Bearer 访问令牌")]
    pub token: Option<String>,

    /// 离线队列数据目录
    #[arg(long, global = true, value_name = "DIR", help = "离线队列数据目录")]
    pub data_dir: Option<String>,

    /// 只在内存中保存队列
    #[arg(long, global = true, help = "使用内存存储（进程退出后队列丢失）")]
    pub memory_storage: bool,

    /// 以离线状态启动
    #[arg(long, global = true, help = "以离线状态启动（不探测后端可达性）")]
    pub offline: bool,

    /// 监控端口
    #[arg(long, global = true, value_name = "PORT", help = "Prometheus 监控指标端口")]
    pub metrics_port: Option<u16>,

    /// 日志级别
    #[arg(
        long,
        global = true,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, global = true, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, global = true, value_name = "PATH", help = "日志输出文件路径")]
    pub log_file: Option<String>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, global = true, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', global = true, help = "静默模式（只输出错误）")]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, global = true, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 显示离线队列与连通状态
    Status,
    /// 手动记录一条扫描事件（离线时进入队列）
    Enqueue {
        /// 包裹 ID
        #[arg(value_name = "PARCEL_ID")]
        parcel_id: String,
        /// 事件类型，例如 IN_TRANSIT、delivered
        #[arg(long, short = 't', value_name = "TYPE", value_parser = parse_event_type)]
        event_type: Option<ScanEventType>,
        /// 运单号
        #[arg(long, value_name = "REF")]
        tracking_ref: Option<String>,
        /// 位置备注
        #[arg(long, value_name = "TEXT")]
        note: Option<String>,
        /// 纬度
        #[arg(long, requires = "longitude", allow_hyphen_values = true)]
        latitude: Option<f64>,
        /// 经度
        #[arg(long, requires = "latitude", allow_hyphen_values = true)]
        longitude: Option<f64>,
    },
    /// 立即同步离线队列
    Sync,
    /// 清空离线队列
    Clear {
        /// 不询问直接清空
        #[arg(long)]
        yes: bool,
    },
    /// 本地解析 QR 文本（不访问后端）
    Parse {
        #[arg(value_name = "TEXT")]
        text: String,
    },
    /// 通过后端校验 QR 文本
    Verify {
        #[arg(value_name = "TEXT")]
        text: String,
    },
    /// 从标准输入读取扫码结果并采集
    Scan {
        /// 持续扫描（否则第一次成功后结束）
        #[arg(long)]
        continuous: bool,
        /// 事件类型
        #[arg(long, short = 't', value_name = "TYPE", value_parser = parse_event_type)]
        event_type: Option<ScanEventType>,
    },
    /// 订阅实时扫描事件流
    Listen {
        /// 收到指定数量的事件后退出
        #[arg(long, value_name = "NUM")]
        limit: Option<u64>,
    },
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "smartcampost.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "smartcampost.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置）
    ShowConfig,
}

fn parse_event_type(value: &str) -> Result<ScanEventType, String> {
    value.parse()
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        // 根据 verbose 级别设置
        match self.verbose {
            0 => None, // 使用默认或配置文件
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}
