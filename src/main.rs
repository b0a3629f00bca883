use std::fs;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use smartcampost_scan::{
    capture::CaptureOutcome,
    cli::{Cli, Commands},
    config::{self, ClientConfig},
    context::ClientContext,
    infra::metrics,
    logging,
    model::{GeoPoint, LocationSource, ScanEvent, ScanEventType},
    offline::SyncOutcome,
    qr,
    scanner::{CaptureDevice, DeviceInfo, DeviceRegistry, Facing, ManualEntryDevice, ScanMode, ScanSession},
    stream::{LiveViewState, StreamEnd, StreamListener},
};
use tokio::io::BufReader;
use tokio::sync::Notify;

/// 实时流断开后的重连间隔
const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    // 解析命令行参数
    let cli = Cli::parse();

    // 不需要日志和完整配置的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        Some(Commands::ShowConfig) => return show_config(&cli),
        Some(Commands::Parse { text }) => return parse_text(text),
        _ => {}
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    let _log_guard = logging::init_logging(&log_level, log_format.as_deref(), log_file.as_deref(), cli.quiet)?;

    tracing::info!("🚀 SmartCAMPOST scan client starting...");

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = ClientConfig::load(&cli).context("Failed to load configuration")?;

    if cli.dev {
        tracing::info!("🔧 Development mode enabled");
    }

    tracing::debug!("📊 Client Configuration:");
    tracing::debug!("  - API: {}", config.api.base_url);
    tracing::debug!("  - Storage: {:?} ({})", config.queue.storage, config.queue.data_dir.display());
    tracing::debug!("  - Auto Sync: {}", config.sync.auto_sync);
    tracing::debug!("  - Debounce: {}ms", config.scanner.debounce_window_ms);

    if let Some(addr) = config.metrics.listen_addr() {
        match metrics::init(addr) {
            Ok(()) => tracing::info!("📈 Metrics exported on http://{}/metrics", addr),
            Err(e) => tracing::warn!("⚠️ Failed to start metrics exporter: {}", e),
        }
    }

    let context = match ClientContext::build(config, !cli.offline) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!("❌ Client initialization failed: {}", e);
            tracing::error!("💡 Check the API URL and the offline data directory");
            process::exit(1);
        }
    };

    if !cli.offline {
        let reachable = context.probe_now().await?;
        if !reachable {
            tracing::warn!("📴 Backend unreachable, working offline");
        }
    }

    let command = cli.command.unwrap_or(Commands::Status);
    match command {
        Commands::Status => show_status(&context),
        Commands::Enqueue {
            parcel_id,
            event_type,
            tracking_ref,
            note,
            latitude,
            longitude,
        } => {
            let mut event = ScanEvent::new(
                parcel_id,
                event_type.unwrap_or(context.config.scanner.default_event_type),
            )
            .with_agent(
                context.config.scanner.agent_id.clone(),
                context.config.scanner.agency_id.clone(),
            );
            if let Some(tracking_ref) = tracking_ref {
                event = event.with_tracking_ref(tracking_ref);
            }
            if let Some(note) = note.or_else(|| context.config.scanner.location_note.clone()) {
                event = event.with_location_note(note);
            }
            if let (Some(latitude), Some(longitude)) = (latitude, longitude) {
                event = event.with_location(GeoPoint { latitude, longitude }, LocationSource::Manual);
            }
            let outcome = context.pipeline.record_event(event).await?;
            println!("{}", outcome_line(&outcome));
            Ok(())
        }
        Commands::Sync => run_sync(&context).await,
        Commands::Clear { yes } => {
            if !yes {
                bail!(
                    "Refusing to drop {} pending event(s) without --yes",
                    context.queue.len()
                );
            }
            let dropped = context.queue.len();
            context.queue.clear();
            println!("🗑️ Cleared {} pending event(s)", dropped);
            Ok(())
        }
        Commands::Verify { text } => {
            let outcome = context.verifier.verify(&text).await;
            println!("{}: {}", outcome.label(), outcome.user_message());
            if let Some(result) = outcome.result() {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            Ok(())
        }
        Commands::Scan { continuous, event_type } => {
            let mode = if continuous || context.config.scanner.continuous {
                ScanMode::Continuous
            } else {
                ScanMode::Single
            };
            run_scan(&context, mode, event_type).await
        }
        Commands::Listen { limit } => run_listen(&context, limit).await,
        Commands::GenerateConfig { .. }
        | Commands::ValidateConfig { .. }
        | Commands::ShowConfig
        | Commands::Parse { .. } => Ok(()),
    }
}

fn show_status(context: &ClientContext) -> Result<()> {
    let stats = context.queue.stats();
    println!("🌐 Online: {}", context.connectivity.is_online());
    println!("📦 Pending events: {}", stats.pending_events);
    println!("💾 Durable: {}", stats.durable);
    if let Some(oldest) = stats.oldest_captured_at {
        println!("⏱️ Oldest capture: {}", oldest.to_rfc3339());
    }
    if let Err(e) = context.queue.health_check() {
        println!("⚠️ Storage unhealthy: {}", e);
    }
    Ok(())
}

async fn run_sync(context: &ClientContext) -> Result<()> {
    match context.engine.sync_now().await? {
        SyncOutcome::NothingToSync => println!("✅ Nothing to sync"),
        SyncOutcome::Offline => println!("📴 Offline, {} event(s) kept for later", context.queue.len()),
        SyncOutcome::AlreadySyncing => println!("⏳ A sync is already in progress"),
        SyncOutcome::Completed(report) => {
            println!(
                "✅ Synced {} of {} event(s), {} kept for retry",
                report.acknowledged, report.submitted, report.retained
            );
            for failure in &report.failures {
                println!("  ❌ #{}: {}", failure.event_index, failure.reason);
            }
            if !report.reconciled {
                println!("⚠️ Server counts did not add up, all events were kept");
            }
        }
    }
    Ok(())
}

async fn run_scan(context: &ClientContext, mode: ScanMode, event_type: Option<ScanEventType>) -> Result<()> {
    let mut registry = DeviceRegistry::new();
    registry.register(
        DeviceInfo {
            id: "stdin".to_string(),
            label: "Keyboard wedge / manual entry".to_string(),
            facing: Facing::External,
        },
        || Box::new(ManualEntryDevice::new("stdin", BufReader::new(tokio::io::stdin()))) as Box<dyn CaptureDevice>,
    );

    let scheduler = context.start_scheduler();
    let _probe = context.spawn_probe()?;

    let device = registry.open_preferred()?;
    let mut session = ScanSession::start(device, mode).await?;
    let event_type = event_type.unwrap_or(context.config.scanner.default_event_type);
    tracing::info!("📷 Scanning {} events from {} ({:?} mode)", event_type, session.device().label, mode);

    let captured = context
        .pipeline
        .run_session(&mut session, event_type, |_raw, result| match result {
            Ok(CaptureOutcome::Debounced) => {}
            Ok(outcome) => println!("{}", outcome_line(outcome)),
            Err(e) => println!("❌ {}", e),
        })
        .await?;

    session.stop();
    scheduler.stop().await;
    println!("📦 Captured {} scan(s), {} pending sync", captured, context.queue.len());
    Ok(())
}

async fn run_listen(context: &ClientContext, limit: Option<u64>) -> Result<()> {
    let view = Arc::new(Mutex::new(LiveViewState::new()));
    let received = Arc::new(AtomicU64::new(0));
    let done = Arc::new(Notify::new());

    loop {
        let stream = match context.api.open_scan_stream().await {
            Ok(stream) => stream,
            Err(e) if e.is_retryable() => {
                tracing::warn!("Scan stream unavailable: {}, retrying", e);
                tokio::time::sleep(STREAM_RECONNECT_DELAY).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let listener = {
            let view = view.clone();
            let received = received.clone();
            let done = done.clone();
            StreamListener::new().on_scan_events(move |event| {
                if view.lock().apply(event.clone()) {
                    println!(
                        "📍 {} {} {}",
                        event.tracking_ref.as_deref().unwrap_or(&event.parcel_id),
                        event.event_type,
                        event.location_note.as_deref().unwrap_or("")
                    );
                    let count = received.fetch_add(1, Ordering::SeqCst) + 1;
                    if limit.is_some_and(|limit| count >= limit) {
                        done.notify_one();
                    }
                }
            })
        };

        let subscription = listener.subscribe(stream);
        tracing::info!("📡 Listening for live scan events");

        tokio::select! {
            end = subscription.closed() => match end {
                StreamEnd::Closed => tracing::info!("Scan stream closed, reconnecting"),
                StreamEnd::TransportError(e) => tracing::warn!("Scan stream interrupted: {}", e),
            },
            _ = done.notified() => break,
            _ = tokio::signal::ctrl_c() => break,
        }

        tokio::time::sleep(STREAM_RECONNECT_DELAY).await;
    }

    let view = view.lock();
    println!(
        "📊 {} event(s) across {} parcel(s)",
        view.applied(),
        view.parcel_count()
    );
    Ok(())
}

fn outcome_line(outcome: &CaptureOutcome) -> String {
    match outcome {
        CaptureOutcome::Recorded { .. } => format!("✅ {}", outcome.message()),
        CaptureOutcome::Queued { .. } => format!("📦 {}", outcome.message()),
        CaptureOutcome::Rejected(rejected) if rejected.is_forgery_attempt() => {
            format!("🚨 {}", outcome.message())
        }
        _ => format!("⚠️ {}", outcome.message()),
    }
}

fn parse_text(text: &str) -> Result<()> {
    let parsed = qr::parse(text);
    let kind = if parsed.is_structured() { "structured" } else { "legacy" };
    let payload = parsed.into_payload()?;
    println!("# {} QR code", kind);
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    fs::write(path, config::DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config file: {}", path))?;
    println!("✅ Default config written to: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = ClientConfig::from_toml_file(path)?;
    config.validate()?;
    println!("✅ Config file is valid: {}", path);
    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    let config = ClientConfig::load(cli)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
