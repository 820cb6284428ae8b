mod view;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use twin_core::LatchTiming;
use twin_live::{ComposerConfig, Endpoints, HttpSource, LiveComposer, SystemClock};
use twin_stream::{BackoffPolicy, Tap, TapConfig, WsConnector};

use crate::view::{reconcile, render_line, PushFeed};

#[derive(Parser, Debug)]
#[command(name = "twin-monitor", about = "Live actuator state from the telemetry backend")]
struct Args {
    #[arg(long, default_value = "")]
    api_base: String,
    #[arg(long, default_value = "")]
    stream_url: String,
    #[arg(long, default_value = "")]
    channels: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = twin_stream::DEFAULT_MAX_BUFFERED)]
    buffer: usize,
    #[arg(long, default_value_t = view::DEFAULT_PUSH_STALENESS.as_millis() as u64)]
    push_staleness_ms: u64,
    /// Degrade a long-indeterminate actuator to UNKNOWN after this many ms.
    #[arg(long)]
    indeterminate_expiry_ms: Option<i64>,
    #[arg(long)]
    select: Option<String>,
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    api_base: String,
    stream_url: String,
    channels: Vec<String>,
    log_dir: String,
    log_stdout: bool,
    buffer: usize,
    push_staleness: Duration,
    indeterminate_expiry_ms: Option<i64>,
    select: Option<String>,
}

impl RuntimeConfig {
    fn from_args(args: Args) -> Self {
        let api_base = resolve_api_base(&args.api_base);
        let stream_url = resolve_stream_url(&args.stream_url, &api_base);
        Self {
            channels: resolve_channels(&args.channels),
            log_dir: resolve_log_dir(&args.log_dir),
            log_stdout: resolve_log_stdout(),
            buffer: args.buffer,
            push_staleness: Duration::from_millis(args.push_staleness_ms),
            indeterminate_expiry_ms: args.indeterminate_expiry_ms,
            select: args.select.filter(|id| !id.trim().is_empty()),
            api_base,
            stream_url,
        }
    }
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_args(Args::parse());
    let _log_guard = init_logging(&config);
    run(config).await
}

async fn run(config: RuntimeConfig) -> Result<()> {
    let source = HttpSource::new(&config.api_base, Endpoints::default())
        .with_context(|| format!("backend url {}", config.api_base))?;
    let tap_config = TapConfig {
        base_url: config.stream_url.clone(),
        channels: config.channels.clone(),
        max_buffered: config.buffer,
        backoff: BackoffPolicy::default(),
    };
    let tap = Arc::new(
        Tap::attach(tap_config, Arc::new(WsConnector)).context("stream subscription")?,
    );
    let composer_config = ComposerConfig {
        latch: LatchTiming {
            indeterminate_expiry_ms: config.indeterminate_expiry_ms,
            ..LatchTiming::default()
        },
        ..ComposerConfig::default()
    };
    let composer = LiveComposer::new(Arc::new(source), Arc::new(SystemClock), composer_config);
    let handle = composer.start();
    handle.select(config.select.clone());
    info!(
        "monitor_started: api={} stream={} channels={}",
        config.api_base,
        config.stream_url,
        config.channels.join(",")
    );

    let mut snapshots = handle.subscribe();
    let mut messages = tap.subscribe();
    let mut push = PushFeed::default();
    let mut last_line = String::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let render = tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                true
            }
            received = messages.recv() => match received {
                Ok(message) => push.ingest(&message) > 0,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("push_feed_lagged: skipped={skipped}");
                    false
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("shutdown_requested");
                break;
            }
        };
        if !render {
            continue;
        }
        let snapshot = snapshots.borrow_and_update().clone();
        let views = reconcile(
            &snapshot,
            &push,
            Utc::now().timestamp_millis(),
            config.push_staleness,
        );
        let line = render_line(&snapshot, &views);
        if line != last_line {
            println!("{line}");
            last_line = line;
        }
    }

    handle.shutdown();
    tap.close().await;
    let stats = handle.stats();
    let tap_stats = tap.stats();
    if push.is_empty() {
        warn!("push_feed_empty: no actuator readings arrived on the stream");
    }
    info!(
        "monitor_stopped: fast_failures={} published={} tapped={} evicted={} pushed_ids={}",
        stats.fast.failures,
        stats.fast.published,
        tap_stats.delivered,
        tap_stats.evicted,
        push.len()
    );
    Ok(())
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let level = env::var("TWIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout_enabled = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
        Self {
            stdout_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("twin-monitor-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn resolve_api_base(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("TWIN_API_BASE") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    "http://127.0.0.1:8000".to_string()
}

fn resolve_stream_url(flag: &str, api_base: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("TWIN_STREAM_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    format!("{}/stream", api_base.trim_end_matches('/'))
}

fn resolve_channels(flag: &str) -> Vec<String> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else {
        env::var("TWIN_CHANNELS").unwrap_or_default()
    };
    let channels = split_channels(&raw);
    if channels.is_empty() {
        vec!["live".to_string()]
    } else {
        channels
    }
}

fn split_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var("TWIN_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".twin/logs".to_string()
}

fn resolve_log_stdout() -> bool {
    if let Ok(value) = env::var("TWIN_LOG_STDOUT") {
        match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => return true,
            "0" | "false" | "FALSE" | "no" | "NO" => return false,
            _ => {}
        }
    }
    false
}
