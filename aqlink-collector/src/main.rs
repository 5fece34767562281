// aqlink Collector - LoRaWAN collector service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # aqlink Collector
//!
//! Subscribes to the configured brokers, replays recorded envelope files,
//! and writes one canonical record per line.
//!
//! ## Usage
//!
//! ```bash
//! # Live, with a kit registry
//! aqlink-collector --config collector.json --registry kits.json
//!
//! # Replay a capture into a file, no HTTP endpoints
//! aqlink-collector --registry kits.json --replay capture.txt --output records.jsonl --no-http
//! ```
//!
//! Records go to stdout (or `--output`); logs go to stderr.

mod http;
mod metrics;
mod output;
mod signals;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use aqlink::{Codec, RuleTable};
use aqlink_gateway::{
    CanonicalRecord, CollectorConfig, Dispatcher, GatewayError, InMemoryStore, JsonFileStore,
    MetadataStore,
};

use http::{AppState, BrokerView, Snapshot};
use output::RecordSink;
use signals::{Control, Signals};

/// How often status and metrics are refreshed while idle
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// aqlink LoRaWAN collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra product rules (JSON), overlaid on the built-in table
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Kit registration file (JSON)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Recorded envelope file to replay (repeatable)
    #[arg(long)]
    replay: Vec<PathBuf>,

    /// Port for the HTTP endpoints
    #[arg(short, long, default_value = "9100")]
    port: u16,

    /// Do not serve HTTP endpoints
    #[arg(long)]
    no_http: bool,

    /// Append records to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Error, Debug)]
enum CollectorError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

enum Event {
    Record(Result<Option<CanonicalRecord>, GatewayError>),
    Control(Control),
    Refresh,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("aqlink Collector v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "collector stopped");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration file, with command-line paths taking precedence
fn load_config(args: &Args) -> Result<CollectorConfig, GatewayError> {
    let mut config = match &args.config {
        Some(path) => CollectorConfig::from_file(path)?,
        None => CollectorConfig::default(),
    };
    if args.rules.is_some() {
        config.rules = args.rules.clone();
    }
    if args.registry.is_some() {
        config.registry = args.registry.clone();
    }
    config.replay.files.extend(args.replay.iter().cloned());
    config.validate()?;
    Ok(config)
}

fn build_codec(config: &CollectorConfig) -> Result<Codec, GatewayError> {
    let mut table = RuleTable::builtin();
    if let Some(path) = &config.rules {
        let overlay = RuleTable::from_file(path)?;
        info!(path = %path.display(), products = overlay.len(), "loaded product rules");
        table.extend(overlay);
    }
    Ok(Codec::new(table))
}

fn build_store(config: &CollectorConfig) -> Result<Box<dyn MetadataStore>, GatewayError> {
    match &config.registry {
        Some(path) => Ok(Box::new(JsonFileStore::open(path)?)),
        None => {
            warn!("no kit registry configured, every kit is unregistered");
            Ok(Box::new(InMemoryStore::new()))
        }
    }
}

async fn run(args: Args) -> Result<(), CollectorError> {
    let config = load_config(&args)?;
    let codec = build_codec(&config)?;
    let store = build_store(&config)?;

    let mut dispatcher = Dispatcher::new(&config, codec, store);
    for file in &config.replay.files {
        dispatcher.add_replay_file(file)?;
    }
    info!(
        brokers = config.brokers.len(),
        replay = config.replay.files.len(),
        "dispatcher ready"
    );

    let mut sink = match &args.output {
        Some(path) => RecordSink::append(path)?,
        None => RecordSink::stdout(),
    };

    let state = Arc::new(AppState::new());
    let server = if args.no_http {
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = TcpListener::bind(addr).await?;
        let state = Arc::clone(&state);
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, state).await {
                error!(error = %e, "HTTP server failed");
            }
        }))
    };

    let mut signals = Signals::install()?;
    let outcome = run_loop(&mut dispatcher, &mut sink, &state, &mut signals).await;

    dispatcher.shutdown().await;
    publish(&dispatcher, &state, false);
    if let Some(server) = server {
        server.abort();
    }
    outcome
}

async fn run_loop(
    dispatcher: &mut Dispatcher,
    sink: &mut RecordSink,
    state: &AppState,
    signals: &mut Signals,
) -> Result<(), CollectorError> {
    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
    publish(dispatcher, state, true);

    loop {
        let event = tokio::select! {
            next = dispatcher.next_record() => Event::Record(next),
            control = signals.recv() => Event::Control(control),
            _ = refresh.tick() => Event::Refresh,
        };

        match event {
            Event::Record(Ok(Some(record))) => {
                sink.write(&record)?;
                metrics::record_emitted(&record);
            }
            Event::Record(Ok(None)) => {
                info!(decoded = dispatcher.stats().decoded, "all sources exhausted");
                return Ok(());
            }
            Event::Record(Err(e)) => return Err(e.into()),
            Event::Control(Control::DumpStatus) => log_status(dispatcher),
            Event::Control(Control::Invalidate) => {
                if let Err(e) = dispatcher.cache_mut().invalidate_all() {
                    warn!(error = %e, "registry reload failed");
                }
            }
            Event::Control(Control::Shutdown) => {
                info!("shutdown requested");
                return Ok(());
            }
            Event::Refresh => {}
        }
        publish(dispatcher, state, true);
    }
}

fn publish(dispatcher: &Dispatcher, state: &AppState, running: bool) {
    let brokers = dispatcher.broker_statuses();
    metrics::update_brokers(&brokers);
    metrics::update_dispatch(
        dispatcher.stats(),
        dispatcher.queue_len(),
        dispatcher.queue_dropped(),
        dispatcher.cache().len(),
    );
    state.publish(Snapshot {
        running,
        stats: dispatcher.stats().clone(),
        queue_len: dispatcher.queue_len(),
        queue_dropped: dispatcher.queue_dropped(),
        cache_entries: dispatcher.cache().len(),
        brokers: brokers.iter().map(BrokerView::from).collect(),
    });
}

fn log_status(dispatcher: &Dispatcher) {
    let now = chrono::Utc::now().timestamp();
    let kits = dispatcher.cache().status(now);
    info!(kits = kits.len(), queue = dispatcher.queue_len(), "cache status");
    for kit in kits {
        info!(
            kit = %kit.kit,
            device = ?kit.device,
            active = kit.active,
            expires_in = kit.expires_in,
            records = kit.record_count,
            interval = kit.interval,
            last_seen = ?kit.last_seen,
            unknown_fields = ?kit.unknown_fields,
            "kit"
        );
    }
    for broker in dispatcher.broker_statuses() {
        info!(
            broker = %broker.endpoint,
            state = %broker.state,
            restarts = broker.restart_count,
            last_error = ?broker.last_error,
            "broker"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "aqlink-collector",
            "--replay",
            "a.txt",
            "--replay",
            "b.txt",
            "--no-http",
            "--output",
            "out.jsonl",
        ])
        .unwrap();
        assert_eq!(args.replay.len(), 2);
        assert!(args.no_http);
        assert_eq!(args.port, 9100);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_cli_paths_override_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "registry": "/etc/aqlink/kits.json", "replay": {{ "files": ["first.txt"] }} }}"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let args = Args::try_parse_from([
            "aqlink-collector",
            "--config",
            path.as_str(),
            "--registry",
            "kits.json",
            "--replay",
            "second.txt",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.registry, Some(PathBuf::from("kits.json")));
        assert_eq!(
            config.replay.files,
            vec![PathBuf::from("first.txt"), PathBuf::from("second.txt")]
        );
    }

    #[test]
    fn test_missing_config_file() {
        let args =
            Args::try_parse_from(["aqlink-collector", "--config", "/nonexistent/aqlink.json"])
                .unwrap();
        assert!(matches!(load_config(&args), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_missing_registry_is_fatal() {
        let config = CollectorConfig {
            registry: Some(PathBuf::from("/nonexistent/kits.json")),
            ..Default::default()
        };
        assert!(matches!(build_store(&config), Err(GatewayError::Store(_))));
        assert!(build_store(&CollectorConfig::default()).is_ok());
    }

    #[test]
    fn test_build_codec_with_builtin_rules() {
        let codec = build_codec(&CollectorConfig::default()).unwrap();
        assert!(!codec.rules().is_empty());
    }
}
