use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{LimiterEvent, LimiterObserver};
use tollgate::{Admission, ClientKey, LimiterError, RateLimiter, RejectReason, TokenUse};

/// Drive a token-bucket rate limiter from client identifiers on stdin.
///
/// Each input line is either `<client>` or `add <client>` to grant a token,
/// or `use <client>` to spend one. Replies go to stdout, one per line:
/// `<client> granted <count>`, `<client> rejected full|invalid`,
/// `<client> spent <remaining>`, `<client> exhausted`,
/// `<client> denied unknown`, or `usage: ...` for a command without a client.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Worker threads for background tasks
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Stop at the first idle check that finds no tracked clients
    #[arg(long)]
    stop_when_idle: bool,

    /// Write limiter events to stderr as JSON lines
    #[arg(long)]
    emit_events: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::default(),
    };
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(threads) = cli.worker_threads {
        config.runtime.worker_threads = Some(threads);
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(config = ?cli.config, "Configuration loaded");

    let worker_threads = config.runtime.validated_worker_threads()?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = worker_threads {
        runtime.worker_threads(threads);
    }
    let runtime = runtime.build()?;

    let result = runtime.block_on(run(config, cli.stop_when_idle, cli.emit_events));
    runtime.shutdown_background();
    result
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

async fn run(config: TollgateConfig, stop_when_idle: bool, emit_events: bool) -> anyhow::Result<()> {
    let limiter_config = config.limiter.to_limiter_config()?;

    let mut builder = RateLimiter::builder(limiter_config).runtime(Handle::current());
    if emit_events {
        builder = builder.observer(Arc::new(JsonLinesObserver));
    }
    let limiter = builder.build();
    limiter.schedule()?;
    info!(config = ?limiter.config(), "Rate limiter initialized");

    let idle = async {
        if stop_when_idle {
            limiter.idle().await
        } else {
            std::future::pending().await
        }
    };

    let result = tokio::select! {
        result = serve_input(&limiter, BufReader::new(tokio::io::stdin())) => result,
        _ = idle => {
            info!("No clients tracked, initiating shutdown");
            Ok(())
        }
        _ = shutdown_signal() => Ok(()),
    };

    limiter.stop();
    limiter.wait_stopped().await;

    info!("Tollgate stopped");
    result
}

/// Apply every input line to the limiter until the input closes.
///
/// Lines that are not valid UTF-8 are logged and skipped.
async fn serve_input<R: AsyncBufRead + Unpin>(limiter: &RateLimiter, mut input: R) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf).await? == 0 {
            info!("Input closed, initiating shutdown");
            return Ok(());
        }
        if let Some(reply) = handle_input(limiter, &buf) {
            println!("{}", reply);
        }
    }
}

/// Decode one raw input line and apply it.
fn handle_input(limiter: &RateLimiter, raw: &[u8]) -> Option<String> {
    match std::str::from_utf8(raw) {
        Ok(line) => handle_command(limiter, line),
        Err(e) => {
            warn!(error = %e, "Skipping input line that is not valid UTF-8");
            None
        }
    }
}

/// Apply one input line to the limiter and describe the outcome.
///
/// Blank lines produce no reply.
fn handle_command(limiter: &RateLimiter, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (command, client) = match line.split_once(char::is_whitespace) {
        Some((command @ ("add" | "use"), client)) => (command, client.trim()),
        None if line == "add" || line == "use" => {
            return Some(format!("usage: {} <client>", line));
        }
        _ => ("add", line),
    };
    let key = ClientKey::new(client);

    let reply = match command {
        "use" => match limiter.use_token(&key) {
            Ok(TokenUse::Spent { remaining }) => format!("{} spent {}", client, remaining),
            Ok(TokenUse::Exhausted) => format!("{} exhausted", client),
            Ok(TokenUse::Ignored) => format!("{} ignored", client),
            Err(LimiterError::UnknownClient(_)) => format!("{} denied unknown", client),
            Err(e) => {
                warn!(client = %client, error = %e, "Token use failed");
                format!("{} error {}", client, e)
            }
        },
        _ => match limiter.add(&key) {
            Ok(Admission::Granted(tokens)) => format!("{} granted {}", client, tokens),
            Ok(Admission::Rejected(RejectReason::BucketFull)) => format!("{} rejected full", client),
            Ok(Admission::Rejected(RejectReason::InvalidKey)) => format!("{} rejected invalid", client),
            Err(e) => {
                warn!(client = %client, error = %e, "Admission failed");
                format!("{} error {}", client, e)
            }
        },
    };
    Some(reply)
}

/// Writes each event to stderr as a timestamped JSON object.
struct JsonLinesObserver;

impl LimiterObserver for JsonLinesObserver {
    fn on_event(&self, event: &LimiterEvent) {
        let line = serde_json::json!({
            "at": Utc::now().to_rfc3339(),
            "event": event,
        });
        eprintln!("{}", line);
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tollgate::ratelimit::NoopObserver;
    use tollgate::LimiterConfig;

    fn limiter(max_tokens: u32) -> RateLimiter {
        let config = LimiterConfig::new(
            10,
            max_tokens,
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .unwrap();
        RateLimiter::builder(config).observer(Arc::new(NoopObserver)).build()
    }

    #[test]
    fn test_bare_identifier_adds() {
        let limiter = limiter(2);
        assert_eq!(handle_command(&limiter, "10.0.0.1").unwrap(), "10.0.0.1 granted 1");
        assert_eq!(handle_command(&limiter, "add 10.0.0.1").unwrap(), "10.0.0.1 granted 2");
        assert_eq!(handle_command(&limiter, "10.0.0.1").unwrap(), "10.0.0.1 rejected full");
    }

    #[test]
    fn test_use_command() {
        let limiter = limiter(2);
        assert_eq!(handle_command(&limiter, "use a").unwrap(), "a denied unknown");

        handle_command(&limiter, "a");
        assert_eq!(handle_command(&limiter, "use a").unwrap(), "a spent 0");
        assert_eq!(handle_command(&limiter, "use   a ").unwrap(), "a exhausted");
    }

    #[test]
    fn test_command_without_client_is_usage_error() {
        let limiter = limiter(2);
        assert_eq!(handle_command(&limiter, "add").unwrap(), "usage: add <client>");
        assert_eq!(handle_command(&limiter, " use ").unwrap(), "usage: use <client>");
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let limiter = limiter(2);
        assert!(handle_input(&limiter, b"\xff\xfe\n").is_none());
        assert!(limiter.is_empty());
        assert_eq!(handle_input(&limiter, b"b\n").unwrap(), "b granted 1");
    }

    #[tokio::test]
    async fn test_serve_input_continues_past_invalid_utf8() {
        let limiter = limiter(2);
        let input: &[u8] = b"a\n\xff\xfe\nb\nuse a\n";

        serve_input(&limiter, input).await.unwrap();

        assert_eq!(limiter.tokens("a"), Some(0));
        assert_eq!(limiter.tokens("b"), Some(1));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let limiter = limiter(2);
        assert!(handle_command(&limiter, "   ").is_none());
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_stopped_limiter_reports_error() {
        let limiter = limiter(2);
        limiter.stop();
        let reply = handle_command(&limiter, "a").unwrap();
        assert!(reply.starts_with("a error"));
    }
}
