//! Loki Writer - forwards lines from stdin to Grafana Loki
//!
//! Every line read from standard input becomes one log entry carrying the
//! configured static labels. Lines are batched and pushed in the background
//! with retries; at end of input everything still queued is delivered before
//! the process exits.
//!
//! ## Configuration
//!
//! An optional config file is given as the first argument. Files ending in
//! `.json` are read as JSON, anything else as a `loki { ... }` directive
//! block. Environment variables override the file:
//!
//! - `LOKI_WRITER_URL`: Push endpoint (e.g. http://localhost:3100/loki/api/v1/push)
//! - `LOKI_WRITER_LABELS`: Static labels as `key=value,key=value`
//! - `LOKI_WRITER_TENANT_ID`: Tenant sent as `X-Scope-OrgID`
//! - `LOKI_WRITER_BATCHWAIT`: Maximum batch age (default: 1s)
//! - `LOKI_WRITER_BATCHSIZE`: Batch size in bytes (default: 1048576)
//! - `LOKI_WRITER_TIMEOUT`: HTTP request timeout (default: 10s)
//! - `LOKI_WRITER_BEARER_TOKEN` / `LOKI_WRITER_BEARER_TOKEN_FILE`: Bearer credentials
//! - `RUST_LOG`: Logging level filter (default: info)

use std::io::{self, BufRead, Write};
use std::path::Path;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loki_writer::config::RawConfig;
use loki_writer::directive::parse_block;
use loki_writer::error::ConfigError;
use loki_writer::module::{LokiLog, WriterModule};
use loki_writer::shipper::{LokiShipper, Shipper};
use loki_writer::writer::LogWriter;

/// Exit status after an interrupt
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Loki writer...");

    let raw = match load_config(std::env::args().nth(1).as_deref()) {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let mut module = LokiLog::new(raw);
    module.provision(None);

    if let Err(e) = module.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    if let Some(config) = module.config() {
        info!(
            url = %config.url,
            labels = %config.labels,
            tenant_id = config.tenant_id.as_deref().unwrap_or(""),
            batch_wait_ms = config.batch_wait.as_millis() as u64,
            batch_size = config.batch_size,
            max_retries = config.backoff.max_retries,
            "Configuration loaded"
        );
    }

    let writer = match module.open() {
        Ok(writer) => writer,
        Err(e) => {
            error!(error = %e, "Failed to open Loki writer");
            std::process::exit(1);
        }
    };

    // Writes block the calling thread, so stdin is forwarded off the runtime.
    let forwarder = tokio::task::spawn_blocking(move || {
        let mut writer = writer;
        let result = forward_stdin(&mut writer);
        (writer, result)
    });

    info!("Forwarding stdin. Press Ctrl+C to stop.");

    tokio::select! {
        joined = forwarder => {
            let writer = match joined {
                Ok((writer, Ok(lines))) => {
                    info!(lines = lines, "End of input, delivering remaining entries");
                    writer
                }
                Ok((writer, Err(e))) => {
                    warn!(error = %e, "Stopped reading stdin");
                    writer
                }
                Err(e) => {
                    error!(error = %e, "Forwarding task panicked");
                    std::process::exit(1);
                }
            };

            // Graceful stop joins the worker thread.
            let stats = tokio::task::spawn_blocking(move || {
                let mut shipper = writer.into_shipper();
                shipper.stop();
                shipper.stats()
            })
            .await;

            match stats {
                Ok(stats) => info!(
                    entries_sent = stats.entries_sent,
                    entries_dropped = stats.entries_dropped,
                    batches_sent = stats.batches_sent,
                    batches_dropped = stats.batches_dropped,
                    retries = stats.retries,
                    "Loki writer stopped"
                ),
                Err(e) => warn!(error = %e, "Shipper shutdown panicked"),
            }
        }

        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("Interrupted, entries not yet delivered are dropped"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            // The forwarder is blocked on stdin and cannot be joined.
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

/// Read the optional config file, then apply environment overrides.
fn load_config(path: Option<&str>) -> Result<RawConfig, ConfigError> {
    let mut raw = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::new("config", format!("cannot read {path}: {e}")))?;
            parse_config(Path::new(path), &contents)?
        }
        None => RawConfig::default(),
    };

    raw.apply_env()?;
    Ok(raw)
}

fn parse_config(path: &Path, contents: &str) -> Result<RawConfig, ConfigError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => RawConfig::from_json(contents),
        _ => parse_block(contents),
    }
}

/// Write every stdin line, without its line ending, as one entry.
fn forward_stdin(writer: &mut LogWriter<LokiShipper>) -> io::Result<u64> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut line = Vec::new();
    let mut lines: u64 = 0;

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            return Ok(lines);
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        writer.write_all(&line)?;
        lines += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_by_extension() {
        let json = r#"{"url":"http://localhost:3100/loki/api/v1/push","labels":{"app":"svc"}}"#;
        let raw = parse_config(Path::new("/etc/loki-writer.json"), json).unwrap();
        assert_eq!(raw.labels.get("app").map(String::as_str), Some("svc"));

        let block = "loki http://localhost:3100/loki/api/v1/push {\n    labels {\n        app svc\n    }\n}\n";
        let raw = parse_config(Path::new("/etc/loki-writer.conf"), block).unwrap();
        assert_eq!(raw.url, "http://localhost:3100/loki/api/v1/push");
    }

    #[test]
    fn test_parse_config_errors_surface() {
        assert!(parse_config(Path::new("writer.json"), "loki {").is_err());
        assert!(parse_config(Path::new("writer.conf"), "{\"url\": 1}").is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(Some("/nonexistent/loki-writer.conf")).unwrap_err();
        assert_eq!(err.field, "config");
    }
}
