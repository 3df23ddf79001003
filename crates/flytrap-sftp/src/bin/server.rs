//! Flytrap SFTP honeypot binary
//!
//! Run with: cargo run --bin flytrap-sftp-server -- --config-path config.toml

use clap::Parser;
use flytrap_sftp::config::LoggingConfig;
use flytrap_sftp::{Config, FlushReport, LogFormat, Recorder, Server};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Accept every login without checking credentials
    #[arg(long)]
    no_auth: bool,

    /// Host private key; an ephemeral Ed25519 key is generated when unset
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(long, default_value = "config.toml")]
    config_path: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds to stall each password check (-1 keeps the configured value)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    login_delay: i64,

    /// Seconds to stall each command and listing (-1 keeps the configured value)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    command_delay: i64,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        config.no_auth |= self.no_auth;
        config.apply_delay_overrides(self.login_delay, self.command_delay);

        if let Some(key_path) = self.key_path {
            config.host_key_path = Some(key_path);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(log_format) = self.log_format {
            config.logging.format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.logging.file = Some(log_file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args.config_path.clone();

    // Missing or broken config falls back to defaults
    let (mut config, load_error) = match Config::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    args.apply(&mut config);

    let _log_guard = init_tracing(&config.logging);

    if let Some(e) = load_error {
        warn!(
            event = "config_load_failed",
            path = %config_path.display(),
            error = %e,
            "Failed to load configuration, using defaults"
        );
    }

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Flytrap SFTP"
    );

    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        open_auth = config.no_auth,
        credentials = config.credentials.len(),
        catalog_entries = config.catalog.len(),
        login_delay_secs = config.login_delay,
        command_delay_secs = config.command_delay,
        max_connections_per_ip = config.max_connections_per_ip,
        activity_log = %config.telemetry.activity_log.display(),
        identity_log = %config.telemetry.identity_log.display(),
        flush_interval_secs = config.telemetry.flush_interval_secs,
        log_format = ?config.logging.format,
        "Honeypot configuration"
    );

    if let Err(e) = config.validate() {
        error!(
            event = "configuration_validation_failed",
            error = %e,
            "Configuration validation failed"
        );
        std::process::exit(1);
    }

    let config = Arc::new(config);
    let recorder = Arc::new(Recorder::new(&config.telemetry));

    let server = match Server::new(config.clone(), recorder.clone()) {
        Ok(server) => server,
        Err(e) => {
            error!(
                event = "server_creation_failed",
                error = %e,
                "Failed to create server"
            );
            std::process::exit(1);
        }
    };

    let (stop_flusher, stop_rx) = oneshot::channel::<()>();
    let shutdown = async move {
        let _ = stop_rx.await;
    };
    let mut flusher = tokio::spawn(
        recorder
            .clone()
            .run(config.telemetry.flush_interval(), shutdown),
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(event = "server_error", error = %e, "Server encountered an error");
                final_flush(stop_flusher, flusher).await;
                std::process::exit(1);
            }
        }
        joined = &mut flusher => {
            match joined {
                Ok(Err(e)) => error!(
                    event = "telemetry_failed",
                    error = %e,
                    "Activity log is unwritable, shutting down"
                ),
                Ok(Ok(_)) => error!(event = "telemetry_failed", "Telemetry task stopped"),
                Err(e) => error!(event = "telemetry_failed", error = %e, "Telemetry task panicked"),
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = "shutdown_requested", "Interrupt received, flushing telemetry");
            final_flush(stop_flusher, flusher).await;
        }
    }

    info!(event = "server_shutdown", "Flytrap SFTP shutdown complete");
}

/// Stop the flush loop after its current flush and wait for its final one
async fn final_flush(
    stop: oneshot::Sender<()>,
    flusher: JoinHandle<flytrap_sftp::Result<FlushReport>>,
) {
    let _ = stop.send(());
    match flusher.await {
        Ok(Ok(report)) => info!(
            event = "telemetry_flushed",
            activity_written = report.activity_written,
            identities = ?report.identities,
            "Final telemetry flush"
        ),
        Ok(Err(e)) => {
            error!(event = "telemetry_failed", error = %e, "Final telemetry flush failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(event = "telemetry_failed", error = %e, "Telemetry task panicked");
            std::process::exit(1);
        }
    }
}

/// Install the global subscriber, writing to `logging.file` when set
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let (writer, guard) = match &logging.file {
        Some(log_file) => match file_writer(log_file) {
            Ok((writer, guard)) => (writer, Some(guard)),
            Err(e) => {
                eprintln!("Warning: cannot log to {}: {}", log_file.display(), e);
                eprintln!("Falling back to stderr logging");
                (BoxMakeWriter::new(std::io::stderr), None)
            }
        },
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let filter = EnvFilter::new(logging.level.clone());
    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        }
    }

    guard
}

fn file_writer(log_file: &Path) -> std::io::Result<(BoxMakeWriter, WorkerGuard)> {
    let directory = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "log file has no file name")
    })?;

    std::fs::create_dir_all(directory)?;

    let file_appender = tracing_appender::rolling::daily(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    Ok((BoxMakeWriter::new(non_blocking), guard))
}
