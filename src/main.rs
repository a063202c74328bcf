//! # SkyPulse GCS
//!
//! Headless ground-control session over a serial telemetry radio.
//!
//! Loads the configuration, polls the system's serial ports, connects to the
//! configured port and logs connection changes, new devices and telemetry
//! until Ctrl+C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use skypulse_gcs::config::{Config, LoggingConfig};
use skypulse_gcs::link::serial::SerialLink;
use skypulse_gcs::link::{Link, LinkEvent};
use skypulse_gcs::session::Session;

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix of the daily log files
const LOG_FILE_PREFIX: &str = "skypulse-gcs.log";

/// Load the configuration named on the command line, or the default file
///
/// A missing default file is not an error; built-in defaults apply.
fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load {}", DEFAULT_CONFIG_PATH)),
        None => Ok(Config::default()),
    }
}

/// Initialise logging to stdout, plus daily files when `log_dir` is set
///
/// `RUST_LOG` overrides the configured level. The returned guard must live
/// until exit so buffered file output is flushed.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let stdout = tracing_subscriber::fmt::layer();

    if logging.log_dir.is_empty() {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&logging.log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Some(guard)
}

/// Main entry point for SkyPulse GCS
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, `config/default.toml`, or defaults)
///    - Set up logging with tracing subscriber
///    - Open the serial link and spawn the session task
///    - Import radio settings when a settings file is configured
///
/// 2. **Main Loop**
///    - Poll serial ports and feed the snapshots to the session
///    - Log state transitions and new-device notifications
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Disconnect if connected
///    - Stop the session task
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(std::env::args().nth(1).map(PathBuf::from))?;
    let _log_guard = init_logging(&config.logging);

    info!("SkyPulse GCS v{} starting...", env!("CARGO_PKG_VERSION"));

    let (link, link_events) = SerialLink::new();
    let link = Arc::new(link);
    let port_events = link.event_sender();

    let (session, handle) = Session::new(link.clone(), link_events, &config);
    let session_task = tokio::spawn(session.run());

    let settings_file = &config.connection.radio_settings_file;
    if !settings_file.is_empty() {
        match handle.import_radio_settings(settings_file).await {
            Ok(_) => info!("Radio settings imported from {}", settings_file),
            Err(e) => warn!("Failed to import radio settings from {}: {}", settings_file, e),
        }
    }

    let radio = handle.radio_settings().await?;
    if radio.local.baud_rate != config.connection.baud_rate {
        warn!(
            "Configured baud rate {} differs from the radio's {}",
            config.connection.baud_rate, radio.local.baud_rate
        );
    }

    let mut transitions = handle.subscribe_transitions();
    let mut status = handle.status_receiver();

    handle
        .subscribe(|snapshot| {
            debug!(
                "Telemetry: alt {:.1} m, gs {:.1} m/s, bat {:.0}%, {} sats, mode {}",
                snapshot.altitude,
                snapshot.ground_speed,
                snapshot.battery,
                snapshot.satellites,
                snapshot.mode
            );
            Ok(())
        })
        .await?;

    if !config.connection.port.is_empty() {
        info!("Connecting to {}", config.connection.port);
        if let Err(e) = handle
            .connect(&config.connection.port, config.connection.baud_rate)
            .await
        {
            warn!("Connect to {} rejected: {}", config.connection.port, e);
        }
    }

    let mut poll = interval(Duration::from_millis(config.ports.poll_interval_ms));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_notification = None;

    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = poll.tick() => match link.get_ports().await {
                Ok(ports) => {
                    if port_events.send(LinkEvent::PortsUpdated(ports)).await.is_err() {
                        warn!("Session stopped accepting link events");
                        break;
                    }
                }
                Err(e) => warn!("Port listing failed: {}", e),
            },

            transition = transitions.recv() => match transition {
                Ok(t) => match t.message {
                    Some(message) => info!("Connection {} -> {}: {}", t.from, t.to, message),
                    None => info!("Connection {} -> {}", t.from, t.to),
                },
                Err(RecvError::Lagged(missed)) => warn!("Missed {} state transitions", missed),
                Err(RecvError::Closed) => break,
            },

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let notification = status.borrow_and_update().port_notification.clone();
                if let Some(n) = notification {
                    if last_notification != Some(n.id) {
                        info!(
                            "New device: {} ({}){}",
                            n.display_name,
                            n.path,
                            if n.is_known_telemetry { " - telemetry radio" } else { "" }
                        );
                        last_notification = Some(n.id);
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if handle.state().is_connected() {
        match handle.disconnect().await {
            Ok(response) => info!("{}", response.message),
            Err(e) => warn!("Disconnect failed: {}", e),
        }
    }

    handle.shutdown();
    session_task.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path_loads() {
        let config = load_config(None).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let result = load_config(Some(PathBuf::from("/nonexistent/skypulse.toml")));
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("/nonexistent/skypulse.toml"));
    }

    #[test]
    fn test_log_file_prefix() {
        assert!(LOG_FILE_PREFIX.ends_with(".log"));
    }
}
