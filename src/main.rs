use clap::Parser;
use log::{error, info, warn};
use sieve::api::{self, ApiState};
use sieve::config::Config;
use sieve::error::{ConfigError, SessionError};
use sieve::filter::FilterEngine;
use sieve::forwarder::Forwarder;
use sieve::health::{HealthMonitor, HealthReport};
use sieve::metrics::MetricsAggregator;
use sieve::pipeline::EventPipeline;
use sieve::session::{ConnectionState, HubSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Configuration file tried when no `--config` is given
const DEFAULT_CONFIG_PATH: &str = "sieve.toml";

/// Command-line arguments for the hub event sieve
#[derive(Parser)]
#[command(
    name = "sieve",
    about = "Home-automation event sieve - filters and forwards hub events",
    long_about = "Connects to a home-automation hub over WebSocket, normalizes and filters the \
                  event stream, and forwards the kept events to an append log and an event store, \
                  with live stats and health exposed over HTTP."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults later, so only reject
            // paths that exist and are not regular files
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Convert config path to string safely, handling non-UTF-8 paths
    ///
    /// # Returns
    ///
    /// `Ok(Some(path_str))` if config is provided and valid UTF-8,
    /// `Ok(None)` if no config provided,
    /// `Err(String)` if config path contains invalid UTF-8
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }
}

/// Main application struct that wires the pipeline components together
///
/// EventSieve owns the channels between the hub session, the filter
/// workers and the observers, manages task lifecycles and coordinates
/// graceful shutdown.
pub struct EventSieve {
    /// Application configuration
    config: Config,

    /// Process-wide counters shared by every component
    metrics: Arc<MetricsAggregator>,

    /// Shutdown flag watched by all spawned tasks
    shutdown_tx: watch::Sender<bool>,

    /// The hub session task; its result decides the process exit code
    session: Option<JoinHandle<Result<(), SessionError>>>,

    /// Pipeline, health and API task handles for cleanup
    tasks: Vec<JoinHandle<()>>,

    /// Set when a component ended with a fatal error
    failed: bool,
}

impl EventSieve {
    /// Create a new EventSieve with the given configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration fails validation.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        info!("Initializing event sieve with configuration");
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(EventSieve {
            config,
            metrics: Arc::new(MetricsAggregator::new()),
            shutdown_tx,
            session: None,
            tasks: Vec::new(),
            failed: false,
        })
    }

    /// Load configuration from file or use defaults
    ///
    /// A missing file falls back to the built-in defaults with a warning;
    /// an unreadable or invalid file is a startup error.
    pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        let path_ref = std::path::Path::new(path);

        if !path_ref.exists() {
            if config_path.is_some() {
                warn!("Configuration file '{}' not found, using defaults", path);
            } else {
                info!(
                    "No {} in the working directory, using default configuration",
                    DEFAULT_CONFIG_PATH
                );
            }
            return Ok(Config::default());
        }

        info!("Loading configuration from: {}", path);
        Config::from_file(path_ref)
    }

    /// Start every component task
    ///
    /// Spawns the pipeline workers, the health monitor, the stats API and
    /// finally the hub session, wired together with bounded channels.
    /// Returns immediately; the tasks run until shutdown.
    pub fn start(&mut self) {
        info!("Starting event sieve components");

        let shutdown_rx = self.shutdown_tx.subscribe();
        let (event_tx, event_rx) = mpsc::channel(self.config.pipeline.queue_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (health_tx, health_rx) = watch::channel(HealthReport::startup());

        let engine = Arc::new(FilterEngine::new(&self.config.filter));
        let forwarder = Arc::new(Forwarder::new(
            &self.config.forwarder,
            Arc::clone(&self.metrics),
        ));
        let pipeline = EventPipeline::new(
            self.config.pipeline.clone(),
            engine,
            forwarder,
            Arc::clone(&self.metrics),
        );
        self.tasks
            .push(tokio::spawn(pipeline.run(event_rx, shutdown_rx.clone())));

        let monitor = HealthMonitor::new(
            &self.config.health,
            Arc::clone(&self.metrics),
            state_rx,
            health_tx,
        );
        self.tasks.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

        // The API is an observability surface; losing it (e.g. the port is
        // taken) does not stop event forwarding
        let api_config = self.config.api.clone();
        let api_state = ApiState {
            metrics: Arc::clone(&self.metrics),
            health: health_rx,
        };
        let api_shutdown = shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(err) = api::serve(&api_config, api_state, api_shutdown).await {
                error!("Stats API failed: {}", err);
            }
        }));

        let session = HubSession::new(
            self.config.hub.clone(),
            Arc::clone(&self.metrics),
            event_tx,
            state_tx,
            shutdown_rx,
        );
        self.session = Some(tokio::spawn(session.run()));

        info!("All event sieve components started");
    }

    /// Wait for an interrupt signal or for the hub session to end
    ///
    /// The session ends on its own when authentication is rejected or the
    /// reconnect budget runs out; both are fatal for the process.
    pub async fn wait_for_shutdown(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let (session_done, fatal) = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received interrupt signal, shutting down gracefully..."),
                    Err(err) => error!("Failed to listen for interrupt signals: {}", err),
                }
                (false, false)
            }
            result = session => {
                let fatal = match result {
                    Ok(Ok(())) => {
                        info!("Hub session ended");
                        false
                    }
                    Ok(Err(err)) => {
                        error!("Hub session ended with error: {}", err);
                        true
                    }
                    Err(err) => {
                        error!("Hub session task panicked: {}", err);
                        true
                    }
                };
                (true, fatal)
            }
        };

        if session_done {
            self.session = None;
        }
        if fatal {
            self.failed = true;
        }
    }

    /// Stop all components and wait for them to finish
    ///
    /// Flips the shutdown flag, then joins the session and the remaining
    /// tasks; the pipeline bounds its own drain with the grace window.
    pub async fn stop(&mut self) {
        info!("Stopping event sieve components");

        if self.shutdown_tx.send(true).is_err() {
            warn!("All shutdown receivers already gone");
        }

        if let Some(session) = self.session.take() {
            match session.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("Hub session ended with error: {}", err);
                    if err.is_fatal() {
                        self.failed = true;
                    }
                }
                Err(err) => {
                    error!("Hub session task panicked: {}", err);
                    self.failed = true;
                }
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!("Task failed to join: {}", err);
            }
        }

        let stats = self.metrics.snapshot();
        info!(
            "Final stats: {} events processed, {} filtered ({:.1}%), {} stored",
            stats.total_processed,
            stats.total_filtered,
            stats.filter_rate * 100.0,
            stats.total_stored
        );
        info!("Event sieve stopped");
    }

    /// Whether any component ended with a fatal error
    pub fn failed(&self) -> bool {
        self.failed
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting hub event sieve");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config_path = match cli.config_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid configuration path: {}", e);
            std::process::exit(1);
        }
    };

    let config = match EventSieve::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut sieve = match EventSieve::new(config) {
        Ok(sieve) => sieve,
        Err(e) => {
            error!("Failed to initialize event sieve: {}", e);
            std::process::exit(1);
        }
    };

    sieve.start();

    info!("Event sieve is running. Press Ctrl+C to stop.");

    sieve.wait_for_shutdown().await;
    sieve.stop().await;

    if sieve.failed() {
        std::process::exit(1);
    }

    info!("Event sieve shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_validation_with_existing_file() {
        let temp_file = std::env::temp_dir().join("sieve_cli_test_config.toml");
        std::fs::write(&temp_file, "[api]\nlisten_addr = \"127.0.0.1:0\"").unwrap();

        let cli = Cli {
            config: Some(temp_file.clone()),
            verbose: false,
        };

        assert!(cli.validate().is_ok());

        std::fs::remove_file(&temp_file).unwrap();
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            verbose: false,
        };

        // Missing files are handled gracefully at load time
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let cli = Cli {
            config: Some(PathBuf::from("/tmp")),
            verbose: false,
        };

        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_validation_no_config() {
        let cli = Cli {
            config: None,
            verbose: false,
        };

        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_config_path_str_with_valid_path() {
        let cli = Cli {
            config: Some(PathBuf::from("sieve.toml")),
            verbose: false,
        };

        let result = cli.config_path_str().unwrap();
        assert_eq!(result, Some("sieve.toml"));
    }

    #[test]
    fn test_config_path_str_no_config() {
        let cli = Cli {
            config: None,
            verbose: false,
        };

        let result = cli.config_path_str().unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_load_config_missing_file_falls_back_to_defaults() {
        let config =
            EventSieve::load_config(Some("/nonexistent/sieve.toml")).expect("expected defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_rejects_malformed_toml() {
        let temp_file = std::env::temp_dir().join("sieve_malformed_config.toml");
        std::fs::write(&temp_file, "not [valid toml").unwrap();

        let result = EventSieve::load_config(temp_file.to_str());
        assert!(matches!(result, Err(ConfigError::TomlError(_))));

        std::fs::remove_file(&temp_file).unwrap();
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let temp_file = std::env::temp_dir().join("sieve_invalid_config.toml");
        std::fs::write(&temp_file, "[filter]\nsampling_rate = 3.0").unwrap();

        let result = EventSieve::load_config(temp_file.to_str());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        std::fs::remove_file(&temp_file).unwrap();
    }
}
