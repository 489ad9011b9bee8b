//! Background daemon for desktop hardware control.
//!
//! The daemon:
//! 1. Connects to the system bus and probes the Bluetooth adapter
//! 2. Serves the REST API
//! 3. Waits for SIGINT/SIGTERM
//! 4. Shuts the API down, then closes the Bluetooth backend

use crate::api::{self, ApiState};
use crate::bluetooth::{BluetoothBackend, StatusCache};
use crate::config::{BluetoothConfig, Config};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("API server error: {0}")]
    Api(#[from] anyhow::Error),

    #[error("Daemon already running")]
    AlreadyRunning,

    #[error("Daemon not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connect the Bluetooth backend, or a disabled one if that is impossible.
async fn connect_bluetooth(config: &BluetoothConfig, cache: Arc<StatusCache>) -> BluetoothBackend {
    if !config.enabled {
        info!("Bluetooth disabled in config");
        return BluetoothBackend::disabled();
    }
    probe_system_bus(config, cache).await
}

#[cfg(target_os = "linux")]
async fn probe_system_bus(config: &BluetoothConfig, cache: Arc<StatusCache>) -> BluetoothBackend {
    match crate::bus::ZbusClient::system().await {
        Ok(client) => BluetoothBackend::probe(client, cache, config).await,
        Err(e) => {
            warn!("System bus unavailable, Bluetooth disabled: {}", e);
            BluetoothBackend::disabled()
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn probe_system_bus(
    _config: &BluetoothConfig,
    _cache: Arc<StatusCache>,
) -> BluetoothBackend {
    warn!("Bluetooth control needs BlueZ, which is Linux only");
    BluetoothBackend::disabled()
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Main daemon struct
pub struct Daemon {
    config: Config,
    bluetooth: Arc<BluetoothBackend>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Bring up the backends.
    pub async fn new(config: Config) -> Self {
        let cache = Arc::new(StatusCache::new());
        let bluetooth = connect_bluetooth(&config.bluetooth, cache).await;

        Self {
            config,
            bluetooth: Arc::new(bluetooth),
            shutdown: CancellationToken::new(),
        }
    }

    /// Main daemon loop
    pub async fn run_loop(&self) -> Result<(), DaemonError> {
        info!(
            "deskctl daemon started (bluetooth: {})",
            if self.bluetooth.is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        let api_task = if self.config.api.enabled {
            if self.config.api.api_key_hash.is_none() {
                warn!("No API key configured, the REST API accepts unauthenticated requests");
            }
            let listener = match api::bind(&self.config.api).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.bluetooth.close().await;
                    return Err(DaemonError::Api(e));
                }
            };
            let state = ApiState::new(
                Arc::clone(&self.bluetooth),
                self.config.api.api_key_hash.clone(),
            );
            let config = self.config.api.clone();
            let token = self.shutdown.clone();
            Some(tokio::spawn(async move {
                api::serve_on(listener, state, &config, token).await
            }))
        } else {
            info!("REST API disabled in config");
            None
        };

        shutdown_signal().await;
        info!("Shutdown signal received");
        self.shutdown.cancel();

        let mut result = Ok(());
        if let Some(task) = api_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("REST API server failed: {}", e);
                    result = Err(DaemonError::Api(e));
                }
                Err(e) => error!("REST API task panicked: {}", e),
            }
        }

        self.bluetooth.close().await;
        info!("Daemon stopped");
        result
    }
}

/// Get the PID file path
fn pid_file() -> Result<PathBuf, DaemonError> {
    let runtime_dir = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or(DaemonError::Config(crate::config::ConfigError::NoConfigDir))?;

    Ok(runtime_dir.join("deskctl.pid"))
}

fn read_pid() -> Option<i32> {
    let path = pid_file().ok()?;
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

/// PID of the running daemon, if any.
fn running_pid() -> Option<i32> {
    read_pid().filter(|&pid| process_alive(pid))
}

/// Write PID file
fn write_pid() -> Result<(), DaemonError> {
    let path = pid_file()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())?;
    Ok(())
}

/// Remove PID file
fn remove_pid() -> Result<(), DaemonError> {
    let path = pid_file()?;
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// Start the daemon in the foreground
pub async fn run() -> Result<(), DaemonError> {
    if running_pid().is_some() {
        return Err(DaemonError::AlreadyRunning);
    }

    let config = Config::load()?;

    write_pid()?;

    let daemon = Daemon::new(config).await;
    let result = daemon.run_loop().await;

    remove_pid()?;

    result
}

/// Stop the daemon
pub async fn stop() -> Result<(), DaemonError> {
    let pid = running_pid().ok_or(DaemonError::NotRunning)?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)?;
        info!("Sent SIGTERM to daemon (PID: {})", pid);
    }

    #[cfg(not(unix))]
    {
        error!("Stop not implemented on this platform (PID: {})", pid);
    }

    Ok(())
}

/// Check daemon status
pub async fn status() -> Result<(), DaemonError> {
    match running_pid() {
        Some(pid) => println!("deskctl daemon is running (PID: {})", pid),
        None => println!("deskctl daemon is not running"),
    }

    Ok(())
}
