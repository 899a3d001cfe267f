use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::reconciler::{ControllerHandle, Reconciler};
use super::signals::{SignalHandler, SignalType};
use crate::config::Config;
use crate::system::{AudioServerConnector, BluetoothCtl, BluetoothPresence, PactlConnector};

const SNAPSHOT_FILE: &str = "snapshot.json";

/// Manages the daemon lifecycle: the reconciliation worker plus signal handling
pub struct ServiceManager<C, B>
where
    C: AudioServerConnector + Clone,
    B: BluetoothPresence + Clone,
{
    config: Config,
    config_path: Option<String>,
    snapshot_path: PathBuf,
    connector: C,
    bluetooth: B,
    controller: Option<ControllerHandle>,
}

impl ServiceManager<PactlConnector, BluetoothCtl> {
    /// Service manager driving the real audio server and Bluetooth stack
    pub fn new_production(config: Config, config_path: Option<String>) -> Result<Self> {
        Ok(Self::new(
            config,
            config_path,
            PactlConnector,
            BluetoothCtl,
            default_snapshot_path()?,
        ))
    }
}

impl<C, B> ServiceManager<C, B>
where
    C: AudioServerConnector + Clone,
    B: BluetoothPresence + Clone,
{
    pub fn new(
        config: Config,
        config_path: Option<String>,
        connector: C,
        bluetooth: B,
        snapshot_path: PathBuf,
    ) -> Self {
        Self {
            config,
            config_path,
            snapshot_path,
            connector,
            bluetooth,
            controller: None,
        }
    }

    /// Start the worker and serve signals until shutdown
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting audio topology controller service");

        self.start_controller()?;

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalType>();
        let signal_handler = SignalHandler::new(signal_tx);
        let shutdown_flag = signal_handler.shutdown_flag();

        tokio::spawn(async move {
            if let Err(e) = signal_handler.listen_for_signals().await {
                error!("Signal handler error: {}", e);
            }
        });

        info!("Service started successfully, entering main loop");

        loop {
            tokio::select! {
                signal = signal_rx.recv() => {
                    let Some(signal) = signal else {
                        warn!("Signal channel closed");
                        break;
                    };
                    if !self.handle_signal(signal).await {
                        break;
                    }
                }
                _ = sleep(Duration::from_millis(100)) => {
                    if shutdown_flag.load(std::sync::atomic::Ordering::Relaxed) {
                        info!("Shutdown flag set, stopping service");
                        break;
                    }
                    if self.controller.as_ref().is_some_and(|c| c.is_finished()) {
                        error!("Reconciliation worker exited unexpectedly");
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// React to one control request. Returns false once the service should stop.
    pub async fn handle_signal(&mut self, signal: SignalType) -> bool {
        match signal {
            SignalType::Shutdown => {
                info!("Shutdown signal received, stopping service");
                false
            }
            SignalType::Reload => {
                if let Err(e) = self.reload_config().await {
                    error!("Failed to reload configuration: {:#}", e);
                }
                true
            }
            SignalType::Snapshot => {
                match self.write_snapshot() {
                    Ok(Some(path)) => info!("Catalog snapshot written to {}", path.display()),
                    Ok(None) => warn!("No catalog snapshot available yet"),
                    Err(e) => error!("Failed to write catalog snapshot: {:#}", e),
                }
                true
            }
        }
    }

    fn start_controller(&mut self) -> Result<()> {
        let reconciler = Reconciler::new(
            &self.config,
            self.connector.clone(),
            self.bluetooth.clone(),
        );
        self.controller = Some(reconciler.spawn()?);
        Ok(())
    }

    async fn stop_controller(&mut self) -> Result<()> {
        if let Some(controller) = self.controller.take() {
            tokio::task::spawn_blocking(move || controller.stop())
                .await
                .context("Reconciliation worker join failed")??;
        }
        Ok(())
    }

    /// Shutdown the service gracefully, tearing down managed modules
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down audio topology controller service");
        self.stop_controller().await?;
        info!("Service shutdown completed");
        Ok(())
    }

    /// Reload configuration (SIGHUP): the running worker tears down and a new
    /// one starts under the reloaded policy. A config that fails to load
    /// leaves the running worker untouched.
    pub async fn reload_config(&mut self) -> Result<()> {
        info!("Reloading configuration");

        let new_config = Config::load(self.config_path.as_deref())?;

        self.stop_controller().await?;
        self.config = new_config;
        self.start_controller()?;

        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Write the latest catalog snapshot as JSON. `None` when the worker has
    /// not published one yet.
    pub fn write_snapshot(&self) -> Result<Option<PathBuf>> {
        let Some(snapshot) = self.controller.as_ref().and_then(|c| c.snapshot()) else {
            return Ok(None);
        };

        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create snapshot directory: {}", parent.display())
            })?;
        }
        let json = serde_json::to_string_pretty(&*snapshot)
            .context("Failed to serialize catalog snapshot")?;
        std::fs::write(&self.snapshot_path, json).with_context(|| {
            format!("Failed to write snapshot: {}", self.snapshot_path.display())
        })?;

        Ok(Some(self.snapshot_path.clone()))
    }

    /// Check if the worker is running
    pub fn is_running(&self) -> bool {
        self.controller.as_ref().is_some_and(|c| !c.is_finished())
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

/// Default location for SIGUSR1 catalog snapshots
pub fn default_snapshot_path() -> Result<PathBuf> {
    let home_dir =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?;
    Ok(home_dir
        .join(".local/share/audio-topology-controller")
        .join(SNAPSHOT_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SinkInfo;
    use crate::system::{MockAudioServer, MockBluetooth};
    use tempfile::TempDir;

    fn config() -> Config {
        let mut config = Config::default();
        config.general.event_wait_ms = 10;
        config.general.reconnect_delay_ms = 0;
        config
    }

    fn manager(
        server: &MockAudioServer,
        dir: &TempDir,
        config_path: Option<String>,
    ) -> ServiceManager<MockAudioServer, MockBluetooth> {
        ServiceManager::new(
            config(),
            config_path,
            server.clone(),
            MockBluetooth::new(),
            dir.path().join("state").join(SNAPSHOT_FILE),
        )
    }

    async fn wait_for_snapshot(manager: &ServiceManager<MockAudioServer, MockBluetooth>) {
        for _ in 0..200 {
            if manager
                .controller
                .as_ref()
                .and_then(|c| c.snapshot())
                .is_some()
            {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never published a snapshot");
    }

    #[tokio::test]
    async fn test_snapshot_signal_writes_catalog_json() {
        let server = MockAudioServer::new();
        server.add_sink(SinkInfo {
            index: 1,
            name: "alsa_output.usb".to_string(),
            description: "USB Audio".to_string(),
            channels: 2,
            alsa_card: None,
        });
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&server, &dir, None);

        manager.start_controller().unwrap();
        wait_for_snapshot(&manager).await;

        assert!(manager.handle_signal(SignalType::Snapshot).await);
        let written = std::fs::read_to_string(manager.snapshot_path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["catalog"]["sinks"][0]["info"]["name"], "alsa_output.usb");

        manager.shutdown().await.unwrap();
        assert_eq!(server.monitor_sinks(), 0);
    }

    #[tokio::test]
    async fn test_reload_restarts_worker_with_new_policy() {
        let server = MockAudioServer::new();
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "[policy]\nmonitor_sink_name = \"reloaded_monitor\"\n",
        )
        .unwrap();

        let mut manager = manager(
            &server,
            &dir,
            Some(config_path.to_string_lossy().into_owned()),
        );
        manager.start_controller().unwrap();
        wait_for_snapshot(&manager).await;
        assert_eq!(
            server.default_source(),
            Some("topology_monitor.monitor".to_string())
        );

        assert!(manager.handle_signal(SignalType::Reload).await);
        wait_for_snapshot(&manager).await;

        assert_eq!(manager.config().policy.monitor_sink_name, "reloaded_monitor");
        assert_eq!(server.connect_count(), 2);
        assert!(manager.is_running());

        assert!(!manager.handle_signal(SignalType::Shutdown).await);
        manager.shutdown().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(server.monitor_sinks(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_before_worker_starts_is_none() {
        let server = MockAudioServer::new();
        let dir = TempDir::new().unwrap();
        let manager = manager(&server, &dir, None);

        assert!(manager.write_snapshot().unwrap().is_none());
        assert!(!manager.snapshot_path().exists());
    }
}
