use anyhow::Result;
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// Control requests delivered by process signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// SIGTERM / SIGINT
    Shutdown,
    /// SIGHUP
    Reload,
    /// SIGUSR1: dump the catalog
    Snapshot,
}

impl SignalType {
    pub fn from_signal(signal: i32) -> Option<Self> {
        match signal {
            SIGTERM | SIGINT => Some(SignalType::Shutdown),
            SIGHUP => Some(SignalType::Reload),
            SIGUSR1 => Some(SignalType::Snapshot),
            _ => None,
        }
    }
}

/// Turns process signals into [`SignalType`] messages for the service loop
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    signal_sender: mpsc::UnboundedSender<SignalType>,
}

impl SignalHandler {
    pub fn new(signal_sender: mpsc::UnboundedSender<SignalType>) -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            signal_sender,
        }
    }

    /// Get a reference to the shutdown flag
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    /// Listen until a shutdown signal arrives
    pub async fn listen_for_signals(&self) -> Result<()> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP, SIGUSR1])?;

        info!("Signal handler initialized, listening for SIGTERM, SIGINT, SIGHUP, SIGUSR1");

        while let Some(signal) = signals.next().await {
            let Some(kind) = SignalType::from_signal(signal) else {
                warn!("Received unexpected signal: {}", signal);
                continue;
            };

            match kind {
                SignalType::Shutdown => {
                    info!(
                        "Received shutdown signal ({}), initiating graceful shutdown",
                        signal
                    );
                    self.shutdown_flag.store(true, Ordering::Relaxed);
                }
                SignalType::Reload => info!("Received SIGHUP signal, reloading configuration"),
                SignalType::Snapshot => info!("Received SIGUSR1 signal, writing catalog snapshot"),
            }

            if let Err(e) = self.signal_sender.send(kind) {
                warn!("Failed to forward {:?} signal: {}", kind, e);
            }
            if kind == SignalType::Shutdown {
                break;
            }
        }

        Ok(())
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }
}
