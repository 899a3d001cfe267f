use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::audio::{
    BluetoothPeerInfo, CardInfo, ModuleArgs, ModuleInfo, ModuleKind, SinkInfo, SourceInfo,
    StreamInfo, VolumeTarget,
};
use crate::error::ServerError;

/// What happened to a server object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Remove,
}

/// Object category an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    Card,
    Sink,
    Source,
}

/// A typed change notification from the audio server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEvent {
    pub kind: EventKind,
    pub facility: Facility,
    pub index: u32,
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EventKind::New => "new",
            EventKind::Remove => "remove",
        };
        let facility = match self.facility {
            Facility::Card => "card",
            Facility::Sink => "sink",
            Facility::Source => "source",
        };
        write!(f, "{kind} {facility} #{}", self.index)
    }
}

/// Subscription to card/sink/source change events.
pub trait EventStream: Send {
    /// Wait up to `timeout` for the next event. `Ok(None)` means the wait
    /// timed out; a closed subscription is reported as unavailable.
    fn next(&mut self, timeout: Duration) -> Result<Option<ServerEvent>, ServerError>;
}

/// Synchronous handle on the host audio server.
pub trait AudioServerClient: Send {
    fn list_sinks(&self) -> Result<Vec<SinkInfo>, ServerError>;

    fn list_sources(&self) -> Result<Vec<SourceInfo>, ServerError>;

    fn list_cards(&self) -> Result<Vec<CardInfo>, ServerError>;

    fn list_modules(&self) -> Result<Vec<ModuleInfo>, ServerError>;

    /// Active playback streams, annotated with their owning binary.
    fn list_streams(&self) -> Result<Vec<StreamInfo>, ServerError>;

    /// Load a routing module and return its server index.
    fn load_module(&self, kind: ModuleKind, args: &ModuleArgs) -> Result<u32, ServerError>;

    fn unload_module(&self, index: u32) -> Result<(), ServerError>;

    fn set_default_sink(&self, name: &str) -> Result<(), ServerError>;

    fn set_default_source(&self, name: &str) -> Result<(), ServerError>;

    /// Set every channel of `target` to `level` (1.0 = 100%).
    fn set_volume(&self, target: VolumeTarget, channels: u8, level: f64)
    -> Result<(), ServerError>;

    fn set_card_profile(&self, card: &str, profile: &str) -> Result<(), ServerError>;

    fn subscribe_events(&self) -> Result<Box<dyn EventStream>, ServerError>;
}

/// Opens fresh server handles, once at startup and again after each loss.
pub trait AudioServerConnector: Send + 'static {
    fn connect(&self) -> Result<Box<dyn AudioServerClient>, ServerError>;
}

/// Snapshot feed of connected wireless peers.
pub trait BluetoothPresence: Send + 'static {
    fn connected_peers(&self) -> Result<Vec<BluetoothPeerInfo>>;
}

/// Trait for file system operations - abstracts std::fs for testability
pub trait FileSystemInterface {
    /// Read the entire contents of a configuration file
    fn read_config_file(&self, path: &Path) -> Result<String>;

    /// Write configuration content to a file
    fn write_config_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Check if a configuration file exists
    fn config_file_exists(&self, path: &Path) -> bool;

    /// Create the directory structure for config files
    fn create_config_dir(&self, path: &Path) -> Result<()>;
}
