use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::audio::{
    BluetoothPeerInfo, CardInfo, ModuleArgs, ModuleInfo, ModuleKind, SinkInfo, SourceInfo,
    StreamInfo, VolumeTarget,
};
use crate::error::ServerError;
use crate::system::traits::{
    AudioServerClient, AudioServerConnector, BluetoothPresence, EventKind, EventStream, Facility,
    FileSystemInterface, ServerEvent,
};

/// A call the mock server received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCall {
    ListSinks,
    ListSources,
    ListCards,
    ListModules,
    ListStreams,
    LoadModule { kind: ModuleKind, args: String },
    UnloadModule(u32),
    SetDefaultSink(String),
    SetDefaultSource(String),
    SetVolume {
        target: VolumeTarget,
        channels: u8,
        level: f64,
    },
    SetCardProfile { card: String, profile: String },
    Subscribe,
}

impl ServerCall {
    /// Whether the call changes server state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ServerCall::ListSinks
                | ServerCall::ListSources
                | ServerCall::ListCards
                | ServerCall::ListModules
                | ServerCall::ListStreams
                | ServerCall::Subscribe
        )
    }
}

#[derive(Debug, Default)]
struct MockServerState {
    sinks: Vec<SinkInfo>,
    sources: Vec<SourceInfo>,
    cards: Vec<CardInfo>,
    modules: Vec<ModuleInfo>,
    streams: Vec<StreamInfo>,
    /// Module index → sink index for sinks published by modules.
    module_sinks: HashMap<u32, u32>,
    default_sink: Option<String>,
    default_source: Option<String>,
    next_index: u32,
    calls: Vec<ServerCall>,
    subscribers: Vec<Sender<ServerEvent>>,
    down: bool,
    /// Calls left before a one-shot unavailability.
    fail_after: Option<usize>,
    reject_unload: bool,
    rejected_listing: Option<ServerCall>,
    connects: usize,
}

impl MockServerState {
    fn allocate_index(&mut self) -> u32 {
        self.next_index += 1;
        1000 + self.next_index
    }

    fn emit(&mut self, event: ServerEvent) {
        self.subscribers.retain(|s| s.send(event).is_ok());
    }

    fn record(&mut self, call: ServerCall) -> Result<(), ServerError> {
        if self.down {
            return Err(ServerError::unavailable("mock server is down"));
        }
        if let Some(remaining) = self.fail_after {
            if remaining == 0 {
                self.fail_after = None;
                self.subscribers.clear();
                return Err(ServerError::unavailable("mock server connection lost"));
            }
            self.fail_after = Some(remaining - 1);
        }
        if self.rejected_listing.as_ref() == Some(&call) {
            self.calls.push(call);
            return Err(ServerError::rejected("list", "mock server refused listing"));
        }
        self.calls.push(call);
        Ok(())
    }
}

/// In-memory audio server for tests. Clones share state, so a test keeps
/// one handle while the controller owns another.
#[derive(Debug, Clone, Default)]
pub struct MockAudioServer {
    state: Arc<Mutex<MockServerState>>,
}

impl MockAudioServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a sink and notify subscribers.
    pub fn add_sink(&self, sink: SinkInfo) {
        let mut state = self.state();
        let index = sink.index;
        state.sinks.push(sink);
        state.emit(ServerEvent {
            kind: EventKind::New,
            facility: Facility::Sink,
            index,
        });
    }

    pub fn remove_sink(&self, index: u32) {
        let mut state = self.state();
        state.sinks.retain(|s| s.index != index);
        state.emit(ServerEvent {
            kind: EventKind::Remove,
            facility: Facility::Sink,
            index,
        });
    }

    pub fn add_source(&self, source: SourceInfo) {
        let mut state = self.state();
        let index = source.index;
        state.sources.push(source);
        state.emit(ServerEvent {
            kind: EventKind::New,
            facility: Facility::Source,
            index,
        });
    }

    pub fn remove_source(&self, index: u32) {
        let mut state = self.state();
        state.sources.retain(|s| s.index != index);
        state.emit(ServerEvent {
            kind: EventKind::Remove,
            facility: Facility::Source,
            index,
        });
    }

    pub fn add_card(&self, card: CardInfo) {
        let mut state = self.state();
        let index = card.index;
        state.cards.push(card);
        state.emit(ServerEvent {
            kind: EventKind::New,
            facility: Facility::Card,
            index,
        });
    }

    /// Add a module as if something else had loaded it.
    pub fn add_module(&self, kind: ModuleKind, argument: &str) -> u32 {
        let mut state = self.state();
        let index = state.allocate_index();
        state.modules.push(ModuleInfo {
            index,
            name: kind.module_name().to_string(),
            argument: argument.to_string(),
        });
        index
    }

    pub fn set_streams(&self, streams: Vec<StreamInfo>) {
        self.state().streams = streams;
    }

    /// Push an arbitrary event to subscribers.
    pub fn emit(&self, event: ServerEvent) {
        self.state().emit(event);
    }

    /// Take the server down (or bring it back). While down every call and
    /// every connect attempt fails as unavailable.
    pub fn set_down(&self, down: bool) {
        let mut state = self.state();
        state.down = down;
        if down {
            state.subscribers.clear();
        }
    }

    /// Let `calls` more calls succeed, then fail the next one as unavailable.
    pub fn fail_after(&self, calls: usize) {
        self.state().fail_after = Some(calls);
    }

    /// Make unload requests fail as rejected.
    pub fn set_reject_unload(&self, reject: bool) {
        self.state().reject_unload = reject;
    }

    /// Make one listing call (e.g. `ServerCall::ListStreams`) fail as
    /// rejected. `None` clears it.
    pub fn set_rejected_listing(&self, listing: Option<ServerCall>) {
        self.state().rejected_listing = listing;
    }

    pub fn calls(&self) -> Vec<ServerCall> {
        self.state().calls.clone()
    }

    pub fn mutations(&self) -> Vec<ServerCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.state().modules.clone()
    }

    /// (source, sink) of every loaded loopback.
    pub fn loopbacks(&self) -> Vec<(String, String)> {
        self.modules_of(ModuleKind::Loopback)
            .iter()
            .map(|args| {
                (
                    args.get("source").unwrap_or_default().to_string(),
                    args.get("sink").unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    /// Member sinks of each loaded aggregate-sink module.
    pub fn aggregates(&self) -> Vec<Vec<String>> {
        self.modules_of(ModuleKind::AggregateSink)
            .iter()
            .map(|args| args.get_list("slaves"))
            .collect()
    }

    pub fn monitor_sinks(&self) -> usize {
        self.modules_of(ModuleKind::MonitorSink).len()
    }

    fn modules_of(&self, kind: ModuleKind) -> Vec<ModuleArgs> {
        self.state()
            .modules
            .iter()
            .filter(|m| m.name == kind.module_name())
            .filter_map(|m| ModuleArgs::parse(&m.argument).ok())
            .collect()
    }

    pub fn default_sink(&self) -> Option<String> {
        self.state().default_sink.clone()
    }

    pub fn default_source(&self) -> Option<String> {
        self.state().default_source.clone()
    }

    pub fn active_profile(&self, card: &str) -> Option<String> {
        self.state()
            .cards
            .iter()
            .find(|c| c.name == card)
            .and_then(|c| c.active_profile.clone())
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.state().sinks.iter().map(|s| s.name.clone()).collect()
    }
}

impl AudioServerClient for MockAudioServer {
    fn list_sinks(&self) -> Result<Vec<SinkInfo>, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::ListSinks)?;
        Ok(state.sinks.clone())
    }

    fn list_sources(&self) -> Result<Vec<SourceInfo>, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::ListSources)?;
        Ok(state.sources.clone())
    }

    fn list_cards(&self) -> Result<Vec<CardInfo>, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::ListCards)?;
        Ok(state.cards.clone())
    }

    fn list_modules(&self) -> Result<Vec<ModuleInfo>, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::ListModules)?;
        Ok(state.modules.clone())
    }

    fn list_streams(&self) -> Result<Vec<StreamInfo>, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::ListStreams)?;
        Ok(state.streams.clone())
    }

    fn load_module(&self, kind: ModuleKind, args: &ModuleArgs) -> Result<u32, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::LoadModule {
            kind,
            args: args.to_string(),
        })?;

        let index = state.allocate_index();
        state.modules.push(ModuleInfo {
            index,
            name: kind.module_name().to_string(),
            argument: args.to_string(),
        });

        // Virtual sinks appear like any other sink.
        if let (ModuleKind::AggregateSink | ModuleKind::MonitorSink, Some(name)) =
            (kind, args.get("sink_name"))
        {
            let sink_index = state.allocate_index();
            state.sinks.push(SinkInfo {
                index: sink_index,
                name: name.to_string(),
                description: name.to_string(),
                channels: 2,
                alsa_card: None,
            });
            state.module_sinks.insert(index, sink_index);
            state.emit(ServerEvent {
                kind: EventKind::New,
                facility: Facility::Sink,
                index: sink_index,
            });
        }

        Ok(index)
    }

    fn unload_module(&self, index: u32) -> Result<(), ServerError> {
        let mut state = self.state();
        state.record(ServerCall::UnloadModule(index))?;

        if state.reject_unload || !state.modules.iter().any(|m| m.index == index) {
            return Err(ServerError::rejected(
                format!("unload-module {index}"),
                "No such entity",
            ));
        }
        state.modules.retain(|m| m.index != index);

        if let Some(sink_index) = state.module_sinks.remove(&index) {
            state.sinks.retain(|s| s.index != sink_index);
            state.emit(ServerEvent {
                kind: EventKind::Remove,
                facility: Facility::Sink,
                index: sink_index,
            });
        }
        Ok(())
    }

    fn set_default_sink(&self, name: &str) -> Result<(), ServerError> {
        let mut state = self.state();
        state.record(ServerCall::SetDefaultSink(name.to_string()))?;
        state.default_sink = Some(name.to_string());
        Ok(())
    }

    fn set_default_source(&self, name: &str) -> Result<(), ServerError> {
        let mut state = self.state();
        state.record(ServerCall::SetDefaultSource(name.to_string()))?;
        state.default_source = Some(name.to_string());
        Ok(())
    }

    fn set_volume(
        &self,
        target: VolumeTarget,
        channels: u8,
        level: f64,
    ) -> Result<(), ServerError> {
        self.state().record(ServerCall::SetVolume {
            target,
            channels,
            level,
        })
    }

    fn set_card_profile(&self, card: &str, profile: &str) -> Result<(), ServerError> {
        let mut state = self.state();
        state.record(ServerCall::SetCardProfile {
            card: card.to_string(),
            profile: profile.to_string(),
        })?;

        match state.cards.iter_mut().find(|c| c.name == card) {
            Some(entry) => {
                entry.active_profile = Some(profile.to_string());
                Ok(())
            }
            None => Err(ServerError::rejected(
                format!("set-card-profile {card}"),
                "No such entity",
            )),
        }
    }

    fn subscribe_events(&self) -> Result<Box<dyn EventStream>, ServerError> {
        let mut state = self.state();
        state.record(ServerCall::Subscribe)?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        state.subscribers.push(sender);
        Ok(Box::new(MockEventStream { receiver }))
    }
}

impl AudioServerConnector for MockAudioServer {
    fn connect(&self) -> Result<Box<dyn AudioServerClient>, ServerError> {
        let mut state = self.state();
        if state.down {
            return Err(ServerError::unavailable("mock server is down"));
        }
        state.connects += 1;
        Ok(Box::new(self.clone()))
    }
}

/// Event stream fed by [`MockAudioServer`].
pub struct MockEventStream {
    receiver: Receiver<ServerEvent>,
}

impl EventStream for MockEventStream {
    fn next(&mut self, timeout: Duration) -> Result<Option<ServerEvent>, ServerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ServerError::unavailable("mock event subscription closed"))
            }
        }
    }
}

/// Mock Bluetooth presence feed with a settable peer list.
#[derive(Debug, Clone, Default)]
pub struct MockBluetooth {
    peers: Arc<Mutex<Vec<BluetoothPeerInfo>>>,
    should_fail: Arc<AtomicBool>,
    polls: Arc<AtomicUsize>,
}

impl MockBluetooth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peers(&self, peers: Vec<BluetoothPeerInfo>) {
        *self.peers.lock().unwrap() = peers;
    }

    pub fn set_failure(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }
}

impl BluetoothPresence for MockBluetooth {
    fn connected_peers(&self) -> Result<Vec<BluetoothPeerInfo>> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("Mock bluetooth failure"));
        }
        Ok(self.peers.lock().unwrap().clone())
    }
}

/// Mock file system for testing - provides controllable file operations
#[derive(Clone)]
pub struct MockFileSystem {
    pub files: Arc<Mutex<HashMap<PathBuf, String>>>,
    pub read_calls: Arc<Mutex<Vec<PathBuf>>>,
    pub write_calls: Arc<Mutex<Vec<(PathBuf, String)>>>,
    pub directory_creation_calls: Arc<Mutex<Vec<PathBuf>>>,
    pub should_fail_read: Arc<Mutex<bool>>,
    pub should_fail_write: Arc<Mutex<bool>>,
    pub should_fail_create_dir: Arc<Mutex<bool>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            read_calls: Arc::new(Mutex::new(Vec::new())),
            write_calls: Arc::new(Mutex::new(Vec::new())),
            directory_creation_calls: Arc::new(Mutex::new(Vec::new())),
            should_fail_read: Arc::new(Mutex::new(false)),
            should_fail_write: Arc::new(Mutex::new(false)),
            should_fail_create_dir: Arc::new(Mutex::new(false)),
        }
    }

    /// Add a file to the mock file system
    pub fn add_file<P: AsRef<Path>>(&self, path: P, content: String) {
        self.files
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf(), content);
    }

    /// Get all write calls that were made
    pub fn get_write_calls(&self) -> Vec<(PathBuf, String)> {
        self.write_calls.lock().unwrap().clone()
    }

    /// Get all directory creation calls that were made
    pub fn get_directory_creation_calls(&self) -> Vec<PathBuf> {
        self.directory_creation_calls.lock().unwrap().clone()
    }

    /// Configure the mock to fail read operations
    pub fn set_read_failure(&self, should_fail: bool) {
        *self.should_fail_read.lock().unwrap() = should_fail;
    }

    /// Configure the mock to fail write operations
    pub fn set_write_failure(&self, should_fail: bool) {
        *self.should_fail_write.lock().unwrap() = should_fail;
    }

    /// Configure the mock to fail directory creation
    pub fn set_create_dir_failure(&self, should_fail: bool) {
        *self.should_fail_create_dir.lock().unwrap() = should_fail;
    }

    /// Check if a file exists in the mock system
    pub fn file_exists<P: AsRef<Path>>(&self, path: P) -> bool {
        self.files.lock().unwrap().contains_key(path.as_ref())
    }
}

impl FileSystemInterface for MockFileSystem {
    fn read_config_file(&self, path: &Path) -> Result<String> {
        self.read_calls.lock().unwrap().push(path.to_path_buf());

        if *self.should_fail_read.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock read failure"));
        }

        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("File not found: {}", path.display()))
    }

    fn write_config_file(&self, path: &Path, content: &str) -> Result<()> {
        self.write_calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), content.to_string()));

        if *self.should_fail_write.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock write failure"));
        }

        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn config_file_exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn create_config_dir(&self, path: &Path) -> Result<()> {
        self.directory_creation_calls
            .lock()
            .unwrap()
            .push(path.to_path_buf());

        if *self.should_fail_create_dir.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock create directory failure"));
        }

        Ok(())
    }
}

impl Default for MockFileSystem {
    fn default() -> Self {
        Self::new()
    }
}
