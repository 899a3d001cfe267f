use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::presence::{merge_bluetooth_peers, merge_companion_streams, scan_companion_streams};
use crate::audio::{
    Activation, Card, CardInfo, CatalogSnapshot, DeviceCatalog, Plan,
    RoutingModule, RoutingOp, RoutingPlanner, Sink, SinkInfo, Source, SourceInfo,
};
use crate::config::{Config, GeneralConfig};
use crate::error::ServerError;
use crate::system::{
    AudioServerClient, AudioServerConnector, BluetoothPresence, EventKind, EventStream, Facility,
    ServerEvent,
};

const RECONNECT_SLICE: Duration = Duration::from_millis(100);

/// Where the reconciliation loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Startup,
    Reconciling,
    WaitForEvent,
    Reconnecting,
    Shutdown,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Startup => "STARTUP",
            LoopState::Reconciling => "RECONCILING",
            LoopState::WaitForEvent => "WAIT_FOR_EVENT",
            LoopState::Reconnecting => "RECONNECTING",
            LoopState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Timing knobs for the loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerOptions {
    pub event_wait: Duration,
    pub reconnect_delay: Duration,
    pub presence_interval: Duration,
}

impl From<&GeneralConfig> for ReconcilerOptions {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            event_wait: Duration::from_millis(general.event_wait_ms.max(1)),
            reconnect_delay: Duration::from_millis(general.reconnect_delay_ms),
            presence_interval: Duration::from_millis(general.presence_poll_interval_ms),
        }
    }
}

/// Latest catalog snapshot, shared with readers outside the worker.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    latest: Arc<Mutex<Option<Arc<CatalogSnapshot>>>>,
}

impl SnapshotHandle {
    fn publish(&self, snapshot: CatalogSnapshot) {
        match self.latest.lock() {
            Ok(mut latest) => *latest = Some(Arc::new(snapshot)),
            Err(e) => warn!("Snapshot lock poisoned, snapshot dropped: {}", e),
        }
    }

    pub fn latest(&self) -> Option<Arc<CatalogSnapshot>> {
        self.latest.lock().ok().and_then(|latest| latest.clone())
    }
}

/// Handle on a reconciliation worker running on its own thread.
pub struct ControllerHandle {
    stop: Arc<AtomicBool>,
    snapshots: SnapshotHandle,
    thread: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn snapshot(&self) -> Option<Arc<CatalogSnapshot>> {
        self.snapshots.latest()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the worker to tear down and wait for it to exit.
    pub fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("Reconciliation worker panicked"))
    }
}

/// The controller: owns the catalog and drives the audio server toward the
/// policy's topology, one state transition per [`Reconciler::step`].
pub struct Reconciler<C: AudioServerConnector, B: BluetoothPresence> {
    connector: C,
    bluetooth: B,
    planner: RoutingPlanner,
    options: ReconcilerOptions,
    catalog: DeviceCatalog,
    client: Option<Box<dyn AudioServerClient>>,
    events: Option<Box<dyn EventStream>>,
    state: LoopState,
    stop: Arc<AtomicBool>,
    snapshots: SnapshotHandle,
    /// Objects seen but deliberately not catalogued (virtual sinks, monitors).
    ignored: HashSet<(Facility, u32)>,
    card_policy_warned: bool,
    presence_failing: bool,
    streams_failing: bool,
    /// A startup scan was refused part way; retried on the presence cadence.
    rescan_pending: bool,
    last_presence_poll: Option<Instant>,
}

impl<C: AudioServerConnector, B: BluetoothPresence> Reconciler<C, B> {
    pub fn new(config: &Config, connector: C, bluetooth: B) -> Self {
        Self {
            connector,
            bluetooth,
            planner: RoutingPlanner::new(config),
            options: ReconcilerOptions::from(&config.general),
            catalog: DeviceCatalog::new(),
            client: None,
            events: None,
            state: LoopState::Startup,
            stop: Arc::new(AtomicBool::new(false)),
            snapshots: SnapshotHandle::default(),
            ignored: HashSet::new(),
            card_policy_warned: false,
            presence_failing: false,
            streams_failing: false,
            rescan_pending: false,
            last_presence_poll: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn snapshots(&self) -> SnapshotHandle {
        self.snapshots.clone()
    }

    /// Run on a dedicated thread until the stop flag is raised.
    pub fn spawn(mut self) -> Result<ControllerHandle> {
        let stop = self.stop_flag();
        let snapshots = self.snapshots();
        let thread = std::thread::Builder::new()
            .name("topology-reconciler".to_string())
            .spawn(move || self.run())
            .context("Failed to spawn reconciliation worker")?;

        Ok(ControllerHandle {
            stop,
            snapshots,
            thread,
        })
    }

    /// Drive the state machine until stopped, then tear down.
    pub fn run(&mut self) {
        info!("Reconciliation worker started");

        while self.state != LoopState::Shutdown {
            if self.stop.load(Ordering::Relaxed) {
                self.shutdown();
                break;
            }
            self.step();
        }

        info!("Reconciliation worker stopped");
    }

    /// Perform one state transition and return the new state.
    pub fn step(&mut self) -> LoopState {
        let next = match self.state {
            LoopState::Startup => self.startup(),
            LoopState::Reconciling | LoopState::WaitForEvent => self.wait_for_event(),
            LoopState::Reconnecting => self.reconnect(),
            LoopState::Shutdown => LoopState::Shutdown,
        };
        self.transition(next);
        self.state
    }

    /// Unload everything the controller owns and drop the server handle.
    pub fn shutdown(&mut self) {
        info!("Shutting down, removing managed routing modules");

        let result = self.with_pass(|pass| pass.teardown());
        if let Err(e) = result {
            warn!("Teardown incomplete: {}", e);
        }

        self.events = None;
        self.client = None;
        self.transition(LoopState::Shutdown);
    }

    fn transition(&mut self, next: LoopState) {
        if next != self.state {
            debug!("{} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn with_pass<T>(
        &mut self,
        f: impl FnOnce(&mut Pass<'_>) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let client = self
            .client
            .as_deref()
            .ok_or_else(|| ServerError::unavailable("no audio server handle"))?;

        let mut pass = Pass {
            client,
            planner: &self.planner,
            bluetooth: &self.bluetooth,
            catalog: &mut self.catalog,
            ignored: &mut self.ignored,
            card_policy_warned: &mut self.card_policy_warned,
            presence_failing: &mut self.presence_failing,
            streams_failing: &mut self.streams_failing,
        };
        f(&mut pass)
    }

    fn publish_snapshot(&self) {
        self.snapshots.publish(self.catalog.snapshot());
    }

    fn lost(&self, error: &ServerError) -> LoopState {
        warn!("Audio server unavailable ({}), reconnecting", error);
        LoopState::Reconnecting
    }

    fn startup(&mut self) -> LoopState {
        info!("Connecting to audio server");

        let client = match self.connector.connect() {
            Ok(client) => client,
            Err(e) => return self.lost(&e),
        };
        self.client = Some(client);
        self.transition(LoopState::Reconciling);

        // Subscribe before scanning so nothing changes unseen in between.
        let events = self.with_pass(|pass| pass.client.subscribe_events());
        match events {
            Ok(events) => self.events = Some(events),
            Err(e) => return self.lost(&e),
        }

        match self.with_pass(|pass| pass.full_scan()) {
            Ok(()) => {
                self.rescan_pending = false;
                self.last_presence_poll = Some(Instant::now());
                self.publish_snapshot();
                info!(
                    "Startup scan complete: {} cards, {} sinks, {} sources",
                    self.catalog.cards().len(),
                    self.catalog.sinks().len(),
                    self.catalog.sources().len()
                );
                LoopState::WaitForEvent
            }
            Err(e) if e.is_unavailable() => self.lost(&e),
            Err(e) => {
                warn!("Startup scan incomplete ({}), rescanning later", e);
                self.rescan_pending = true;
                self.last_presence_poll = Some(Instant::now());
                self.publish_snapshot();
                LoopState::WaitForEvent
            }
        }
    }

    fn wait_for_event(&mut self) -> LoopState {
        let presence_due = self
            .last_presence_poll
            .is_none_or(|at| at.elapsed() >= self.options.presence_interval);
        if presence_due && self.rescan_pending {
            self.last_presence_poll = Some(Instant::now());
            match self.with_pass(|pass| pass.full_scan()) {
                Ok(()) => {
                    info!("Rescan complete");
                    self.rescan_pending = false;
                    self.publish_snapshot();
                }
                Err(e) if e.is_unavailable() => return self.lost(&e),
                Err(e) => warn!("Rescan incomplete: {}", e),
            }
        } else if presence_due {
            self.last_presence_poll = Some(Instant::now());
            let result = self.with_pass(|pass| {
                let changed = pass.poll_presence()?;
                if changed {
                    pass.routing_pass()?;
                }
                Ok(changed)
            });
            match result {
                Ok(true) => self.publish_snapshot(),
                Ok(false) => {}
                Err(e) if e.is_unavailable() => return self.lost(&e),
                Err(e) => warn!("Presence update abandoned: {}", e),
            }
        }

        let Some(events) = self.events.as_mut() else {
            return self.lost(&ServerError::unavailable("no event subscription"));
        };

        let event = match events.next(self.options.event_wait) {
            Ok(Some(event)) => event,
            Ok(None) => return LoopState::WaitForEvent,
            Err(e) => return self.lost(&e),
        };

        debug!("Server event: {}", event);
        self.transition(LoopState::Reconciling);
        match self.with_pass(|pass| pass.handle_event(event)) {
            Ok(()) => {
                self.publish_snapshot();
                LoopState::WaitForEvent
            }
            Err(e) if e.is_unavailable() => self.lost(&e),
            Err(e) => {
                warn!("Pass for {} abandoned: {}", event, e);
                LoopState::WaitForEvent
            }
        }
    }

    fn reconnect(&mut self) -> LoopState {
        // Nothing from the lost session is trusted.
        self.events = None;
        self.client = None;
        self.catalog = DeviceCatalog::new();
        self.ignored.clear();
        self.rescan_pending = false;
        self.last_presence_poll = None;

        let deadline = Instant::now() + self.options.reconnect_delay;
        while !self.stop.load(Ordering::Relaxed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(RECONNECT_SLICE));
        }

        LoopState::Startup
    }
}

/// Borrowed view used for one reconciliation pass.
struct Pass<'a> {
    client: &'a dyn AudioServerClient,
    planner: &'a RoutingPlanner,
    bluetooth: &'a dyn BluetoothPresence,
    catalog: &'a mut DeviceCatalog,
    ignored: &'a mut HashSet<(Facility, u32)>,
    card_policy_warned: &'a mut bool,
    presence_failing: &'a mut bool,
    streams_failing: &'a mut bool,
}

impl Pass<'_> {
    /// Startup order: monitor sink, cards (settled), sinks, sources,
    /// presence, then routing.
    fn full_scan(&mut self) -> Result<(), ServerError> {
        self.refresh_modules()?;
        let monitor_ops = self.planner.plan_monitor_sink(self.catalog);
        self.apply(&monitor_ops)?;

        self.sync_cards()?;
        self.settle_cards()?;
        self.sync_sinks()?;
        self.sync_sources()?;
        self.poll_presence()?;
        self.routing_pass()
    }

    /// Module list is re-read from the server on every pass.
    fn refresh_modules(&mut self) -> Result<(), ServerError> {
        let modules = self
            .client
            .list_modules()?
            .iter()
            .filter_map(RoutingModule::from_listing)
            .collect();

        self.catalog.replace_modules(modules);
        Ok(())
    }

    fn sync_cards(&mut self) -> Result<(), ServerError> {
        let cards = self.client.list_cards()?;

        for name in self.catalog.cards().identities() {
            if !cards.iter().any(|c| c.name == name) {
                info!("Card {} is gone", name);
                self.catalog.remove_card(&name);
            }
        }
        for info in cards {
            self.observe_card(info);
        }
        Ok(())
    }

    fn observe_card(&mut self, info: CardInfo) {
        let name = info.name.clone();
        if self.catalog.upsert_card(Card {
            info,
            active: false,
        }) {
            info!("Found card {}", name);
        }
    }

    fn settle_cards(&mut self) -> Result<(), ServerError> {
        let plan = self.planner.plan_cards(self.catalog);
        if plan.card_policy_incomplete && !*self.card_policy_warned {
            warn!("Card-profile policy lacks allowed types or modes, card profiles are left alone");
            *self.card_policy_warned = true;
        }
        self.apply_plan(&plan)
    }

    fn sync_sinks(&mut self) -> Result<(), ServerError> {
        let sinks = self.client.list_sinks()?;

        for name in self.catalog.sinks().identities() {
            if !sinks.iter().any(|s| s.name == name) {
                self.evict_sink(&name)?;
            }
        }
        for info in sinks {
            self.observe_sink(info)?;
        }
        Ok(())
    }

    /// Classify and catalogue a sink. Returns false for sinks the
    /// controller publishes itself.
    fn observe_sink(&mut self, info: SinkInfo) -> Result<bool, ServerError> {
        if self.planner.is_virtual_sink(&info.name) {
            if self.ignored.insert((Facility::Sink, info.index)) {
                debug!("Ignoring controller sink {} #{}", info.name, info.index);
                let ops = self.planner.plan_aggregate_volume(&info);
                self.apply(&ops)?;
            }
            return Ok(false);
        }

        let verdict = self.planner.classifier().classify_sink(&info);
        debug!(
            "Sink {}: {} eligible={} volume={}",
            info.name, verdict.class, verdict.eligible, verdict.volume
        );

        let name = info.name.clone();
        let added = self.catalog.upsert_sink(Sink {
            info,
            class: verdict.class,
            eligible: verdict.eligible,
            volume: verdict.volume,
            active: false,
        });
        if added {
            info!("Found sink {} ({})", name, verdict.class);
        }
        Ok(true)
    }

    fn evict_sink(&mut self, name: &str) -> Result<(), ServerError> {
        let ops = self.planner.plan_sink_removal(self.catalog, name);
        self.apply(&ops)?;
        if self.catalog.remove_sink(name).is_some() {
            info!("Sink {} removed", name);
        }
        Ok(())
    }

    fn sync_sources(&mut self) -> Result<(), ServerError> {
        let sources = self.client.list_sources()?;

        for name in self.catalog.sources().identities() {
            if !sources.iter().any(|s| s.name == name) {
                self.evict_source(&name)?;
            }
        }
        for info in sources {
            self.observe_source(info);
        }
        Ok(())
    }

    fn observe_source(&mut self, info: SourceInfo) -> bool {
        let Some(kind) = info.kind() else {
            debug!("Ignoring monitor source {} #{}", info.name, info.index);
            self.ignored.insert((Facility::Source, info.index));
            return false;
        };

        let verdict = self
            .planner
            .classifier()
            .classify_source(&info, &kind, self.catalog.correlation());
        debug!(
            "Source {}: {} eligible={} volume={}",
            info.name, verdict.class, verdict.eligible, verdict.volume
        );

        let name = info.name.clone();
        let added = self.catalog.upsert_source(Source {
            info,
            kind,
            class: verdict.class,
            eligible: verdict.eligible,
            volume: verdict.volume,
            active: false,
        });
        if added {
            info!("Found source {} ({})", name, verdict.class);
        }
        true
    }

    /// Re-derive source classes after the sink set (and with it the ALSA
    /// correlation) changed.
    fn reclassify_sources(&mut self) {
        let sources: Vec<Source> = self.catalog.sources().iter().cloned().collect();
        for mut source in sources {
            let verdict = self.planner.classifier().classify_source(
                &source.info,
                &source.kind,
                self.catalog.correlation(),
            );
            if verdict.class != source.class || verdict.eligible != source.eligible {
                debug!("Source {} reclassified as {}", source.info.name, verdict.class);
                source.class = verdict.class;
                source.eligible = verdict.eligible;
                self.catalog.upsert_source(source);
            }
        }
    }

    fn evict_source(&mut self, name: &str) -> Result<(), ServerError> {
        if let Some(source) = self.catalog.sources().get(name).cloned() {
            let ops = self.planner.plan_source_removal(self.catalog, &source);
            self.apply(&ops)?;
            self.catalog.remove_source(name);
            info!("Source {} removed", name);
        }
        Ok(())
    }

    /// Poll both presence feeds. Returns whether the catalog changed.
    fn poll_presence(&mut self) -> Result<bool, ServerError> {
        let mut changed = false;

        match self.bluetooth.connected_peers() {
            Ok(peers) => {
                if *self.presence_failing {
                    info!("Bluetooth presence feed recovered");
                    *self.presence_failing = false;
                }
                changed |= merge_bluetooth_peers(self.catalog, peers);
            }
            Err(e) => {
                if !*self.presence_failing {
                    warn!("Bluetooth presence feed unavailable: {:#}", e);
                    *self.presence_failing = true;
                }
            }
        }

        // A refused stream listing keeps the previous companion set.
        match self.client.list_streams() {
            Ok(streams) => {
                if *self.streams_failing {
                    info!("Companion stream listing recovered");
                    *self.streams_failing = false;
                }
                changed |= merge_companion_streams(self.catalog, scan_companion_streams(&streams));
            }
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                if !*self.streams_failing {
                    warn!("Companion stream listing failed: {}", e);
                    *self.streams_failing = true;
                }
            }
        }

        Ok(changed)
    }

    fn routing_pass(&mut self) -> Result<(), ServerError> {
        self.refresh_modules()?;
        let plan = self.planner.plan_routing(self.catalog);
        self.apply_plan(&plan)
    }

    fn handle_event(&mut self, event: ServerEvent) -> Result<(), ServerError> {
        match (event.kind, event.facility) {
            (EventKind::New, Facility::Card) => {
                let Some(info) = self
                    .client
                    .list_cards()?
                    .into_iter()
                    .find(|c| c.index == event.index)
                else {
                    debug!("Card #{} vanished before it was read", event.index);
                    return Ok(());
                };
                self.observe_card(info);
                self.settle_cards()?;
                self.routing_pass()
            }
            (EventKind::New, Facility::Sink) => {
                let Some(info) = self
                    .client
                    .list_sinks()?
                    .into_iter()
                    .find(|s| s.index == event.index)
                else {
                    debug!("Sink #{} vanished before it was read", event.index);
                    return Ok(());
                };
                if !self.observe_sink(info)? {
                    return Ok(());
                }
                self.reclassify_sources();
                self.routing_pass()
            }
            (EventKind::New, Facility::Source) => {
                let Some(info) = self
                    .client
                    .list_sources()?
                    .into_iter()
                    .find(|s| s.index == event.index)
                else {
                    debug!("Source #{} vanished before it was read", event.index);
                    return Ok(());
                };
                if !self.observe_source(info) {
                    return Ok(());
                }
                self.routing_pass()
            }
            (EventKind::Remove, Facility::Card) => {
                match self.catalog.card_by_index(event.index).map(|c| c.info.name.clone()) {
                    Some(name) => {
                        info!("Card {} removed", name);
                        self.catalog.remove_card(&name);
                    }
                    None => self.unknown_removal(event),
                }
                Ok(())
            }
            (EventKind::Remove, Facility::Sink) => {
                let Some(name) = self
                    .catalog
                    .sink_by_index(event.index)
                    .map(|s| s.info.name.clone())
                else {
                    self.unknown_removal(event);
                    return Ok(());
                };
                self.refresh_modules()?;
                self.evict_sink(&name)?;
                self.reclassify_sources();
                self.routing_pass()
            }
            (EventKind::Remove, Facility::Source) => {
                let Some(name) = self
                    .catalog
                    .source_by_index(event.index)
                    .map(|s| s.info.name.clone())
                else {
                    self.unknown_removal(event);
                    return Ok(());
                };
                self.refresh_modules()?;
                self.evict_source(&name)?;
                self.routing_pass()
            }
        }
    }

    fn unknown_removal(&mut self, event: ServerEvent) {
        if self.ignored.remove(&(event.facility, event.index)) {
            debug!("Ignored object gone: {}", event);
        } else {
            warn!("Remove event for unknown object: {}", event);
        }
    }

    fn teardown(&mut self) -> Result<(), ServerError> {
        self.refresh_modules()?;
        let ops = self.planner.plan_shutdown(self.catalog);
        self.apply(&ops)
    }

    fn apply_plan(&mut self, plan: &Plan) -> Result<(), ServerError> {
        self.apply(&plan.ops)?;

        for activation in &plan.activations {
            match activation {
                Activation::Card(name) => self.catalog.mark_card_active(name),
                Activation::Sink(name) => self.catalog.mark_sink_active(name),
                Activation::Source(name) => self.catalog.mark_source_active(name),
                Activation::BluetoothPeer(address) => {
                    self.catalog.mark_bluetooth_peer_active(address)
                }
                Activation::Companion(binary) => self.catalog.mark_companion_active(binary),
            }
        }
        Ok(())
    }

    /// Execute ops in order. Rejections are logged and skipped; loss of the
    /// server aborts the rest.
    fn apply(&mut self, ops: &[RoutingOp]) -> Result<(), ServerError> {
        for op in ops {
            match self.execute(op) {
                Ok(()) => {}
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => warn!("{} failed: {}", op, e),
            }
        }
        Ok(())
    }

    fn execute(&mut self, op: &RoutingOp) -> Result<(), ServerError> {
        debug!("Applying {}", op);

        match op {
            RoutingOp::SetCardProfile { card, profile } => {
                self.client.set_card_profile(card, profile)?;
                if let Some(mut entry) = self.catalog.cards().get(card).cloned() {
                    entry.info.active_profile = Some(profile.clone());
                    self.catalog.upsert_card(entry);
                }
            }
            RoutingOp::LoadModule { kind, args } => {
                let index = self.client.load_module(*kind, args)?;
                info!("Loaded {} module #{}: {}", kind, index, args);
            }
            RoutingOp::UnloadModule { index, kind } => {
                self.client.unload_module(*index)?;
                info!("Unloaded {} module #{}", kind, index);
            }
            RoutingOp::SetDefaultSink { name } => self.client.set_default_sink(name)?,
            RoutingOp::SetDefaultSource { name } => self.client.set_default_source(name)?,
            RoutingOp::SetVolume {
                target,
                channels,
                level,
            } => self.client.set_volume(*target, *channels, *level)?,
        }
        Ok(())
    }
}
