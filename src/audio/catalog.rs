use serde::Serialize;
use tracing::debug;

use super::device::{
    AlsaCard, CardInfo, CompanionKind, InputClass, ModuleKind, OutputClass, RoutingModule,
    SinkInfo, SourceInfo, SourceKind,
};

/// Anything the catalog stores under a unique identity.
pub trait CatalogEntry {
    fn identity(&self) -> &str;
}

/// A card as tracked by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct Card {
    pub info: CardInfo,
    /// Policy has acted on this card once.
    pub active: bool,
}

/// A sink annotated by the classifier.
#[derive(Debug, Clone, Serialize)]
pub struct Sink {
    pub info: SinkInfo,
    pub class: OutputClass,
    pub eligible: bool,
    pub volume: f64,
    pub active: bool,
}

/// A source annotated by the classifier.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub info: SourceInfo,
    pub kind: SourceKind,
    pub class: InputClass,
    pub eligible: bool,
    pub volume: f64,
    pub active: bool,
}

impl Source {
    pub fn is_bluetooth(&self) -> bool {
        matches!(self.kind, SourceKind::Bluetooth { .. })
    }
}

/// A connected wireless peer reported by the presence feed.
#[derive(Debug, Clone, Serialize)]
pub struct BluetoothPeer {
    pub address: String,
    pub name: String,
    pub active: bool,
}

/// A playback stream owned by a recognised companion application.
#[derive(Debug, Clone, Serialize)]
pub struct CompanionStream {
    pub binary: String,
    pub kind: CompanionKind,
    pub stream_index: u32,
    pub channels: u8,
    pub active: bool,
}

impl CatalogEntry for Card {
    fn identity(&self) -> &str {
        &self.info.name
    }
}

impl CatalogEntry for Sink {
    fn identity(&self) -> &str {
        &self.info.name
    }
}

impl CatalogEntry for Source {
    fn identity(&self) -> &str {
        &self.info.name
    }
}

impl CatalogEntry for BluetoothPeer {
    fn identity(&self) -> &str {
        &self.address
    }
}

impl CatalogEntry for CompanionStream {
    fn identity(&self) -> &str {
        &self.binary
    }
}

/// Insertion-ordered collection keyed by identity.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct Category<T> {
    entries: Vec<T>,
}

impl<T> Default for Category<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: CatalogEntry> Category<T> {
    /// Insert or replace by identity, keeping the original position.
    /// Returns `true` when the identity was not present before.
    pub fn upsert(&mut self, entry: T) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.identity() == entry.identity())
        {
            Some(existing) => {
                *existing = entry;
                false
            }
            None => {
                self.entries.push(entry);
                true
            }
        }
    }

    pub fn remove(&mut self, identity: &str) -> Option<T> {
        let position = self.entries.iter().position(|e| e.identity() == identity)?;
        Some(self.entries.remove(position))
    }

    pub fn get(&self, identity: &str) -> Option<&T> {
        self.entries.iter().find(|e| e.identity() == identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut T> {
        self.entries.iter_mut().find(|e| e.identity() == identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.get(identity).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn identities(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.identity().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One ALSA card id known to back at least one catalogued sink.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationEntry {
    pub card_id: String,
    pub card_name: String,
    /// Sinks whose presence keeps this entry alive.
    pub sinks: Vec<String>,
}

/// ALSA card id → card display name, maintained alongside the sink category.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct CorrelationMap {
    entries: Vec<CorrelationEntry>,
}

impl CorrelationMap {
    fn add_sink(&mut self, sink: &str, card: &AlsaCard) {
        match self.entries.iter_mut().find(|e| e.card_id == card.id) {
            Some(entry) => {
                if !entry.sinks.iter().any(|s| s == sink) {
                    entry.sinks.push(sink.to_string());
                }
            }
            None => {
                debug!("Correlating ALSA card {} ({}) with sink {}", card.id, card.long_name, sink);
                self.entries.push(CorrelationEntry {
                    card_id: card.id.clone(),
                    card_name: card.long_name.clone(),
                    sinks: vec![sink.to_string()],
                });
            }
        }
    }

    fn remove_sink(&mut self, sink: &str) {
        for entry in &mut self.entries {
            entry.sinks.retain(|s| s != sink);
        }
        self.entries.retain(|e| {
            if e.sinks.is_empty() {
                debug!("Dropping ALSA card correlation {}", e.card_id);
                false
            } else {
                true
            }
        });
    }

    /// Display name recorded for an ALSA card id.
    pub fn card_name(&self, card_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.card_id == card_id)
            .map(|e| e.card_name.as_str())
    }

    /// Whether `card` is the same physical card as a catalogued sink.
    pub fn matches(&self, card: &AlsaCard) -> bool {
        self.card_name(&card.id) == Some(card.long_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Authoritative in-memory state of the audio topology.
///
/// Owned by the reconciliation worker. It performs no server calls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceCatalog {
    cards: Category<Card>,
    sinks: Category<Sink>,
    sources: Category<Source>,
    bluetooth_peers: Category<BluetoothPeer>,
    companions: Category<CompanionStream>,
    modules: Vec<RoutingModule>,
    correlation: CorrelationMap,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cards(&self) -> &Category<Card> {
        &self.cards
    }

    pub fn sinks(&self) -> &Category<Sink> {
        &self.sinks
    }

    pub fn sources(&self) -> &Category<Source> {
        &self.sources
    }

    pub fn bluetooth_peers(&self) -> &Category<BluetoothPeer> {
        &self.bluetooth_peers
    }

    pub fn companions(&self) -> &Category<CompanionStream> {
        &self.companions
    }

    pub fn correlation(&self) -> &CorrelationMap {
        &self.correlation
    }

    pub fn modules(&self) -> &[RoutingModule] {
        &self.modules
    }

    /// Upsert a card. A re-observed card keeps its `active` flag.
    pub fn upsert_card(&mut self, mut card: Card) -> bool {
        if let Some(existing) = self.cards.get(&card.info.name) {
            card.active |= existing.active;
        }
        self.cards.upsert(card)
    }

    pub fn remove_card(&mut self, name: &str) -> Option<Card> {
        self.cards.remove(name)
    }

    /// Upsert a sink and record its ALSA card correlation.
    pub fn upsert_sink(&mut self, mut sink: Sink) -> bool {
        if let Some(existing) = self.sinks.get(&sink.info.name) {
            sink.active |= existing.active;
        }
        if let Some(card) = &sink.info.alsa_card {
            self.correlation.add_sink(&sink.info.name, card);
        }
        self.sinks.upsert(sink)
    }

    /// Remove a sink together with its correlation entry.
    pub fn remove_sink(&mut self, name: &str) -> Option<Sink> {
        let sink = self.sinks.remove(name)?;
        self.correlation.remove_sink(name);
        Some(sink)
    }

    pub fn upsert_source(&mut self, mut source: Source) -> bool {
        if let Some(existing) = self.sources.get(&source.info.name) {
            source.active |= existing.active;
        }
        self.sources.upsert(source)
    }

    pub fn remove_source(&mut self, name: &str) -> Option<Source> {
        self.sources.remove(name)
    }

    pub fn upsert_bluetooth_peer(&mut self, mut peer: BluetoothPeer) -> bool {
        if let Some(existing) = self.bluetooth_peers.get(&peer.address) {
            peer.active |= existing.active;
        }
        self.bluetooth_peers.upsert(peer)
    }

    pub fn remove_bluetooth_peer(&mut self, address: &str) -> Option<BluetoothPeer> {
        self.bluetooth_peers.remove(address)
    }

    pub fn upsert_companion(&mut self, mut stream: CompanionStream) -> bool {
        if let Some(existing) = self.companions.get(&stream.binary) {
            stream.active |= existing.active;
        }
        self.companions.upsert(stream)
    }

    pub fn remove_companion(&mut self, binary: &str) -> Option<CompanionStream> {
        self.companions.remove(binary)
    }

    pub fn card_by_index(&self, index: u32) -> Option<&Card> {
        self.cards.iter().find(|c| c.info.index == index)
    }

    pub fn sink_by_index(&self, index: u32) -> Option<&Sink> {
        self.sinks.iter().find(|s| s.info.index == index)
    }

    pub fn source_by_index(&self, index: u32) -> Option<&Source> {
        self.sources.iter().find(|s| s.info.index == index)
    }

    pub fn mark_card_active(&mut self, name: &str) {
        if let Some(card) = self.cards.get_mut(name) {
            card.active = true;
        }
    }

    pub fn mark_sink_active(&mut self, name: &str) {
        if let Some(sink) = self.sinks.get_mut(name) {
            sink.active = true;
        }
    }

    pub fn mark_source_active(&mut self, name: &str) {
        if let Some(source) = self.sources.get_mut(name) {
            source.active = true;
        }
    }

    pub fn mark_bluetooth_peer_active(&mut self, address: &str) {
        if let Some(peer) = self.bluetooth_peers.get_mut(address) {
            peer.active = true;
        }
    }

    pub fn mark_companion_active(&mut self, binary: &str) {
        if let Some(stream) = self.companions.get_mut(binary) {
            stream.active = true;
        }
    }

    /// Replace the module list with a fresh server listing.
    pub fn replace_modules(&mut self, modules: Vec<RoutingModule>) {
        self.modules = modules;
    }

    pub fn loopbacks(&self) -> impl Iterator<Item = &RoutingModule> {
        self.modules.iter().filter(|m| m.kind == ModuleKind::Loopback)
    }

    /// The aggregate-sink module publishing `sink_name`, if loaded.
    pub fn aggregate_module(&self, sink_name: &str) -> Option<&RoutingModule> {
        self.modules
            .iter()
            .find(|m| m.kind == ModuleKind::AggregateSink && m.args.get("sink_name") == Some(sink_name))
    }

    /// The null-sink module publishing `sink_name`, if loaded.
    pub fn monitor_module(&self, sink_name: &str) -> Option<&RoutingModule> {
        self.modules
            .iter()
            .find(|m| m.kind == ModuleKind::MonitorSink && m.args.get("sink_name") == Some(sink_name))
    }

    /// Take an immutable copy for readers outside the worker.
    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            taken_at_unix_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            catalog: self.clone(),
        }
    }
}

/// Point-in-time copy of the catalog, safe to hand to other threads.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub taken_at_unix_ms: u64,
    pub catalog: DeviceCatalog,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::module_args::ModuleArgs;

    fn sink(index: u32, name: &str, card: Option<(&str, &str)>) -> Sink {
        Sink {
            info: SinkInfo {
                index,
                name: name.to_string(),
                description: name.to_string(),
                channels: 2,
                alsa_card: card.map(|(id, long_name)| AlsaCard {
                    id: id.to_string(),
                    long_name: long_name.to_string(),
                }),
            },
            class: OutputClass::External,
            eligible: true,
            volume: 1.0,
            active: false,
        }
    }

    #[test]
    fn test_upsert_never_duplicates_identity() {
        let mut catalog = DeviceCatalog::new();
        assert!(catalog.upsert_sink(sink(1, "speakers", None)));
        assert!(!catalog.upsert_sink(sink(7, "speakers", None)));

        assert_eq!(catalog.sinks().len(), 1);
        assert_eq!(catalog.sinks().get("speakers").unwrap().info.index, 7);
    }

    #[test]
    fn test_iteration_is_insertion_ordered() {
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(3, "c", None));
        catalog.upsert_sink(sink(1, "a", None));
        catalog.upsert_sink(sink(2, "b", None));
        catalog.upsert_sink(sink(9, "a", None));

        assert_eq!(catalog.sinks().identities(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_reobserved_sink_keeps_active_flag() {
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "speakers", None));
        catalog.mark_sink_active("speakers");
        catalog.upsert_sink(sink(1, "speakers", None));

        assert!(catalog.sinks().get("speakers").unwrap().active);
    }

    #[test]
    fn test_correlation_follows_sink_lifecycle() {
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "hdmi", Some(("0", "HDA Intel PCH"))));
        catalog.upsert_sink(sink(2, "analog", Some(("0", "HDA Intel PCH"))));
        catalog.upsert_sink(sink(3, "usb", Some(("1", "USB Audio"))));
        assert_eq!(catalog.correlation().len(), 2);

        catalog.remove_sink("hdmi");
        assert_eq!(catalog.correlation().card_name("0"), Some("HDA Intel PCH"));

        catalog.remove_sink("analog");
        assert_eq!(catalog.correlation().card_name("0"), None);
        assert_eq!(catalog.correlation().card_name("1"), Some("USB Audio"));

        catalog.remove_sink("usb");
        assert!(catalog.correlation().is_empty());
    }

    #[test]
    fn test_correlation_requires_matching_card_name() {
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "usb", Some(("1", "USB Audio"))));

        let same = AlsaCard {
            id: "1".to_string(),
            long_name: "USB Audio".to_string(),
        };
        let renamed = AlsaCard {
            id: "1".to_string(),
            long_name: "Other Device".to_string(),
        };
        assert!(catalog.correlation().matches(&same));
        assert!(!catalog.correlation().matches(&renamed));
    }

    #[test]
    fn test_module_lookups() {
        let mut catalog = DeviceCatalog::new();
        catalog.replace_modules(vec![
            RoutingModule {
                index: 10,
                kind: ModuleKind::MonitorSink,
                args: ModuleArgs::new().with("sink_name", "topology_monitor"),
            },
            RoutingModule {
                index: 11,
                kind: ModuleKind::AggregateSink,
                args: ModuleArgs::new()
                    .with("sink_name", "combined")
                    .with("slaves", "a,b"),
            },
            RoutingModule {
                index: 12,
                kind: ModuleKind::Loopback,
                args: ModuleArgs::new().with("source", "in").with("sink", "a"),
            },
        ]);

        assert_eq!(catalog.monitor_module("topology_monitor").unwrap().index, 10);
        assert_eq!(
            catalog.aggregate_module("combined").unwrap().aggregate_members(),
            vec!["a", "b"]
        );
        assert_eq!(catalog.loopbacks().count(), 1);
        assert!(catalog.aggregate_module("other").is_none());
    }
}
