use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use super::catalog::{DeviceCatalog, Sink, Source};
use super::classifier::{Classifier, ProfileSelection};
use super::device::{InputClass, ModuleKind, RoutingModule, SinkInfo, SourceKind};
use super::module_args::ModuleArgs;
use crate::config::Config;

/// Fixed loopback latency, in milliseconds.
pub const LOOPBACK_LATENCY_MSEC: u32 = 20;

/// Endpoint a volume change applies to, by server index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "lowercase")]
pub enum VolumeTarget {
    Sink(u32),
    Source(u32),
}

/// One side-effecting call into the audio server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RoutingOp {
    SetCardProfile {
        card: String,
        profile: String,
    },
    LoadModule {
        kind: ModuleKind,
        args: ModuleArgs,
    },
    UnloadModule {
        index: u32,
        kind: ModuleKind,
    },
    SetDefaultSink {
        name: String,
    },
    SetDefaultSource {
        name: String,
    },
    SetVolume {
        target: VolumeTarget,
        channels: u8,
        level: f64,
    },
}

impl fmt::Display for RoutingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingOp::SetCardProfile { card, profile } => {
                write!(f, "set-card-profile {card} {profile}")
            }
            RoutingOp::LoadModule { kind, args } => {
                write!(f, "load-module {} {}", kind.module_name(), args)
            }
            RoutingOp::UnloadModule { index, kind } => write!(f, "unload-module {index} ({kind})"),
            RoutingOp::SetDefaultSink { name } => write!(f, "set-default-sink {name}"),
            RoutingOp::SetDefaultSource { name } => write!(f, "set-default-source {name}"),
            RoutingOp::SetVolume {
                target,
                channels,
                level,
            } => match target {
                VolumeTarget::Sink(index) => {
                    write!(f, "set-sink-volume {index} {level:.2} x{channels}")
                }
                VolumeTarget::Source(index) => {
                    write!(f, "set-source-volume {index} {level:.2} x{channels}")
                }
            },
        }
    }
}

/// Catalog entry to mark `active` once the pass has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "category", content = "identity", rename_all = "snake_case")]
pub enum Activation {
    Card(String),
    Sink(String),
    Source(String),
    BluetoothPeer(String),
    Companion(String),
}

/// Output of one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub ops: Vec<RoutingOp>,
    pub activations: Vec<Activation>,
    /// Automatic card-profile policy was incomplete; cards were left alone.
    pub card_policy_incomplete: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.activations.is_empty()
    }
}

/// Module list as it will look once the ops planned so far are applied.
///
/// The duplicate-loopback guard consults this, so a route planned earlier in
/// the same pass is never planned twice.
struct ModuleView {
    live: Vec<RoutingModule>,
    planned: Vec<(ModuleKind, ModuleArgs)>,
}

impl ModuleView {
    fn new(modules: &[RoutingModule]) -> Self {
        Self {
            live: modules.to_vec(),
            planned: Vec::new(),
        }
    }

    fn has_loopback(&self, source: &str, sink: &str) -> bool {
        self.live.iter().any(|m| m.is_loopback(source, sink))
            || self.planned.iter().any(|(kind, args)| {
                *kind == ModuleKind::Loopback
                    && args.get("source") == Some(source)
                    && args.get("sink") == Some(sink)
            })
    }

    fn loopbacks_from(&self, source: &str) -> Vec<RoutingModule> {
        self.live
            .iter()
            .filter(|m| m.loopback_source() == Some(source))
            .cloned()
            .collect()
    }

    fn unload(&mut self, index: u32) {
        self.live.retain(|m| m.index != index);
    }

    fn load(&mut self, kind: ModuleKind, args: ModuleArgs) {
        self.planned.push((kind, args));
    }
}

/// Computes the operations that move the live routing graph to the one the
/// policy wants. Never talks to the server itself.
#[derive(Debug, Clone)]
pub struct RoutingPlanner {
    classifier: Classifier,
    allow_multiple_sinks: bool,
    allow_multiple_sources: bool,
    monitor_sink: String,
    monitor_description: String,
    aggregate_sink: String,
}

impl RoutingPlanner {
    pub fn new(config: &Config) -> Self {
        Self {
            classifier: Classifier::new(config),
            allow_multiple_sinks: config.policy.allow_multiple_sinks,
            allow_multiple_sources: config.policy.allow_multiple_sources,
            monitor_sink: config.policy.monitor_sink_name.clone(),
            monitor_description: config.policy.monitor_sink_description.clone(),
            aggregate_sink: config.policy.aggregate_sink_name.clone(),
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn monitor_sink_name(&self) -> &str {
        &self.monitor_sink
    }

    pub fn aggregate_sink_name(&self) -> &str {
        &self.aggregate_sink
    }

    /// Whether a sink is one of the controller's own virtual sinks.
    pub fn is_virtual_sink(&self, name: &str) -> bool {
        name == self.monitor_sink || name == self.aggregate_sink
    }

    /// Volume for a freshly published aggregate sink. Empty for any other sink.
    pub fn plan_aggregate_volume(&self, sink: &SinkInfo) -> Vec<RoutingOp> {
        if sink.name != self.aggregate_sink {
            return Vec::new();
        }
        vec![RoutingOp::SetVolume {
            target: VolumeTarget::Sink(sink.index),
            channels: sink.channels,
            level: self.classifier.aggregate_volume(),
        }]
    }

    pub fn loopback_args(source: &str, sink: &str) -> ModuleArgs {
        ModuleArgs::new()
            .with("source", source)
            .with("sink", sink)
            .with("latency_msec", LOOPBACK_LATENCY_MSEC.to_string())
            .with("source_dont_move", "true")
            .with("sink_dont_move", "true")
    }

    pub fn aggregate_args(&self, members: &[String]) -> ModuleArgs {
        ModuleArgs::new()
            .with("sink_name", self.aggregate_sink.as_str())
            .with("slaves", members.join(","))
    }

    pub fn monitor_sink_args(&self) -> ModuleArgs {
        ModuleArgs::new()
            .with("sink_name", self.monitor_sink.as_str())
            .with(
                "sink_properties",
                format!("device.description={}", self.monitor_description),
            )
    }

    /// Monitor sink setup run at startup: load it unless a module already
    /// publishes the name, then capture from its monitor by default.
    pub fn plan_monitor_sink(&self, catalog: &DeviceCatalog) -> Vec<RoutingOp> {
        let mut ops = Vec::new();

        match catalog.monitor_module(&self.monitor_sink) {
            Some(existing) => debug!(
                "Monitor sink {} already loaded as module #{}",
                self.monitor_sink, existing.index
            ),
            None => ops.push(RoutingOp::LoadModule {
                kind: ModuleKind::MonitorSink,
                args: self.monitor_sink_args(),
            }),
        }

        ops.push(RoutingOp::SetDefaultSource {
            name: format!("{}.monitor", self.monitor_sink),
        });
        ops
    }

    /// Full pass: cards first, then sinks, sources and presence entries.
    pub fn plan(&self, catalog: &DeviceCatalog) -> Plan {
        let mut plan = self.plan_cards(catalog);
        let routing = self.plan_routing(catalog);
        plan.ops.extend(routing.ops);
        plan.activations.extend(routing.activations);
        plan
    }

    /// Card-profile step on its own. Profile changes alter which endpoints
    /// exist, so startup settles cards before enumerating anything else.
    pub fn plan_cards(&self, catalog: &DeviceCatalog) -> Plan {
        let mut plan = Plan::default();

        for card in catalog.cards().iter().filter(|c| !c.active) {
            match self.classifier.select_card_profile(&card.info) {
                ProfileSelection::Selected(profile) => {
                    if card.info.active_profile.as_deref() != Some(profile.as_str()) {
                        info!("Switching card {} to profile {}", card.info.name, profile);
                        plan.ops.push(RoutingOp::SetCardProfile {
                            card: card.info.name.clone(),
                            profile,
                        });
                    }
                    plan.activations
                        .push(Activation::Card(card.info.name.clone()));
                }
                ProfileSelection::NoMatch => {
                    debug!("No qualifying profile for card {}", card.info.name);
                }
                ProfileSelection::PolicyIncomplete => {
                    plan.card_policy_incomplete = true;
                    break;
                }
            }
        }

        plan
    }

    /// Sink, source and presence steps against the catalog's module list.
    pub fn plan_routing(&self, catalog: &DeviceCatalog) -> Plan {
        let mut plan = Plan::default();
        let mut modules = ModuleView::new(catalog.modules());

        let active_sinks = self.plan_sinks(catalog, &mut modules, &mut plan);
        self.plan_sources(catalog, &active_sinks, &mut modules, &mut plan);
        self.plan_presence(catalog, &mut plan);

        plan
    }

    /// Returns the names of sinks that are active once this pass applies.
    fn plan_sinks(
        &self,
        catalog: &DeviceCatalog,
        modules: &mut ModuleView,
        plan: &mut Plan,
    ) -> Vec<String> {
        let active: Vec<&Sink> = catalog.sinks().iter().filter(|s| s.active).collect();
        let candidates: Vec<&Sink> = catalog
            .sinks()
            .iter()
            .filter(|s| !s.active && s.eligible)
            .collect();
        let total = active.len() + candidates.len();
        let aggregate = catalog.aggregate_module(&self.aggregate_sink);

        let mut active_names: Vec<String> = active.iter().map(|s| s.info.name.clone()).collect();

        if total == 0 {
            debug!("No eligible sinks found");
        }

        if self.allow_multiple_sinks && total > 1 {
            let members: Vec<String> = active
                .iter()
                .chain(candidates.iter())
                .map(|s| s.info.name.clone())
                .collect();

            let in_sync = candidates.is_empty()
                && aggregate.is_some_and(|m| same_members(&m.aggregate_members(), &members));
            if in_sync {
                return active_names;
            }

            if let Some(module) = aggregate {
                info!("Replacing aggregate sink module #{}", module.index);
                plan.ops.push(RoutingOp::UnloadModule {
                    index: module.index,
                    kind: ModuleKind::AggregateSink,
                });
                modules.unload(module.index);
            }

            info!("Aggregating sinks: {}", members.join(", "));
            let args = self.aggregate_args(&members);
            plan.ops.push(RoutingOp::LoadModule {
                kind: ModuleKind::AggregateSink,
                args: args.clone(),
            });
            modules.load(ModuleKind::AggregateSink, args);
            plan.ops.push(RoutingOp::SetDefaultSink {
                name: self.aggregate_sink.clone(),
            });

            for sink in candidates {
                plan.activations
                    .push(Activation::Sink(sink.info.name.clone()));
            }
            return members;
        }

        if !self.allow_multiple_sinks && !active.is_empty() {
            return active_names;
        }

        let mut restore_default = false;
        if let Some(module) = aggregate {
            info!("Tearing down stale aggregate sink module #{}", module.index);
            plan.ops.push(RoutingOp::UnloadModule {
                index: module.index,
                kind: ModuleKind::AggregateSink,
            });
            modules.unload(module.index);
            restore_default = true;
        }

        let mut picked = false;
        for sink in candidates {
            info!("Selecting sink {} ({})", sink.info.name, sink.class);
            plan.ops.push(RoutingOp::SetDefaultSink {
                name: sink.info.name.clone(),
            });
            plan.ops.push(RoutingOp::SetVolume {
                target: VolumeTarget::Sink(sink.info.index),
                channels: sink.info.channels,
                level: sink.volume,
            });
            plan.activations
                .push(Activation::Sink(sink.info.name.clone()));
            active_names.push(sink.info.name.clone());
            picked = true;

            if !self.allow_multiple_sinks {
                break;
            }
        }

        if restore_default && !picked {
            if let Some(first) = active.first() {
                plan.ops.push(RoutingOp::SetDefaultSink {
                    name: first.info.name.clone(),
                });
            }
        }

        active_names
    }

    fn plan_sources(
        &self,
        catalog: &DeviceCatalog,
        active_sinks: &[String],
        modules: &mut ModuleView,
        plan: &mut Plan,
    ) {
        let sources = catalog.sources();
        if sources.iter().all(|s| !s.active && !s.eligible) {
            debug!("No mic/aux sources detected");
            return;
        }

        for source in sources.iter().filter(|s| s.active) {
            self.converge_source(source, active_sinks, modules, plan);
        }

        let mut endpoint_held = !self.allow_multiple_sources
            && sources
                .iter()
                .any(|s| s.active && s.kind == SourceKind::Endpoint);

        for source in sources.iter().filter(|s| !s.active && s.eligible) {
            if source.kind == SourceKind::Endpoint {
                if endpoint_held {
                    debug!(
                        "Single-source policy holds, leaving {} unrouted",
                        source.info.name
                    );
                    continue;
                }
                endpoint_held = !self.allow_multiple_sources;
            }

            info!("Selecting source {} ({})", source.info.name, source.class);
            // Output taps mirror a hardware output at whatever level it plays.
            if source.kind != SourceKind::OutputTap {
                plan.ops.push(RoutingOp::SetVolume {
                    target: VolumeTarget::Source(source.info.index),
                    channels: source.info.channels,
                    level: source.volume,
                });
            }
            self.converge_source(source, active_sinks, modules, plan);
            plan.activations
                .push(Activation::Source(source.info.name.clone()));
        }
    }

    /// Sinks a source should be looped into. `None` for sources whose routing
    /// the controller never touches.
    fn loopback_targets(&self, source: &Source, active_sinks: &[String]) -> Option<Vec<String>> {
        match (&source.kind, source.class) {
            (SourceKind::Bluetooth { .. }, _) => None,
            (SourceKind::OutputTap, _) | (SourceKind::Endpoint, InputClass::Mic) => {
                Some(vec![self.monitor_sink.clone()])
            }
            (SourceKind::Endpoint, InputClass::Aux) => Some(active_sinks.to_vec()),
        }
    }

    fn converge_source(
        &self,
        source: &Source,
        active_sinks: &[String],
        modules: &mut ModuleView,
        plan: &mut Plan,
    ) {
        let Some(targets) = self.loopback_targets(source, active_sinks) else {
            return;
        };
        let name = source.info.name.as_str();

        for module in modules.loopbacks_from(name) {
            let keep = module
                .loopback_sink()
                .is_some_and(|sink| targets.iter().any(|t| t == sink));
            if !keep {
                info!(
                    "Unloading loopback #{} from {} to {}",
                    module.index,
                    name,
                    module.loopback_sink().unwrap_or("?")
                );
                plan.ops.push(RoutingOp::UnloadModule {
                    index: module.index,
                    kind: ModuleKind::Loopback,
                });
                modules.unload(module.index);
            }
        }

        for sink in &targets {
            if modules.has_loopback(name, sink) {
                continue;
            }
            info!("Looping {} into {}", name, sink);
            let args = Self::loopback_args(name, sink);
            plan.ops.push(RoutingOp::LoadModule {
                kind: ModuleKind::Loopback,
                args: args.clone(),
            });
            modules.load(ModuleKind::Loopback, args);
        }
    }

    fn plan_presence(&self, catalog: &DeviceCatalog, plan: &mut Plan) {
        for peer in catalog.bluetooth_peers().iter().filter(|p| !p.active) {
            info!("Bluetooth peer {} ({}) connected", peer.name, peer.address);
            plan.activations
                .push(Activation::BluetoothPeer(peer.address.clone()));
        }

        for stream in catalog.companions().iter().filter(|c| !c.active) {
            info!(
                "Companion stream from {} ({}) playing",
                stream.binary, stream.kind
            );
            plan.activations
                .push(Activation::Companion(stream.binary.clone()));
        }
    }

    /// Unloads for a sink about to be evicted: every loopback naming it.
    pub fn plan_sink_removal(&self, catalog: &DeviceCatalog, sink: &str) -> Vec<RoutingOp> {
        catalog
            .loopbacks()
            .filter(|m| m.loopback_sink() == Some(sink))
            .map(|m| RoutingOp::UnloadModule {
                index: m.index,
                kind: ModuleKind::Loopback,
            })
            .collect()
    }

    /// Unloads for a source about to be evicted. Bluetooth-sourced routes
    /// belong to the platform and are left alone.
    pub fn plan_source_removal(&self, catalog: &DeviceCatalog, source: &Source) -> Vec<RoutingOp> {
        if source.is_bluetooth() {
            return Vec::new();
        }
        catalog
            .loopbacks()
            .filter(|m| m.loopback_source() == Some(source.info.name.as_str()))
            .map(|m| RoutingOp::UnloadModule {
                index: m.index,
                kind: ModuleKind::Loopback,
            })
            .collect()
    }

    /// Teardown on stop: loopbacks of active non-Bluetooth sources, the
    /// aggregate, then the monitor sink.
    pub fn plan_shutdown(&self, catalog: &DeviceCatalog) -> Vec<RoutingOp> {
        let mut ops = Vec::new();

        for source in catalog
            .sources()
            .iter()
            .filter(|s| s.active && !s.is_bluetooth())
        {
            ops.extend(self.plan_source_removal(catalog, source));
        }

        if let Some(module) = catalog.aggregate_module(&self.aggregate_sink) {
            ops.push(RoutingOp::UnloadModule {
                index: module.index,
                kind: ModuleKind::AggregateSink,
            });
        }

        match catalog.monitor_module(&self.monitor_sink) {
            Some(module) => ops.push(RoutingOp::UnloadModule {
                index: module.index,
                kind: ModuleKind::MonitorSink,
            }),
            None => warn!("Monitor sink {} not loaded at shutdown", self.monitor_sink),
        }

        ops
    }
}

fn same_members(current: &[String], wanted: &[String]) -> bool {
    current.len() == wanted.len() && wanted.iter().all(|w| current.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::catalog::{BluetoothPeer, Card};
    use crate::audio::device::{
        CardInfo, CardProfile, OutputClass, PortInfo, SourceInfo,
    };
    use crate::config::AudioMode;

    fn sink(index: u32, name: &str, eligible: bool, active: bool) -> Sink {
        Sink {
            info: SinkInfo {
                index,
                name: name.to_string(),
                description: name.to_string(),
                channels: 2,
                alsa_card: None,
            },
            class: OutputClass::External,
            eligible,
            volume: 1.0,
            active,
        }
    }

    fn source(index: u32, name: &str, class: InputClass, active: bool) -> Source {
        let info = SourceInfo {
            index,
            name: name.to_string(),
            description: name.to_string(),
            channels: 2,
            ports: vec![PortInfo {
                name: "analog-input".to_string(),
                description: "Input".to_string(),
            }],
            alsa_card: None,
        };
        Source {
            kind: info.kind().unwrap_or(SourceKind::Endpoint),
            info,
            class,
            eligible: true,
            volume: 0.85,
            active,
        }
    }

    fn loopback(index: u32, source: &str, sink: &str) -> RoutingModule {
        RoutingModule {
            index,
            kind: ModuleKind::Loopback,
            args: RoutingPlanner::loopback_args(source, sink),
        }
    }

    /// Apply a plan to the catalog as the reconciler would, without a server.
    fn apply(catalog: &mut DeviceCatalog, plan: &Plan, next_index: &mut u32) {
        let mut modules = catalog.modules().to_vec();
        for op in &plan.ops {
            match op {
                RoutingOp::LoadModule { kind, args } => {
                    modules.push(RoutingModule {
                        index: *next_index,
                        kind: *kind,
                        args: args.clone(),
                    });
                    *next_index += 1;
                }
                RoutingOp::UnloadModule { index, .. } => modules.retain(|m| m.index != *index),
                _ => {}
            }
        }
        catalog.replace_modules(modules);
        for activation in &plan.activations {
            match activation {
                Activation::Card(n) => catalog.mark_card_active(n),
                Activation::Sink(n) => catalog.mark_sink_active(n),
                Activation::Source(n) => catalog.mark_source_active(n),
                Activation::BluetoothPeer(a) => catalog.mark_bluetooth_peer_active(a),
                Activation::Companion(b) => catalog.mark_companion_active(b),
            }
        }
    }

    fn count_loads(plan: &Plan, kind: ModuleKind) -> usize {
        plan.ops
            .iter()
            .filter(|op| matches!(op, RoutingOp::LoadModule { kind: k, .. } if *k == kind))
            .count()
    }

    #[test]
    fn test_two_new_sinks_are_aggregated() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "internal", true, false));
        catalog.upsert_sink(sink(2, "usb", true, false));

        let plan = planner.plan(&catalog);

        assert_eq!(
            plan.ops,
            vec![
                RoutingOp::LoadModule {
                    kind: ModuleKind::AggregateSink,
                    args: ModuleArgs::new()
                        .with("sink_name", "combined")
                        .with("slaves", "internal,usb"),
                },
                RoutingOp::SetDefaultSink {
                    name: "combined".to_string()
                },
            ]
        );
        assert_eq!(
            plan.activations,
            vec![
                Activation::Sink("internal".to_string()),
                Activation::Sink("usb".to_string())
            ]
        );
    }

    #[test]
    fn test_second_pass_is_empty() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "internal", true, false));
        catalog.upsert_sink(sink(2, "usb", true, false));
        catalog.upsert_source(source(3, "alsa_input.line", InputClass::Aux, false));
        catalog.upsert_source(source(4, "alsa_input.mic", InputClass::Mic, false));

        let mut next_index = 100;
        let first = planner.plan(&catalog);
        assert!(!first.ops.is_empty());
        apply(&mut catalog, &first, &mut next_index);

        let second = planner.plan(&catalog);
        assert!(second.is_empty(), "unexpected ops: {:?}", second.ops);
    }

    #[test]
    fn test_aux_loops_into_every_active_sink_once() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "a", true, true));
        catalog.upsert_sink(sink(2, "b", true, true));
        catalog.replace_modules(vec![
            RoutingModule {
                index: 9,
                kind: ModuleKind::AggregateSink,
                args: planner.aggregate_args(&["a".to_string(), "b".to_string()]),
            },
            loopback(10, "alsa_input.line", "a"),
        ]);
        catalog.upsert_source(source(3, "alsa_input.line", InputClass::Aux, false));

        let plan = planner.plan(&catalog);

        assert_eq!(count_loads(&plan, ModuleKind::Loopback), 1);
        assert!(plan.ops.contains(&RoutingOp::LoadModule {
            kind: ModuleKind::Loopback,
            args: RoutingPlanner::loopback_args("alsa_input.line", "b"),
        }));
    }

    #[test]
    fn test_mic_only_loops_into_monitor_sink() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "speakers", true, true));
        catalog.replace_modules(vec![loopback(5, "alsa_input.mic", "speakers")]);
        catalog.upsert_source(source(2, "alsa_input.mic", InputClass::Mic, true));

        let plan = planner.plan(&catalog);

        assert_eq!(
            plan.ops,
            vec![
                RoutingOp::UnloadModule {
                    index: 5,
                    kind: ModuleKind::Loopback
                },
                RoutingOp::LoadModule {
                    kind: ModuleKind::Loopback,
                    args: RoutingPlanner::loopback_args("alsa_input.mic", "topology_monitor"),
                },
            ]
        );
    }

    #[test]
    fn test_output_tap_loops_into_monitor_sink() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        let mut tap = source(
            7,
            "alsa_output.pci.analog-stereo.monitor",
            InputClass::Aux,
            false,
        );
        tap.kind = SourceKind::OutputTap;
        catalog.upsert_source(tap);

        let plan = planner.plan(&catalog);
        assert!(plan.ops.contains(&RoutingOp::LoadModule {
            kind: ModuleKind::Loopback,
            args: RoutingPlanner::loopback_args(
                "alsa_output.pci.analog-stereo.monitor",
                "topology_monitor"
            ),
        }));
        assert!(
            !plan
                .ops
                .iter()
                .any(|op| matches!(op, RoutingOp::SetVolume { .. }))
        );
    }

    #[test]
    fn test_bluetooth_source_gets_volume_but_no_loopbacks() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "speakers", true, true));
        catalog.upsert_source(source(
            4,
            "bluez_source.AA_BB_CC_DD_EE_FF.a2dp_source",
            InputClass::Aux,
            false,
        ));
        catalog.upsert_bluetooth_peer(BluetoothPeer {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: "Phone".to_string(),
            active: false,
        });

        let plan = planner.plan(&catalog);

        assert_eq!(count_loads(&plan, ModuleKind::Loopback), 0);
        assert!(matches!(
            plan.ops.as_slice(),
            [RoutingOp::SetVolume {
                target: VolumeTarget::Source(4),
                ..
            }]
        ));
        assert!(plan
            .activations
            .contains(&Activation::BluetoothPeer("AA:BB:CC:DD:EE:FF".to_string())));
    }

    #[test]
    fn test_single_sink_policy_holds_incumbent() {
        let mut config = Config::default();
        config.policy.allow_multiple_sinks = false;
        let planner = RoutingPlanner::new(&config);

        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "a", true, false));
        catalog.upsert_sink(sink(2, "b", true, false));

        let plan = planner.plan(&catalog);
        assert_eq!(
            plan.ops,
            vec![
                RoutingOp::SetDefaultSink {
                    name: "a".to_string()
                },
                RoutingOp::SetVolume {
                    target: VolumeTarget::Sink(1),
                    channels: 2,
                    level: 1.0
                },
            ]
        );

        let mut next_index = 1;
        apply(&mut catalog, &plan, &mut next_index);
        assert!(planner.plan(&catalog).ops.is_empty());
    }

    #[test]
    fn test_stale_aggregate_is_torn_down_and_default_restored() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "a", true, true));
        catalog.replace_modules(vec![RoutingModule {
            index: 9,
            kind: ModuleKind::AggregateSink,
            args: planner.aggregate_args(&["a".to_string(), "gone".to_string()]),
        }]);

        let plan = planner.plan(&catalog);
        assert_eq!(
            plan.ops,
            vec![
                RoutingOp::UnloadModule {
                    index: 9,
                    kind: ModuleKind::AggregateSink
                },
                RoutingOp::SetDefaultSink {
                    name: "a".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_aggregate_rebuilt_when_membership_drifts() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "a", true, true));
        catalog.upsert_sink(sink(2, "b", true, true));
        catalog.upsert_sink(sink(3, "c", true, true));
        catalog.replace_modules(vec![RoutingModule {
            index: 9,
            kind: ModuleKind::AggregateSink,
            args: planner.aggregate_args(&["a".to_string(), "b".to_string()]),
        }]);

        let plan = planner.plan(&catalog);
        assert_eq!(plan.ops[0], RoutingOp::UnloadModule {
            index: 9,
            kind: ModuleKind::AggregateSink
        });
        assert_eq!(plan.ops[1], RoutingOp::LoadModule {
            kind: ModuleKind::AggregateSink,
            args: planner.aggregate_args(&["a".to_string(), "b".to_string(), "c".to_string()]),
        });
    }

    #[test]
    fn test_single_source_policy_limits_new_endpoints() {
        let mut config = Config::default();
        config.policy.allow_multiple_sources = false;
        let planner = RoutingPlanner::new(&config);

        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(sink(1, "speakers", true, true));
        catalog.upsert_source(source(2, "alsa_input.one", InputClass::Aux, false));
        catalog.upsert_source(source(3, "alsa_input.two", InputClass::Aux, false));

        let plan = planner.plan(&catalog);
        assert_eq!(
            plan.activations,
            vec![Activation::Source("alsa_input.one".to_string())]
        );
    }

    #[test]
    fn test_manual_mode_unlisted_sink_never_selected() {
        let mut config = Config::default();
        config.policy.mode = AudioMode::Manual;
        let planner = RoutingPlanner::new(&config);

        let hdmi = SinkInfo {
            index: 1,
            name: "hdmi0".to_string(),
            description: "HDMI".to_string(),
            channels: 2,
            alsa_card: None,
        };
        let verdict = planner.classifier().classify_sink(&hdmi);
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_sink(Sink {
            info: hdmi,
            class: verdict.class,
            eligible: verdict.eligible,
            volume: verdict.volume,
            active: false,
        });

        let plan = planner.plan(&catalog);
        assert!(plan.ops.is_empty());
        assert!(plan.activations.is_empty());
    }

    #[test]
    fn test_card_profile_set_once() {
        let mut config = Config::default();
        config.automatic.allowed_card_profile_types = vec!["output".to_string()];
        config.automatic.allowed_card_profile_modes = vec!["analog-stereo".to_string()];
        let planner = RoutingPlanner::new(&config);

        let mut catalog = DeviceCatalog::new();
        catalog.upsert_card(Card {
            info: CardInfo {
                index: 0,
                name: "alsa_card.usb".to_string(),
                profiles: vec![
                    CardProfile::new("off", 0, 0),
                    CardProfile::new("output:analog-stereo", 1, 0),
                ],
                active_profile: Some("off".to_string()),
            },
            active: false,
        });

        let plan = planner.plan_cards(&catalog);
        assert_eq!(
            plan.ops,
            vec![RoutingOp::SetCardProfile {
                card: "alsa_card.usb".to_string(),
                profile: "output:analog-stereo".to_string()
            }]
        );

        let mut next_index = 0;
        apply(&mut catalog, &plan, &mut next_index);
        assert!(planner.plan_cards(&catalog).is_empty());
    }

    #[test]
    fn test_incomplete_card_policy_is_flagged() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_card(Card {
            info: CardInfo {
                index: 0,
                name: "alsa_card.usb".to_string(),
                profiles: vec![CardProfile::new("output:analog-stereo", 1, 0)],
                active_profile: None,
            },
            active: false,
        });

        let plan = planner.plan_cards(&catalog);
        assert!(plan.card_policy_incomplete);
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn test_sink_removal_unloads_loopbacks_naming_it() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.replace_modules(vec![
            loopback(10, "alsa_input.line", "usb"),
            loopback(11, "alsa_input.line", "internal"),
        ]);

        assert_eq!(
            planner.plan_sink_removal(&catalog, "usb"),
            vec![RoutingOp::UnloadModule {
                index: 10,
                kind: ModuleKind::Loopback
            }]
        );
    }

    #[test]
    fn test_shutdown_leaves_bluetooth_routes() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();
        catalog.upsert_source(source(1, "alsa_input.line", InputClass::Aux, true));
        catalog.upsert_source(source(
            2,
            "bluez_source.AA_BB.a2dp_source",
            InputClass::Aux,
            true,
        ));
        catalog.replace_modules(vec![
            loopback(10, "alsa_input.line", "speakers"),
            loopback(11, "bluez_source.AA_BB.a2dp_source", "speakers"),
            RoutingModule {
                index: 3,
                kind: ModuleKind::MonitorSink,
                args: planner.monitor_sink_args(),
            },
        ]);

        assert_eq!(
            planner.plan_shutdown(&catalog),
            vec![
                RoutingOp::UnloadModule {
                    index: 10,
                    kind: ModuleKind::Loopback
                },
                RoutingOp::UnloadModule {
                    index: 3,
                    kind: ModuleKind::MonitorSink
                },
            ]
        );
    }

    #[test]
    fn test_monitor_sink_reused_when_loaded() {
        let planner = RoutingPlanner::new(&Config::default());
        let mut catalog = DeviceCatalog::new();

        assert_eq!(planner.plan_monitor_sink(&catalog).len(), 2);

        catalog.replace_modules(vec![RoutingModule {
            index: 3,
            kind: ModuleKind::MonitorSink,
            args: planner.monitor_sink_args(),
        }]);
        assert_eq!(
            planner.plan_monitor_sink(&catalog),
            vec![RoutingOp::SetDefaultSource {
                name: "topology_monitor.monitor".to_string()
            }]
        );
    }
    #[test]
    fn test_aggregate_volume_follows_mode() {
        let combined = sink(1004, "combined", true, false).info;
        let speakers = sink(1, "speakers", true, false).info;

        let mut config = Config::default();
        config.automatic.default_sink_volume = Some(toml::Value::Float(0.7));
        let planner = RoutingPlanner::new(&config);
        assert_eq!(
            planner.plan_aggregate_volume(&combined),
            vec![RoutingOp::SetVolume {
                target: VolumeTarget::Sink(1004),
                channels: 2,
                level: 0.7,
            }]
        );
        assert!(planner.plan_aggregate_volume(&speakers).is_empty());

        config.policy.mode = AudioMode::Manual;
        config.manual.combined_sink_volume = Some(toml::Value::Float(0.5));
        let planner = RoutingPlanner::new(&config);
        assert!(matches!(
            &planner.plan_aggregate_volume(&combined)[..],
            [RoutingOp::SetVolume { level, .. }] if *level == 0.5
        ));
    }
}
