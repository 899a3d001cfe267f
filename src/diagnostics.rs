//! One-shot inspection of the audio server: raw object dumps and dry-run
//! planning for the CLI.

use serde::Serialize;
use tracing::{debug, warn};

use crate::audio::presence::{merge_bluetooth_peers, merge_companion_streams, scan_companion_streams};
use crate::audio::{
    BluetoothPeerInfo, Card, CardInfo, DeviceCatalog, ModuleInfo, Plan,
    RoutingModule, RoutingOp, RoutingPlanner, Sink, SinkInfo, Source, SourceInfo, StreamInfo,
};
use crate::error::ServerError;
use crate::system::{AudioServerClient, BluetoothPresence};

/// A category listing, or why it could not be read.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Objects(Vec<T>),
    Failed { error: String },
}

impl<T> Listing<T> {
    fn from_result<E: std::fmt::Display>(result: Result<Vec<T>, E>) -> Self {
        match result {
            Ok(objects) => Listing::Objects(objects),
            Err(e) => Listing::Failed {
                error: format!("{e:#}"),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Listing::Objects(objects) => objects.len(),
            Listing::Failed { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every raw object the server and presence feeds report, per category.
#[derive(Debug, Serialize)]
pub struct RawDump {
    pub sinks: Listing<SinkInfo>,
    pub sources: Listing<SourceInfo>,
    pub cards: Listing<CardInfo>,
    pub modules: Listing<ModuleInfo>,
    pub streams: Listing<StreamInfo>,
    pub bluetooth_peers: Listing<BluetoothPeerInfo>,
}

/// Collect the raw dump. A failing category is recorded, not fatal.
pub fn collect_raw(client: &dyn AudioServerClient, bluetooth: &dyn BluetoothPresence) -> RawDump {
    RawDump {
        sinks: Listing::from_result(client.list_sinks()),
        sources: Listing::from_result(client.list_sources()),
        cards: Listing::from_result(client.list_cards()),
        modules: Listing::from_result(client.list_modules()),
        streams: Listing::from_result(client.list_streams()),
        bluetooth_peers: Listing::from_result(bluetooth.connected_peers()),
    }
}

/// Build a classified catalog from one round of listings, without
/// changing anything on the server.
pub fn scan_catalog(
    client: &dyn AudioServerClient,
    bluetooth: &dyn BluetoothPresence,
    planner: &RoutingPlanner,
) -> Result<DeviceCatalog, ServerError> {
    let mut catalog = DeviceCatalog::new();
    let classifier = planner.classifier();

    let modules = client
        .list_modules()?
        .iter()
        .filter_map(RoutingModule::from_listing)
        .collect();
    catalog.replace_modules(modules);

    for info in client.list_cards()? {
        catalog.upsert_card(Card {
            info,
            active: false,
        });
    }

    for info in client.list_sinks()? {
        if planner.is_virtual_sink(&info.name) {
            continue;
        }
        let verdict = classifier.classify_sink(&info);
        catalog.upsert_sink(Sink {
            info,
            class: verdict.class,
            eligible: verdict.eligible,
            volume: verdict.volume,
            active: false,
        });
    }

    for info in client.list_sources()? {
        let Some(kind) = info.kind() else {
            continue;
        };
        let verdict = classifier.classify_source(&info, &kind, catalog.correlation());
        catalog.upsert_source(Source {
            info,
            kind,
            class: verdict.class,
            eligible: verdict.eligible,
            volume: verdict.volume,
            active: false,
        });
    }

    match bluetooth.connected_peers() {
        Ok(peers) => {
            merge_bluetooth_peers(&mut catalog, peers);
        }
        Err(e) => warn!("Bluetooth presence feed unavailable: {:#}", e),
    }
    let streams = client.list_streams()?;
    merge_companion_streams(&mut catalog, scan_companion_streams(&streams));

    debug!(
        "Scanned {} cards, {} sinks, {} sources",
        catalog.cards().len(),
        catalog.sinks().len(),
        catalog.sources().len()
    );
    Ok(catalog)
}

/// What a fresh controller would do against the current server state.
#[derive(Debug)]
pub struct DryRun {
    pub catalog: DeviceCatalog,
    pub monitor_ops: Vec<RoutingOp>,
    pub plan: Plan,
}

impl DryRun {
    pub fn ops(&self) -> impl Iterator<Item = &RoutingOp> {
        self.monitor_ops.iter().chain(self.plan.ops.iter())
    }
}

pub fn dry_run(
    client: &dyn AudioServerClient,
    bluetooth: &dyn BluetoothPresence,
    planner: &RoutingPlanner,
) -> Result<DryRun, ServerError> {
    let catalog = scan_catalog(client, bluetooth, planner)?;
    let monitor_ops = planner.plan_monitor_sink(&catalog);
    let plan = planner.plan(&catalog);

    Ok(DryRun {
        catalog,
        monitor_ops,
        plan,
    })
}
