use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::module_args::ModuleArgs;

/// Property carrying the ALSA card id of a hardware-backed endpoint.
pub const ALSA_CARD_PROPERTY: &str = "alsa.card";
/// Property carrying the ALSA long card name of a hardware-backed endpoint.
pub const ALSA_CARD_NAME_PROPERTY: &str = "alsa.long_card_name";
/// Property naming the binary that owns a playback stream.
pub const PROCESS_BINARY_PROPERTY: &str = "application.process.binary";

const BLUETOOTH_SOURCE_PREFIX: &str = "bluez_source.";
const HARDWARE_OUTPUT_PREFIX: &str = "alsa_output";
const MONITOR_SUFFIX: &str = ".monitor";

/// Output class of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputClass {
    Internal,
    External,
}

/// Input class of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputClass {
    Mic,
    Aux,
}

impl fmt::Display for OutputClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputClass::Internal => write!(f, "internal"),
            OutputClass::External => write!(f, "external"),
        }
    }
}

impl fmt::Display for InputClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputClass::Mic => write!(f, "mic"),
            InputClass::Aux => write!(f, "aux"),
        }
    }
}

/// ALSA identity of a hardware-backed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlsaCard {
    pub id: String,
    pub long_name: String,
}

/// A device port as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// One selectable card profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardProfile {
    pub name: String,
    pub description: String,
    /// Declared number of sinks this profile exposes.
    pub sinks: u32,
    /// Declared number of sources this profile exposes.
    pub sources: u32,
    pub available: bool,
}

impl CardProfile {
    pub fn new(name: &str, sinks: u32, sources: u32) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            sinks,
            sources,
            available: true,
        }
    }

    pub fn is_off(&self) -> bool {
        self.name == "off"
    }

    /// Split a composite profile name (`output:analog-stereo+input:mono`)
    /// into `(type, mode)` pairs. Returns `None` if any token lacks a type.
    pub fn mode_tokens(&self) -> Option<Vec<(&str, &str)>> {
        self.name
            .split('+')
            .map(|token| token.split_once(':'))
            .collect()
    }
}

/// Raw card observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardInfo {
    pub index: u32,
    pub name: String,
    pub profiles: Vec<CardProfile>,
    pub active_profile: Option<String>,
}

/// Raw sink observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub channels: u8,
    pub alsa_card: Option<AlsaCard>,
}

/// Raw source observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub channels: u8,
    pub ports: Vec<PortInfo>,
    pub alsa_card: Option<AlsaCard>,
}

/// What a source physically is, derived from its server name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A capture endpoint (line-in, microphone, USB interface input).
    Endpoint,
    /// Audio arriving from a paired wireless peer. Its routing belongs to the
    /// platform, so the controller never creates or destroys its loopbacks.
    Bluetooth { address: String },
    /// The monitor of a hardware output, tapped into the monitor sink.
    OutputTap,
}

impl SourceInfo {
    /// Classify the source by name. `None` means the source is a monitor that
    /// the controller does not route at all.
    pub fn kind(&self) -> Option<SourceKind> {
        if let Some(rest) = self.name.strip_prefix(BLUETOOTH_SOURCE_PREFIX) {
            let address = rest.split('.').next().unwrap_or(rest).replace('_', ":");
            return Some(SourceKind::Bluetooth { address });
        }
        if self.name.starts_with(HARDWARE_OUTPUT_PREFIX) {
            return Some(SourceKind::OutputTap);
        }
        if self.name.ends_with(MONITOR_SUFFIX) {
            return None;
        }
        Some(SourceKind::Endpoint)
    }
}

/// Raw routing-module observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub index: u32,
    pub name: String,
    pub argument: String,
}

/// Raw playback-stream observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    pub sink: Option<u32>,
    pub channels: u8,
    /// Owning process binary, when the client reported it.
    pub binary: Option<String>,
}

/// Raw Bluetooth peer observation from the presence feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothPeerInfo {
    pub address: String,
    pub name: String,
}

/// Kind of server-side routing module the controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleKind {
    Loopback,
    AggregateSink,
    MonitorSink,
}

impl ModuleKind {
    /// Server module name.
    pub fn module_name(&self) -> &'static str {
        match self {
            ModuleKind::Loopback => "module-loopback",
            ModuleKind::AggregateSink => "module-combine-sink",
            ModuleKind::MonitorSink => "module-null-sink",
        }
    }

    pub fn from_module_name(name: &str) -> Option<Self> {
        match name {
            "module-loopback" => Some(ModuleKind::Loopback),
            "module-combine-sink" => Some(ModuleKind::AggregateSink),
            "module-null-sink" => Some(ModuleKind::MonitorSink),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Loopback => write!(f, "loopback"),
            ModuleKind::AggregateSink => write!(f, "aggregate-sink"),
            ModuleKind::MonitorSink => write!(f, "monitor-sink"),
        }
    }
}

/// A routing module currently loaded in the server.
///
/// The parsed arguments are the only record of what the module routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingModule {
    pub index: u32,
    pub kind: ModuleKind,
    pub args: ModuleArgs,
}

impl RoutingModule {
    /// Interpret a listed module. Modules of other kinds yield `None`, as do
    /// modules whose arguments do not parse (logged and skipped).
    pub fn from_listing(module: &ModuleInfo) -> Option<Self> {
        let kind = ModuleKind::from_module_name(&module.name)?;
        match ModuleArgs::parse(&module.argument) {
            Ok(args) => Some(Self {
                index: module.index,
                kind,
                args,
            }),
            Err(e) => {
                warn!("Skipping module #{} ({}): {}", module.index, module.name, e);
                None
            }
        }
    }

    /// Whether this is a loopback from `source` into `sink`.
    pub fn is_loopback(&self, source: &str, sink: &str) -> bool {
        self.kind == ModuleKind::Loopback
            && self.args.get("source") == Some(source)
            && self.args.get("sink") == Some(sink)
    }

    pub fn loopback_source(&self) -> Option<&str> {
        match self.kind {
            ModuleKind::Loopback => self.args.get("source"),
            _ => None,
        }
    }

    pub fn loopback_sink(&self) -> Option<&str> {
        match self.kind {
            ModuleKind::Loopback => self.args.get("sink"),
            _ => None,
        }
    }

    pub fn aggregate_members(&self) -> Vec<String> {
        match self.kind {
            ModuleKind::AggregateSink => self.args.get_list("slaves"),
            _ => Vec::new(),
        }
    }
}

/// Label of an application that plays straight into a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompanionKind {
    Plexamp,
    AirPlay,
    Spotify,
    Vlc,
    Generic,
}

impl fmt::Display for CompanionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompanionKind::Plexamp => write!(f, "plexamp"),
            CompanionKind::AirPlay => write!(f, "airplay"),
            CompanionKind::Spotify => write!(f, "spotify"),
            CompanionKind::Vlc => write!(f, "vlc"),
            CompanionKind::Generic => write!(f, "generic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> SourceInfo {
        SourceInfo {
            index: 1,
            name: name.to_string(),
            description: String::new(),
            channels: 2,
            ports: Vec::new(),
            alsa_card: None,
        }
    }

    #[test]
    fn test_source_kind_by_name() {
        assert_eq!(
            source("alsa_input.usb-Focusrite.analog-stereo").kind(),
            Some(SourceKind::Endpoint)
        );
        assert_eq!(
            source("alsa_output.pci-0000_00_1f.3.analog-stereo.monitor").kind(),
            Some(SourceKind::OutputTap)
        );
        assert_eq!(source("combined.monitor").kind(), None);
        assert_eq!(
            source("bluez_source.AA_BB_CC_DD_EE_FF.a2dp_source").kind(),
            Some(SourceKind::Bluetooth {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );
    }

    #[test]
    fn test_profile_mode_tokens() {
        let profile = CardProfile::new("output:analog-stereo+input:mono-fallback", 1, 1);
        assert_eq!(
            profile.mode_tokens(),
            Some(vec![("output", "analog-stereo"), ("input", "mono-fallback")])
        );

        let bare = CardProfile::new("pro-audio", 1, 1);
        assert_eq!(bare.mode_tokens(), None);
    }

    #[test]
    fn test_module_kind_names() {
        for kind in [
            ModuleKind::Loopback,
            ModuleKind::AggregateSink,
            ModuleKind::MonitorSink,
        ] {
            assert_eq!(ModuleKind::from_module_name(kind.module_name()), Some(kind));
        }
        assert_eq!(ModuleKind::from_module_name("module-udev-detect"), None);
    }

    #[test]
    fn test_routing_module_from_listing() {
        let listing = |name: &str, argument: &str| ModuleInfo {
            index: 7,
            name: name.to_string(),
            argument: argument.to_string(),
        };

        let module =
            RoutingModule::from_listing(&listing("module-loopback", "source=a sink=b")).unwrap();
        assert!(module.is_loopback("a", "b"));
        assert!(RoutingModule::from_listing(&listing("module-loopback", "source=\"open")).is_none());
        assert!(RoutingModule::from_listing(&listing("module-udev-detect", "")).is_none());
    }
}
