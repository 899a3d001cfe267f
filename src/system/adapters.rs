use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::device::{ALSA_CARD_NAME_PROPERTY, ALSA_CARD_PROPERTY, PROCESS_BINARY_PROPERTY};
use crate::audio::presence::parse_bluetooth_listing;
use crate::audio::{
    AlsaCard, BluetoothPeerInfo, CardInfo, CardProfile, ModuleArgs, ModuleInfo, ModuleKind,
    PortInfo, SinkInfo, SourceInfo, StreamInfo, VolumeTarget,
};
use crate::error::ServerError;
use crate::system::traits::{
    AudioServerClient, AudioServerConnector, BluetoothPresence, EventKind, EventStream, Facility,
    FileSystemInterface, ServerEvent,
};

const PACTL: &str = "pactl";
const BLUETOOTHCTL: &str = "bluetoothctl";

static SUBSCRIBE_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^Event '(?P<kind>[a-z]+)' on (?P<facility>[a-z-]+) #(?P<index>\d+)$")
        .map_err(|e| warn!("Event pattern failed to compile: {}", e))
        .ok()
});

type Properties = BTreeMap<String, Value>;

#[derive(Debug, Deserialize)]
struct RawPort {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawSink {
    index: u32,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    channel_map: String,
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    index: u32,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    channel_map: String,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    ports: Vec<RawPort>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    description: String,
    #[serde(default)]
    sinks: u32,
    #[serde(default)]
    sources: u32,
    #[serde(default = "default_available")]
    available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawCard {
    index: u32,
    name: String,
    /// Kept as a map so the server's profile order survives.
    #[serde(default)]
    profiles: serde_json::Map<String, Value>,
    #[serde(default)]
    active_profile: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawModule {
    index: u32,
    name: String,
    #[serde(default)]
    argument: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    index: u32,
    #[serde(default)]
    sink: Option<u32>,
    #[serde(default)]
    channel_map: String,
    #[serde(default)]
    properties: Properties,
}

fn property<'a>(properties: &'a Properties, key: &str) -> Option<&'a str> {
    properties.get(key).and_then(Value::as_str)
}

fn alsa_card(properties: &Properties) -> Option<AlsaCard> {
    Some(AlsaCard {
        id: property(properties, ALSA_CARD_PROPERTY)?.to_string(),
        long_name: property(properties, ALSA_CARD_NAME_PROPERTY)?.to_string(),
    })
}

fn channel_count(channel_map: &str) -> u8 {
    let count = channel_map.split(',').filter(|c| !c.trim().is_empty()).count();
    u8::try_from(count).unwrap_or(u8::MAX).max(1)
}

fn volume_percent(level: f64) -> String {
    format!("{}%", (level * 100.0).round().max(0.0) as u32)
}

fn is_connection_failure(stderr: &str) -> bool {
    ["Connection failure", "Connection refused", "Connection terminated"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Parse one `pactl subscribe` line. Only new/remove events on cards, sinks
/// and sources are of interest; everything else yields `None`.
pub fn parse_event_line(line: &str) -> Option<ServerEvent> {
    let caps = SUBSCRIBE_LINE.as_ref()?.captures(line.trim())?;

    let kind = match &caps["kind"] {
        "new" => EventKind::New,
        "remove" => EventKind::Remove,
        _ => return None,
    };
    let facility = match &caps["facility"] {
        "card" => Facility::Card,
        "sink" => Facility::Sink,
        "source" => Facility::Source,
        _ => return None,
    };

    Some(ServerEvent {
        kind,
        facility,
        index: caps["index"].parse().ok()?,
    })
}

/// Production client that drives the PulseAudio-compatible server through
/// the `pactl` command-line tool.
#[derive(Debug, Default)]
pub struct PactlClient;

impl PactlClient {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[String]) -> Result<String, ServerError> {
        debug!("{} {}", PACTL, args.join(" "));

        let output = Command::new(PACTL)
            .args(args)
            .output()
            .map_err(|e| ServerError::unavailable(format!("failed to run {PACTL}: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_connection_failure(&stderr) {
            Err(ServerError::unavailable(stderr))
        } else {
            Err(ServerError::rejected(args.join(" "), stderr))
        }
    }

    fn run_str(&self, args: &[&str]) -> Result<String, ServerError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&args)
    }

    fn list<T: for<'de> Deserialize<'de>>(&self, category: &str) -> Result<Vec<T>, ServerError> {
        let output = self.run_str(&["--format=json", "list", category])?;
        serde_json::from_str(&output).map_err(|e| {
            ServerError::rejected(format!("list {category}"), format!("unreadable output: {e}"))
        })
    }
}

impl AudioServerClient for PactlClient {
    fn list_sinks(&self) -> Result<Vec<SinkInfo>, ServerError> {
        let raw: Vec<RawSink> = self.list("sinks")?;
        Ok(raw
            .into_iter()
            .map(|s| SinkInfo {
                index: s.index,
                alsa_card: alsa_card(&s.properties),
                channels: channel_count(&s.channel_map),
                name: s.name,
                description: s.description,
            })
            .collect())
    }

    fn list_sources(&self) -> Result<Vec<SourceInfo>, ServerError> {
        let raw: Vec<RawSource> = self.list("sources")?;
        Ok(raw
            .into_iter()
            .map(|s| SourceInfo {
                index: s.index,
                alsa_card: alsa_card(&s.properties),
                channels: channel_count(&s.channel_map),
                ports: s
                    .ports
                    .into_iter()
                    .map(|p| PortInfo {
                        name: p.name,
                        description: p.description,
                    })
                    .collect(),
                name: s.name,
                description: s.description,
            })
            .collect())
    }

    fn list_cards(&self) -> Result<Vec<CardInfo>, ServerError> {
        let raw: Vec<RawCard> = self.list("cards")?;
        Ok(raw
            .into_iter()
            .map(|card| {
                let profiles = card
                    .profiles
                    .into_iter()
                    .filter_map(|(name, value)| {
                        match serde_json::from_value::<RawProfile>(value) {
                            Ok(p) => Some(CardProfile {
                                name,
                                description: p.description,
                                sinks: p.sinks,
                                sources: p.sources,
                                available: p.available,
                            }),
                            Err(e) => {
                                warn!("Skipping unreadable profile {} of {}: {}", name, card.name, e);
                                None
                            }
                        }
                    })
                    .collect();
                CardInfo {
                    index: card.index,
                    name: card.name,
                    profiles,
                    active_profile: card.active_profile,
                }
            })
            .collect())
    }

    fn list_modules(&self) -> Result<Vec<ModuleInfo>, ServerError> {
        let raw: Vec<RawModule> = self.list("modules")?;
        Ok(raw
            .into_iter()
            .map(|m| ModuleInfo {
                index: m.index,
                name: m.name,
                argument: m.argument.unwrap_or_default(),
            })
            .collect())
    }

    fn list_streams(&self) -> Result<Vec<StreamInfo>, ServerError> {
        let raw: Vec<RawStream> = self.list("sink-inputs")?;
        Ok(raw
            .into_iter()
            .map(|s| StreamInfo {
                index: s.index,
                sink: s.sink,
                channels: channel_count(&s.channel_map),
                binary: property(&s.properties, PROCESS_BINARY_PROPERTY).map(str::to_string),
            })
            .collect())
    }

    fn load_module(&self, kind: ModuleKind, args: &ModuleArgs) -> Result<u32, ServerError> {
        let mut command = vec!["load-module".to_string(), kind.module_name().to_string()];
        command.extend(args.to_arg_list());

        let output = self.run(&command)?;
        output.trim().parse().map_err(|_| {
            ServerError::rejected(
                format!("load-module {}", kind.module_name()),
                format!("unexpected module index '{}'", output.trim()),
            )
        })
    }

    fn unload_module(&self, index: u32) -> Result<(), ServerError> {
        self.run(&["unload-module".to_string(), index.to_string()])
            .map(|_| ())
    }

    fn set_default_sink(&self, name: &str) -> Result<(), ServerError> {
        self.run_str(&["set-default-sink", name]).map(|_| ())
    }

    fn set_default_source(&self, name: &str) -> Result<(), ServerError> {
        self.run_str(&["set-default-source", name]).map(|_| ())
    }

    fn set_volume(
        &self,
        target: VolumeTarget,
        channels: u8,
        level: f64,
    ) -> Result<(), ServerError> {
        let (command, index) = match target {
            VolumeTarget::Sink(index) => ("set-sink-volume", index),
            VolumeTarget::Source(index) => ("set-source-volume", index),
        };

        let mut args = vec![command.to_string(), index.to_string()];
        args.extend(std::iter::repeat_n(volume_percent(level), usize::from(channels.max(1))));
        self.run(&args).map(|_| ())
    }

    fn set_card_profile(&self, card: &str, profile: &str) -> Result<(), ServerError> {
        self.run_str(&["set-card-profile", card, profile]).map(|_| ())
    }

    fn subscribe_events(&self) -> Result<Box<dyn EventStream>, ServerError> {
        let child = Command::new(PACTL)
            .arg("subscribe")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ServerError::unavailable(format!("failed to run {PACTL} subscribe: {e}")))?;

        Ok(Box::new(PactlEventStream::attach(child)?))
    }
}

/// Event subscription backed by a `pactl subscribe` child process whose
/// output is pumped onto a channel by a reader thread.
pub struct PactlEventStream {
    child: Child,
    receiver: Receiver<ServerEvent>,
}

impl PactlEventStream {
    /// Start pumping `child`'s output. On failure the child is killed and
    /// reaped when the half-built stream drops.
    fn attach(child: Child) -> Result<Self, ServerError> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut stream = Self { child, receiver };

        let stdout = stream
            .child
            .stdout
            .take()
            .ok_or_else(|| ServerError::unavailable("pactl subscribe has no stdout"))?;

        std::thread::Builder::new()
            .name("pactl-subscribe".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if let Some(event) = parse_event_line(&line) {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                }
                debug!("pactl subscribe stream closed");
            })
            .map_err(|e| ServerError::unavailable(format!("failed to start event reader: {e}")))?;

        Ok(stream)
    }
}

impl EventStream for PactlEventStream {
    fn next(&mut self, timeout: Duration) -> Result<Option<ServerEvent>, ServerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ServerError::unavailable("event subscription closed"))
            }
        }
    }
}

impl Drop for PactlEventStream {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("pactl subscribe already exited: {}", e);
        }
        let _ = self.child.wait();
    }
}

/// Connects `pactl` clients after checking the server answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PactlConnector;

impl AudioServerConnector for PactlConnector {
    fn connect(&self) -> Result<Box<dyn AudioServerClient>, ServerError> {
        let client = PactlClient::new();
        client.run_str(&["info"])?;
        Ok(Box::new(client))
    }
}

/// Bluetooth presence from `bluetoothctl devices Connected`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BluetoothCtl;

impl BluetoothPresence for BluetoothCtl {
    fn connected_peers(&self) -> Result<Vec<BluetoothPeerInfo>> {
        let output = Command::new(BLUETOOTHCTL)
            .args(["devices", "Connected"])
            .output()
            .with_context(|| format!("Failed to run {BLUETOOTHCTL}"))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                BLUETOOTHCTL,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_bluetooth_listing(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Production implementation of FileSystemInterface using std::fs
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFileSystem;

impl FileSystemInterface for StandardFileSystem {
    fn read_config_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))
    }

    fn write_config_file(&self, path: &Path, content: &str) -> Result<()> {
        std::fs::write(path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write config file: {}", e))
    }

    fn config_file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_config_dir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create config directory: {}", e))
    }
}
