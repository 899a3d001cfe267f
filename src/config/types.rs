use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audio::{InputClass, OutputClass};

/// Volume applied to a sink when nothing valid is configured.
pub const DEFAULT_SINK_VOLUME: f64 = 1.0;
/// Volume applied to a source when nothing valid is configured.
pub const DEFAULT_SOURCE_VOLUME: f64 = 0.85;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub automatic: AutomaticConfig,

    #[serde(default)]
    pub manual: ManualConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Upper bound on a single wait for server change events.
    pub event_wait_ms: u64,
    /// Pause between reconnect attempts while the server is down.
    pub reconnect_delay_ms: u64,
    /// How often the Bluetooth and companion-stream feeds are polled.
    pub presence_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: AudioMode,
    /// Class given to a source that shares an ALSA card with a known sink.
    pub co_located_io_class: InputClass,
    pub allow_multiple_sinks: bool,
    pub allow_multiple_sources: bool,
    /// Description fragment identifying the platform's built-in audio.
    pub internal_output_marker: String,
    /// Port name/description fragments identifying a microphone.
    pub mic_port_markers: Vec<String>,
    pub monitor_sink_name: String,
    pub monitor_sink_description: String,
    pub aggregate_sink_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomaticConfig {
    pub allowed_output_class: Option<OutputClass>,
    pub allowed_input_class: Option<InputClass>,
    /// Kept as a raw value so a non-numeric entry can be reported and replaced.
    pub default_sink_volume: Option<toml::Value>,
    pub default_source_volume: Option<toml::Value>,
    pub allowed_card_profile_types: Vec<String>,
    pub allowed_card_profile_modes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    /// Volume for the aggregate sink in manual mode.
    pub combined_sink_volume: Option<toml::Value>,
    pub cards: Vec<ManualCard>,
    pub sinks: Vec<ManualSink>,
    pub sources: Vec<ManualSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCard {
    pub name: String,
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSink {
    pub name: String,
    #[serde(rename = "type", default)]
    pub class: Option<OutputClass>,
    #[serde(default)]
    pub volume: Option<toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSource {
    pub name: String,
    #[serde(rename = "type", default)]
    pub class: Option<InputClass>,
    #[serde(default)]
    pub volume: Option<toml::Value>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            event_wait_ms: 100,
            reconnect_delay_ms: 2000,
            presence_poll_interval_ms: 2000,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::Automatic,
            co_located_io_class: InputClass::Aux,
            allow_multiple_sinks: true,
            allow_multiple_sources: true,
            internal_output_marker: "Built-in Audio".to_string(),
            mic_port_markers: vec!["mic".to_string(), "Microphone".to_string()],
            monitor_sink_name: "topology_monitor".to_string(),
            monitor_sink_description: "Topology-Monitor-Sink".to_string(),
            aggregate_sink_name: "combined".to_string(),
        }
    }
}

/// Turn a configured volume into a level, substituting `fallback` (with a
/// warning) when the value is present but not numeric.
pub fn resolve_volume(value: Option<&toml::Value>, fallback: f64, label: &str) -> f64 {
    match value {
        None => fallback,
        Some(toml::Value::Float(level)) => *level,
        Some(toml::Value::Integer(level)) => *level as f64,
        Some(other) => {
            warn!(
                "Volume for {} is not numeric ({}), using {}",
                label, other, fallback
            );
            fallback
        }
    }
}

impl Config {
    /// Load from `config_path`, or the default location when `None`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let loader = match config_path {
            Some(path) => super::ConfigLoader::new_production(path.into()),
            None => super::ConfigLoader::new_with_default_path()?,
        };
        loader.load_config()
    }

    /// Whether automatic card-profile management has what it needs.
    pub fn card_profile_policy_complete(&self) -> bool {
        !self.automatic.allowed_card_profile_types.is_empty()
            && !self.automatic.allowed_card_profile_modes.is_empty()
    }

    /// Human-readable problems that do not prevent the controller from running.
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match self.policy.mode {
            AudioMode::Automatic => {
                if !self.card_profile_policy_complete() {
                    warnings.push(
                        "automatic card-profile types/modes are incomplete; card profiles will not be managed"
                            .to_string(),
                    );
                }
                for (label, value) in [
                    ("default_sink_volume", &self.automatic.default_sink_volume),
                    ("default_source_volume", &self.automatic.default_source_volume),
                ] {
                    if let Some(v) = value {
                        if !v.is_float() && !v.is_integer() {
                            warnings.push(format!("{label} is not numeric: {v}"));
                        }
                    }
                }
            }
            AudioMode::Manual => {
                if self.manual.sinks.is_empty() && self.manual.sources.is_empty() {
                    warnings.push("manual mode with no sink or source tables: nothing is eligible".to_string());
                }
                let combined = "combined sink".to_string();
                let volumes = std::iter::once((&combined, &self.manual.combined_sink_volume))
                    .chain(self.manual.sinks.iter().map(|s| (&s.name, &s.volume)))
                    .chain(self.manual.sources.iter().map(|s| (&s.name, &s.volume)));
                for (name, value) in volumes {
                    if let Some(v) = value {
                        if !v.is_float() && !v.is_integer() {
                            warnings.push(format!("volume for {name} is not numeric: {v}"));
                        }
                    }
                }
            }
        }

        if self.policy.monitor_sink_name == self.policy.aggregate_sink_name {
            warnings.push("monitor and aggregate sinks share a name".to_string());
        }

        warnings
    }
}
