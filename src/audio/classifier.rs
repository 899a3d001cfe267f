use tracing::{debug, warn};

use super::catalog::CorrelationMap;
use super::device::{CardInfo, InputClass, OutputClass, SinkInfo, SourceInfo, SourceKind};
use crate::config::{
    AudioMode, Config, DEFAULT_SINK_VOLUME, DEFAULT_SOURCE_VOLUME, ManualCard, resolve_volume,
};

/// Semantic role assigned to a discovered endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification<C> {
    pub eligible: bool,
    pub class: C,
    pub volume: f64,
}

/// Outcome of card-profile selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSelection {
    Selected(String),
    NoMatch,
    /// Automatic profile policy lacks its type or mode list.
    PolicyIncomplete,
}

#[derive(Debug, Clone)]
struct ManualEntry<C> {
    name: String,
    class: Option<C>,
    volume: f64,
}

/// Pure mapping from raw devices plus policy to semantic roles.
///
/// Volumes are resolved once at construction so an invalid configured value
/// is reported once per configuration load.
#[derive(Debug, Clone)]
pub struct Classifier {
    mode: AudioMode,
    internal_marker: String,
    mic_markers: Vec<String>,
    co_located_class: InputClass,
    allowed_output: Option<OutputClass>,
    allowed_input: Option<InputClass>,
    sink_volume: f64,
    source_volume: f64,
    aggregate_volume: f64,
    profile_types: Vec<String>,
    profile_modes: Vec<String>,
    manual_cards: Vec<ManualCard>,
    manual_sinks: Vec<ManualEntry<OutputClass>>,
    manual_sources: Vec<ManualEntry<InputClass>>,
}

impl Classifier {
    pub fn new(config: &Config) -> Self {
        let automatic = &config.automatic;

        let manual_sinks = config
            .manual
            .sinks
            .iter()
            .map(|s| ManualEntry {
                name: s.name.clone(),
                class: s.class,
                volume: resolve_volume(s.volume.as_ref(), DEFAULT_SINK_VOLUME, &s.name),
            })
            .collect();
        let manual_sources = config
            .manual
            .sources
            .iter()
            .map(|s| ManualEntry {
                name: s.name.clone(),
                class: s.class,
                volume: resolve_volume(s.volume.as_ref(), DEFAULT_SOURCE_VOLUME, &s.name),
            })
            .collect();

        let sink_volume = resolve_volume(
            automatic.default_sink_volume.as_ref(),
            DEFAULT_SINK_VOLUME,
            "default sink",
        );
        let aggregate_volume = match config.policy.mode {
            AudioMode::Automatic => sink_volume,
            AudioMode::Manual => resolve_volume(
                config.manual.combined_sink_volume.as_ref(),
                DEFAULT_SINK_VOLUME,
                "combined sink",
            ),
        };

        Self {
            mode: config.policy.mode,
            internal_marker: config.policy.internal_output_marker.clone(),
            mic_markers: config.policy.mic_port_markers.clone(),
            co_located_class: config.policy.co_located_io_class,
            allowed_output: automatic.allowed_output_class,
            allowed_input: automatic.allowed_input_class,
            sink_volume,
            source_volume: resolve_volume(
                automatic.default_source_volume.as_ref(),
                DEFAULT_SOURCE_VOLUME,
                "default source",
            ),
            aggregate_volume,
            profile_types: automatic.allowed_card_profile_types.clone(),
            profile_modes: automatic.allowed_card_profile_modes.clone(),
            manual_cards: config.manual.cards.clone(),
            manual_sinks,
            manual_sources,
        }
    }

    pub fn mode(&self) -> AudioMode {
        self.mode
    }

    /// Level for the aggregate sink.
    pub fn aggregate_volume(&self) -> f64 {
        self.aggregate_volume
    }

    pub fn output_class(&self, sink: &SinkInfo) -> OutputClass {
        if sink.description.contains(&self.internal_marker) {
            OutputClass::Internal
        } else {
            OutputClass::External
        }
    }

    /// Input class from port metadata, overridden for sources sharing an
    /// ALSA card with a catalogued sink.
    pub fn input_class(&self, source: &SourceInfo, correlation: &CorrelationMap) -> InputClass {
        let is_mic = source.ports.iter().any(|port| {
            self.mic_markers
                .iter()
                .any(|m| port.name.contains(m.as_str()) || port.description.contains(m.as_str()))
        });
        let class = if is_mic { InputClass::Mic } else { InputClass::Aux };

        match &source.alsa_card {
            Some(card) if correlation.matches(card) => {
                debug!(
                    "Source {} shares ALSA card {} with a sink, classed as {}",
                    source.name, card.id, self.co_located_class
                );
                self.co_located_class
            }
            _ => class,
        }
    }

    pub fn classify_sink(&self, sink: &SinkInfo) -> Classification<OutputClass> {
        let class = self.output_class(sink);

        match self.mode {
            AudioMode::Automatic => Classification {
                eligible: self.allowed_output.is_none_or(|allowed| allowed == class),
                class,
                volume: self.sink_volume,
            },
            AudioMode::Manual => match self.manual_sinks.iter().find(|e| e.name == sink.name) {
                Some(entry) => Classification {
                    eligible: entry.class.is_none_or(|c| c == class),
                    class,
                    volume: entry.volume,
                },
                None => Classification {
                    eligible: false,
                    class,
                    volume: DEFAULT_SINK_VOLUME,
                },
            },
        }
    }

    pub fn classify_source(
        &self,
        source: &SourceInfo,
        kind: &SourceKind,
        correlation: &CorrelationMap,
    ) -> Classification<InputClass> {
        match kind {
            // Peers and output taps are always aux-equivalent and bypass the
            // class/table filters once observed.
            SourceKind::Bluetooth { .. } | SourceKind::OutputTap => {
                return Classification {
                    eligible: true,
                    class: InputClass::Aux,
                    volume: self.source_volume_for(&source.name),
                };
            }
            SourceKind::Endpoint => {}
        }

        let class = self.input_class(source, correlation);

        match self.mode {
            AudioMode::Automatic => Classification {
                eligible: self.allowed_input.is_none_or(|allowed| allowed == class),
                class,
                volume: self.source_volume,
            },
            AudioMode::Manual => match self.manual_sources.iter().find(|e| e.name == source.name) {
                Some(entry) => Classification {
                    eligible: entry.class.is_none_or(|c| c == class),
                    class,
                    volume: entry.volume,
                },
                None => Classification {
                    eligible: false,
                    class,
                    volume: DEFAULT_SOURCE_VOLUME,
                },
            },
        }
    }

    fn source_volume_for(&self, name: &str) -> f64 {
        match self.mode {
            AudioMode::Automatic => self.source_volume,
            AudioMode::Manual => self
                .manual_sources
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.volume)
                .unwrap_or(DEFAULT_SOURCE_VOLUME),
        }
    }

    /// Pick the profile a card should run, walking candidates in ascending
    /// (server-reported) order.
    pub fn select_card_profile(&self, card: &CardInfo) -> ProfileSelection {
        match self.mode {
            AudioMode::Automatic => {
                if self.profile_types.is_empty() || self.profile_modes.is_empty() {
                    return ProfileSelection::PolicyIncomplete;
                }

                for profile in card.profiles.iter().filter(|p| !p.is_off() && p.available) {
                    let Some(tokens) = profile.mode_tokens() else {
                        warn!(
                            "Card {} profile {} has an undefined profile type",
                            card.name, profile.name
                        );
                        continue;
                    };

                    let qualifies = tokens.iter().all(|(profile_type, mode)| {
                        self.profile_types.iter().any(|t| t == profile_type)
                            && self.profile_modes.iter().any(|m| m == mode)
                    });
                    if qualifies {
                        return ProfileSelection::Selected(profile.name.clone());
                    }
                }

                ProfileSelection::NoMatch
            }
            AudioMode::Manual => self
                .manual_cards
                .iter()
                .find(|c| c.name == card.name)
                .and_then(|entry| card.profiles.iter().find(|p| p.name == entry.profile))
                .map(|p| ProfileSelection::Selected(p.name.clone()))
                .unwrap_or(ProfileSelection::NoMatch),
        }
    }
}
