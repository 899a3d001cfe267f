//! Builders for server objects and a harness driving a reconciler against
//! the in-memory server.
//!
//! Not every test uses every method, so dead code warnings are suppressed.

#![allow(dead_code)]

use audio_topology_controller::audio::{AlsaCard, CardInfo, CardProfile, PortInfo, SinkInfo, SourceInfo};
use audio_topology_controller::config::Config;
use audio_topology_controller::system::{MockAudioServer, MockBluetooth};
use audio_topology_controller::{LoopState, Reconciler};

/// Builder for test SinkInfo instances
pub struct SinkBuilder {
    index: u32,
    name: String,
    description: String,
    channels: u8,
    alsa_card: Option<AlsaCard>,
}

impl SinkBuilder {
    pub fn new(index: u32, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            description: "USB Audio Analog Stereo".to_string(),
            channels: 2,
            alsa_card: None,
        }
    }

    /// Describe the sink as the machine's built-in output.
    pub fn internal(mut self) -> Self {
        self.description = "Built-in Audio Analog Stereo".to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn alsa_card(mut self, id: &str, long_name: &str) -> Self {
        self.alsa_card = Some(AlsaCard {
            id: id.to_string(),
            long_name: long_name.to_string(),
        });
        self
    }

    pub fn build(self) -> SinkInfo {
        SinkInfo {
            index: self.index,
            name: self.name,
            description: self.description,
            channels: self.channels,
            alsa_card: self.alsa_card,
        }
    }
}

/// Builder for test SourceInfo instances; a line input unless told otherwise
pub struct SourceBuilder {
    index: u32,
    name: String,
    channels: u8,
    port: String,
    alsa_card: Option<AlsaCard>,
}

impl SourceBuilder {
    pub fn new(index: u32, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            channels: 2,
            port: "analog-input-linein".to_string(),
            alsa_card: None,
        }
    }

    pub fn mic(mut self) -> Self {
        self.port = "analog-input-mic".to_string();
        self
    }

    pub fn channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn alsa_card(mut self, id: &str, long_name: &str) -> Self {
        self.alsa_card = Some(AlsaCard {
            id: id.to_string(),
            long_name: long_name.to_string(),
        });
        self
    }

    pub fn build(self) -> SourceInfo {
        SourceInfo {
            index: self.index,
            name: self.name,
            description: "Test Input".to_string(),
            channels: self.channels,
            ports: vec![PortInfo {
                name: self.port.clone(),
                description: self.port,
            }],
            alsa_card: self.alsa_card,
        }
    }
}

/// Builder for test CardInfo instances
pub struct CardBuilder {
    index: u32,
    name: String,
    profiles: Vec<CardProfile>,
    active_profile: Option<String>,
}

impl CardBuilder {
    pub fn new(index: u32, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            profiles: vec![CardProfile::new("off", 0, 0)],
            active_profile: Some("off".to_string()),
        }
    }

    pub fn profile(mut self, name: &str) -> Self {
        self.profiles.push(CardProfile::new(name, 1, 1));
        self
    }

    pub fn unavailable_profile(mut self, name: &str) -> Self {
        let mut profile = CardProfile::new(name, 1, 1);
        profile.available = false;
        self.profiles.push(profile);
        self
    }

    pub fn active(mut self, name: &str) -> Self {
        self.active_profile = Some(name.to_string());
        self
    }

    pub fn build(self) -> CardInfo {
        CardInfo {
            index: self.index,
            name: self.name,
            profiles: self.profiles,
            active_profile: self.active_profile,
        }
    }
}

/// Config tuned for fast tests: short waits, immediate reconnects
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.general.event_wait_ms = 10;
    config.general.reconnect_delay_ms = 0;
    config.general.presence_poll_interval_ms = 60_000;
    config
}

/// A reconciler wired to a shared mock server and Bluetooth feed
pub struct Harness {
    pub server: MockAudioServer,
    pub bluetooth: MockBluetooth,
    pub reconciler: Reconciler<MockAudioServer, MockBluetooth>,
}

impl Harness {
    pub fn new(config: &Config, server: MockAudioServer) -> Self {
        let bluetooth = MockBluetooth::new();
        let reconciler = Reconciler::new(config, server.clone(), bluetooth.clone());
        Self {
            server,
            bluetooth,
            reconciler,
        }
    }

    /// Run startup and drain the events it caused.
    pub fn start(&mut self) -> LoopState {
        let state = self.reconciler.step();
        self.settle();
        state
    }

    /// Step until pending events are drained; idle steps time out quickly.
    pub fn settle(&mut self) {
        for _ in 0..20 {
            self.reconciler.step();
        }
    }
}
