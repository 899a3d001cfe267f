use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use super::catalog::{BluetoothPeer, CompanionStream, DeviceCatalog};
use super::device::{BluetoothPeerInfo, CompanionKind, StreamInfo};

static CONNECTED_DEVICE_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^Device\s+(?P<address>\S+)\s+(?P<name>.+)$")
        .map_err(|e| warn!("Bluetooth listing pattern failed to compile: {}", e))
        .ok()
});

impl CompanionKind {
    /// Map an owning-process binary to its companion label. Unknown
    /// binaries fall through to `Generic`.
    pub fn from_binary(binary: &str) -> Self {
        match binary {
            "node" => CompanionKind::Plexamp,
            "shairport-sync" => CompanionKind::AirPlay,
            "spotifyd" => CompanionKind::Spotify,
            "vlc" => CompanionKind::Vlc,
            _ => CompanionKind::Generic,
        }
    }
}

/// Parse a `Device <address> <name>` listing of connected peers.
/// Lines that do not match are skipped.
pub fn parse_bluetooth_listing(output: &str) -> Vec<BluetoothPeerInfo> {
    let Some(pattern) = CONNECTED_DEVICE_LINE.as_ref() else {
        return Vec::new();
    };

    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let caps = pattern.captures(line);
            if caps.is_none() {
                debug!("Ignoring bluetooth listing line: {}", line);
            }
            let caps = caps?;
            Some(BluetoothPeerInfo {
                address: caps["address"].to_string(),
                name: caps["name"].trim().to_string(),
            })
        })
        .collect()
}

/// Companion streams among the active playback streams, one per binary.
/// Streams whose client did not report a binary are not companions.
pub fn scan_companion_streams(streams: &[StreamInfo]) -> Vec<CompanionStream> {
    let mut found: Vec<CompanionStream> = Vec::new();

    for stream in streams {
        let Some(binary) = stream.binary.as_deref() else {
            continue;
        };
        if found.iter().any(|c| c.binary == binary) {
            continue;
        }

        let kind = CompanionKind::from_binary(binary);
        if kind == CompanionKind::Generic {
            info!("Unidentified companion stream from {}", binary);
        }
        found.push(CompanionStream {
            binary: binary.to_string(),
            kind,
            stream_index: stream.index,
            channels: stream.channels,
            active: false,
        });
    }

    found
}

/// Merge a Bluetooth presence snapshot into the catalog, evicting peers
/// that are no longer connected. Returns whether anything changed.
pub fn merge_bluetooth_peers(catalog: &mut DeviceCatalog, peers: Vec<BluetoothPeerInfo>) -> bool {
    let mut changed = false;

    for address in catalog.bluetooth_peers().identities() {
        if !peers.iter().any(|p| p.address == address) {
            warn!("Bluetooth peer {} has been disconnected", address);
            catalog.remove_bluetooth_peer(&address);
            changed = true;
        }
    }

    for peer in peers {
        if catalog.bluetooth_peers().contains(&peer.address) {
            continue;
        }
        info!("Found bluetooth peer: {} {}", peer.name, peer.address);
        catalog.upsert_bluetooth_peer(BluetoothPeer {
            address: peer.address,
            name: peer.name,
            active: false,
        });
        changed = true;
    }

    changed
}

/// Merge the current companion streams into the catalog, evicting the ones
/// that stopped. Returns whether anything changed.
pub fn merge_companion_streams(catalog: &mut DeviceCatalog, streams: Vec<CompanionStream>) -> bool {
    let mut changed = false;

    for binary in catalog.companions().identities() {
        if !streams.iter().any(|s| s.binary == binary) {
            info!("Companion stream from {} stopped", binary);
            catalog.remove_companion(&binary);
            changed = true;
        }
    }

    for stream in streams {
        let known = catalog
            .companions()
            .get(&stream.binary)
            .is_some_and(|c| c.stream_index == stream.stream_index);
        if !known {
            catalog.upsert_companion(stream);
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(index: u32, binary: Option<&str>) -> StreamInfo {
        StreamInfo {
            index,
            sink: Some(0),
            channels: 2,
            binary: binary.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_connected_devices() {
        let output = "Device AA:BB:CC:DD:EE:FF Pixel 7\n\
                      garbage line\n\
                      \n\
                      Device 11:22:33:44:55:66 JBL Flip 5 \n";

        let peers = parse_bluetooth_listing(output);
        assert_eq!(
            peers,
            vec![
                BluetoothPeerInfo {
                    address: "AA:BB:CC:DD:EE:FF".to_string(),
                    name: "Pixel 7".to_string()
                },
                BluetoothPeerInfo {
                    address: "11:22:33:44:55:66".to_string(),
                    name: "JBL Flip 5".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_companion_kinds() {
        assert_eq!(CompanionKind::from_binary("node"), CompanionKind::Plexamp);
        assert_eq!(
            CompanionKind::from_binary("shairport-sync"),
            CompanionKind::AirPlay
        );
        assert_eq!(CompanionKind::from_binary("spotifyd"), CompanionKind::Spotify);
        assert_eq!(CompanionKind::from_binary("vlc"), CompanionKind::Vlc);
        assert_eq!(CompanionKind::from_binary("mpv"), CompanionKind::Generic);
    }

    #[test]
    fn test_scan_keeps_first_stream_per_binary() {
        let streams = vec![
            stream(4, Some("spotifyd")),
            stream(5, None),
            stream(6, Some("spotifyd")),
            stream(7, Some("mpv")),
        ];

        let found = scan_companion_streams(&streams);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].stream_index, 4);
        assert_eq!(found[1].kind, CompanionKind::Generic);
    }

    #[test]
    fn test_merge_bluetooth_evicts_disconnected_peers() {
        let mut catalog = DeviceCatalog::new();
        let phone = BluetoothPeerInfo {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: "Phone".to_string(),
        };

        assert!(merge_bluetooth_peers(&mut catalog, vec![phone.clone()]));
        catalog.mark_bluetooth_peer_active(&phone.address);
        assert!(!merge_bluetooth_peers(&mut catalog, vec![phone]));
        assert!(catalog.bluetooth_peers().get("AA:BB:CC:DD:EE:FF").unwrap().active);

        assert!(merge_bluetooth_peers(&mut catalog, Vec::new()));
        assert!(catalog.bluetooth_peers().is_empty());
    }

    #[test]
    fn test_merge_companions_is_stable_for_same_stream() {
        let mut catalog = DeviceCatalog::new();
        let streams = scan_companion_streams(&[stream(4, Some("vlc"))]);

        assert!(merge_companion_streams(&mut catalog, streams.clone()));
        assert!(!merge_companion_streams(&mut catalog, streams));
        assert!(merge_companion_streams(&mut catalog, Vec::new()));
        assert!(catalog.companions().is_empty());
    }
}
