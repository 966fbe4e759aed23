//! Relay wire protocol: message types and version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent in the hostname reply so the collector can reject old relays.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hardware (MAC) address, 6 bytes. Serialized as fixed-length binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HwAddr(pub [u8; 6]);

/// Accepts `aa:bb:cc:dd:ee:ff` (any case) or the bare 12-hex-digit form.
impl FromStr for HwAddr {
    type Err = InvalidHwAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: String = if s.len() == 17 {
            let parts: Vec<&str> = s.split(':').collect();
            if parts.len() != 6 || parts.iter().any(|p| p.len() != 2) {
                return Err(InvalidHwAddr(s.to_string()));
            }
            parts.concat()
        } else {
            s.to_string()
        };
        if digits.len() != 12 {
            return Err(InvalidHwAddr(s.to_string()));
        }
        let raw = hex::decode(&digits).map_err(|_| InvalidHwAddr(s.to_string()))?;
        let mut out = [0u8; 6];
        out.copy_from_slice(&raw);
        Ok(HwAddr(out))
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hardware address: {0:?}")]
pub struct InvalidHwAddr(pub String);

/// Movement of a device relative to the scanner's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

/// WiFi device role as reported by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiDeviceType {
    AccessPoint,
    Device,
}

/// Which scanner a state event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scanner {
    Bluetooth,
    Wifi,
}

/// Scan-state event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScanEvent {
    StartedScanning,
    StoppedScanning,
    /// Antenna platform turned to the given angle (degrees).
    AntennaRotation(f64),
    /// WiFi scanner switched to the given frequency (MHz).
    Frequency(u32),
}

/// A relay message: common envelope fields plus the kind-specific body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// True if this copy was replayed from the spillover cache or is a resend.
    pub cached: bool,
    /// Hardware address of the scanning adapter; only set when the session negotiated it.
    pub sensor: Option<HwAddr>,
    pub body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            cached: false,
            sensor: None,
            body,
        }
    }

    pub fn kind(&self) -> Kind {
        self.body.kind()
    }
}

/// All message bodies. Encoding is bincode; framing is length-prefix (see wire module).
/// Timestamps are fractional seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Bluetooth device entered or left range.
    BluetoothIo {
        timestamp: f64,
        hwid: HwAddr,
        device_class: u32,
        direction: Direction,
    },
    /// Single Bluetooth inquiry result with signal strength.
    BluetoothRaw {
        timestamp: f64,
        hwid: HwAddr,
        device_class: u32,
        rssi: i16,
    },
    /// WiFi device entered or left range.
    WifiIo {
        timestamp: f64,
        hwid: HwAddr,
        device_type: WifiDeviceType,
        direction: Direction,
    },
    /// Single WiFi device detection with signal strength.
    WifiDevRaw {
        timestamp: f64,
        hwid: HwAddr,
        frequency: u32,
        ssi: i16,
    },
    /// Raw 802.11 frame record.
    WifiRaw {
        timestamp: f64,
        frequency: u32,
        frame_type: u8,
        subtype: u8,
        from: HwAddr,
        to: HwAddr,
        retry: bool,
        ssi: i16,
    },
    State {
        timestamp: f64,
        scanner: Scanner,
        event: ScanEvent,
    },
    Info {
        timestamp: f64,
        info: String,
    },
    HostnameRequest,
    Hostname {
        hostname: String,
        protocol_version: u8,
    },
    KeepaliveRequest {
        enable: bool,
        interval: u32,
    },
    /// Liveness ping, sent in both directions.
    Keepalive,
    CachingRequest {
        enable_caching: bool,
        push_cache: bool,
        clear_cache: bool,
    },
    StateRequest {
        bluetooth: bool,
        wifi: bool,
        antenna: bool,
        frequency: bool,
    },
    UptimeRequest {
        enable: bool,
    },
    /// Unix seconds; zero when unknown.
    Uptime {
        scanner_started: u64,
        system_booted: u64,
    },
    StartDataRequest {
        enable_data: bool,
        bluetooth_raw: bool,
        wifi_raw: bool,
        wifi_devraw: bool,
        sensor_mac: bool,
    },
    /// Confirms receipt of the message whose payload hashes to `checksum`.
    Ack {
        checksum: String,
    },
}

/// Message kind without payload. Used for feature gating and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    BluetoothIo,
    BluetoothRaw,
    WifiIo,
    WifiDevRaw,
    WifiRaw,
    State,
    Info,
    HostnameRequest,
    Hostname,
    KeepaliveRequest,
    Keepalive,
    CachingRequest,
    StateRequest,
    UptimeRequest,
    Uptime,
    StartDataRequest,
    Ack,
}

impl Kind {
    /// Telemetry kinds are tracked until the collector acknowledges them and may be cached.
    pub fn is_telemetry(self) -> bool {
        matches!(
            self,
            Kind::BluetoothIo
                | Kind::BluetoothRaw
                | Kind::WifiIo
                | Kind::WifiDevRaw
                | Kind::WifiRaw
                | Kind::State
                | Kind::Info
        )
    }
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::BluetoothIo { .. } => Kind::BluetoothIo,
            Body::BluetoothRaw { .. } => Kind::BluetoothRaw,
            Body::WifiIo { .. } => Kind::WifiIo,
            Body::WifiDevRaw { .. } => Kind::WifiDevRaw,
            Body::WifiRaw { .. } => Kind::WifiRaw,
            Body::State { .. } => Kind::State,
            Body::Info { .. } => Kind::Info,
            Body::HostnameRequest => Kind::HostnameRequest,
            Body::Hostname { .. } => Kind::Hostname,
            Body::KeepaliveRequest { .. } => Kind::KeepaliveRequest,
            Body::Keepalive => Kind::Keepalive,
            Body::CachingRequest { .. } => Kind::CachingRequest,
            Body::StateRequest { .. } => Kind::StateRequest,
            Body::UptimeRequest { .. } => Kind::UptimeRequest,
            Body::Uptime { .. } => Kind::Uptime,
            Body::StartDataRequest { .. } => Kind::StartDataRequest,
            Body::Ack { .. } => Kind::Ack,
        }
    }
}
