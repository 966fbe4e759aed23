//! Local line protocol: comma-separated records from the scanner, parsed into messages.

use crate::protocol::{Body, Direction, HwAddr, Kind, Message, ScanEvent, Scanner, WifiDeviceType};
use crate::session::Features;

/// Marks a line as a replay of a record the scanner had cached itself.
pub const CACHED_PREFIX: &str = "CACHED_";

/// Local announcement key carrying the scanner's start time.
pub const SCANNER_UPTIME_KEY: &str = "scanner_uptime";

/// Result of parsing one local line.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    /// A message to hand to the relay for delivery.
    Message(Message),
    /// Local metadata: the scanner started at this Unix time.
    ScannerStarted(u64),
}

/// Why a line was not turned into a message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LineError {
    #[error("empty line")]
    Empty,
    #[error("unknown kind {0:?}")]
    UnknownKind(String),
    #[error("{kind}: expected {expected} fields, got {got}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{kind}: invalid {field} {value:?}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("{0:?} not enabled for this session")]
    Disabled(Kind),
}

impl LineError {
    /// Lines dropped by negotiation are expected; everything else is malformed input.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, LineError::Disabled(_) | LineError::Empty)
    }
}

/// Parse one local line into a message, applying the session overlay to decide which
/// optional fields are populated and which kinds are dropped.
pub fn encode_line(line: &str, features: &Features) -> Result<Encoded, LineError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(LineError::Empty);
    }
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let (tag, cached) = match fields[0].strip_prefix(CACHED_PREFIX) {
        Some(t) => (t, true),
        None => (fields[0], false),
    };
    let args = &fields[1..];

    let (sensor, body) = match tag {
        "BLUETOOTH_IO" => {
            const K: &str = "BLUETOOTH_IO";
            expect_fields(K, args, 5)?;
            let body = Body::BluetoothIo {
                timestamp: parse_ts(K, args[1])?,
                hwid: parse_mac(K, "hwid", args[2])?,
                device_class: parse_num(K, "device_class", args[3])?,
                direction: parse_direction(K, args[4])?,
            };
            (Some(parse_mac(K, "sensor", args[0])?), body)
        }
        "BLUETOOTH_RAW" => {
            const K: &str = "BLUETOOTH_RAW";
            expect_fields(K, args, 5)?;
            let body = Body::BluetoothRaw {
                timestamp: parse_ts(K, args[1])?,
                hwid: parse_mac(K, "hwid", args[2])?,
                device_class: parse_num(K, "device_class", args[3])?,
                rssi: parse_num(K, "rssi", args[4])?,
            };
            (Some(parse_mac(K, "sensor", args[0])?), body)
        }
        "WIFI_IO" => {
            const K: &str = "WIFI_IO";
            expect_fields(K, args, 5)?;
            let device_type = match args[3].to_ascii_uppercase().as_str() {
                "ACP" => WifiDeviceType::AccessPoint,
                "DEV" => WifiDeviceType::Device,
                _ => return Err(invalid(K, "device_type", args[3])),
            };
            let body = Body::WifiIo {
                timestamp: parse_ts(K, args[1])?,
                hwid: parse_mac(K, "hwid", args[2])?,
                device_type,
                direction: parse_direction(K, args[4])?,
            };
            (Some(parse_mac(K, "sensor", args[0])?), body)
        }
        "WIFI_DEVRAW" => {
            const K: &str = "WIFI_DEVRAW";
            expect_fields(K, args, 5)?;
            let body = Body::WifiDevRaw {
                timestamp: parse_ts(K, args[1])?,
                hwid: parse_mac(K, "hwid", args[2])?,
                frequency: parse_num(K, "frequency", args[3])?,
                ssi: parse_num(K, "ssi", args[4])?,
            };
            (Some(parse_mac(K, "sensor", args[0])?), body)
        }
        "WIFI_RAW" => {
            const K: &str = "WIFI_RAW";
            expect_fields(K, args, 9)?;
            let retry = match args[7] {
                "0" => false,
                "1" => true,
                other => return Err(invalid(K, "retry", other)),
            };
            let body = Body::WifiRaw {
                timestamp: parse_ts(K, args[1])?,
                frequency: parse_num(K, "frequency", args[2])?,
                frame_type: parse_num(K, "frame_type", args[3])?,
                subtype: parse_num(K, "subtype", args[4])?,
                from: parse_mac(K, "from", args[5])?,
                to: parse_mac(K, "to", args[6])?,
                retry,
                ssi: parse_num(K, "ssi", args[8])?,
            };
            (Some(parse_mac(K, "sensor", args[0])?), body)
        }
        "STATE" => {
            const K: &str = "STATE";
            if args.len() != 4 && args.len() != 5 {
                return Err(LineError::FieldCount {
                    kind: K,
                    expected: 4,
                    got: args.len(),
                });
            }
            let scanner = match args[0] {
                "bluetooth" => Scanner::Bluetooth,
                "wifi" => Scanner::Wifi,
                other => return Err(invalid(K, "scanner", other)),
            };
            let value = args.get(4).copied();
            let event = match (args[3], value) {
                ("started_scanning", None) => ScanEvent::StartedScanning,
                ("stopped_scanning", None) => ScanEvent::StoppedScanning,
                ("antenna_rotation", Some(v)) => ScanEvent::AntennaRotation(parse_num(K, "angle", v)?),
                ("frequency", Some(v)) => ScanEvent::Frequency(parse_num(K, "frequency", v)?),
                (other, _) => return Err(invalid(K, "event", other)),
            };
            let body = Body::State {
                timestamp: parse_ts(K, args[2])?,
                scanner,
                event,
            };
            (Some(parse_mac(K, "sensor", args[1])?), body)
        }
        "INFO" => {
            const K: &str = "INFO";
            if args.len() < 2 {
                return Err(LineError::FieldCount {
                    kind: K,
                    expected: 2,
                    got: args.len(),
                });
            }
            // Free text keeps its commas; re-split the raw line rather than joining trimmed fields.
            let info = line.splitn(3, ',').nth(2).unwrap_or_default().trim();
            let body = Body::Info {
                timestamp: parse_ts(K, args[0])?,
                info: info.to_string(),
            };
            (None, body)
        }
        "LOCAL" => {
            const K: &str = "LOCAL";
            expect_fields(K, args, 2)?;
            if args[0] != SCANNER_UPTIME_KEY {
                return Err(invalid(K, "key", args[0]));
            }
            return Ok(Encoded::ScannerStarted(parse_num(K, "uptime", args[1])?));
        }
        other => return Err(LineError::UnknownKind(other.to_string())),
    };

    if !features.allows(&body) {
        return Err(LineError::Disabled(body.kind()));
    }
    Ok(Encoded::Message(Message {
        cached,
        sensor: if features.sensor_mac { sensor } else { None },
        body,
    }))
}

fn expect_fields(kind: &'static str, args: &[&str], expected: usize) -> Result<(), LineError> {
    if args.len() != expected {
        return Err(LineError::FieldCount {
            kind,
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn invalid(kind: &'static str, field: &'static str, value: &str) -> LineError {
    LineError::InvalidField {
        kind,
        field,
        value: value.to_string(),
    }
}

fn parse_ts(kind: &'static str, s: &str) -> Result<f64, LineError> {
    match s.parse::<f64>() {
        Ok(t) if t.is_finite() => Ok(t),
        _ => Err(invalid(kind, "timestamp", s)),
    }
}

fn parse_num<T: std::str::FromStr>(
    kind: &'static str,
    field: &'static str,
    s: &str,
) -> Result<T, LineError> {
    s.parse::<T>().map_err(|_| invalid(kind, field, s))
}

fn parse_mac(kind: &'static str, field: &'static str, s: &str) -> Result<HwAddr, LineError> {
    s.parse::<HwAddr>().map_err(|_| invalid(kind, field, s))
}

fn parse_direction(kind: &'static str, s: &str) -> Result<Direction, LineError> {
    match s {
        "in" => Ok(Direction::In),
        "out" => Ok(Direction::Out),
        other => Err(invalid(kind, "direction", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    fn all_enabled() -> Features {
        let mut f = Features::default();
        f.bluetooth_raw = true;
        f.wifi_raw = true;
        f.wifi_devraw = true;
        f.sensor_mac = true;
        f.uptime = true;
        f.state.bluetooth = true;
        f.state.wifi = true;
        f.state.antenna = true;
        f.state.frequency = true;
        f
    }

    fn message(line: &str, features: &Features) -> Message {
        match encode_line(line, features) {
            Ok(Encoded::Message(m)) => m,
            other => panic!("expected message for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn bluetooth_io() {
        let m = message(
            "BLUETOOTH_IO,00:11:22:33:44:55,1300000000.125,aa:bb:cc:dd:ee:ff,5898764,in",
            &all_enabled(),
        );
        assert!(!m.cached);
        assert_eq!(m.sensor, Some("001122334455".parse().unwrap()));
        assert_eq!(
            m.body,
            Body::BluetoothIo {
                timestamp: 1_300_000_000.125,
                hwid: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
                device_class: 5898764,
                direction: Direction::In,
            }
        );
    }

    #[test]
    fn sensor_omitted_unless_negotiated() {
        let m = message(
            "WIFI_IO,00:11:22:33:44:55,12.5,aa:bb:cc:dd:ee:ff,DEV,out",
            &Features::default(),
        );
        assert_eq!(m.sensor, None);
        assert!(matches!(
            m.body,
            Body::WifiIo {
                device_type: WifiDeviceType::Device,
                direction: Direction::Out,
                ..
            }
        ));
    }

    #[test]
    fn cached_prefix_sets_flag() {
        let m = message(
            "CACHED_BLUETOOTH_IO,00:11:22:33:44:55,1.0,aa:bb:cc:dd:ee:ff,0,out",
            &Features::default(),
        );
        assert!(m.cached);
    }

    #[test]
    fn raw_kinds_gated_by_session() {
        let line = "BLUETOOTH_RAW,00:11:22:33:44:55,1.0,aa:bb:cc:dd:ee:ff,0,-71";
        assert_eq!(
            encode_line(line, &Features::default()),
            Err(LineError::Disabled(Kind::BluetoothRaw))
        );
        let m = message(line, &all_enabled());
        assert!(matches!(m.body, Body::BluetoothRaw { rssi: -71, .. }));
    }

    #[test]
    fn wifi_raw_fields() {
        let m = message(
            "WIFI_RAW,00:11:22:33:44:55,2.5,2437,0,4,aa:bb:cc:dd:ee:ff,ff:ff:ff:ff:ff:ff,1,-60",
            &all_enabled(),
        );
        assert_eq!(
            m.body,
            Body::WifiRaw {
                timestamp: 2.5,
                frequency: 2437,
                frame_type: 0,
                subtype: 4,
                from: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
                to: "ff:ff:ff:ff:ff:ff".parse().unwrap(),
                retry: true,
                ssi: -60,
            }
        );
    }

    #[test]
    fn state_events() {
        let f = all_enabled();
        let m = message("STATE,bluetooth,001122334455,3.000,started_scanning", &f);
        assert!(matches!(
            m.body,
            Body::State {
                event: ScanEvent::StartedScanning,
                scanner: Scanner::Bluetooth,
                ..
            }
        ));
        let m = message("STATE,bluetooth,001122334455,3.000,antenna_rotation,22.50", &f);
        assert!(matches!(
            m.body,
            Body::State {
                event: ScanEvent::AntennaRotation(a),
                ..
            } if (a - 22.5).abs() < f64::EPSILON
        ));
        assert!(matches!(
            encode_line("STATE,bluetooth,001122334455,3.0,started_scanning", &Features::default()),
            Err(LineError::Disabled(Kind::State))
        ));
    }

    #[test]
    fn info_keeps_commas() {
        let m = message("INFO,5.5,adapter hci0 reset, retrying", &Features::default());
        assert_eq!(
            m.body,
            Body::Info {
                timestamp: 5.5,
                info: "adapter hci0 reset, retrying".into()
            }
        );
    }

    #[test]
    fn local_uptime() {
        assert_eq!(
            encode_line("LOCAL,scanner_uptime,1300000000", &Features::default()),
            Ok(Encoded::ScannerStarted(1_300_000_000))
        );
    }

    #[test]
    fn malformed_lines() {
        let f = all_enabled();
        assert_eq!(encode_line("   ", &f), Err(LineError::Empty));
        assert!(matches!(
            encode_line("BOGUS,1,2", &f),
            Err(LineError::UnknownKind(_))
        ));
        assert!(matches!(
            encode_line("BLUETOOTH_IO,00:11:22:33:44:55,1.0", &f),
            Err(LineError::FieldCount { got: 2, .. })
        ));
        assert!(matches!(
            encode_line("BLUETOOTH_IO,00:11:22:33:44:55,nan,aa:bb:cc:dd:ee:ff,0,in", &f),
            Err(LineError::InvalidField { field: "timestamp", .. })
        ));
        assert!(matches!(
            encode_line("BLUETOOTH_IO,00:11:22:33:44:55,1.0,aa:bb:cc:dd:ee:ff,0,sideways", &f),
            Err(LineError::InvalidField { field: "direction", .. })
        ));
        assert!(encode_line("BOGUS", &f).unwrap_err().is_malformed());
    }

    #[test]
    fn encoded_lines_roundtrip_through_wire() {
        let f = all_enabled();
        let lines = [
            "BLUETOOTH_IO,00:11:22:33:44:55,1300000000.125,aa:bb:cc:dd:ee:ff,5898764,in",
            "BLUETOOTH_RAW,00:11:22:33:44:55,1300000000.5,aa:bb:cc:dd:ee:ff,5898764,-80",
            "WIFI_IO,00:11:22:33:44:55,1300000001.0,aa:bb:cc:dd:ee:ff,ACP,in",
            "WIFI_DEVRAW,00:11:22:33:44:55,1300000002.0,aa:bb:cc:dd:ee:ff,5180,-55",
            "WIFI_RAW,00:11:22:33:44:55,1300000003.0,2412,2,8,aa:bb:cc:dd:ee:ff,00:00:00:00:00:01,0,-40",
            "STATE,wifi,001122334455,1300000004.0,frequency,2462",
            "CACHED_INFO,1300000005.0,scanner restarted",
        ];
        for line in lines {
            let m = message(line, &f);
            let payload = wire::serialize(&m).unwrap();
            assert_eq!(wire::deserialize(&payload).unwrap(), m, "{line}");
        }
    }
}
