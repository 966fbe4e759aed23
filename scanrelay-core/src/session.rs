//! Session: one live connection to the collector and the features it negotiated.

use std::time::{Duration, Instant};

use crate::protocol::{Body, ScanEvent, Scanner};

/// Keepalive grace: the collector's ping must arrive within interval + interval / 10.
const KEEPALIVE_GRACE_DIVISOR: u32 = 10;

/// Which scan-state events the collector subscribed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSubscription {
    pub bluetooth: bool,
    pub wifi: bool,
    pub antenna: bool,
    pub frequency: bool,
}

impl StateSubscription {
    pub fn allows(&self, scanner: Scanner, event: &ScanEvent) -> bool {
        match event {
            ScanEvent::StartedScanning | ScanEvent::StoppedScanning => match scanner {
                Scanner::Bluetooth => self.bluetooth,
                Scanner::Wifi => self.wifi,
            },
            ScanEvent::AntennaRotation(_) => self.antenna,
            ScanEvent::Frequency(_) => self.frequency,
        }
    }
}

/// Negotiated feature overlay. Reset to defaults whenever a session starts or ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    /// Forward base telemetry (IO events and info).
    pub data: bool,
    pub bluetooth_raw: bool,
    pub wifi_raw: bool,
    pub wifi_devraw: bool,
    /// Include the sensor hardware address in telemetry.
    pub sensor_mac: bool,
    /// Keepalive interval, if enabled.
    pub keepalive: Option<Duration>,
    pub state: StateSubscription,
    pub uptime: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            data: true,
            bluetooth_raw: false,
            wifi_raw: false,
            wifi_devraw: false,
            sensor_mac: false,
            keepalive: None,
            state: StateSubscription::default(),
            uptime: false,
        }
    }
}

impl Features {
    /// Whether a message with this body may be forwarded in the current session.
    /// Control messages always pass.
    pub fn allows(&self, body: &Body) -> bool {
        match body {
            Body::BluetoothIo { .. } | Body::WifiIo { .. } | Body::Info { .. } => self.data,
            Body::BluetoothRaw { .. } => self.bluetooth_raw,
            Body::WifiRaw { .. } => self.wifi_raw,
            Body::WifiDevRaw { .. } => self.wifi_devraw,
            Body::State { scanner, event, .. } => self.state.allows(*scanner, event),
            Body::Uptime { .. } => self.uptime,
            _ => true,
        }
    }
}

/// One outbound connection instance.
#[derive(Debug)]
pub struct Session {
    pub features: Features,
    last_keepalive: Instant,
}

impl Session {
    pub fn new(now: Instant) -> Self {
        Self {
            features: Features::default(),
            last_keepalive: now,
        }
    }

    /// Enable or disable keepalive. Enabling restarts the supervision window at `now`.
    pub fn set_keepalive(&mut self, interval: Option<Duration>, now: Instant) {
        self.features.keepalive = interval;
        self.last_keepalive = now;
    }

    pub fn on_keepalive_received(&mut self, now: Instant) {
        self.last_keepalive = now;
    }

    /// True when keepalive is enabled and the collector has been silent past interval + 10%.
    pub fn keepalive_expired(&self, now: Instant) -> bool {
        match self.features.keepalive {
            Some(interval) => {
                let limit = interval + interval / KEEPALIVE_GRACE_DIVISOR;
                now.saturating_duration_since(self.last_keepalive) >= limit
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, HwAddr};

    #[test]
    fn defaults_allow_base_telemetry_only() {
        let f = Features::default();
        let io = Body::BluetoothIo {
            timestamp: 1.0,
            hwid: HwAddr([1; 6]),
            device_class: 0,
            direction: Direction::Out,
        };
        let raw = Body::BluetoothRaw {
            timestamp: 1.0,
            hwid: HwAddr([1; 6]),
            device_class: 0,
            rssi: -70,
        };
        let state = Body::State {
            timestamp: 1.0,
            scanner: Scanner::Bluetooth,
            event: ScanEvent::StartedScanning,
        };
        assert!(f.allows(&io));
        assert!(!f.allows(&raw));
        assert!(!f.allows(&state));
        assert!(f.allows(&Body::Keepalive));
    }

    #[test]
    fn state_subscription_per_event() {
        let sub = StateSubscription {
            bluetooth: false,
            wifi: true,
            antenna: true,
            frequency: false,
        };
        assert!(!sub.allows(Scanner::Bluetooth, &ScanEvent::StoppedScanning));
        assert!(sub.allows(Scanner::Wifi, &ScanEvent::StartedScanning));
        assert!(sub.allows(Scanner::Bluetooth, &ScanEvent::AntennaRotation(90.0)));
        assert!(!sub.allows(Scanner::Wifi, &ScanEvent::Frequency(2412)));
    }

    #[test]
    fn keepalive_window() {
        let t0 = Instant::now();
        let mut s = Session::new(t0);
        assert!(!s.keepalive_expired(t0 + Duration::from_secs(3600)));
        s.set_keepalive(Some(Duration::from_secs(10)), t0);
        assert!(!s.keepalive_expired(t0 + Duration::from_millis(10_999)));
        assert!(s.keepalive_expired(t0 + Duration::from_secs(11)));
        s.on_keepalive_received(t0 + Duration::from_secs(11));
        assert!(!s.keepalive_expired(t0 + Duration::from_secs(12)));
    }
}
