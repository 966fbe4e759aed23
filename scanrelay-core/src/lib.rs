//! Scan telemetry relay core.
//! Host-driven: no network I/O; the daemon passes events and receives actions.

pub mod ack;
pub mod backoff;
pub mod cache;
pub mod codec;
pub mod core;
pub mod drain;
pub mod integrity;
pub mod protocol;
pub mod session;
pub mod wire;

pub use ack::{AckEntry, AckTracker, TickOutcome};
pub use cache::{CacheError, SpilloverCache, BYTES_PER_MB};
pub use codec::{encode_line, Encoded, LineError};
pub use core::{
    Action, ConnectError, ConnectionState, Event, ExitStatus, RelayConfig, RelayCore,
    SharedStore, Store,
};
pub use drain::{DrainStep, Drainer};
pub use protocol::{Body, HwAddr, Kind, Message, PROTOCOL_VERSION};
pub use session::{Features, Session};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, WireError};
