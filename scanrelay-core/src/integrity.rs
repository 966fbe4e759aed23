//! Integrity: content checksum used to correlate sent messages with collector acknowledgments.
//! Not a security boundary.

use sha2::{Digest, Sha256};

use crate::protocol::Message;
use crate::wire::{self, WireError};

/// Hash serialized payload bytes. Returns lowercase hex SHA-256.
pub fn checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Serialize `msg` and return the payload together with its checksum.
pub fn serialize_with_checksum(msg: &Message) -> Result<(Vec<u8>, String), WireError> {
    let payload = wire::serialize(msg)?;
    let sum = checksum(&payload);
    Ok((payload, sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;

    #[test]
    fn checksum_stable() {
        let payload = b"hello relay";
        assert_eq!(checksum(payload), checksum(payload));
        assert_eq!(checksum(payload).len(), 64);
    }

    #[test]
    fn checksum_differs_on_content() {
        assert_ne!(checksum(b"a"), checksum(b"b"));
    }

    #[test]
    fn cached_flag_changes_checksum() {
        let mut msg = Message::new(Body::Info {
            timestamp: 10.0,
            info: "x".into(),
        });
        let (_, fresh) = serialize_with_checksum(&msg).unwrap();
        msg.cached = true;
        let (_, replayed) = serialize_with_checksum(&msg).unwrap();
        assert_ne!(fresh, replayed);
    }
}
