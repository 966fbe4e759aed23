//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! The same payload encoding is used on the wire and in the spillover cache, so
//! `deserialize` must treat its input as untrusted.

use bincode::Options;

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(u64::from(MAX_FRAME_LEN))
        .reject_trailing_bytes()
}

/// Serialize a message into its payload bytes. Deterministic for a given message.
pub fn serialize(msg: &Message) -> Result<Vec<u8>, WireError> {
    let payload = options().serialize(msg).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(WireError::TooLarge);
    }
    Ok(payload)
}

/// Parse payload bytes back into a message. Fails on truncated or corrupted input.
pub fn deserialize(payload: &[u8]) -> Result<Message, WireError> {
    options().deserialize(payload).map_err(WireError::Decode)
}

/// Error serializing or parsing a payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("payload too large")]
    TooLarge,
}

/// Wrap an already serialized payload in a frame.
pub fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let payload = serialize(msg)?;
    Ok(frame_payload(&payload))
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with a partial buffer; returns `NeedMore` until the frame is complete.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Read and validate the length prefix of the frame at the front of `bytes`.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("{0}")]
    Decode(WireError),
}
