//! Framing: length-prefix (4 bytes LE) + codec payload. Default codec is bincode.

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Serializer for one envelope payload. Framing is handled separately, so a
/// codec only has to round-trip the envelope losslessly.
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError>;
    fn decode(&self, payload: &[u8]) -> Result<Envelope, FrameDecodeError>;
}

/// bincode payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl EnvelopeCodec for BincodeCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
        Ok(bincode::serialize(envelope)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Envelope, FrameDecodeError> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Encode an envelope into a single frame: 4 bytes LE length + codec payload.
pub fn encode_frame(
    codec: &dyn EnvelopeCodec,
    envelope: &Envelope,
) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = codec.encode(envelope)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding an envelope into a frame (codec or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Payload length announced by a frame header. Rejects oversized frames before
/// the caller allocates for them.
pub fn payload_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Error decoding a frame (too large, or codec failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
