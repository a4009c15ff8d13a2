use std::ops::{Deref, Range, RangeFrom};

use sparkle_crypto::OverlayMac;
use thiserror::Error;

// Ranges of the decrypted data-packet body.
const DEST_RANGE: Range<usize> = 0..6;
const FRAME_RANGE: RangeFrom<usize> = 6..;

/// A decrypted overlay data packet: the destination overlay address
/// followed by the opaque application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket<B>
where
    B: Deref<Target = [u8]>,
{
    buffer: B,
}

impl<B> DataPacket<B>
where
    B: Deref<Target = [u8]>,
{
    /// Parse a decrypted payload as a data packet.
    pub fn from_buffer(buffer: B) -> Result<Self, DataPacketError> {
        if buffer.len() < FRAME_RANGE.start {
            return Err(DataPacketError::TooShort);
        }

        Ok(Self { buffer })
    }

    /// The destination overlay address.
    pub fn dest(&self) -> OverlayMac {
        OverlayMac::from_octets(self.buffer[DEST_RANGE].try_into().unwrap())
    }

    /// The application frame.
    pub fn frame(&self) -> &[u8] {
        &self.buffer[FRAME_RANGE]
    }

    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

/// Assemble a data-packet body for the given destination.
pub fn assemble(dest: OverlayMac, frame: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(FRAME_RANGE.start + frame.len());
    buffer.extend_from_slice(dest.as_bytes());
    buffer.extend_from_slice(frame);
    buffer
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataPacketError {
    #[error("data packet shorter than its destination address")]
    TooShort,
}
