//! Wire messages carrying votes between nodes.
//!
//! Every frame is a bincode-encoded [`VoteMessage`] behind a length prefix:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode payload]
//! ```

use {
    crate::{
        error::{Result, VotingError},
        vote::Vote,
    },
    bytes::Bytes,
    serde::{Deserialize, Serialize},
};

/// Size of the length prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Top-level vote message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteMessage {
    /// A vote confirming one or more blocks, sent in reply to a request or
    /// broadcast to realtime peers.
    ConfirmAck(Vote),
}

impl VoteMessage {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(VotingError::Serialization)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(VotingError::Serialization)
    }

    /// Serialize with the length prefix, refusing payloads over `max_size`.
    pub fn encode_framed(&self, max_size: usize) -> Result<Bytes> {
        let payload = self.serialize()?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= max_size)
            .ok_or(VotingError::FrameTooLarge {
                size: payload.len(),
                max: max_size,
            })?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN.saturating_add(payload.len()));
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(Bytes::from(buf))
    }

    /// Payload length announced by a frame header.
    pub fn read_frame_len(header: &[u8; FRAME_HEADER_LEN]) -> usize {
        u32::from_le_bytes(*header) as usize
    }

    /// Decode one complete frame.
    pub fn decode_framed(frame: &[u8], max_size: usize) -> Result<Self> {
        let header: &[u8; FRAME_HEADER_LEN] = frame
            .get(..FRAME_HEADER_LEN)
            .and_then(|header| header.try_into().ok())
            .ok_or_else(truncated)?;
        let len = Self::read_frame_len(header);
        if len > max_size {
            return Err(VotingError::FrameTooLarge {
                size: len,
                max: max_size,
            });
        }
        let payload = frame
            .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN.saturating_add(len))
            .ok_or_else(truncated)?;
        Self::deserialize(payload)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfirmAck(_) => "confirm_ack",
        }
    }
}

fn truncated() -> VotingError {
    VotingError::Io(std::io::ErrorKind::UnexpectedEof.into())
}

impl From<Vote> for VoteMessage {
    fn from(vote: Vote) -> Self {
        Self::ConfirmAck(vote)
    }
}
