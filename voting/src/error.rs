//! Error types for vote generation.

use {
    crate::{config::ConfigError, signer::SigningError},
    thiserror::Error,
};

/// Which generator queue refused an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Candidates,
    Requests,
}

/// Errors that can occur while generating or dispatching votes.
#[derive(Error, Debug)]
pub enum VotingError {
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    /// The queue was full; the item was dropped.
    #[error("{queue:?} queue full ({capacity} entries)")]
    QueueOverflow { queue: QueueKind, capacity: usize },

    #[error("vote generator stopped")]
    Stopped,

    #[error("reply action already set")]
    ReplyActionAlreadySet,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience result type for voting operations.
pub type Result<T> = std::result::Result<T, VotingError>;
