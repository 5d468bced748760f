//! Signing seam between the generator and the node's wallet.

use {
    crate::vote::{BlockHash, Vote},
    thiserror::Error,
};

/// Why a batch could not be signed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("no voting key available")]
    NoKey,
    #[error("signer rejected the batch: {0}")]
    Rejected(String),
}

/// Signs one vote covering every hash of a batch.
pub trait VoteSigner: Send + Sync {
    fn sign(&self, timestamp: u64, hashes: &[BlockHash]) -> Result<Vote, SigningError>;
}

impl<T: VoteSigner + ?Sized> VoteSigner for std::sync::Arc<T> {
    fn sign(&self, timestamp: u64, hashes: &[BlockHash]) -> Result<Vote, SigningError> {
        (**self).sign(timestamp, hashes)
    }
}
