//! Vote types shared by the history, the generator and the wire format.

use {
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_time_utils::timestamp,
    std::{
        fmt,
        sync::atomic::{AtomicU64, Ordering},
    },
};

/// Hash of a block being voted for.
pub type BlockHash = Hash;

/// Identifier of the election a block belongs to. Competing forks of the
/// same position share a root.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Root(pub Hash);

impl Root {
    pub const fn new_from_array(bytes: [u8; 32]) -> Self {
        Self(Hash::new_from_array(bytes))
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Hash> for Root {
    fn from(hash: Hash) -> Self {
        Self(hash)
    }
}

/// A signed statement by `voter` that it accepts every block in `hashes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Identity of the signing representative.
    pub voter: Pubkey,
    /// Millisecond timestamp; later votes supersede earlier ones.
    pub timestamp: u64,
    /// Blocks covered by this vote.
    pub hashes: Vec<BlockHash>,
    pub signature: Signature,
}

/// A block that can be voted on.
pub trait VotableBlock {
    fn root(&self) -> Root;
    fn hash(&self) -> BlockHash;
}

impl VotableBlock for (Root, BlockHash) {
    fn root(&self) -> Root {
        self.0
    }

    fn hash(&self) -> BlockHash {
        self.1
    }
}

/// Ledger notifications that make cached votes for a root obsolete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEvent {
    /// The election for the root was confirmed.
    Confirmed(Root),
    /// The block at the root was rolled back.
    RolledBack(Root),
}

impl LedgerEvent {
    pub fn root(&self) -> Root {
        match self {
            Self::Confirmed(root) | Self::RolledBack(root) => *root,
        }
    }
}

/// Produces strictly increasing millisecond timestamps, following the wall
/// clock whenever it is ahead.
#[derive(Debug, Default)]
pub struct TimestampGenerator {
    last: AtomicU64,
}

impl TimestampGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        let wall = timestamp();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(current.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
