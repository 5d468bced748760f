//! TRv1 Node Voting
//!
//! Produces this node's votes for blocks it has accepted and delivers them to
//! peers, either broadcast to every realtime channel or as a reply to a peer
//! that asked for them.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`vote`]      | `Vote`, `Root`, ledger events, timestamp generator |
//! | [`signer`]    | Signing seam to the node wallet |
//! | [`history`]   | Local vote history cache |
//! | [`generator`] | Batching vote generator and its worker thread |
//! | [`session`]   | Unsynchronized candidate buffer in front of the generator |
//! | [`message`]   | Vote wire message and framing |
//! | [`network`]   | Broadcast and reply over the node transport |
//! | [`processor`] | Sink for this node's own votes |
//! | [`config`]    | `VotingConfig` defaults and dev overrides |
//! | [`error`]     | Crate-wide error enum |

pub mod config;
pub mod error;
pub mod generator;
pub mod history;
pub mod message;
pub mod network;
pub mod processor;
pub mod session;
pub mod signer;
pub mod vote;

pub use {
    config::VotingConfig,
    error::{Result, VotingError},
    generator::{VoteGenerator, VoteGeneratorStatsSnapshot},
    history::LocalVoteHistory,
    network::{ChannelBroadcaster, VoteBroadcaster},
    processor::{NoopVoteProcessor, VoteProcessor},
    session::VoteGeneratorSession,
    signer::{SigningError, VoteSigner},
    vote::{BlockHash, LedgerEvent, Root, VotableBlock, Vote},
};
