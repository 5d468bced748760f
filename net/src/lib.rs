//! TRv1 Node Transport
//!
//! TCP plumbing shared by the node's realtime and bootstrap traffic:
//!
//! - **Connections** with an ordered, bounded write queue, serialized reads,
//!   and idle / silent-peer detection.
//! - **Inbound admission** limiting live connections in total, per source
//!   address and per source subnet.
//! - **Channels** pairing a connection with the shared outbound bandwidth
//!   limiter, and a registry used to broadcast to realtime peers.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────┐
//!  │  Vote generator / message handlers          │
//!  └──────────────┬──────────────────────────────┘
//!                 │  Bytes + DropPolicy
//!  ┌──────────────▼──────────────────────────────┐
//!  │  ChannelRegistry ─ Channel ─ BandwidthLimiter│
//!  └──────────────┬──────────────────────────────┘
//!                 │
//!  ┌──────────────▼──────────────────────────────┐
//!  │  Connection (writer task, checkup timer)    │
//!  └──────────────▲──────────────────────────────┘
//!                 │  admitted streams
//!  ┌──────────────┴──────────────────────────────┐
//!  │  Listener (accept loop, per-IP / subnet map)│
//!  └─────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]            | `NetConfig` / `ConnectionConfig` defaults and dev overrides |
//! | [`connection`]        | Connection lifecycle, write queue, timeouts |
//! | [`listener`]          | Accept loop and admission control |
//! | [`subnet`]            | Address and subnet accounting |
//! | [`channel`]           | Channels and the channel registry |
//! | [`bandwidth_limiter`] | Token bucket outbound limiter |
//! | [`error`]             | Crate-wide error enum |

pub mod bandwidth_limiter;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod subnet;

pub use {
    channel::{Channel, ChannelKey, ChannelRegistry},
    config::{ConnectionConfig, NetConfig},
    connection::{Connection, ConnectionType, DropPolicy, WriteCallback},
    error::{NetError, Result},
    listener::Listener,
};
