//! Channels: connections as seen by the message layer.

use {
    crate::{
        bandwidth_limiter::BandwidthLimiter,
        config::NetConfig,
        connection::{Connection, DropPolicy, WriteCallback},
        error::{DropReason, NetError},
    },
    bytes::Bytes,
    dashmap::DashMap,
    log::trace,
    std::{net::SocketAddr, sync::Arc},
};

/// A connection plus the outbound bandwidth limiter it shares with its
/// siblings.
pub struct Channel {
    connection: Arc<Connection>,
    limiter: Option<Arc<dyn BandwidthLimiter>>,
}

impl Channel {
    pub fn new(connection: Arc<Connection>, limiter: Option<Arc<dyn BandwidthLimiter>>) -> Self {
        Self {
            connection,
            limiter,
        }
    }

    /// Send `buffer`. Only [`DropPolicy::Limiter`] writes consult the
    /// bandwidth limiter; every write is then subject to the connection's
    /// queue rule. Returns `false` if the buffer was dropped.
    pub fn send(&self, buffer: Bytes, policy: DropPolicy, callback: Option<WriteCallback>) -> bool {
        if policy == DropPolicy::Limiter {
            if let Some(limiter) = &self.limiter {
                if !limiter.should_pass(buffer.len()) {
                    trace!(
                        "bandwidth limiter dropped {} bytes to {:?}",
                        buffer.len(),
                        self.connection.remote_endpoint()
                    );
                    if let Some(callback) = callback {
                        callback(Err(NetError::Dropped(DropReason::BandwidthLimited)));
                    }
                    return false;
                }
            }
        }
        self.connection.write(buffer, policy, callback)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.connection.remote_endpoint()
    }

    /// Registry key, once the connection is established.
    pub fn key(&self) -> Option<ChannelKey> {
        Some(ChannelKey {
            remote: self.connection.remote_endpoint()?,
            local: self.connection.local_endpoint()?,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.connection.is_closed()
    }
}

/// Identity of a channel: both ends of its TCP stream. Several channels to
/// the same peer differ in their local end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// Live channels keyed by [`ChannelKey`].
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelKey, Arc<Channel>>,
    limiter: Option<Arc<dyn BandwidthLimiter>>,
}

impl ChannelRegistry {
    /// Registry without a bandwidth limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose channels share the outbound limiter described by
    /// `config`.
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            channels: DashMap::new(),
            limiter: config
                .bandwidth_limiter()
                .map(|limiter| limiter as Arc<dyn BandwidthLimiter>),
        }
    }

    /// Wrap `connection` in a channel using the shared limiter and register
    /// it. Returns `None` if the connection is not established.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Channel>> {
        let channel = Arc::new(Channel::new(connection, self.limiter.clone()));
        let key = channel.key()?;
        self.channels.insert(key, channel.clone());
        Some(channel)
    }

    /// Register `channel`, replacing a previous channel with the same key.
    /// Channels that are not connected are ignored.
    pub fn insert(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        let key = channel.key()?;
        self.channels.insert(key, channel)
    }

    pub fn remove(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.remove(key).map(|(_, channel)| channel)
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.get(key).map(|entry| entry.value().clone())
    }

    /// All channels to `remote`.
    pub fn channels_to(&self, remote: &SocketAddr) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .filter(|entry| entry.key().remote == *remote)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop channels whose connection has been closed. Returns how many were
    /// removed.
    pub fn purge_closed(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, channel| channel.is_alive());
        before.saturating_sub(self.channels.len())
    }

    /// Open channels classified as realtime.
    pub fn realtime_channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .filter(|entry| entry.is_alive() && entry.connection().is_realtime())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Send `buffer` to every realtime channel that is not at capacity.
    /// Returns the number of channels that accepted it.
    pub fn broadcast(&self, buffer: &Bytes, policy: DropPolicy) -> usize {
        self.realtime_channels()
            .into_iter()
            .filter(|channel| !channel.connection().is_at_capacity())
            .filter(|channel| channel.send(buffer.clone(), policy, None))
            .count()
    }
}
