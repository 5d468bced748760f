//! Glue between generated votes and the node transport.

use {
    crate::{message::VoteMessage, vote::Vote},
    log::{trace, warn},
    std::sync::Arc,
    trv1_node_net::{Channel, ChannelRegistry, DropPolicy},
};

/// Delivers a vote to the node's realtime peers.
pub trait VoteBroadcaster: Send + Sync {
    fn broadcast(&self, vote: &Arc<Vote>);
}

impl<T: VoteBroadcaster + ?Sized> VoteBroadcaster for Arc<T> {
    fn broadcast(&self, vote: &Arc<Vote>) {
        (**self).broadcast(vote)
    }
}

/// Broadcasts framed votes to every realtime channel of a registry.
pub struct ChannelBroadcaster {
    registry: Arc<ChannelRegistry>,
    max_frame_size: usize,
}

impl ChannelBroadcaster {
    pub fn new(registry: Arc<ChannelRegistry>, max_frame_size: usize) -> Self {
        Self {
            registry,
            max_frame_size,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Frame `vote` and send it with the `Limiter` policy. Returns the number
    /// of channels that took it.
    pub fn send(&self, vote: &Vote) -> usize {
        match VoteMessage::ConfirmAck(vote.clone()).encode_framed(self.max_frame_size) {
            Ok(frame) => {
                let sent = self.registry.broadcast(&frame, DropPolicy::Limiter);
                trace!(
                    "broadcast vote covering {} hashes to {} peers",
                    vote.hashes.len(),
                    sent
                );
                sent
            }
            Err(err) => {
                warn!("failed to encode vote for broadcast: {}", err);
                0
            }
        }
    }
}

impl VoteBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, vote: &Arc<Vote>) {
        self.send(vote);
    }
}

/// Frame `vote` and send it on `channel`. Returns `false` if the vote could
/// not be encoded or the channel dropped it.
pub fn send_vote(channel: &Channel, vote: &Vote, max_frame_size: usize, policy: DropPolicy) -> bool {
    match VoteMessage::ConfirmAck(vote.clone()).encode_framed(max_frame_size) {
        Ok(frame) => channel.send(frame, policy, None),
        Err(err) => {
            warn!(
                "failed to encode vote for {:?}: {}",
                channel.remote_endpoint(),
                err
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        solana_hash::Hash,
        solana_pubkey::Pubkey,
        solana_signature::Signature,
        tokio::net::TcpListener,
        trv1_node_net::{Connection, ConnectionConfig, ConnectionType},
    };

    fn vote(hashes: u8) -> Vote {
        Vote {
            voter: Pubkey::new_from_array([4; 32]),
            timestamp: 1,
            hashes: (0..hashes).map(|n| Hash::new_from_array([n; 32])).collect(),
            signature: Signature::default(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_respects_frame_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connection = Connection::new(&ConnectionConfig::default());
        let (connected, accepted) = tokio::join!(
            connection.connect(listener.local_addr().unwrap()),
            listener.accept()
        );
        connected.unwrap();
        let _peer = accepted.unwrap();
        connection.set_connection_type(ConnectionType::Realtime);
        let registry = Arc::new(ChannelRegistry::new());
        registry.register(connection).unwrap();

        let small = ChannelBroadcaster::new(registry.clone(), 256);
        assert_eq!(small.send(&vote(1)), 1);
        assert_eq!(small.send(&vote(12)), 0);

        let large = ChannelBroadcaster::new(registry, 65_536);
        assert_eq!(large.send(&vote(12)), 1);
    }
}
