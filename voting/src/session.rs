//! Collects candidates locally and hands them to the generator in one go.

use {
    crate::{
        generator::VoteGenerator,
        vote::{BlockHash, Root},
    },
    std::mem,
};

/// Single-threaded buffer in front of a [`VoteGenerator`]. Useful when many
/// blocks are confirmed at once: the generator's queue lock is taken only on
/// [`flush`](Self::flush).
pub struct VoteGeneratorSession<'a> {
    generator: &'a VoteGenerator,
    items: Vec<(Root, BlockHash)>,
}

impl<'a> VoteGeneratorSession<'a> {
    pub fn new(generator: &'a VoteGenerator) -> Self {
        Self {
            generator,
            items: Vec::new(),
        }
    }

    pub fn add(&mut self, root: Root, hash: BlockHash) {
        self.items.push((root, hash));
    }

    /// Queue everything collected so far. Returns how many candidates the
    /// generator queued.
    pub fn flush(&mut self) -> usize {
        if self.items.is_empty() {
            return 0;
        }
        self.generator.add_batch(mem::take(&mut self.items))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::VotingConfig,
            network::VoteBroadcaster,
            processor::NoopVoteProcessor,
            signer::{SigningError, VoteSigner},
            vote::Vote,
        },
        solana_hash::Hash,
        std::sync::Arc,
    };

    struct NoSigner;

    impl VoteSigner for NoSigner {
        fn sign(&self, _timestamp: u64, _hashes: &[BlockHash]) -> Result<Vote, SigningError> {
            Err(SigningError::NoKey)
        }
    }

    struct NoBroadcast;

    impl VoteBroadcaster for NoBroadcast {
        fn broadcast(&self, _vote: &Arc<Vote>) {}
    }

    fn idle_generator(config: VotingConfig) -> VoteGenerator {
        VoteGenerator::new(
            config,
            Arc::new(NoSigner),
            Arc::new(NoBroadcast),
            Arc::new(NoopVoteProcessor),
        )
        .unwrap()
    }

    #[test]
    fn test_flush_queues_both_items() {
        let config = VotingConfig {
            batch_delay_ms: 10_000,
            ..VotingConfig::dev_default()
        };
        let generator = idle_generator(config);
        let mut session = VoteGeneratorSession::new(&generator);
        session.add(Root::new_from_array([1; 32]), Hash::new_from_array([1; 32]));
        session.add(Root::new_from_array([2; 32]), Hash::new_from_array([2; 32]));
        assert_eq!(session.len(), 2);
        assert_eq!(generator.candidates_len(), 0);

        assert_eq!(session.flush(), 2);
        assert!(session.is_empty());
        assert_eq!(generator.candidates_len(), 2);
        assert_eq!(session.flush(), 0);
    }

    #[test]
    fn test_concurrent_flushes_queue_every_item() {
        const THREADS: u8 = 4;
        const ITEMS: u8 = 10;
        // Batches never fill, so everything stays queued.
        let config = VotingConfig {
            batch_size: 64,
            batch_threshold: 3,
            batch_delay_ms: 10_000,
            ..VotingConfig::dev_default()
        };
        let generator = idle_generator(config);
        let queued: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|thread| {
                    let generator = &generator;
                    scope.spawn(move || {
                        let mut session = VoteGeneratorSession::new(generator);
                        for item in 0..ITEMS {
                            let id = thread.saturating_mul(ITEMS).saturating_add(item);
                            session.add(
                                Root::new_from_array([id; 32]),
                                Hash::new_from_array([id; 32]),
                            );
                        }
                        session.flush()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .sum()
        });
        assert_eq!(queued, 40);
        assert_eq!(generator.candidates_len(), 40);
        assert_eq!(generator.stats().candidates_queued, 40);
    }
}
