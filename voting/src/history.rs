//! Local vote history: the votes this node has already produced.
//!
//! Every (root, hash) pair a vote covers gets its own entry pointing at the
//! shared vote, so a later request for the same block can be answered without
//! signing again. Entries are kept in insertion order and the oldest are
//! evicted once the cache exceeds its configured size.

use {
    crate::vote::{BlockHash, LedgerEvent, Root, Vote},
    log::trace,
    parking_lot::Mutex,
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    },
};

#[derive(Debug)]
struct Entry {
    root: Root,
    hash: BlockHash,
    vote: Arc<Vote>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    by_seq: BTreeMap<u64, Entry>,
    /// Sequence numbers per root, ascending.
    by_root: HashMap<Root, Vec<u64>>,
}

impl Inner {
    fn remove_seq(&mut self, seq: u64) -> Option<Entry> {
        let entry = self.by_seq.remove(&seq)?;
        if let Some(seqs) = self.by_root.get_mut(&entry.root) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.by_root.remove(&entry.root);
            }
        }
        Some(entry)
    }

    fn entries_for_root(&self, root: Root) -> impl Iterator<Item = &Entry> {
        self.by_root
            .get(&root)
            .into_iter()
            .flatten()
            .filter_map(move |seq| self.by_seq.get(seq))
    }
}

/// Bounded cache of the votes generated by this node.
#[derive(Debug)]
pub struct LocalVoteHistory {
    max_cache: usize,
    inner: Mutex<Inner>,
}

impl LocalVoteHistory {
    pub fn new(max_cache: usize) -> Self {
        Self {
            max_cache: max_cache.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record `vote` for (`root`, `hash`). An earlier entry for the same
    /// root, hash and voter is replaced if `vote` is at least as recent;
    /// otherwise `vote` is ignored. Oldest entries are evicted while the
    /// cache is over its size limit.
    pub fn add(&self, root: Root, hash: BlockHash, vote: Arc<Vote>) {
        let mut inner = self.inner.lock();

        let same_voter: Vec<(u64, u64)> = inner
            .by_root
            .get(&root)
            .into_iter()
            .flatten()
            .filter_map(|seq| {
                inner
                    .by_seq
                    .get(seq)
                    .filter(|entry| entry.hash == hash && entry.vote.voter == vote.voter)
                    .map(|entry| (*seq, entry.vote.timestamp))
            })
            .collect();
        if same_voter
            .iter()
            .any(|(_, timestamp)| *timestamp > vote.timestamp)
        {
            trace!("ignoring older vote for root {}", root);
            return;
        }
        for (seq, _) in same_voter {
            inner.remove_seq(seq);
        }

        let seq = inner.next_seq;
        inner.next_seq = seq.wrapping_add(1);
        inner.by_seq.insert(seq, Entry { root, hash, vote });
        inner.by_root.entry(root).or_default().push(seq);

        while inner.by_seq.len() > self.max_cache {
            let Some((&oldest, _)) = inner.by_seq.first_key_value() else {
                break;
            };
            if let Some(entry) = inner.remove_seq(oldest) {
                trace!("evicted cached vote for root {}", entry.root);
            }
        }
    }

    /// Remove every entry for `root`.
    pub fn erase(&self, root: &Root) {
        let mut inner = self.inner.lock();
        if let Some(seqs) = inner.by_root.remove(root) {
            for seq in seqs {
                inner.by_seq.remove(&seq);
            }
        }
    }

    /// Cached votes for exactly this (root, hash), oldest first.
    pub fn votes(&self, root: &Root, hash: &BlockHash) -> Vec<Arc<Vote>> {
        self.inner
            .lock()
            .entries_for_root(*root)
            .filter(|entry| entry.hash == *hash)
            .map(|entry| entry.vote.clone())
            .collect()
    }

    /// All cached votes for `root`, whatever the hash, oldest first.
    pub fn votes_for_root(&self, root: &Root) -> Vec<Arc<Vote>> {
        self.inner
            .lock()
            .entries_for_root(*root)
            .map(|entry| entry.vote.clone())
            .collect()
    }

    pub fn exists(&self, root: &Root) -> bool {
        self.inner.lock().by_root.contains_key(root)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_cache(&self) -> usize {
        self.max_cache
    }

    /// Drop votes made obsolete by a ledger event.
    pub fn apply(&self, event: LedgerEvent) {
        self.erase(&event.root());
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        solana_hash::Hash,
        solana_pubkey::Pubkey,
        solana_signature::Signature,
    };

    fn root(n: u8) -> Root {
        Root::new_from_array([n; 32])
    }

    fn hash(n: u8) -> BlockHash {
        Hash::new_from_array([n; 32])
    }

    fn vote(voter: u8, timestamp: u64, hashes: &[BlockHash]) -> Arc<Vote> {
        Arc::new(Vote {
            voter: Pubkey::new_from_array([voter; 32]),
            timestamp,
            hashes: hashes.to_vec(),
            signature: Signature::default(),
        })
    }

    #[test]
    fn test_add_and_lookup() {
        let history = LocalVoteHistory::new(16);
        assert!(history.is_empty());
        let v = vote(1, 1, &[hash(1)]);
        history.add(root(1), hash(1), v.clone());

        assert!(history.exists(&root(1)));
        assert!(!history.exists(&root(2)));
        assert_eq!(history.votes(&root(1), &hash(1)), vec![v]);
        assert!(history.votes(&root(1), &hash(2)).is_empty());
        assert_eq!(history.size(), 1);
    }

    #[test]
    fn test_same_voter_supersedes() {
        let history = LocalVoteHistory::new(16);
        history.add(root(1), hash(1), vote(1, 1, &[hash(1)]));
        let newer = vote(1, 2, &[hash(1)]);
        history.add(root(1), hash(1), newer.clone());

        assert_eq!(history.size(), 1);
        assert_eq!(history.votes(&root(1), &hash(1)), vec![newer]);
    }

    #[test]
    fn test_older_vote_does_not_replace_newer() {
        let history = LocalVoteHistory::new(16);
        let newer = vote(1, 5, &[hash(1)]);
        history.add(root(1), hash(1), newer.clone());
        history.add(root(1), hash(1), vote(1, 4, &[hash(1)]));

        assert_eq!(history.size(), 1);
        assert_eq!(history.votes(&root(1), &hash(1)), vec![newer]);

        // Equal timestamps replace.
        let equal = vote(1, 5, &[hash(1), hash(2)]);
        history.add(root(1), hash(1), equal.clone());
        assert_eq!(history.votes(&root(1), &hash(1)), vec![equal]);
    }

    #[test]
    fn test_distinct_voters_and_hashes_coexist() {
        let history = LocalVoteHistory::new(16);
        let a = vote(1, 1, &[hash(1)]);
        let b = vote(2, 1, &[hash(1)]);
        let fork = vote(1, 2, &[hash(2)]);
        history.add(root(1), hash(1), a.clone());
        history.add(root(1), hash(1), b.clone());
        history.add(root(1), hash(2), fork.clone());

        assert_eq!(history.votes(&root(1), &hash(1)), vec![a.clone(), b.clone()]);
        assert_eq!(history.votes_for_root(&root(1)), vec![a, b, fork]);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let history = LocalVoteHistory::new(4);
        for n in 0..10u8 {
            history.add(root(n), hash(n), vote(1, u64::from(n), &[hash(n)]));
        }
        assert_eq!(history.size(), 4);
        for n in 0..6u8 {
            assert!(!history.exists(&root(n)));
        }
        for n in 6..10u8 {
            assert_eq!(history.votes(&root(n), &hash(n)).len(), 1);
        }
    }

    #[test]
    fn test_erase_and_ledger_events() {
        let history = LocalVoteHistory::new(16);
        let shared = vote(1, 1, &[hash(1), hash(2)]);
        history.add(root(1), hash(1), shared.clone());
        history.add(root(2), hash(2), shared);
        history.add(root(3), hash(3), vote(1, 2, &[hash(3)]));

        history.erase(&root(1));
        assert!(!history.exists(&root(1)));
        assert_eq!(history.size(), 2);

        history.apply(LedgerEvent::Confirmed(root(2)));
        history.apply(LedgerEvent::RolledBack(root(3)));
        assert!(history.is_empty());

        // Erasing an unknown root is a no-op.
        history.erase(&root(9));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let history = LocalVoteHistory::new(0);
        history.add(root(1), hash(1), vote(1, 1, &[hash(1)]));
        assert_eq!(history.size(), 1);
        assert_eq!(history.max_cache(), 1);
    }
}
