//! Vote generator.
//!
//! Blocks the node wants to vote for arrive either as broadcast candidates
//! ([`VoteGenerator::add`]) or as requests from a peer that expects a reply
//! on its channel ([`VoteGenerator::generate`]). A dedicated worker thread
//! batches them: up to `batch_size` hashes are covered by a single signature,
//! and a pair that was voted for before is answered from the local vote
//! history instead of being signed again.
//!
//! ## Worker loop
//!
//! 1. A full batch of candidates is broadcast right away.
//! 2. Otherwise a pending request is served.
//! 3. Otherwise the worker waits up to `batch_delay` for a full batch or a
//!    request. If at least `batch_threshold` candidates are queued by then it
//!    waits one more delay, and finally votes for whatever is queued.

use {
    crate::{
        config::VotingConfig,
        error::{QueueKind, Result, VotingError},
        history::LocalVoteHistory,
        network::{send_vote, VoteBroadcaster},
        processor::VoteProcessor,
        signer::VoteSigner,
        vote::{BlockHash, Root, TimestampGenerator, VotableBlock, Vote},
    },
    log::{debug, info, trace, warn},
    parking_lot::{Condvar, Mutex, MutexGuard},
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, OnceLock,
        },
        thread::{self, Builder, JoinHandle},
    },
    trv1_node_net::{Channel, DropPolicy},
};

/// Sends a vote produced for a request back to the requesting peer.
pub type ReplyAction = Box<dyn Fn(&Arc<Vote>, &Arc<Channel>) + Send + Sync>;

// ── Statistics ──────────────────────────────────────────────────────────────

/// Counters updated by the generator.
#[derive(Debug, Default)]
pub struct VoteGeneratorStats {
    candidates_queued: AtomicU64,
    candidates_dropped: AtomicU64,
    requests_queued: AtomicU64,
    requests_dropped: AtomicU64,
    cache_hits: AtomicU64,
    votes_generated: AtomicU64,
    signing_failures: AtomicU64,
    broadcasts: AtomicU64,
    replies: AtomicU64,
}

/// Point-in-time copy of [`VoteGeneratorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteGeneratorStatsSnapshot {
    pub candidates_queued: u64,
    pub candidates_dropped: u64,
    pub requests_queued: u64,
    pub requests_dropped: u64,
    pub cache_hits: u64,
    pub votes_generated: u64,
    pub signing_failures: u64,
    pub broadcasts: u64,
    pub replies: u64,
}

impl VoteGeneratorStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(u64::try_from(value).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VoteGeneratorStatsSnapshot {
        VoteGeneratorStatsSnapshot {
            candidates_queued: self.candidates_queued.load(Ordering::Relaxed),
            candidates_dropped: self.candidates_dropped.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            votes_generated: self.votes_generated.load(Ordering::Relaxed),
            signing_failures: self.signing_failures.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
        }
    }
}

// ── Queues ──────────────────────────────────────────────────────────────────

struct Request {
    candidates: Vec<(Root, BlockHash)>,
    channel: Arc<Channel>,
}

#[derive(Default)]
struct Queues {
    candidates: VecDeque<(Root, BlockHash)>,
    requests: VecDeque<Request>,
}

/// One batch worth of work taken off a queue.
#[derive(Default)]
struct Batch {
    roots: Vec<Root>,
    hashes: Vec<BlockHash>,
    /// Previously generated votes covering candidates of this batch, each
    /// listed once.
    cached: Vec<Arc<Vote>>,
}

impl Batch {
    fn with_capacity(batch_size: usize) -> Self {
        Self {
            roots: Vec::with_capacity(batch_size),
            hashes: Vec::with_capacity(batch_size),
            cached: Vec::new(),
        }
    }

    /// Take `root`/`hash` into the batch. A second candidate for a root that
    /// is already being signed is ignored. Cached votes already in `sent`
    /// are skipped; newly taken ones are added to it.
    fn push(
        &mut self,
        history: &LocalVoteHistory,
        sent: &mut Vec<Arc<Vote>>,
        root: Root,
        hash: BlockHash,
    ) {
        if self.roots.contains(&root) {
            return;
        }
        let cached = history.votes(&root, &hash);
        if cached.is_empty() {
            self.roots.push(root);
            self.hashes.push(hash);
            return;
        }
        for vote in cached {
            if !sent.iter().any(|seen| Arc::ptr_eq(seen, &vote)) {
                sent.push(vote.clone());
                self.cached.push(vote);
            }
        }
    }
}

// ── Generator ───────────────────────────────────────────────────────────────

struct Inner {
    config: VotingConfig,
    signer: Arc<dyn VoteSigner>,
    broadcaster: Arc<dyn VoteBroadcaster>,
    processor: Arc<dyn VoteProcessor>,
    history: LocalVoteHistory,
    reply_action: OnceLock<ReplyAction>,
    queues: Mutex<Queues>,
    condvar: Condvar,
    stopped: AtomicBool,
    timestamps: TimestampGenerator,
    stats: VoteGeneratorStats,
}

/// Batches, signs and dispatches this node's votes.
pub struct VoteGenerator {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VoteGenerator {
    /// Create the generator and start its worker thread. Every vote it signs
    /// is also handed to `processor`.
    pub fn new(
        config: VotingConfig,
        signer: Arc<dyn VoteSigner>,
        broadcaster: Arc<dyn VoteBroadcaster>,
        processor: Arc<dyn VoteProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            history: LocalVoteHistory::new(config.max_cache),
            config,
            signer,
            broadcaster,
            processor,
            reply_action: OnceLock::new(),
            queues: Mutex::new(Queues::default()),
            condvar: Condvar::new(),
            stopped: AtomicBool::new(false),
            timestamps: TimestampGenerator::new(),
            stats: VoteGeneratorStats::default(),
        });
        let thread = {
            let inner = inner.clone();
            Builder::new()
                .name("trv1VoteGen".to_string())
                .spawn(move || inner.run())?
        };
        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a block for a broadcast vote.
    ///
    /// If this node already voted for the exact (root, hash) pair, the cached
    /// votes are broadcast immediately and nothing is signed.
    pub fn add(&self, root: Root, hash: BlockHash) -> Result<()> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(VotingError::Stopped);
        }
        if inner.broadcast_cached(&root, &hash) {
            return Ok(());
        }
        let mut queues = inner.queues.lock();
        let capacity = inner.config.max_candidates;
        if queues.candidates.len() >= capacity {
            VoteGeneratorStats::inc(&inner.stats.candidates_dropped);
            return Err(VotingError::QueueOverflow {
                queue: QueueKind::Candidates,
                capacity,
            });
        }
        queues.candidates.push_back((root, hash));
        VoteGeneratorStats::inc(&inner.stats.candidates_queued);
        if queues.candidates.len() >= inner.config.batch_size {
            inner.condvar.notify_all();
        }
        Ok(())
    }

    /// Queue many candidates under a single lock acquisition. Cached pairs
    /// are broadcast from the history. Returns the number of candidates
    /// queued; the rest were answered from cache or dropped because the
    /// queue was full.
    pub fn add_batch(&self, items: Vec<(Root, BlockHash)>) -> usize {
        let inner = &self.inner;
        if inner.is_stopped() {
            return 0;
        }
        let pending: Vec<_> = items
            .into_iter()
            .filter(|(root, hash)| !inner.broadcast_cached(root, hash))
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let mut queues = inner.queues.lock();
        let room = inner
            .config
            .max_candidates
            .saturating_sub(queues.candidates.len());
        let queued = pending.len().min(room);
        let dropped = pending.len().saturating_sub(queued);
        queues.candidates.extend(pending.into_iter().take(queued));
        VoteGeneratorStats::add(&inner.stats.candidates_queued, queued);
        if dropped > 0 {
            VoteGeneratorStats::add(&inner.stats.candidates_dropped, dropped);
            debug!("vote candidate queue full, dropped {} candidates", dropped);
        }
        if queues.candidates.len() >= inner.config.batch_size {
            inner.condvar.notify_all();
        }
        queued
    }

    /// Queue a request to vote for `blocks` and reply on `channel`.
    ///
    /// Returns the number of blocks accepted, or `0` if the generator is
    /// stopped or the request queue is full.
    pub fn generate<B: VotableBlock>(&self, blocks: &[B], channel: Arc<Channel>) -> usize {
        match self.try_generate(blocks, channel) {
            Ok(count) => count,
            Err(err) => {
                debug!("vote request dropped: {}", err);
                0
            }
        }
    }

    /// Like [`generate`](Self::generate), but reports why a request was
    /// dropped.
    pub fn try_generate<B: VotableBlock>(
        &self,
        blocks: &[B],
        channel: Arc<Channel>,
    ) -> Result<usize> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(VotingError::Stopped);
        }
        let candidates: Vec<_> = blocks
            .iter()
            .map(|block| (block.root(), block.hash()))
            .collect();
        let count = candidates.len();

        let mut queues = inner.queues.lock();
        let capacity = inner.config.max_requests;
        if queues.requests.len() >= capacity {
            VoteGeneratorStats::inc(&inner.stats.requests_dropped);
            trace!(
                "vote request queue full, dropping request from {:?}",
                channel.remote_endpoint()
            );
            return Err(VotingError::QueueOverflow {
                queue: QueueKind::Requests,
                capacity,
            });
        }
        queues.requests.push_back(Request {
            candidates,
            channel,
        });
        VoteGeneratorStats::inc(&inner.stats.requests_queued);
        inner.condvar.notify_all();
        Ok(count)
    }

    /// Install the function used to send request replies. Can only be set
    /// once; without it replies are framed and written to the channel.
    pub fn set_reply_action<F>(&self, action: F) -> Result<()>
    where
        F: Fn(&Arc<Vote>, &Arc<Channel>) + Send + Sync + 'static,
    {
        self.inner
            .reply_action
            .set(Box::new(action))
            .map_err(|_| VotingError::ReplyActionAlreadySet)
    }

    /// Stop the worker and wait for it to exit. A batch being signed is
    /// finished first. Idempotent.
    pub fn stop(&self) {
        {
            let _queues = self.inner.queues.lock();
            self.inner.stopped.store(true, Ordering::Release);
        }
        self.inner.condvar.notify_all();
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("vote generator thread panicked");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// This node's vote history. The ledger erases roots from it once they
    /// are confirmed or rolled back.
    pub fn history(&self) -> &LocalVoteHistory {
        &self.inner.history
    }

    pub fn candidates_len(&self) -> usize {
        self.inner.queues.lock().candidates.len()
    }

    pub fn requests_len(&self) -> usize {
        self.inner.queues.lock().requests.len()
    }

    /// Blocks waiting for a vote, across broadcast candidates and requests.
    pub fn pending_candidates(&self) -> usize {
        let queues = self.inner.queues.lock();
        queues
            .requests
            .iter()
            .fold(queues.candidates.len(), |total, request| {
                total.saturating_add(request.candidates.len())
            })
    }

    pub fn stats(&self) -> VoteGeneratorStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Drop for VoteGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Broadcast every cached vote for the pair. Returns `false` on a miss.
    fn broadcast_cached(&self, root: &Root, hash: &BlockHash) -> bool {
        let cached = self.history.votes(root, hash);
        if cached.is_empty() {
            return false;
        }
        VoteGeneratorStats::inc(&self.stats.cache_hits);
        for vote in &cached {
            self.dispatch_broadcast(vote);
        }
        true
    }

    fn run(&self) {
        info!("vote generator started");
        let delay = self.config.batch_delay();
        let batch_size = self.config.batch_size;
        let mut queues = self.queues.lock();
        while !self.is_stopped() {
            if queues.candidates.len() >= batch_size {
                self.broadcast_batch(&mut queues);
            } else if let Some(request) = queues.requests.pop_front() {
                MutexGuard::unlocked(&mut queues, || self.reply(request));
            } else {
                self.condvar.wait_while_for(
                    &mut queues,
                    |queues| {
                        !self.is_stopped()
                            && queues.candidates.len() < batch_size
                            && queues.requests.is_empty()
                    },
                    delay,
                );
                if self.is_stopped() {
                    break;
                }
                let queued = queues.candidates.len();
                if queued >= self.config.batch_threshold && queued < batch_size {
                    self.condvar.wait_while_for(
                        &mut queues,
                        |queues| !self.is_stopped() && queues.candidates.len() < batch_size,
                        delay,
                    );
                }
                if !queues.candidates.is_empty() && !self.is_stopped() {
                    self.broadcast_batch(&mut queues);
                }
            }
        }
        info!("vote generator stopped");
    }

    /// Take up to one batch of candidates off the queue, then vote for them
    /// with the queue unlocked.
    fn broadcast_batch(&self, queues: &mut MutexGuard<Queues>) {
        let batch_size = self.config.batch_size;
        let mut batch = Batch::with_capacity(batch_size);
        let mut sent = Vec::new();
        while batch.hashes.len() < batch_size {
            let Some((root, hash)) = queues.candidates.pop_front() else {
                break;
            };
            batch.push(&self.history, &mut sent, root, hash);
        }
        MutexGuard::unlocked(queues, || {
            for vote in &batch.cached {
                self.dispatch_broadcast(vote);
            }
            if !batch.hashes.is_empty() {
                self.vote(&batch.roots, batch.hashes, |vote| self.dispatch_broadcast(vote));
            }
        });
    }

    /// Answer a request on its channel, one vote per batch of hashes.
    fn reply(&self, request: Request) {
        let batch_size = self.config.batch_size;
        let mut candidates = request.candidates.into_iter().peekable();
        // Cached votes already sent for this request.
        let mut sent = Vec::new();
        while candidates.peek().is_some() && !self.is_stopped() {
            let mut batch = Batch::with_capacity(batch_size);
            while batch.hashes.len() < batch_size {
                let Some((root, hash)) = candidates.next() else {
                    break;
                };
                batch.push(&self.history, &mut sent, root, hash);
            }
            for vote in &batch.cached {
                self.dispatch_reply(vote, &request.channel);
            }
            if !batch.hashes.is_empty() {
                self.vote(&batch.roots, batch.hashes, |vote| {
                    self.dispatch_reply(vote, &request.channel)
                });
            }
        }
    }

    /// Sign one vote for `hashes`, record it for every (root, hash) pair,
    /// pass it to the local processor and hand it to `dispatch`. A signing
    /// failure drops the batch.
    fn vote(&self, roots: &[Root], hashes: Vec<BlockHash>, dispatch: impl Fn(&Arc<Vote>)) {
        let vote = match self.sign_batch(&hashes) {
            Ok(vote) => vote,
            Err(err) => {
                VoteGeneratorStats::inc(&self.stats.signing_failures);
                warn!("failed to generate vote for {} hashes: {}", hashes.len(), err);
                return;
            }
        };
        for (root, hash) in roots.iter().zip(&hashes) {
            self.history.add(*root, *hash, vote.clone());
        }
        self.processor.process_local(&vote);
        VoteGeneratorStats::inc(&self.stats.votes_generated);
        trace!("generated vote covering {} hashes", hashes.len());
        dispatch(&vote);
    }

    fn sign_batch(&self, hashes: &[BlockHash]) -> Result<Arc<Vote>> {
        let timestamp = self.timestamps.now();
        let vote = self.signer.sign(timestamp, hashes)?;
        Ok(Arc::new(vote))
    }

    fn dispatch_broadcast(&self, vote: &Arc<Vote>) {
        VoteGeneratorStats::inc(&self.stats.broadcasts);
        self.broadcaster.broadcast(vote);
    }

    fn dispatch_reply(&self, vote: &Arc<Vote>, channel: &Arc<Channel>) {
        VoteGeneratorStats::inc(&self.stats.replies);
        match self.reply_action.get() {
            Some(action) => action(vote, channel),
            None => {
                if !send_vote(
                    channel,
                    vote,
                    self.config.max_frame_size,
                    DropPolicy::NoLimiterDrop,
                ) {
                    debug!("vote reply to {:?} dropped", channel.remote_endpoint());
                }
            }
        }
    }
}
