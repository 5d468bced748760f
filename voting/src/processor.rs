//! Sink for votes this node generates.

use {crate::vote::Vote, std::sync::Arc};

/// Receives every vote the generator signs, so the node counts its own vote
/// the same way it counts votes from peers. Cached votes that are only
/// rebroadcast are not passed again.
pub trait VoteProcessor: Send + Sync {
    fn process_local(&self, vote: &Arc<Vote>);
}

impl<T: VoteProcessor + ?Sized> VoteProcessor for Arc<T> {
    fn process_local(&self, vote: &Arc<Vote>) {
        (**self).process_local(vote)
    }
}

/// Processor that discards local votes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVoteProcessor;

impl VoteProcessor for NoopVoteProcessor {
    fn process_local(&self, _vote: &Arc<Vote>) {}
}
