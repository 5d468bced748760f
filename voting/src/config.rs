//! Configuration for vote generation.

use {std::time::Duration, thiserror::Error};

/// Tuning for the vote generator and its local vote history.
#[derive(Debug, Clone)]
pub struct VotingConfig {
    /// Maximum number of (root, hash, vote) entries kept in the local vote
    /// history. Oldest entries are evicted first.
    /// Default: 131 072.
    pub max_cache: usize,

    /// Maximum number of block hashes covered by a single vote.
    /// Default: 12.
    pub batch_size: usize,

    /// When fewer than `batch_size` but at least this many candidates are
    /// queued, the worker waits one more `batch_delay_ms` for the batch to
    /// fill before voting.
    /// Default: 3.
    pub batch_threshold: usize,

    /// How long the worker waits for a full batch (ms).
    /// Default: 100.
    pub batch_delay_ms: u64,

    /// Upper bound on queued reply requests; further requests are dropped.
    /// Default: 2048.
    pub max_requests: usize,

    /// Upper bound on queued broadcast candidates; further candidates are
    /// refused with a queue overflow.
    /// Default: 65 536.
    pub max_candidates: usize,

    /// Largest encoded vote frame accepted or produced, in bytes.
    /// Default: 65 536.
    pub max_frame_size: usize,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            max_cache: 131_072,
            batch_size: 12,
            batch_threshold: 3,
            batch_delay_ms: 100,
            max_requests: 2048,
            max_candidates: 65_536,
            max_frame_size: 65_536,
        }
    }
}

impl VotingConfig {
    /// Create a config suitable for local testing with shorter delays.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            max_cache: 1_024,
            batch_size: 12,
            batch_threshold: 3,
            batch_delay_ms: 20,
            max_requests: 64,
            max_candidates: 1_024,
            max_frame_size: 65_536,
        }
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache == 0 {
            return Err(ConfigError::ZeroLimit("max_cache"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroLimit("batch_size"));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::ZeroLimit("max_requests"));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::ZeroLimit("max_candidates"));
        }
        if self.batch_threshold > self.batch_size {
            return Err(ConfigError::ThresholdAboveBatch {
                threshold: self.batch_threshold,
                batch_size: self.batch_size,
            });
        }
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::FrameTooSmall(self.max_frame_size));
        }
        Ok(())
    }
}

/// Smallest frame that still holds a vote with a single hash.
const MIN_FRAME_SIZE: usize = 256;

/// Errors in voting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    ZeroLimit(&'static str),
    #[error("batch_threshold {threshold} exceeds batch_size {batch_size}")]
    ThresholdAboveBatch { threshold: usize, batch_size: usize },
    #[error("max_frame_size {0} cannot hold a vote")]
    FrameTooSmall(usize),
}
