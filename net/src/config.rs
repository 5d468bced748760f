//! Configuration for the node transport layer.

use {
    crate::bandwidth_limiter::TokenBucketLimiter,
    std::{
        net::{Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    },
    thiserror::Error,
};

/// Per-connection tuning: write queue bound and idle detection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// A connection with no completed read or write for this long is closed.
    /// Also bounds how long an outbound connect may take.
    /// Default: 15 000 ms.
    pub io_timeout_ms: u64,

    /// Accepted connections that have not delivered a single byte for this
    /// long are dropped as silent.
    /// Default: 120 000 ms.
    pub silent_connection_tolerance_ms: u64,

    /// Number of queued writes at which the connection reports
    /// [`is_at_capacity`](crate::connection::Connection::is_at_capacity).
    /// Default: 128.
    pub queue_capacity: usize,

    /// Droppable writes are refused once the queue holds
    /// `queue_capacity * drop_factor` buffers.
    /// Default: 2.
    pub drop_factor: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: 15_000,
            silent_connection_tolerance_ms: 120_000,
            queue_capacity: 128,
            drop_factor: 2,
        }
    }
}

impl ConnectionConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn silent_connection_tolerance(&self) -> Duration {
        Duration::from_millis(self.silent_connection_tolerance_ms)
    }

    /// Queue depth at which droppable writes are refused.
    pub fn drop_threshold(&self) -> usize {
        self.queue_capacity.saturating_mul(self.drop_factor)
    }
}

/// Configuration for the inbound listener and its admission control.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Local address to accept peer connections on.
    /// Default: `0.0.0.0:7075`
    pub bind_addr: SocketAddr,

    /// Upper bound on live inbound connections. Also used as the listen
    /// backlog.
    /// Default: 2048.
    pub max_inbound_connections: usize,

    /// Maximum live inbound connections from a single IP address.
    /// `0` disables the check.
    /// Default: 10.
    pub max_connections_per_ip: usize,

    /// Maximum live inbound connections from a single subnet.
    /// `0` disables the check.
    /// Default: 40.
    pub max_connections_per_subnet: usize,

    /// Prefix length used to group IPv4 peers into a subnet.
    /// Default: 24.
    pub ipv4_subnet_prefix: u8,

    /// Prefix length used to group IPv6 peers into a subnet.
    /// Default: 64.
    pub ipv6_subnet_prefix: u8,

    /// Pause before the accept loop retries after hitting a limit or a
    /// transient accept error (ms).
    pub accept_retry_delay_ms: u64,

    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,

    /// Outbound bandwidth allowance shared by all channels, bytes per second.
    /// `0` means unlimited.
    pub bandwidth_limit: usize,

    /// Burst allowance of the bandwidth limiter as a multiple of
    /// `bandwidth_limit`.
    pub bandwidth_burst_ratio: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7075)),
            max_inbound_connections: 2048,
            max_connections_per_ip: 10,
            max_connections_per_subnet: 40,
            ipv4_subnet_prefix: 24,
            ipv6_subnet_prefix: 64,
            accept_retry_delay_ms: 1,
            connection: ConnectionConfig::default(),
            bandwidth_limit: 10_485_760,
            bandwidth_burst_ratio: 3.0,
        }
    }
}

impl NetConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            max_inbound_connections: 64,
            max_connections_per_ip: 20,
            max_connections_per_subnet: 80,
            ipv4_subnet_prefix: 24,
            ipv6_subnet_prefix: 64,
            accept_retry_delay_ms: 1,
            connection: ConnectionConfig {
                io_timeout_ms: 2_000,
                silent_connection_tolerance_ms: 5_000,
                queue_capacity: 16,
                drop_factor: 2,
            },
            bandwidth_limit: 0,
            bandwidth_burst_ratio: 1.0,
        }
    }

    /// Outbound limiter shared by every channel, or `None` when
    /// `bandwidth_limit` is `0`.
    pub fn bandwidth_limiter(&self) -> Option<Arc<TokenBucketLimiter>> {
        (self.bandwidth_limit > 0).then(|| {
            Arc::new(TokenBucketLimiter::new(
                self.bandwidth_limit,
                self.bandwidth_burst_ratio,
            ))
        })
    }

    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inbound_connections == 0 {
            return Err(ConfigError::NoInboundConnections);
        }
        if self.ipv4_subnet_prefix > 32 {
            return Err(ConfigError::InvalidPrefix(self.ipv4_subnet_prefix, 32));
        }
        if self.ipv6_subnet_prefix > 128 {
            return Err(ConfigError::InvalidPrefix(self.ipv6_subnet_prefix, 128));
        }
        if self.connection.io_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("io_timeout_ms"));
        }
        if self.connection.silent_connection_tolerance_ms == 0 {
            return Err(ConfigError::ZeroTimeout("silent_connection_tolerance_ms"));
        }
        if self.connection.queue_capacity == 0 || self.connection.drop_factor == 0 {
            return Err(ConfigError::InvalidQueueBound);
        }
        if self.bandwidth_burst_ratio.is_nan() || self.bandwidth_burst_ratio < 1.0 {
            return Err(ConfigError::InvalidBurstRatio(self.bandwidth_burst_ratio));
        }
        Ok(())
    }
}

/// Errors in transport configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_inbound_connections must be > 0")]
    NoInboundConnections,
    #[error("subnet prefix {0} exceeds address width {1}")]
    InvalidPrefix(u8, u8),
    #[error("{0} must be > 0")]
    ZeroTimeout(&'static str),
    #[error("queue_capacity and drop_factor must be > 0")]
    InvalidQueueBound,
    #[error("bandwidth_burst_ratio must be >= 1.0, got {0}")]
    InvalidBurstRatio(f64),
}
