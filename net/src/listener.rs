//! Inbound TCP listener with admission control.
//!
//! The accept loop runs as a single tokio task that owns the
//! address → connection map, so admission decisions need no lock. Before each
//! accept, connections that have since been dropped are purged from the map.
//! An accepted stream is then admitted only if:
//!
//! - the total number of live inbound connections is below
//!   `max_inbound_connections` (otherwise the loop pauses without accepting);
//! - the source address holds fewer than `max_connections_per_ip`;
//! - the source subnet holds fewer than `max_connections_per_subnet`.
//!
//! Rejected streams are closed without telling the peer why.

use {
    crate::{
        config::NetConfig,
        connection::Connection,
        error::{AdmissionLimit, NetError, Result},
        subnet::AddressConnections,
    },
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    socket2::{Domain, Protocol, Socket, Type},
    std::{
        io,
        net::SocketAddr,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
};

/// Counters maintained by the accept loop.
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    rejected_per_ip: AtomicU64,
    rejected_per_subnet: AtomicU64,
    accept_errors: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub accepted: u64,
    pub rejected_per_ip: u64,
    pub rejected_per_subnet: u64,
    pub accept_errors: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_per_ip: self.rejected_per_ip.load(Ordering::Relaxed),
            rejected_per_subnet: self.rejected_per_subnet.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
        }
    }

    fn record_rejection(&self, limit: AdmissionLimit) {
        match limit {
            AdmissionLimit::PerIp => self.rejected_per_ip.fetch_add(1, Ordering::Relaxed),
            AdmissionLimit::PerSubnet => self.rejected_per_subnet.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Accepts peer connections on the configured address.
pub struct Listener {
    config: NetConfig,
    cancel: CancellationToken,
    socket: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connection_count: Arc<AtomicUsize>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            connection_count: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(ListenerStats::default()),
        }
    }

    /// Bind the listening socket and return the bound address.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<SocketAddr> {
        self.config.validate()?;
        let addr = self.config.bind_addr;
        let listener = bind(addr, self.config.max_inbound_connections)
            .and_then(TcpListener::from_std)
            .map_err(|source| NetError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("node listener bound to {}", local_addr);
        *self.local_addr.lock() = Some(local_addr);
        *self.socket.lock() = Some(listener);
        Ok(local_addr)
    }

    /// Spawn the accept loop. `callback` receives every admitted connection;
    /// returning `false` stops accepting.
    ///
    /// Fails with [`NetError::NotConnected`] if the listener was not started
    /// or the loop is already running.
    pub fn on_connection<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(Arc<Connection>) -> bool + Send + 'static,
    {
        let listener = self.socket.lock().take().ok_or(NetError::NotConnected)?;
        let accept_loop = AcceptLoop {
            listener,
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            connections: AddressConnections::new(),
            connection_count: self.connection_count.clone(),
            stats: self.stats.clone(),
            callback,
        };
        tokio::spawn(accept_loop.run());
        Ok(())
    }

    /// Stop accepting and release the listening socket. Connections already
    /// handed out stay open.
    pub fn close(&self) {
        self.cancel.cancel();
        self.socket.lock().take();
    }

    /// Port the listener is bound to, or `0` before `start`.
    pub fn listening_port(&self) -> u16 {
        self.local_addr
            .lock()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Live inbound connections, as of the last accept loop iteration.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind(addr: SocketAddr, backlog: usize) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    Ok(socket.into())
}

/// Errors after which accepting can simply be retried.
fn is_transient(err: &io::Error) -> bool {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

struct AcceptLoop<F> {
    listener: TcpListener,
    config: NetConfig,
    cancel: CancellationToken,
    connections: AddressConnections<Connection>,
    connection_count: Arc<AtomicUsize>,
    stats: Arc<ListenerStats>,
    callback: F,
}

impl<F> AcceptLoop<F>
where
    F: FnMut(Arc<Connection>) -> bool + Send + 'static,
{
    async fn run(mut self) {
        let delay = self.config.accept_retry_delay();
        loop {
            self.connections.evict_dead();
            self.publish_count();

            if self.connections.len() >= self.config.max_inbound_connections {
                trace!(
                    "inbound connection limit {} reached",
                    self.config.max_inbound_connections
                );
                if !pause(&self.cancel, delay).await {
                    break;
                }
                continue;
            }

            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_transient(&err) => {
                    debug!("transient accept error: {}", err);
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    if !pause(&self.cancel, delay).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    warn!("accept failed, stopping listener: {}", err);
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };

            if let Err(err) = self.admit(addr) {
                debug!("{}", err);
                drop(stream);
                if !pause(&self.cancel, delay).await {
                    break;
                }
                continue;
            }

            let connection = match Connection::accepted(stream, &self.config.connection).await {
                Ok(connection) => connection,
                Err(err) => {
                    debug!("failed to set up connection from {}: {}", addr, err);
                    continue;
                }
            };
            self.connections.insert(addr.ip(), &connection);
            self.publish_count();
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            trace!("accepted connection from {}", addr);

            if !(self.callback)(connection) {
                debug!("connection callback asked to stop accepting");
                break;
            }
        }
        info!("node listener stopped accepting");
    }

    fn admit(&self, addr: SocketAddr) -> Result<()> {
        let ip = addr.ip();
        let per_ip = self.config.max_connections_per_ip;
        if per_ip > 0 && self.connections.count_ip(ip) >= per_ip {
            self.stats.record_rejection(AdmissionLimit::PerIp);
            return Err(NetError::AdmissionRejected {
                addr,
                limit: AdmissionLimit::PerIp,
            });
        }
        let per_subnet = self.config.max_connections_per_subnet;
        if per_subnet > 0
            && self.connections.count_subnet(
                ip,
                self.config.ipv4_subnet_prefix,
                self.config.ipv6_subnet_prefix,
            ) >= per_subnet
        {
            self.stats.record_rejection(AdmissionLimit::PerSubnet);
            return Err(NetError::AdmissionRejected {
                addr,
                limit: AdmissionLimit::PerSubnet,
            });
        }
        Ok(())
    }

    fn publish_count(&self) {
        self.connection_count
            .store(self.connections.len(), Ordering::Relaxed);
    }
}

/// Returns `false` if the listener was closed while waiting.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        tokio::{io::AsyncReadExt, net::TcpStream, sync::mpsc},
    };

    fn test_config() -> NetConfig {
        NetConfig::dev_default()
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = Listener::new(test_config());
        let addr = first.start().unwrap();
        assert_eq!(first.listening_port(), addr.port());

        let mut config = test_config();
        config.bind_addr = addr;
        let second = Listener::new(config);
        assert_matches!(second.start(), Err(NetError::Bind { .. }));
        assert_eq!(second.listening_port(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.max_inbound_connections = 0;
        assert_matches!(Listener::new(config).start(), Err(NetError::Config(_)));
    }

    #[tokio::test]
    async fn test_on_connection_requires_start() {
        let listener = Listener::new(test_config());
        assert_matches!(
            listener.on_connection(|_| true),
            Err(NetError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_per_ip_limit() {
        let mut config = test_config();
        config.max_connections_per_ip = 1;
        let listener = Listener::new(config);
        let addr = listener.start().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .on_connection(move |connection| tx.send(connection).is_ok())
            .unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let admitted = rx.recv().await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut byte))
            .await
            .unwrap();
        // Closed by the listener: EOF or reset.
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(rx.try_recv().is_err());
        assert!(!admitted.is_closed());
        assert_eq!(listener.stats().rejected_per_ip, 1);
        assert_eq!(listener.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_slot() {
        let mut config = test_config();
        config.max_connections_per_ip = 1;
        let listener = Listener::new(config);
        let addr = listener.start().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .on_connection(move |connection| {
                let remote = connection.remote_endpoint();
                drop(connection);
                tx.send(remote).is_ok()
            })
            .unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        rx.recv().await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(listener.stats().rejected_per_ip, 0);
    }

    #[tokio::test]
    async fn test_inbound_limit_defers_accept() {
        let mut config = test_config();
        config.max_inbound_connections = 1;
        config.max_connections_per_ip = 0;
        config.max_connections_per_subnet = 0;
        let listener = Listener::new(config);
        let addr = listener.start().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .on_connection(move |connection| tx.send(connection).is_ok())
            .unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let held = rx.recv().await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(listener.connection_count(), 1);

        drop(held);
        let admitted = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!admitted.is_closed());
    }

    #[tokio::test]
    async fn test_callback_false_stops_accepting() {
        let listener = Listener::new(test_config());
        let addr = listener.start().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .on_connection(move |connection| {
                tx.send(connection).unwrap();
                false
            })
            .unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let _held = rx.recv().await.unwrap();
        let _ = TcpStream::connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(listener.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_close_keeps_accepted_connections() {
        let listener = Listener::new(test_config());
        let addr = listener.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .on_connection(move |connection| tx.send(connection).is_ok())
            .unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let admitted = rx.recv().await.unwrap();
        listener.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!admitted.is_closed());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
}
