//! Asynchronous TCP connection with a bounded write queue and idle detection.
//!
//! A [`Connection`] is shared behind an `Arc` between the channel registry
//! and whoever has an operation in flight. Once the stream is attached it
//! runs two background tasks on the current tokio runtime:
//!
//! - a **writer** that drains the outbound queue in submission order, so all
//!   write completions of one connection are strictly ordered;
//! - a **checkup timer** that closes the connection when it has been idle
//!   (no completed read or write) for `io_timeout`, or, for accepted
//!   connections, silent (nothing received) for the silent tolerance.
//!
//! `close()` sets the closed flag before cancelling anything. Every
//! completion re-checks the flag, so nothing reports success after `close()`
//! has returned.

use {
    crate::{
        config::ConnectionConfig,
        error::{DropReason, NetError, Result},
    },
    bytes::Bytes,
    log::{debug, trace},
    std::{
        fmt,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
            Arc, OnceLock,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpStream,
        },
        sync::{mpsc, Mutex as AsyncMutex, Notify},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
};

/// Completion callback for a queued write. Receives the number of bytes
/// written or the reason the write failed.
pub type WriteCallback = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// At which stage a buffer may be dropped instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Can be dropped by the bandwidth limiter or the write queue.
    Limiter,
    /// Exempt from the bandwidth limiter, still dropped when the write
    /// queue is over its threshold.
    NoLimiterDrop,
    /// Never dropped by the write queue.
    NoSocketDrop,
}

/// Purpose of a connection, set once it is known. Consumers use it for
/// traffic shaping and eviction; the connection itself does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    Undefined = 0,
    Bootstrap = 1,
    Realtime = 2,
    /// Response side of a realtime channel opened by the remote peer.
    RealtimeResponseServer = 3,
}

impl ConnectionType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Bootstrap,
            2 => Self::Realtime,
            3 => Self::RealtimeResponseServer,
            _ => Self::Undefined,
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// Outbound, created by [`Connection::connect`].
    Client,
    /// Inbound, created by the listener.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    Idle,
    Silent,
}

struct QueueItem {
    buffer: Bytes,
    callback: Option<WriteCallback>,
}

/// State shared between the connection handle and its background tasks.
struct ConnectionState {
    endpoint_type: EndpointType,
    epoch: Instant,
    closed: AtomicBool,
    timed_out: AtomicBool,
    queue_size: AtomicUsize,
    io_timeout_ms: AtomicU64,
    silent_tolerance_ms: AtomicU64,
    last_completion_ms: AtomicU64,
    last_receive_ms: AtomicU64,
    cancel: CancellationToken,
    activity: Notify,
    /// Taken on close so the socket is released even while handles remain.
    reader: AsyncMutex<Option<OwnedReadHalf>>,
}

impl ConnectionState {
    fn new(endpoint_type: EndpointType, config: &ConnectionConfig) -> Self {
        Self {
            endpoint_type,
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            queue_size: AtomicUsize::new(0),
            io_timeout_ms: AtomicU64::new(config.io_timeout_ms),
            silent_tolerance_ms: AtomicU64::new(config.silent_connection_tolerance_ms),
            last_completion_ms: AtomicU64::new(0),
            last_receive_ms: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            activity: Notify::new(),
            reader: AsyncMutex::new(None),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `false` if the connection was already closed.
    ///
    /// The read half is dropped here unless a read holds it; that read sees
    /// the cancellation and drops it itself. The writer task drops the write
    /// half on exit.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        true
    }

    /// Error reported by operations cut short by a close.
    fn closed_error(&self) -> NetError {
        if self.timed_out.load(Ordering::Acquire) {
            NetError::Timeout
        } else {
            NetError::Closed
        }
    }

    fn set_last_completion(&self) {
        self.last_completion_ms
            .store(self.elapsed_ms(), Ordering::Release);
        self.activity.notify_one();
    }

    fn set_last_receive(&self) {
        self.last_receive_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    fn finish_write(&self, callback: Option<WriteCallback>, result: Result<usize>) {
        self.queue_size.fetch_sub(1, Ordering::AcqRel);
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn checkup_interval(&self) -> Duration {
        let mut ms = self.io_timeout_ms.load(Ordering::Relaxed);
        if self.endpoint_type == EndpointType::Server {
            ms = ms.min(self.silent_tolerance_ms.load(Ordering::Relaxed));
        }
        Duration::from_millis(ms.max(1))
    }

    fn timeout_reason(&self) -> Option<TimeoutKind> {
        let now = self.elapsed_ms();
        let idle = now.saturating_sub(self.last_completion_ms.load(Ordering::Acquire));
        if idle >= self.io_timeout_ms.load(Ordering::Relaxed) {
            return Some(TimeoutKind::Idle);
        }
        if self.endpoint_type == EndpointType::Server {
            let silent = now.saturating_sub(self.last_receive_ms.load(Ordering::Acquire));
            if silent >= self.silent_tolerance_ms.load(Ordering::Relaxed) {
                return Some(TimeoutKind::Silent);
            }
        }
        None
    }
}

/// A single TCP stream to or from a peer.
pub struct Connection {
    state: Arc<ConnectionState>,
    connection_type: AtomicU8,
    remote: OnceLock<SocketAddr>,
    local: OnceLock<SocketAddr>,
    write_tx: mpsc::UnboundedSender<QueueItem>,
    /// Held until the stream is attached, then owned by the writer task.
    write_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    queue_capacity: usize,
    drop_threshold: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote.get())
            .field("endpoint_type", &self.state.endpoint_type)
            .field("connection_type", &self.connection_type())
            .field("queue_size", &self.queue_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Create an outbound connection. Nothing happens on the network until
    /// [`connect`](Self::connect) is awaited; writes issued before that are
    /// queued.
    pub fn new(config: &ConnectionConfig) -> Arc<Self> {
        Arc::new(Self::with_endpoint_type(EndpointType::Client, config))
    }

    /// Wrap a stream returned by `accept`. Must be called from within a
    /// tokio runtime.
    pub async fn accepted(stream: TcpStream, config: &ConnectionConfig) -> Result<Arc<Self>> {
        let connection = Arc::new(Self::with_endpoint_type(EndpointType::Server, config));
        connection.attach(stream).await?;
        Ok(connection)
    }

    fn with_endpoint_type(endpoint_type: EndpointType, config: &ConnectionConfig) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(ConnectionState::new(endpoint_type, config)),
            connection_type: AtomicU8::new(ConnectionType::Undefined as u8),
            remote: OnceLock::new(),
            local: OnceLock::new(),
            write_tx,
            write_rx: parking_lot::Mutex::new(Some(write_rx)),
            queue_capacity: config.queue_capacity,
            drop_threshold: config.drop_threshold(),
        }
    }

    /// Open the outbound stream to `endpoint`.
    ///
    /// Fails with [`NetError::Connect`] when the peer refuses or is
    /// unreachable, [`NetError::ConnectTimeout`] when the io timeout elapses
    /// first and [`NetError::Closed`] when the connection was closed. A
    /// failed connect closes the connection.
    pub async fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        if self.state.is_closed() {
            return Err(NetError::Closed);
        }
        let stream = tokio::select! {
            biased;
            _ = self.state.cancel.cancelled() => return Err(NetError::Closed),
            result = tokio::time::timeout(self.timeout(), TcpStream::connect(endpoint)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(source)) => {
                        self.close();
                        return Err(NetError::Connect { addr: endpoint, source });
                    }
                    Err(_) => {
                        self.close();
                        return Err(NetError::ConnectTimeout(endpoint));
                    }
                }
            }
        };
        if self.state.is_closed() {
            return Err(NetError::Closed);
        }
        self.attach(stream).await
    }

    async fn attach(&self, stream: TcpStream) -> Result<()> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let _ = stream.set_nodelay(true);
        let _ = self.remote.set(remote);
        let _ = self.local.set(local);

        let (reader, writer) = stream.into_split();
        let mut queue = self
            .write_rx
            .lock()
            .take()
            .ok_or_else(|| self.state.closed_error())?;
        *self.state.reader.lock().await = Some(reader);
        if self.state.is_closed() {
            self.state.reader.lock().await.take();
            drain_closed(&self.state, &mut queue);
            return Err(self.state.closed_error());
        }

        self.state.set_last_receive();
        self.state.set_last_completion();
        tokio::spawn(write_loop(self.state.clone(), writer, queue));
        tokio::spawn(checkup_loop(self.state.clone(), remote));
        trace!("connection to {} established ({:?})", remote, self.state.endpoint_type);
        Ok(())
    }

    /// Read exactly `size` bytes into `buffer`, resizing it as needed.
    ///
    /// Reads are serialized. A read that completes after the connection was
    /// closed reports [`NetError::Closed`]; an I/O failure (including EOF)
    /// closes the connection.
    pub async fn read(&self, buffer: &mut Vec<u8>, size: usize) -> Result<usize> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        let mut guard = self.state.reader.lock().await;
        if self.state.is_closed() {
            guard.take();
            return Err(self.state.closed_error());
        }
        let reader = guard.as_mut().ok_or(NetError::NotConnected)?;
        buffer.resize(size, 0);
        let result = tokio::select! {
            biased;
            _ = self.state.cancel.cancelled() => Err(NetError::Closed),
            result = reader.read_exact(&mut buffer[..size]) => result.map_err(NetError::from),
        };
        if self.state.is_closed() {
            guard.take();
            return Err(self.state.closed_error());
        }
        match result {
            Ok(read) => {
                self.state.set_last_receive();
                self.state.set_last_completion();
                Ok(read)
            }
            Err(err) => {
                debug!("read from {:?} failed: {}", self.remote.get(), err);
                drop(guard);
                self.close();
                Err(err)
            }
        }
    }

    /// Queue `buffer` for writing.
    ///
    /// Droppable writes (`Limiter`, `NoLimiterDrop`) are refused once the
    /// queue has reached its drop threshold. Returns `false` when the write
    /// was refused; in that case `callback` has already been invoked with the
    /// error, on the calling thread. Otherwise the callback runs on the
    /// connection's writer task.
    pub fn write(&self, buffer: Bytes, policy: DropPolicy, callback: Option<WriteCallback>) -> bool {
        if self.state.is_closed() {
            if let Some(callback) = callback {
                callback(Err(self.state.closed_error()));
            }
            return false;
        }
        if policy == DropPolicy::NoSocketDrop {
            self.state.queue_size.fetch_add(1, Ordering::AcqRel);
        } else if let Err(depth) = self.state.queue_size.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |depth| (depth < self.drop_threshold).then_some(depth.saturating_add(1)),
        ) {
            trace!(
                "dropping {} byte write to {:?}: queue at {}",
                buffer.len(),
                self.remote.get(),
                depth
            );
            if let Some(callback) = callback {
                callback(Err(NetError::Dropped(DropReason::QueueFull)));
            }
            return false;
        }
        if let Err(mpsc::error::SendError(item)) = self.write_tx.send(QueueItem { buffer, callback })
        {
            self.state
                .finish_write(item.callback, Err(self.state.closed_error()));
            return false;
        }
        true
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.state.close() {
            return;
        }
        debug!("closing connection to {:?}", self.remote.get());
        if let Some(mut queue) = self.write_rx.lock().take() {
            drain_closed(&self.state, &mut queue);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// `true` once the checkup timer closed the connection.
    pub fn has_timed_out(&self) -> bool {
        self.state.timed_out.load(Ordering::Acquire)
    }

    /// Writes queued but not yet completed.
    pub fn queue_size(&self) -> usize {
        self.state.queue_size.load(Ordering::Acquire)
    }

    /// Advisory: the write queue has reached its capacity.
    pub fn is_at_capacity(&self) -> bool {
        self.queue_size() >= self.queue_capacity
    }

    /// Advisory: the write queue holds twice its capacity.
    pub fn is_over_capacity(&self) -> bool {
        self.queue_size() >= self.queue_capacity.saturating_mul(2)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.state.io_timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the idle timeout, e.g. once the kind of traffic is known. The
    /// checkup timer is restarted with the new value.
    pub fn set_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.state.io_timeout_ms.store(ms, Ordering::Relaxed);
        self.state.activity.notify_one();
    }

    pub fn set_silent_connection_tolerance(&self, tolerance: Duration) {
        let ms = u64::try_from(tolerance.as_millis()).unwrap_or(u64::MAX);
        self.state.silent_tolerance_ms.store(ms, Ordering::Relaxed);
        self.state.activity.notify_one();
    }

    pub fn connection_type(&self) -> ConnectionType {
        ConnectionType::from_u8(self.connection_type.load(Ordering::Relaxed))
    }

    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        self.connection_type
            .store(connection_type as u8, Ordering::Relaxed);
    }

    pub fn is_realtime(&self) -> bool {
        matches!(
            self.connection_type(),
            ConnectionType::Realtime | ConnectionType::RealtimeResponseServer
        )
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.state.endpoint_type
    }

    /// Address of the peer, once connected.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local.get().copied()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain_closed(state: &ConnectionState, queue: &mut mpsc::UnboundedReceiver<QueueItem>) {
    queue.close();
    while let Ok(item) = queue.try_recv() {
        state.finish_write(item.callback, Err(state.closed_error()));
    }
}

async fn write_loop(
    state: Arc<ConnectionState>,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<QueueItem>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let result = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => Err(state.closed_error()),
            result = writer.write_all(&item.buffer) => {
                result.map(|()| item.buffer.len()).map_err(NetError::from)
            }
        };
        let result = match result {
            Ok(size) if !state.is_closed() => {
                state.set_last_completion();
                Ok(size)
            }
            Ok(_) => Err(state.closed_error()),
            Err(NetError::Io(err)) => {
                debug!("write failed: {}", err);
                state.close();
                Err(NetError::Io(err))
            }
            Err(err) => Err(err),
        };
        state.finish_write(item.callback, result);
    }
    drain_closed(&state, &mut queue);
    let _ = writer.shutdown().await;
}

async fn checkup_loop(state: Arc<ConnectionState>, remote: SocketAddr) {
    loop {
        let interval = state.checkup_interval();
        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => break,
            _ = state.activity.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if let Some(kind) = state.timeout_reason() {
            match kind {
                TimeoutKind::Idle => debug!("connection to {} idle, closing", remote),
                TimeoutKind::Silent => debug!("connection from {} silent, closing", remote),
            }
            state.timed_out.store(true, Ordering::Release);
            state.close();
            break;
        }
    }
}
