use crate::{
    endpoint::ServerEndpoint,
    error::errno,
    transport::{
        ConnectivityNotifier, Connector, Direction, LinkState, Transport, TransportError,
        TransportErrorKind, TransportId, TransportResult,
    },
};
use async_trait::async_trait;
use nbd_proto::{fill_pattern, Hello, Reply, Request, HELLO_LEN, REPLY_LEN};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    io,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicI32, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, Interest},
    net::TcpStream,
    runtime::Handle,
    sync::Mutex,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, trace, warn};

/// How often an idle connection is checked for a close by the peer.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Which bytes a read returns once the greeting has been validated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataPath {
    /// Issue `NBD_CMD_READ` and await the simple reply.
    #[default]
    Nbd,
    /// Deterministic reference data `(offset + i) mod 256`; nothing goes on the wire.
    Pattern,
}

/// Configuration for [`TcpConnector`].
#[derive(Clone, Copy, Debug)]
pub struct TcpConnectorConfig {
    pub data_path: DataPath,
    /// Disable Nagle on established connections.
    pub nodelay: bool,
}

impl Default for TcpConnectorConfig {
    fn default() -> Self {
        Self {
            data_path: DataPath::Nbd,
            nodelay: true,
        }
    }
}

/// [`Connector`] creating tokio TCP sockets. Must be used from within a tokio runtime.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    config: TcpConnectorConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConnectorConfig) -> Self {
        Self { config }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        endpoint: &ServerEndpoint,
        notifier: ConnectivityNotifier,
    ) -> TransportResult<Box<dyn Transport>> {
        if !endpoint.is_tcp_stream() {
            return Err(TransportError::with_message(
                TransportErrorKind::Unsupported,
                format!("unsupported socket parameters for {endpoint}"),
            )
            .with_code(errno::EPROTONOSUPPORT));
        }
        let runtime = Handle::try_current().map_err(|err| {
            TransportError::with_message(TransportErrorKind::Io, format!("no runtime: {err}"))
        })?;
        let addr = endpoint.addr;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if self.config.nodelay {
            socket.set_nodelay(true)?;
        }
        // Errors the kernel reports right away belong to the caller. Anything in flight
        // completes on the task below.
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => return Err(err.into()),
        }
        let stream = {
            let _runtime = runtime.enter();
            TcpStream::from_std(std::net::TcpStream::from(socket))?
        };

        let link = Arc::new(Link::new(notifier));
        let task_link = link.clone();
        let connect_task = runtime.spawn(async move {
            match established(&stream).await {
                Ok(()) => {
                    if task_link.install(stream).await {
                        task_link.watch().await;
                    }
                }
                Err(err) => task_link.fail_connect(&err),
            }
        });

        Ok(Box::new(TcpTransport {
            link,
            connect_task: Some(connect_task),
            data_path: self.config.data_path,
            next_handle: 1,
        }))
    }
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// State shared between a transport and its in-flight connect task.
struct Link {
    state: AtomicU8,
    connect_errno: AtomicI32,
    stream: Mutex<Option<TcpStream>>,
    notifier: ConnectivityNotifier,
}

impl Link {
    fn new(notifier: ConnectivityNotifier) -> Self {
        Self {
            state: AtomicU8::new(STATE_CONNECTING),
            connect_errno: AtomicI32::new(0),
            stream: Mutex::new(None),
            notifier,
        }
    }

    fn id(&self) -> TransportId {
        self.notifier.transport()
    }

    fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => LinkState::Connecting,
            STATE_CONNECTED => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    async fn install(&self, stream: TcpStream) -> bool {
        let mut slot = self.stream.lock().await;
        if self
            .state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_CONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Superseded while the connect was in flight.
            return false;
        }
        *slot = Some(stream);
        drop(slot);
        debug!(unit = self.notifier.unit(), transport = %self.id(), "connected");
        self.notifier.notify(LinkState::Connected);
        true
    }

    /// Watches an established connection until the peer goes away.
    ///
    /// Only an idle stream is inspected, and only with `MSG_PEEK`, so greeting and reply
    /// bytes stay queued for whoever reads them next. A busy stream reports loss through
    /// the failing read or write instead.
    async fn watch(&self) {
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.state() != LinkState::Connected {
                return;
            }
            let Ok(slot) = self.stream.try_lock() else {
                continue;
            };
            let Some(stream) = slot.as_ref() else {
                return;
            };
            let mut byte = [MaybeUninit::<u8>::uninit(); 1];
            let lost = match SockRef::from(stream).peek(&mut byte) {
                Ok(0) => Some(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(_) => None,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => None,
                Err(err) => Some(err),
            };
            drop(slot);
            if let Some(err) = lost {
                debug!(
                    unit = self.notifier.unit(),
                    transport = %self.id(),
                    error = %err,
                    "peer went away"
                );
                self.mark_disconnected();
                return;
            }
        }
    }

    fn fail_connect(&self, err: &io::Error) {
        self.connect_errno
            .store(err.raw_os_error().unwrap_or(errno::EIO), Ordering::Release);
        warn!(
            unit = self.notifier.unit(),
            transport = %self.id(),
            error = %err,
            "connect failed"
        );
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        if self.state.swap(STATE_DISCONNECTED, Ordering::AcqRel) != STATE_DISCONNECTED {
            self.notifier.notify(LinkState::Disconnected);
        }
    }
}

/// [`Transport`] over a tokio TCP stream.
pub struct TcpTransport {
    link: Arc<Link>,
    connect_task: Option<JoinHandle<()>>,
    data_path: DataPath,
    next_handle: u64,
}

impl TcpTransport {
    fn abort_connect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }

    /// Classify an I/O failure, recording loss of the peer.
    fn io_failure(&self, err: io::Error) -> TransportError {
        let err = TransportError::from(err);
        if err.kind() == TransportErrorKind::Disconnected {
            self.link.mark_disconnected();
        }
        err
    }

    fn protocol_failure(&self, message: String) -> TransportError {
        self.link.mark_disconnected();
        TransportError::with_message(TransportErrorKind::Protocol, message)
    }

    async fn read_remote(&mut self, offset: u64, buf: &mut [u8]) -> TransportResult<()> {
        let length = u32::try_from(buf.len()).map_err(|_| {
            TransportError::with_message(TransportErrorKind::Io, "read length exceeds u32")
        })?;
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);

        let link = self.link.clone();
        let mut slot = link.stream.lock().await;
        let stream = slot.as_mut().ok_or_else(not_connected)?;

        let request = Request::read(handle, offset, length).encode();
        if let Err(err) = stream.write_all(&request).await {
            return Err(self.io_failure(err));
        }
        let mut header = [0u8; REPLY_LEN];
        if let Err(err) = stream.read_exact(&mut header).await {
            return Err(self.io_failure(err));
        }
        let reply = Reply::decode(&header)
            .map_err(|err| self.protocol_failure(format!("decode reply: {err}")))?;
        if reply.handle != handle {
            return Err(self.protocol_failure(format!(
                "reply for handle {:#x}, expected {handle:#x}",
                reply.handle
            )));
        }
        if !reply.is_ok() {
            return Err(TransportError::remote(reply.error));
        }
        if let Err(err) = stream.read_exact(buf).await {
            return Err(self.io_failure(err));
        }
        trace!(transport = %link.id(), offset, length, "read complete");
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn id(&self) -> TransportId {
        self.link.id()
    }

    fn link_state(&self) -> LinkState {
        self.link.state()
    }

    fn connect_error(&self) -> Option<i32> {
        match self.link.connect_errno.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    async fn handshake_read(&mut self) -> TransportResult<Hello> {
        let link = self.link.clone();
        let mut slot = link.stream.lock().await;
        let stream = slot.as_mut().ok_or_else(not_connected)?;
        let mut buf = [0u8; HELLO_LEN];
        if let Err(err) = stream.read_exact(&mut buf).await {
            return Err(self.io_failure(err));
        }
        Hello::decode(&buf).map_err(|err| {
            TransportError::with_message(TransportErrorKind::Protocol, err.to_string())
        })
    }

    async fn transfer(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        direction: Direction,
    ) -> TransportResult<()> {
        if direction == Direction::Write {
            return Err(TransportError::with_message(
                TransportErrorKind::Unsupported,
                "transport does not issue write commands",
            ));
        }
        if !self.is_connected() {
            return Err(not_connected());
        }
        match self.data_path {
            DataPath::Pattern => {
                fill_pattern(offset, buf);
                Ok(())
            }
            DataPath::Nbd => self.read_remote(offset, buf).await,
        }
    }

    async fn shutdown(&mut self) {
        self.abort_connect();
        let stream = self.link.stream.lock().await.take();
        if let Some(mut stream) = stream {
            if let Err(err) = stream.shutdown().await {
                debug!(transport = %self.id(), error = %err, "socket shutdown failed");
            }
        }
        self.link.mark_disconnected();
    }

    async fn close(&mut self) {
        self.abort_connect();
        let stream = self.link.stream.lock().await.take();
        if let Some(mut stream) = stream {
            if self.data_path == DataPath::Nbd && self.is_connected() {
                let disconnect = Request::disconnect(self.next_handle).encode();
                if let Err(err) = stream.write_all(&disconnect).await {
                    debug!(transport = %self.id(), error = %err, "disconnect request failed");
                }
            }
        }
        self.link.mark_disconnected();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.abort_connect();
    }
}

/// Waits for a non-blocking connect to finish.
async fn established(stream: &TcpStream) -> io::Result<()> {
    loop {
        stream.writable().await?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                // Spurious wakeup; clear readiness and wait for the next one.
                let _ = stream.try_io(Interest::WRITABLE, || {
                    Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock))
                });
            }
            Err(err) => return Err(err),
        }
    }
}

fn not_connected() -> TransportError {
    TransportError::with_message(TransportErrorKind::Disconnected, "socket is not connected")
}
