use crate::endpoint::ServerEndpoint;
use async_trait::async_trait;
use nbd_proto::Hello;
use std::{fmt, io};
use tokio::sync::mpsc;

pub type TransportResult<T> = core::result::Result<T, TransportError>;

/// Describes the failure category for transport operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    Io,
    /// The socket is not (or no longer) connected.
    Disconnected,
    /// Bytes on the wire did not match the protocol.
    Protocol,
    /// The server answered a request with a non-zero error.
    Remote,
    Unsupported,
}

/// Error surfaced by [`Transport`] and [`Connector`] implementations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    code: Option<i32>,
    message: Option<String>,
}

impl TransportError {
    pub const fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            code: None,
            message: None,
        }
    }

    pub fn with_message(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: Some(message.into()),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Server reply carrying `errno`.
    pub fn remote(errno: u32) -> Self {
        Self {
            kind: TransportErrorKind::Remote,
            code: i32::try_from(errno).ok(),
            message: Some(format!("server replied with error {errno}")),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => TransportErrorKind::Disconnected,
            io::ErrorKind::Unsupported => TransportErrorKind::Unsupported,
            _ => TransportErrorKind::Io,
        };
        Self {
            kind,
            code: err.raw_os_error(),
            message: Some(err.to_string()),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for TransportError {}

/// Identity of one transport instance. Never reused within a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Socket-level connectivity as reported by a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Connect initiated, not yet established.
    Connecting,
    Connected,
    /// Connect failed, peer closed, or the transport was shut down.
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Connectivity change reported by a transport on behalf of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub unit: usize,
    pub transport: TransportId,
    pub state: LinkState,
}

/// Handed to a transport at creation so it can report connectivity changes.
#[derive(Clone, Debug)]
pub struct ConnectivityNotifier {
    unit: usize,
    transport: TransportId,
    tx: mpsc::UnboundedSender<ConnectivityEvent>,
}

impl ConnectivityNotifier {
    pub fn new(
        unit: usize,
        transport: TransportId,
        tx: mpsc::UnboundedSender<ConnectivityEvent>,
    ) -> Self {
        Self { unit, transport, tx }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    /// Queue an event. Dropped silently once the table is gone.
    pub fn notify(&self, state: LinkState) {
        let _ = self.tx.send(ConnectivityEvent {
            unit: self.unit,
            transport: self.transport,
            state,
        });
    }
}

/// Socket-bound session with one remote server.
///
/// All methods are invoked while the caller holds the owning unit's record lock, so
/// implementations never see two concurrent calls.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Current connectivity. Must not block.
    fn link_state(&self) -> LinkState;

    fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// OS error number of the failed connect attempt, if the link failed that way.
    fn connect_error(&self) -> Option<i32> {
        None
    }

    /// Read the fixed-size greeting in full and validate its magic.
    async fn handshake_read(&mut self) -> TransportResult<Hello>;

    /// Move `buf.len()` bytes at byte `offset` of the remote store.
    async fn transfer(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        direction: Direction,
    ) -> TransportResult<()>;

    /// Shut the socket down in both directions; the transport stays in `Disconnected`.
    async fn shutdown(&mut self);

    /// Release the socket. Idempotent.
    async fn close(&mut self);
}

/// Creates transports. `connect` must return as soon as the connect is in flight.
///
/// A connect the socket layer rejects immediately is returned as an error carrying the
/// OS error number, and no transport is created.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &ServerEndpoint,
        notifier: ConnectivityNotifier,
    ) -> TransportResult<Box<dyn Transport>>;
}
