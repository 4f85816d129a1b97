//! In-memory connector and transport for unit tests.

use crate::{
    endpoint::ServerEndpoint,
    transport::{
        ConnectivityNotifier, Connector, Direction, LinkState, Transport, TransportError,
        TransportErrorKind, TransportId, TransportResult,
    },
};
use async_trait::async_trait;
use nbd_proto::{fill_pattern, Hello, HelloFlags, HELLO_LEN};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

pub(crate) fn endpoint(port: u16) -> ServerEndpoint {
    ServerEndpoint::from_socket_addr(([127, 0, 0, 1], port).into())
}

/// Shared view of one fake transport, so tests can flip its state.
pub(crate) struct FakeLink {
    endpoint: ServerEndpoint,
    notifier: ConnectivityNotifier,
    state: Mutex<LinkState>,
    shutdowns: AtomicUsize,
    closes: AtomicUsize,
    transfers: AtomicUsize,
}

impl FakeLink {
    pub(crate) fn endpoint(&self) -> ServerEndpoint {
        self.endpoint
    }

    pub(crate) fn id(&self) -> TransportId {
        self.notifier.transport()
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    /// Change state and report it the way a real transport would.
    pub(crate) fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap() = state;
        self.notifier.notify(state);
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeConnector {
    greeting: Mutex<[u8; HELLO_LEN]>,
    initial: LinkState,
    fail_with: Option<i32>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new(LinkState::Connected)
    }
}

impl FakeConnector {
    /// Transports start in `initial`; greetings advertise a 1 MiB read-only export.
    pub(crate) fn new(initial: LinkState) -> Self {
        Self {
            greeting: Mutex::new(Hello::read_only(1 << 20).encode()),
            initial,
            fail_with: None,
            links: Mutex::new(Vec::new()),
        }
    }

    /// Every connect fails synchronously with `code`.
    pub(crate) fn failing(code: i32) -> Self {
        Self {
            fail_with: Some(code),
            ..Self::default()
        }
    }

    pub(crate) fn set_greeting(&self, greeting: [u8; HELLO_LEN]) {
        *self.greeting.lock().unwrap() = greeting;
    }

    pub(crate) fn set_hello(&self, size_bytes: u64, flags: HelloFlags) {
        self.set_greeting(Hello::new(size_bytes, flags).encode());
    }

    pub(crate) fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        endpoint: &ServerEndpoint,
        notifier: ConnectivityNotifier,
    ) -> TransportResult<Box<dyn Transport>> {
        if let Some(code) = self.fail_with {
            return Err(
                TransportError::with_message(TransportErrorKind::Io, "connect refused")
                    .with_code(code),
            );
        }
        let link = Arc::new(FakeLink {
            endpoint: *endpoint,
            notifier,
            state: Mutex::new(self.initial),
            shutdowns: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(Box::new(FakeTransport {
            link,
            greeting: *self.greeting.lock().unwrap(),
        }))
    }
}

struct FakeTransport {
    link: Arc<FakeLink>,
    greeting: [u8; HELLO_LEN],
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> TransportId {
        self.link.id()
    }

    fn link_state(&self) -> LinkState {
        self.link.state()
    }

    fn connect_error(&self) -> Option<i32> {
        None
    }

    async fn handshake_read(&mut self) -> TransportResult<Hello> {
        if !self.is_connected() {
            return Err(TransportError::new(TransportErrorKind::Disconnected));
        }
        Hello::decode(&self.greeting).map_err(|err| {
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
            return Err(TransportError::new(TransportErrorKind::Unsupported));
        }
        // Give concurrent callers a chance to queue on the record lock mid-transfer.
        tokio::task::yield_now().await;
        if !self.is_connected() {
            return Err(TransportError::new(TransportErrorKind::Disconnected));
        }
        self.link.transfers.fetch_add(1, Ordering::SeqCst);
        fill_pattern(offset, buf);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.link.shutdowns.fetch_add(1, Ordering::SeqCst);
        *self.link.state.lock().unwrap() = LinkState::Disconnected;
    }

    async fn close(&mut self) {
        self.link.closes.fetch_add(1, Ordering::SeqCst);
        *self.link.state.lock().unwrap() = LinkState::Disconnected;
    }
}
