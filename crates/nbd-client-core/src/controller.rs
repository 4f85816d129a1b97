use crate::{
    endpoint::ServerEndpoint,
    error::{DeviceError, DeviceErrorKind, DeviceResult},
    metrics,
    table::DeviceTable,
    transport::{ConnectivityEvent, LinkState},
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-unit view of the connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport associated.
    Idle,
    Connecting,
    Connected,
    /// Transport still associated but closed or failed; only `connect` or `teardown` help.
    Disconnected,
}

impl From<LinkState> for ConnectionState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Connecting => Self::Connecting,
            LinkState::Connected => Self::Connected,
            LinkState::Disconnected => Self::Disconnected,
        }
    }
}

/// Parameters learned from a valid greeting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeResult {
    pub capacity_bytes: u64,
    pub writable: bool,
    /// Whether the greeting carried the oldstyle size and flags fields.
    pub oldstyle: bool,
}

/// Drives connect, handshake validation and teardown for the units of one table.
pub struct ConnectionController<'a> {
    table: &'a DeviceTable,
}

impl<'a> ConnectionController<'a> {
    pub(crate) fn new(table: &'a DeviceTable) -> Self {
        Self { table }
    }

    /// Start a non-blocking connect to `endpoint`.
    ///
    /// Fails with `AlreadyConnected` while the current transport is established. A
    /// transport that is still connecting or has gone down is closed and replaced. The
    /// endpoint is recorded before the attempt, so it survives a failed connect.
    pub async fn connect(&self, unit: usize, endpoint: ServerEndpoint) -> DeviceResult<()> {
        let record = self.table.get(unit)?;
        let started = Instant::now();
        let mut state = record.lock().await;
        if let Some(current) = state.connection.as_ref() {
            if current.is_connected() {
                return Err(DeviceError::with_message(
                    DeviceErrorKind::AlreadyConnected,
                    format!("unit {unit} is connected via {}", current.id()),
                ));
            }
        }

        state.server_endpoint = Some(endpoint);
        state.capacity_bytes = 0;
        state.writable = false;
        if let Some(mut stale) = state.connection.take() {
            debug!(unit, transport = %stale.id(), "superseding stale transport");
            stale.close().await;
            metrics::unit_detached();
        }

        match self
            .table
            .connector()
            .connect(&endpoint, self.table.notifier(unit))
        {
            Ok(transport) => {
                info!(unit, transport = %transport.id(), server = %endpoint, "connect initiated");
                state.connection = Some(transport);
                metrics::unit_attached();
                metrics::observe_connect(started.elapsed(), true);
                Ok(())
            }
            Err(err) => {
                warn!(unit, server = %endpoint, error = %err, "connect failed");
                metrics::observe_connect(started.elapsed(), false);
                Err(DeviceError::connect_failed(err))
            }
        }
    }

    /// Whether the associated transport reports an established connection. Never waits
    /// on the network.
    pub async fn check_connectivity(&self, unit: usize) -> DeviceResult<bool> {
        let state = self.table.get(unit)?.lock().await;
        match state.connection.as_ref() {
            Some(transport) => Ok(transport.is_connected()),
            None => Err(not_connected(unit)),
        }
    }

    /// Read and validate the greeting, recording capacity and writability.
    ///
    /// Only an established transport is read from; one that is still connecting or has
    /// already gone down yields `DeviceNotReady` and is left untouched.
    ///
    /// On a protocol or I/O failure the transport is shut down in both directions and
    /// left associated in the `Disconnected` state: connectivity checks report `false`,
    /// I/O fails as not ready, and a later `connect` or `teardown` replaces it.
    pub async fn validate_handshake(&self, unit: usize) -> DeviceResult<HandshakeResult> {
        let mut guard = self.table.get(unit)?.lock().await;
        let state = &mut *guard;
        let transport = state.connection.as_mut().ok_or_else(|| not_connected(unit))?;
        if !transport.is_connected() {
            return Err(DeviceError::with_message(
                DeviceErrorKind::DeviceNotReady,
                format!("unit {unit} transport is {:?}", transport.link_state()),
            ));
        }

        let started = Instant::now();
        match transport.handshake_read().await {
            Ok(hello) => {
                let result = if hello.is_oldstyle() {
                    HandshakeResult {
                        capacity_bytes: hello.size_bytes,
                        writable: hello.writable(),
                        oldstyle: true,
                    }
                } else {
                    warn!(
                        unit,
                        magic = format_args!("{:#018x}", hello.cliserv_magic),
                        "greeting is not oldstyle; capacity unknown"
                    );
                    HandshakeResult {
                        capacity_bytes: 0,
                        writable: false,
                        oldstyle: false,
                    }
                };
                state.capacity_bytes = result.capacity_bytes;
                state.writable = result.writable;
                metrics::observe_handshake(started.elapsed(), true);
                info!(
                    unit,
                    capacity = result.capacity_bytes,
                    writable = result.writable,
                    "handshake complete"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(unit, transport = %transport.id(), error = %err, "handshake failed");
                transport.shutdown().await;
                metrics::observe_handshake(started.elapsed(), false);
                Err(err.into())
            }
        }
    }

    /// Close the transport and wipe the record.
    pub async fn teardown(&self, unit: usize) -> DeviceResult<()> {
        let started = Instant::now();
        let mut state = self.table.get(unit)?.lock().await;
        let Some(mut transport) = state.connection.take() else {
            return Err(DeviceError::with_message(
                DeviceErrorKind::NothingToTeardown,
                format!("unit {unit} has no transport"),
            ));
        };
        let id = transport.id();
        transport.close().await;
        state.wipe();
        metrics::unit_detached();
        metrics::observe_teardown(started.elapsed());
        info!(unit, transport = %id, "torn down");
        Ok(())
    }

    /// Apply a connectivity report. Returns `false` when the reporting transport is no
    /// longer the one associated with the unit; such reports are ignored.
    ///
    /// The record is never wiped here; the state change is only observed.
    pub async fn on_connectivity_change(&self, event: ConnectivityEvent) -> bool {
        let Ok(record) = self.table.get(event.unit) else {
            warn!(unit = event.unit, "connectivity event for unknown unit");
            return false;
        };
        let state = record.lock().await;
        match state.connection.as_ref() {
            Some(transport) if transport.id() == event.transport => {
                match event.state {
                    LinkState::Disconnected => warn!(
                        unit = event.unit,
                        transport = %event.transport,
                        "transport disconnected"
                    ),
                    other => info!(
                        unit = event.unit,
                        transport = %event.transport,
                        state = ?other,
                        "transport state changed"
                    ),
                }
                true
            }
            _ => {
                debug!(
                    unit = event.unit,
                    transport = %event.transport,
                    state = ?event.state,
                    "ignoring event from replaced transport"
                );
                false
            }
        }
    }

    pub async fn connection_state(&self, unit: usize) -> DeviceResult<ConnectionState> {
        let state = self.table.get(unit)?.lock().await;
        Ok(state
            .connection
            .as_ref()
            .map_or(ConnectionState::Idle, |t| t.link_state().into()))
    }

    /// Poll until the unit's transport is established.
    ///
    /// Fails with `ConnectFailed` (carrying the socket error when known) once the
    /// transport goes down, and with `TimedOut` after `timeout`.
    pub async fn wait_connected(
        &self,
        unit: usize,
        timeout: Duration,
        poll_interval: Duration,
    ) -> DeviceResult<()> {
        let record = self.table.get(unit)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = record.lock().await;
                let transport = state.connection.as_ref().ok_or_else(|| not_connected(unit))?;
                match transport.link_state() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Disconnected => {
                        return Err(DeviceError::with_message(
                            DeviceErrorKind::ConnectFailed,
                            format!("unit {unit} transport {} went down", transport.id()),
                        )
                        .with_code(transport.connect_error()));
                    }
                    LinkState::Connecting => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeviceError::with_message(
                    DeviceErrorKind::TimedOut,
                    format!("unit {unit} not connected after {timeout:?}"),
                ));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn not_connected(unit: usize) -> DeviceError {
    DeviceError::with_message(
        DeviceErrorKind::NotConnected,
        format!("unit {unit} has no transport"),
    )
}
