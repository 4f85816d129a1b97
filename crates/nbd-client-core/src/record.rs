use crate::{endpoint::ServerEndpoint, transport::Transport};
use std::fmt;
use tokio::sync::{Mutex, MutexGuard};

/// Client-visible block size a record starts with and falls back to.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Identity of whoever holds a unit open (a process id in the device-node layer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpenerId(pub u64);

impl fmt::Display for OpenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opener {}", self.0)
    }
}

/// Values outside `(0, 512]` become 512.
pub fn clamp_block_size(requested: i64) -> u32 {
    if requested <= 0 || requested > i64::from(DEFAULT_BLOCK_SIZE) {
        DEFAULT_BLOCK_SIZE
    } else {
        requested as u32
    }
}

/// Mutable half of a [`DeviceRecord`]; only reachable through the record lock.
pub struct DeviceState {
    pub(crate) connection: Option<Box<dyn Transport>>,
    pub(crate) server_endpoint: Option<ServerEndpoint>,
    pub(crate) capacity_bytes: u64,
    pub(crate) negotiated_block_size: u32,
    pub(crate) exclusive_opener: Option<OpenerId>,
    pub(crate) writable: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            connection: None,
            server_endpoint: None,
            capacity_bytes: 0,
            negotiated_block_size: DEFAULT_BLOCK_SIZE,
            exclusive_opener: None,
            writable: false,
        }
    }
}

impl DeviceState {
    pub fn is_attached(&self) -> bool {
        self.connection.is_some()
    }

    pub fn server_endpoint(&self) -> Option<&ServerEndpoint> {
        self.server_endpoint.as_ref()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn negotiated_block_size(&self) -> u32 {
        self.negotiated_block_size
    }

    pub fn exclusive_opener(&self) -> Option<OpenerId> {
        self.exclusive_opener
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Reset everything except the connection, which the caller must already have taken.
    pub(crate) fn wipe(&mut self) {
        debug_assert!(self.connection.is_none());
        *self = Self::default();
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("connection", &self.connection.as_ref().map(|t| t.id()))
            .field("server_endpoint", &self.server_endpoint)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("negotiated_block_size", &self.negotiated_block_size)
            .field("exclusive_opener", &self.exclusive_opener)
            .field("writable", &self.writable)
            .finish()
    }
}

/// One arena slot of the device table.
///
/// The lock is a tokio mutex and is held across network awaits (handshake reads and
/// transfers), so all work on one unit is serialized while distinct units proceed in
/// parallel.
pub struct DeviceRecord {
    unit: usize,
    state: Mutex<DeviceState>,
}

impl DeviceRecord {
    pub(crate) fn new(unit: usize) -> Self {
        Self {
            unit,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub async fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().await
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}
