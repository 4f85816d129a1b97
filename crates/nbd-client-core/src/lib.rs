//! Device session engine: a fixed table of block units, each backed by an NBD transport.
//!
//! Every record is guarded by one async lock. Control operations, I/O dispatch and
//! connectivity events on the same unit are totally ordered by that lock; units are
//! independent of each other.

pub mod control;
pub mod controller;
pub mod device;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod record;
pub mod table;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod testing;

pub use control::{ControlRequest, ControlResponse, ControlSurface};
pub use controller::{ConnectionController, ConnectionState, HandshakeResult};
pub use device::{BlockDevice, UnitHandle};
pub use dispatch::{BlockRequest, Completion, IoDispatcher};
pub use endpoint::{resolve, AddressFamily, ServerEndpoint, SocketType};
pub use error::{errno, DeviceError, DeviceErrorKind, DeviceResult};
pub use record::{clamp_block_size, DeviceRecord, DeviceState, OpenerId, DEFAULT_BLOCK_SIZE};
pub use table::{DeviceTable, TableConfig, DEFAULT_DEVICE_COUNT};
pub use tcp::{DataPath, TcpConnector, TcpConnectorConfig, TcpTransport};
pub use transport::{
    ConnectivityEvent, ConnectivityNotifier, Connector, Direction, LinkState, Transport,
    TransportError, TransportErrorKind, TransportId, TransportResult,
};
