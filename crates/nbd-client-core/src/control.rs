use crate::{
    controller::{ConnectionController, HandshakeResult},
    endpoint::ServerEndpoint,
    error::{not_ready, DeviceError, DeviceErrorKind, DeviceResult},
    record::{clamp_block_size, OpenerId, DEFAULT_BLOCK_SIZE},
    table::DeviceTable,
};
use tracing::{debug, info};

/// Control requests a device-node layer or CLI forwards for one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    GetBlockSize,
    /// Out-of-range values are clamped, never rejected.
    SetBlockSize(i64),
    GetBlockCount,
    Connect(ServerEndpoint),
    ConnectivityCheck,
    Handshake,
    Teardown,
    Open(OpenerId),
    Close(OpenerId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlResponse {
    BlockSize(u32),
    BlockCount(u64),
    Connected(bool),
    Handshake(HandshakeResult),
    Ack,
}

/// Request/response operations on device records.
///
/// Connection-level "no transport" failures surface here as `DeviceNotReady`.
pub struct ControlSurface<'a> {
    table: &'a DeviceTable,
}

impl<'a> ControlSurface<'a> {
    pub(crate) fn new(table: &'a DeviceTable) -> Self {
        Self { table }
    }

    fn controller(&self) -> ConnectionController<'a> {
        self.table.controller()
    }

    pub async fn block_size(&self, unit: usize) -> DeviceResult<u32> {
        Ok(self.table.get(unit)?.lock().await.negotiated_block_size)
    }

    /// Returns the size actually applied.
    pub async fn set_block_size(&self, unit: usize, requested: i64) -> DeviceResult<u32> {
        let applied = clamp_block_size(requested);
        if i64::from(applied) != requested {
            debug!(unit, requested, applied, "block size clamped");
        }
        self.table.get(unit)?.lock().await.negotiated_block_size = applied;
        Ok(applied)
    }

    /// Capacity in negotiated blocks; only answered while a transport is attached.
    pub async fn block_count(&self, unit: usize) -> DeviceResult<u64> {
        let state = self.table.get(unit)?.lock().await;
        if state.connection.is_none() {
            return Err(not_ready(unit));
        }
        Ok(state.capacity_bytes / u64::from(state.negotiated_block_size))
    }

    pub async fn connect(&self, unit: usize, endpoint: ServerEndpoint) -> DeviceResult<()> {
        self.controller().connect(unit, endpoint).await
    }

    pub async fn connectivity_check(&self, unit: usize) -> DeviceResult<bool> {
        self.controller()
            .check_connectivity(unit)
            .await
            .map_err(|err| surface_not_ready(unit, err))
    }

    pub async fn handshake(&self, unit: usize) -> DeviceResult<HandshakeResult> {
        self.controller()
            .validate_handshake(unit)
            .await
            .map_err(|err| surface_not_ready(unit, err))
    }

    pub async fn teardown(&self, unit: usize) -> DeviceResult<()> {
        self.controller().teardown(unit).await
    }

    /// Claim the unit for `opener`. Re-opening by the current owner is allowed.
    pub async fn open(&self, unit: usize, opener: OpenerId) -> DeviceResult<()> {
        let mut state = self.table.get(unit)?.lock().await;
        match state.exclusive_opener {
            Some(owner) if owner != opener => Err(DeviceError::with_message(
                DeviceErrorKind::Busy,
                format!("unit {unit} is held by {owner}"),
            )),
            _ => {
                state.exclusive_opener = Some(opener);
                debug!(unit, %opener, "opened");
                Ok(())
            }
        }
    }

    /// Release the unit and reset its block size. The connection is left alone.
    pub async fn close(&self, unit: usize, opener: OpenerId) -> DeviceResult<()> {
        let mut state = self.table.get(unit)?.lock().await;
        if state.exclusive_opener != Some(opener) {
            return Err(DeviceError::with_message(
                DeviceErrorKind::InvalidState,
                format!("unit {unit} is not held by {opener}"),
            ));
        }
        state.exclusive_opener = None;
        state.negotiated_block_size = DEFAULT_BLOCK_SIZE;
        info!(unit, %opener, "released");
        Ok(())
    }

    pub async fn execute(
        &self,
        unit: usize,
        request: ControlRequest,
    ) -> DeviceResult<ControlResponse> {
        match request {
            ControlRequest::GetBlockSize => {
                self.block_size(unit).await.map(ControlResponse::BlockSize)
            }
            ControlRequest::SetBlockSize(requested) => self
                .set_block_size(unit, requested)
                .await
                .map(ControlResponse::BlockSize),
            ControlRequest::GetBlockCount => {
                self.block_count(unit).await.map(ControlResponse::BlockCount)
            }
            ControlRequest::Connect(endpoint) => {
                self.connect(unit, endpoint).await.map(|()| ControlResponse::Ack)
            }
            ControlRequest::ConnectivityCheck => self
                .connectivity_check(unit)
                .await
                .map(ControlResponse::Connected),
            ControlRequest::Handshake => {
                self.handshake(unit).await.map(ControlResponse::Handshake)
            }
            ControlRequest::Teardown => self.teardown(unit).await.map(|()| ControlResponse::Ack),
            ControlRequest::Open(opener) => {
                self.open(unit, opener).await.map(|()| ControlResponse::Ack)
            }
            ControlRequest::Close(opener) => {
                self.close(unit, opener).await.map(|()| ControlResponse::Ack)
            }
        }
    }
}

fn surface_not_ready(unit: usize, err: DeviceError) -> DeviceError {
    if err.kind() == DeviceErrorKind::NotConnected {
        not_ready(unit)
    } else {
        err
    }
}
