use crate::{
    control::{ControlRequest, ControlResponse},
    dispatch::{BlockRequest, Completion},
    error::DeviceResult,
    record::OpenerId,
    table::DeviceTable,
    transport::Direction,
};
use async_trait::async_trait;
use std::sync::Arc;

/// What a host storage object needs from one unit.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    fn unit(&self) -> usize;

    async fn open(&self, opener: OpenerId) -> DeviceResult<()>;

    async fn close(&self, opener: OpenerId) -> DeviceResult<()>;

    /// Negotiated block size reported to openers.
    async fn block_size(&self) -> DeviceResult<u32>;

    /// Transfer `buf.len()` bytes starting at transfer block `start_block`.
    async fn strategy(
        &self,
        start_block: u64,
        direction: Direction,
        buf: &mut [u8],
    ) -> DeviceResult<Completion>;

    async fn ioctl(&self, request: ControlRequest) -> DeviceResult<ControlResponse>;
}

/// [`BlockDevice`] for one unit of a shared table.
#[derive(Clone)]
pub struct UnitHandle {
    table: Arc<DeviceTable>,
    unit: usize,
}

impl UnitHandle {
    pub(crate) fn new(table: Arc<DeviceTable>, unit: usize) -> Self {
        Self { table, unit }
    }

    pub fn table(&self) -> &Arc<DeviceTable> {
        &self.table
    }
}

#[async_trait]
impl BlockDevice for UnitHandle {
    fn unit(&self) -> usize {
        self.unit
    }

    async fn open(&self, opener: OpenerId) -> DeviceResult<()> {
        self.table.control_surface().open(self.unit, opener).await
    }

    async fn close(&self, opener: OpenerId) -> DeviceResult<()> {
        self.table.control_surface().close(self.unit, opener).await
    }

    async fn block_size(&self) -> DeviceResult<u32> {
        self.table.control_surface().block_size(self.unit).await
    }

    async fn strategy(
        &self,
        start_block: u64,
        direction: Direction,
        buf: &mut [u8],
    ) -> DeviceResult<Completion> {
        let request = BlockRequest {
            unit: self.unit,
            start_block,
            length: buf.len(),
            direction,
        };
        self.table.dispatcher().dispatch(request, buf).await
    }

    async fn ioctl(&self, request: ControlRequest) -> DeviceResult<ControlResponse> {
        self.table.control(self.unit, request).await
    }
}
