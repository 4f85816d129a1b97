use crate::{
    error::{not_ready, DeviceError, DeviceErrorKind, DeviceResult},
    metrics,
    table::DeviceTable,
    transport::Direction,
};
use std::time::Instant;
use tracing::{debug, trace};

/// One block-range transfer against a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub unit: usize,
    /// Counted in the table's transfer block size, not the negotiated block size.
    pub start_block: u64,
    pub length: usize,
    pub direction: Direction,
}

impl BlockRequest {
    pub fn read(unit: usize, start_block: u64, length: usize) -> Self {
        Self {
            unit,
            start_block,
            length,
            direction: Direction::Read,
        }
    }
}

/// Terminal status of a successful request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub transferred: usize,
    pub residual: usize,
}

pub struct IoDispatcher<'a> {
    table: &'a DeviceTable,
}

impl<'a> IoDispatcher<'a> {
    pub(crate) fn new(table: &'a DeviceTable) -> Self {
        Self { table }
    }

    /// Check the unit and move `request.length` bytes through `buf`.
    ///
    /// The record lock is held from the connectivity check until the transport returns,
    /// so a concurrent teardown either happens entirely before (the request fails as not
    /// ready) or entirely after (the request completes against the old transport).
    /// Transfer failures are returned as-is and leave the record untouched.
    pub async fn dispatch(
        &self,
        request: BlockRequest,
        buf: &mut [u8],
    ) -> DeviceResult<Completion> {
        let record = self.table.get(request.unit)?;
        let offset = request
            .start_block
            .checked_mul(u64::from(self.table.transfer_block_size()))
            .ok_or_else(|| {
                DeviceError::with_message(
                    DeviceErrorKind::InvalidArgument,
                    format!("block {} overflows the byte offset", request.start_block),
                )
            })?;

        let mut guard = record.lock().await;
        let state = &mut *guard;
        let transport = match state.connection.as_mut() {
            Some(transport) if transport.is_connected() => transport,
            _ => return Err(not_ready(request.unit)),
        };
        if buf.len() < request.length {
            return Err(DeviceError::with_message(
                DeviceErrorKind::Io,
                format!(
                    "buffer holds {} bytes, request needs {}",
                    buf.len(),
                    request.length
                ),
            ));
        }
        if request.direction == Direction::Write && !state.writable {
            return Err(DeviceError::with_message(
                DeviceErrorKind::ReadOnly,
                format!("unit {} is read-only", request.unit),
            ));
        }

        let started = Instant::now();
        let result = transport
            .transfer(offset, &mut buf[..request.length], request.direction)
            .await;
        let ok = result.is_ok();
        match request.direction {
            Direction::Read => metrics::observe_read(request.length, started.elapsed(), ok),
            Direction::Write => metrics::observe_write(request.length, started.elapsed(), ok),
        }
        if let Err(err) = result {
            debug!(
                unit = request.unit,
                offset,
                length = request.length,
                error = %err,
                "transfer failed"
            );
            return Err(err.into());
        }
        trace!(unit = request.unit, offset, length = request.length, "transfer complete");
        Ok(Completion {
            transferred: request.length,
            residual: 0,
        })
    }
}
