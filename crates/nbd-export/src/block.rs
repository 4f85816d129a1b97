use async_trait::async_trait;
use std::{fmt, io};

/// Reply codes for failed reads.
pub const EIO: u32 = 5;
pub const EINVAL: u32 = 22;

pub type BlockSourceResult<T> = core::result::Result<T, BlockSourceError>;

/// Describes the failure category for block source operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSourceErrorKind {
    InvalidInput,
    OutOfRange,
    Io,
}

/// Error surfaced by [`BlockSource`] implementations.
#[derive(Clone, Debug)]
pub struct BlockSourceError {
    kind: BlockSourceErrorKind,
    message: Option<String>,
}

impl BlockSourceError {
    pub const fn new(kind: BlockSourceErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: BlockSourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> BlockSourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Error code sent to the client when a read fails this way.
    pub fn errno(&self) -> u32 {
        match self.kind {
            BlockSourceErrorKind::InvalidInput | BlockSourceErrorKind::OutOfRange => EINVAL,
            BlockSourceErrorKind::Io => EIO,
        }
    }
}

impl fmt::Display for BlockSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for BlockSourceError {}

pub(crate) fn io_error(err: io::Error) -> BlockSourceError {
    BlockSourceError::with_message(BlockSourceErrorKind::Io, err.to_string())
}

/// Read-only block storage an export serves from.
///
/// Callers pass buffers whose lengths are exact multiples of the reported block size.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Logical block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of logical blocks available.
    async fn total_blocks(&self) -> BlockSourceResult<u64>;

    /// Read one or more blocks starting at `lba` into `buf`.
    async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> BlockSourceResult<usize>;
}

pub(crate) fn ensure_aligned(block_size: u32, len: usize) -> BlockSourceResult<()> {
    if len % block_size as usize != 0 {
        return Err(BlockSourceError::with_message(
            BlockSourceErrorKind::InvalidInput,
            "buffer length must align to block size",
        ));
    }
    Ok(())
}

pub(crate) fn ensure_in_range(lba: u64, blocks: u64, total: u64) -> BlockSourceResult<()> {
    let end = lba.checked_add(blocks).ok_or_else(|| {
        BlockSourceError::with_message(BlockSourceErrorKind::OutOfRange, "lba overflow")
    })?;
    if end > total {
        return Err(BlockSourceError::with_message(
            BlockSourceErrorKind::OutOfRange,
            "request past end of device",
        ));
    }
    Ok(())
}
