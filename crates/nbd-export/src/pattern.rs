use crate::block::{ensure_aligned, ensure_in_range, BlockSource, BlockSourceResult};
use anyhow::{ensure, Result};
use async_trait::async_trait;
use nbd_proto::fill_pattern;

/// Block source whose byte at absolute offset `o` is `o mod 256`.
///
/// Serves the same bytes a client configured for reference data would produce locally,
/// so wire reads can be checked against it.
pub struct PatternBlockSource {
    block_size: u32,
    blocks: u64,
}

impl PatternBlockSource {
    pub fn new(block_size: u32, total_blocks: u64) -> Result<Self> {
        ensure!(
            block_size.is_power_of_two(),
            "block size must be a power of two"
        );
        ensure!(total_blocks > 0, "total_blocks must be non-zero");
        Ok(Self {
            block_size,
            blocks: total_blocks,
        })
    }
}

#[async_trait]
impl BlockSource for PatternBlockSource {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    async fn total_blocks(&self) -> BlockSourceResult<u64> {
        Ok(self.blocks)
    }

    async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> BlockSourceResult<usize> {
        ensure_aligned(self.block_size, buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }
        let blocks = (buf.len() / self.block_size as usize) as u64;
        ensure_in_range(lba, blocks, self.blocks)?;
        fill_pattern(lba * u64::from(self.block_size), buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockSourceErrorKind;

    #[tokio::test]
    async fn reads_offset_pattern() {
        let source = PatternBlockSource::new(512, 4).unwrap();
        let mut buf = vec![0u8; 1024];
        assert_eq!(source.read_blocks(1, &mut buf).await.unwrap(), 1024);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[255], 255);
        assert_eq!(buf[256], 0);
    }

    #[tokio::test]
    async fn rejects_out_of_range_and_unaligned() {
        let source = PatternBlockSource::new(512, 4).unwrap();
        let mut buf = vec![0u8; 1024];
        let err = source.read_blocks(3, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), BlockSourceErrorKind::OutOfRange);
        let err = source.read_blocks(0, &mut buf[..100]).await.unwrap_err();
        assert_eq!(err.kind(), BlockSourceErrorKind::InvalidInput);
    }

    #[test]
    fn new_validates_geometry() {
        assert!(PatternBlockSource::new(500, 1).is_err());
        assert!(PatternBlockSource::new(512, 0).is_err());
    }
}
