use crate::block::{
    ensure_aligned, ensure_in_range, io_error, BlockSource, BlockSourceError,
    BlockSourceErrorKind, BlockSourceResult,
};
use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use std::{io, os::unix::fs::FileExt, path::Path};
use tokio::{fs::OpenOptions, task};
use tracing::debug;

/// Read-only block source backed by a regular file or device node.
///
/// A trailing partial block is not exported.
pub struct FileBlockSource {
    file: std::fs::File,
    block_size: u32,
    blocks: u64,
}

impl FileBlockSource {
    pub async fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        ensure!(
            block_size.is_power_of_two(),
            "block size must be a power of two"
        );
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .with_context(|| format!("open {} read-only", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        debug!(path = %path.display(), len, "opened file block source");
        Ok(Self {
            file: file.into_std().await,
            block_size,
            blocks: len / u64::from(block_size),
        })
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.file.try_clone()?;
        let len = buf.len();
        let tmp = task::spawn_blocking(move || {
            let mut tmp = vec![0u8; len];
            let mut read = 0;
            while read < len {
                let n = file.read_at(&mut tmp[read..], offset + read as u64)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read from block file",
                    ));
                }
                read += n;
            }
            Ok::<_, io::Error>(tmp)
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;
        buf.copy_from_slice(&tmp);
        Ok(())
    }
}

#[async_trait]
impl BlockSource for FileBlockSource {
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
        let offset = lba.checked_mul(u64::from(self.block_size)).ok_or_else(|| {
            BlockSourceError::with_message(BlockSourceErrorKind::OutOfRange, "lba overflow")
        })?;
        self.read_at(offset, buf).await.map_err(io_error)?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_whole_blocks_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..1300u32).map(|i| (i * 7) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let source = FileBlockSource::open(file.path(), 512).await.unwrap();
        assert_eq!(source.total_blocks().await.unwrap(), 2);

        let mut buf = vec![0u8; 512];
        source.read_blocks(1, &mut buf).await.unwrap();
        assert_eq!(&buf[..], &data[512..1024]);

        let err = source.read_blocks(2, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), BlockSourceErrorKind::OutOfRange);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileBlockSource::open(dir.path().join("absent.img"), 512)
            .await
            .err()
            .expect("missing file");
        assert!(err.to_string().contains("absent.img"));
    }
}
