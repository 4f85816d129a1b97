use crate::block::{BlockSource, EINVAL};
use anyhow::{bail, ensure, Context, Result};
use nbd_proto::{Command, Hello, ProtoError, Reply, Request, REQUEST_LEN};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};
use tracing::{debug, info, trace, warn};

/// Largest read a single request may ask for.
pub const MAX_REQUEST_BYTES: u32 = 32 << 20;

const EPERM: u32 = 1;

/// Serve one client: send the oldstyle greeting, then answer requests until the client
/// disconnects or sends `NBD_CMD_DISC`.
///
/// The export is read-only: writes are drained and answered with `EPERM`, unknown
/// commands and out-of-range reads with `EINVAL`.
pub async fn serve_connection<S>(mut stream: S, source: &dyn BlockSource) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let block_size = source.block_size();
    ensure!(block_size > 0, "block source reports zero block size");
    let total_blocks = source
        .total_blocks()
        .await
        .map_err(|err| anyhow::anyhow!("query export size: {err}"))?;
    let size_bytes = total_blocks
        .checked_mul(u64::from(block_size))
        .context("export size overflows u64")?;

    stream
        .write_all(&Hello::read_only(size_bytes).encode())
        .await
        .context("send greeting")?;
    debug!(size_bytes, "greeting sent");

    let mut header = [0u8; REQUEST_LEN];
    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("client closed connection");
                return Ok(());
            }
            Err(err) => return Err(err).context("read request header"),
        }
        let request = match Request::decode(&header) {
            Ok(request) => request,
            Err(ProtoError::InvalidCommand(code)) => {
                warn!(code, "unknown command");
                send_reply(&mut stream, Reply::new(EINVAL, Request::peek_handle(&header))).await?;
                continue;
            }
            Err(err) => bail!("malformed request: {err}"),
        };

        match request.command {
            Command::Disconnect => {
                debug!("client requested disconnect");
                return Ok(());
            }
            Command::Write => {
                let expected = u64::from(request.length);
                let mut payload = (&mut stream).take(expected);
                let drained = tokio::io::copy(&mut payload, &mut tokio::io::sink())
                    .await
                    .context("drain write payload")?;
                ensure!(drained == expected, "client closed during write payload");
                debug!(offset = request.offset, length = request.length, "rejecting write");
                send_reply(&mut stream, Reply::new(EPERM, request.handle)).await?;
            }
            Command::Read => {
                match read_range(source, size_bytes, request.offset, request.length).await {
                    Ok(data) => {
                        send_reply(&mut stream, Reply::ok(request.handle)).await?;
                        stream.write_all(&data).await.context("send read payload")?;
                        trace!(offset = request.offset, length = request.length, "read served");
                    }
                    Err(code) => {
                        debug!(
                            offset = request.offset,
                            length = request.length,
                            code,
                            "read rejected"
                        );
                        send_reply(&mut stream, Reply::new(code, request.handle)).await?;
                    }
                }
            }
        }
    }
}

/// Accept clients on `listener` until the task is cancelled or accepting fails.
pub async fn serve(listener: TcpListener, source: Arc<dyn BlockSource>) -> Result<()> {
    let local = listener.local_addr().context("listener address")?;
    info!(%local, "export listening");
    loop {
        let (stream, peer) = listener.accept().await.context("accept client")?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "set_nodelay failed");
        }
        let source = source.clone();
        tokio::spawn(async move {
            info!(%peer, "client connected");
            match serve_connection(stream, source.as_ref()).await {
                Ok(()) => info!(%peer, "client done"),
                Err(err) => warn!(%peer, error = %format!("{err:#}"), "client session failed"),
            }
        });
    }
}

async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&reply.encode())
        .await
        .context("send reply header")
}

/// Bytes `[offset, offset + length)` of the export, or the errno to reply with.
async fn read_range(
    source: &dyn BlockSource,
    size_bytes: u64,
    offset: u64,
    length: u32,
) -> core::result::Result<Vec<u8>, u32> {
    if length > MAX_REQUEST_BYTES {
        return Err(EINVAL);
    }
    let end = offset.checked_add(u64::from(length)).ok_or(EINVAL)?;
    if end > size_bytes {
        return Err(EINVAL);
    }
    if length == 0 {
        return Ok(Vec::new());
    }

    let block_size = u64::from(source.block_size());
    let first = offset / block_size;
    let last = end.div_ceil(block_size);
    let covering = usize::try_from((last - first) * block_size).map_err(|_| EINVAL)?;
    let mut buf = vec![0u8; covering];
    source
        .read_blocks(first, &mut buf)
        .await
        .map_err(|err| err.errno())?;
    let skip = (offset - first * block_size) as usize;
    buf.drain(..skip);
    buf.truncate(length as usize);
    Ok(buf)
}
