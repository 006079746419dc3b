//! NBD server on a unix-domain socket.  Implements the fixed-newstyle
//! handshake (`LIST`, `ABORT`, `GO`; anything else is answered with
//! `ERR_UNSUP`) and the simple-reply transmission phase, translating
//! `READ`/`WRITE` into backend calls.  One client owns the export at a
//! time; the accept loop takes the next connection only after the current
//! one ends.

use crate::backend::Backend;
use anyhow::{bail, Context, Result};
use log::*;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;

const NBD_MAGIC: u64 = 0x4e42444d41474943;
const OPTION_MAGIC: u64 = 0x49484156454f5054;
const OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;
const REQUEST_MAGIC: u32 = 0x25609513;
const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;

const OPT_ABORT: u32 = 2;
const OPT_LIST: u32 = 3;
const OPT_GO: u32 = 7;

const REP_ACK: u32 = 1;
const REP_SERVER: u32 = 2;
const REP_INFO: u32 = 3;
const REP_ERR_UNSUP: u32 = (1 << 31) + 1;

const INFO_EXPORT: u16 = 0;
const FLAG_HAS_FLAGS: u16 = 1 << 0;

const CMD_READ: u16 = 0;
const CMD_WRITE: u16 = 1;
const CMD_DISC: u16 = 2;
const CMD_FLUSH: u16 = 3;
const CMD_TRIM: u16 = 4;

const MAX_OPTION_LENGTH: u32 = 65536;
const MAX_REQUEST_LENGTH: u32 = 268_435_456;

const EIO: u32 = 5;
const EINVAL: u32 = 22;

const EXPORT_NAME: &str = "sia";

pub struct NbdServer {
    socket_path: PathBuf,
    backend: Backend,
}

impl NbdServer {
    pub fn new(socket_path: PathBuf, backend: Backend) -> NbdServer {
        NbdServer {
            socket_path,
            backend,
        }
    }

    /// Bind the socket and spawn the accept loop.
    pub fn start(self) -> Result<()> {
        info!("listening on {}", self.socket_path.display());
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding {}", self.socket_path.display()))?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _)) => {
                        info!("accepted connection on {}", self.socket_path.display());
                        if let Err(e) = handle_connection(&mut stream, &self.backend).await {
                            error!("closing connection due to error: {:#}", e);
                        }
                    }
                    Err(e) => {
                        warn!("accept() on {} failed: {}", self.socket_path.display(), e);
                    }
                }
            }
        });

        Ok(())
    }
}

async fn handle_connection<S>(stream: &mut S, backend: &Backend) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !negotiate(stream, backend.size()).await? {
        return Ok(());
    }
    transmission(stream, backend).await
}

async fn send_option_reply<S>(
    stream: &mut S,
    option_id: u32,
    reply_type: u32,
    payload: &[u8],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(OPTION_REPLY_MAGIC).await?;
    stream.write_u32(option_id).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the fixed-newstyle handshake.  Returns `Ok(true)` once the client
/// has sent `GO` and transmission may begin, `Ok(false)` on a clean
/// `ABORT`.
async fn negotiate<S>(stream: &mut S, export_size: u64) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u64(NBD_MAGIC).await?;
    stream.write_u64(OPTION_MAGIC).await?;
    stream.write_u16(FLAG_FIXED_NEWSTYLE).await?;
    stream.flush().await?;

    // Be picky and require NBD_FLAG_C_FIXED_NEWSTYLE even though the
    // protocol says the client only SHOULD set it.
    let client_flags = stream.read_u32().await?;
    if client_flags != FLAG_C_FIXED_NEWSTYLE {
        bail!("unexpected client flags {:#x}", client_flags);
    }

    loop {
        let option_magic = stream.read_u64().await?;
        if option_magic != OPTION_MAGIC {
            bail!("did not receive option magic");
        }

        let option_id = stream.read_u32().await?;
        let option_length = stream.read_u32().await?;
        if option_length > MAX_OPTION_LENGTH {
            bail!("option is too long ({} bytes)", option_length);
        }

        // No recognized option carries data we care about; the export
        // name a GO names is irrelevant since there is only one.
        let mut option_data = vec![0; option_length as usize];
        stream.read_exact(&mut option_data).await?;

        match option_id {
            OPT_LIST => {
                let mut payload = Vec::with_capacity(4 + EXPORT_NAME.len());
                payload.extend_from_slice(&(EXPORT_NAME.len() as u32).to_be_bytes());
                payload.extend_from_slice(EXPORT_NAME.as_bytes());
                send_option_reply(stream, option_id, REP_SERVER, &payload).await?;
                send_option_reply(stream, option_id, REP_ACK, &[]).await?;
            }
            OPT_ABORT => {
                send_option_reply(stream, option_id, REP_ACK, &[]).await?;
                return Ok(false);
            }
            OPT_GO => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&INFO_EXPORT.to_be_bytes());
                payload.extend_from_slice(&export_size.to_be_bytes());
                payload.extend_from_slice(&FLAG_HAS_FLAGS.to_be_bytes());
                send_option_reply(stream, option_id, REP_INFO, &payload).await?;
                send_option_reply(stream, option_id, REP_ACK, &[]).await?;

                // entering transmission phase now
                return Ok(true);
            }
            _ => {
                send_option_reply(stream, option_id, REP_ERR_UNSUP, &[]).await?;
            }
        }
    }
}

async fn send_simple_reply<S>(stream: &mut S, errno: u32, handle: u64) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(SIMPLE_REPLY_MAGIC).await?;
    stream.write_u32(errno).await?;
    stream.write_u64(handle).await?;
    Ok(())
}

async fn transmission<S>(stream: &mut S, backend: &Backend) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request_magic = stream.read_u32().await?;
        if request_magic != REQUEST_MAGIC {
            bail!("did not receive request magic");
        }

        let _command_flags = stream.read_u16().await?;
        let command_type = stream.read_u16().await?;
        let handle = stream.read_u64().await?;
        let offset = stream.read_u64().await?;
        let length = stream.read_u32().await?;
        if length > MAX_REQUEST_LENGTH {
            bail!("request is too long ({} bytes)", length);
        }

        let in_range = offset
            .checked_add(u64::from(length))
            .map_or(false, |end| end <= backend.size());

        match command_type {
            CMD_READ => {
                trace!("read {} bytes at {}", length, offset);
                if !in_range {
                    warn!("read beyond end of export ({} at {})", length, offset);
                    send_simple_reply(stream, EINVAL, handle).await?;
                    stream.flush().await?;
                    continue;
                }

                let mut buf = vec![0; length as usize];
                match backend.read_at(&mut buf, offset).await {
                    Ok(_) => {
                        send_simple_reply(stream, 0, handle).await?;
                        stream.write_all(&buf).await?;
                        stream.flush().await?;
                    }
                    Err(e) => {
                        send_simple_reply(stream, EIO, handle).await?;
                        stream.flush().await?;
                        return Err(e.context("read request failed"));
                    }
                }
            }
            CMD_WRITE => {
                trace!("write {} bytes at {}", length, offset);
                let mut buf = vec![0; length as usize];
                stream.read_exact(&mut buf).await?;

                if !in_range {
                    warn!("write beyond end of export ({} at {})", length, offset);
                    send_simple_reply(stream, EINVAL, handle).await?;
                    stream.flush().await?;
                    continue;
                }

                match backend.write_at(&buf, offset).await {
                    Ok(_) => {
                        send_simple_reply(stream, 0, handle).await?;
                        stream.flush().await?;
                    }
                    Err(e) => {
                        send_simple_reply(stream, EIO, handle).await?;
                        stream.flush().await?;
                        return Err(e.context("write request failed"));
                    }
                }
            }
            CMD_DISC => {
                debug!("client disconnected");
                return Ok(());
            }
            CMD_FLUSH | CMD_TRIM => {
                // acknowledged, nothing to do: writes go straight to the
                // cache files and dirty pages are tracked per-page
                send_simple_reply(stream, 0, handle).await?;
                stream.flush().await?;
            }
            _ => {
                warn!("unsupported command {}", command_type);
                send_simple_reply(stream, EINVAL, handle).await?;
                stream.flush().await?;
            }
        }
    }
}
