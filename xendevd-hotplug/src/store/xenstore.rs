//! Client for the xenstored socket protocol.
//!
//! Every message is a 16-byte header followed by `len` payload bytes:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────────┐
//! │ type u32 │ req  u32 │ tx   u32 │ len  u32 │ payload      │
//! └──────────┴──────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! Requests run outside any transaction (`tx = 0`). The reply carries the
//! same type, or `ERROR` with the errno name as a NUL-terminated string.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::Store;
use crate::error::{HotplugError, Result};

/// Default xenstored control socket.
pub const DEFAULT_XENSTORED_SOCKET: &str = "/var/run/xenstored/socket";

const HEADER_LEN: usize = 16;
const PAYLOAD_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum MsgType {
    Read = 2,
    Write = 11,
    Rm = 13,
    Error = 16,
}

struct Reply {
    msg_type: u32,
    payload: Vec<u8>,
}

/// Connection to xenstored, opened once and held for the process lifetime.
pub struct XenStore {
    stream: Mutex<UnixStream>,
    next_req_id: AtomicU32,
}

impl XenStore {
    /// Connect to the xenstored socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            HotplugError::resource(format!("Failed to connect to xenstored at {}", path.display()), e)
        })?;

        info!(socket = %path.display(), "Connected to xenstored");

        Ok(Self {
            stream: Mutex::new(stream),
            next_req_id: AtomicU32::new(1),
        })
    }

    async fn request(&self, msg_type: MsgType, payload: &[u8]) -> Result<Reply> {
        if payload.len() > PAYLOAD_MAX {
            return Err(HotplugError::Store(format!(
                "request payload of {} bytes exceeds {}",
                payload.len(),
                PAYLOAD_MAX
            )));
        }

        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let mut msg = Vec::with_capacity(HEADER_LEN + payload.len());
        msg.extend_from_slice(&(msg_type as u32).to_ne_bytes());
        msg.extend_from_slice(&req_id.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        msg.extend_from_slice(payload);

        let mut stream = self.stream.lock().await;
        stream.write_all(&msg).await.map_err(|e| io_error("send", e))?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(|e| io_error("receive", e))?;

        let field = |i: usize| u32::from_ne_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let reply_type = field(0);
        let reply_id = field(4);
        let len = field(12) as usize;

        if len > PAYLOAD_MAX {
            // Consume the body so the next exchange starts on a header.
            let mut body = (&mut *stream).take(len as u64);
            tokio::io::copy(&mut body, &mut tokio::io::sink())
                .await
                .map_err(|e| io_error("receive", e))?;
            return Err(HotplugError::Store(format!("reply payload of {} bytes exceeds {}", len, PAYLOAD_MAX)));
        }

        let mut reply_payload = vec![0u8; len];
        stream.read_exact(&mut reply_payload).await.map_err(|e| io_error("receive", e))?;

        if reply_id != req_id {
            return Err(HotplugError::Store(format!(
                "reply id {} does not match request id {}",
                reply_id, req_id
            )));
        }

        trace!(msg_type = ?msg_type, req_id, reply_type, len, "xenstore exchange");

        Ok(Reply {
            msg_type: reply_type,
            payload: reply_payload,
        })
    }
}

fn io_error(what: &str, e: std::io::Error) -> HotplugError {
    HotplugError::resource(format!("Failed to {} xenstore message", what), e)
}

fn error_name(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

fn with_nul(path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(path.len() + 1);
    buf.extend_from_slice(path.as_bytes());
    buf.push(0);
    buf
}

#[async_trait]
impl Store for XenStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        let reply = self.request(MsgType::Read, &with_nul(path)).await?;

        if reply.msg_type == MsgType::Error as u32 {
            let name = error_name(&reply.payload);
            if name == "ENOENT" {
                return Ok(None);
            }
            return Err(HotplugError::Store(format!("read {}: {}", path, name)));
        }

        let value = String::from_utf8_lossy(&reply.payload).into_owned();
        debug!(path = %path, value = %value, "xenstore read");
        Ok(Some(value))
    }

    async fn write(&self, path: &str, value: &str) -> Result<()> {
        let mut payload = with_nul(path);
        payload.extend_from_slice(value.as_bytes());

        let reply = self.request(MsgType::Write, &payload).await?;
        if reply.msg_type == MsgType::Error as u32 {
            return Err(HotplugError::Store(format!("write {}: {}", path, error_name(&reply.payload))));
        }

        debug!(path = %path, value = %value, "xenstore write");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let reply = self.request(MsgType::Rm, &with_nul(path)).await?;
        if reply.msg_type == MsgType::Error as u32 {
            let name = error_name(&reply.payload);
            if name == "ENOENT" {
                return Ok(());
            }
            return Err(HotplugError::Store(format!("rm {}: {}", path, name)));
        }

        debug!(path = %path, "xenstore rm");
        Ok(())
    }
}
