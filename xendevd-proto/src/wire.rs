//! Message layouts for the device-management protocol.
//!
//! ```text
//! request header                     response header
//! ┌──────────┬──────────┬─────────┐  ┌──────────┬─────────────┐
//! │ kind i32 │ dev  i32 │ len i32 │  │ err  i32 │ len     i32 │
//! └──────────┴──────────┴─────────┘  └──────────┴─────────────┘
//!
//! add payload:           type[6] mode[2] filename\0
//! remove/query payload:  type[6] pad[2] major i32 minor i32
//! add response:          major i32 minor i32
//! query response:        filename\0
//! ```
//!
//! The two padding bytes in remove/query payloads follow the C struct layout
//! the toolstack sends; the packed 14-byte form is accepted as well.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{ProtoError, Result};

/// Well-known listening socket of the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/chaos_socket";

/// Size of the fixed request header.
pub const REQUEST_HEADER_LEN: usize = 12;

/// Size of the fixed response header.
pub const RESPONSE_HEADER_LEN: usize = 8;

/// Width of the block subtype tag (`phy`, `file`).
pub const SUBTYPE_TAG_LEN: usize = 6;

/// Width of the access mode tag (`r`, `w`).
pub const MODE_TAG_LEN: usize = 2;

/// Upper bound on any payload; generous for a path plus tags.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const DEVNUM_PAYLOAD_LEN: usize = 16;
const DEVNUM_PACKED_LEN: usize = SUBTYPE_TAG_LEN + 8;

/// Request discriminant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestKind {
    None = 0,
    Add = 1,
    Remove = 2,
    Query = 3,
}

impl RequestKind {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Add),
            2 => Some(Self::Remove),
            3 => Some(Self::Query),
            _ => None,
        }
    }
}

/// Device-kind discriminant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceKind {
    None = 0,
    Block = 1,
}

impl DeviceKind {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Block),
            _ => None,
        }
    }
}

/// Raw request header.
///
/// Kept as plain integers so unknown discriminants survive decoding and can
/// be answered with an error instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: i32,
    pub device: i32,
    pub payload_len: i32,
}

impl RequestHeader {
    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.device.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; REQUEST_HEADER_LEN]) -> Self {
        let mut cursor = &buf[..];
        Self {
            kind: cursor.get_i32_ne(),
            device: cursor.get_i32_ne(),
            payload_len: cursor.get_i32_ne(),
        }
    }

    /// Validated payload length.
    pub fn payload_len(&self) -> Result<usize> {
        payload_len(self.payload_len)
    }
}

/// Raw response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub error: i32,
    pub payload_len: i32,
}

impl ResponseHeader {
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.error.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RESPONSE_HEADER_LEN]) -> Self {
        let mut cursor = &buf[..];
        Self {
            error: cursor.get_i32_ne(),
            payload_len: cursor.get_i32_ne(),
        }
    }
}

fn payload_len(raw: i32) -> Result<usize> {
    let len = usize::try_from(raw)
        .map_err(|_| ProtoError::Malformed(format!("negative payload length {}", raw)))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtoError::TooLarge(len));
    }
    Ok(len)
}

/// A decoded block-device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevRequest {
    /// Bind a loop device to `filename` and report its device number.
    Add {
        subtype: String,
        mode: String,
        filename: String,
    },
    /// Unbind the device with the given number.
    Remove { subtype: String, major: u32, minor: u32 },
    /// Report what backs the device with the given number.
    Query { subtype: String, major: u32, minor: u32 },
}

impl DevRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            DevRequest::Add { .. } => RequestKind::Add,
            DevRequest::Remove { .. } => RequestKind::Remove,
            DevRequest::Query { .. } => RequestKind::Query,
        }
    }

    /// Decode a request from its header and payload.
    ///
    /// Any (kind, device) pair other than add/remove/query on block devices
    /// yields [`ProtoError::Unsupported`].
    pub fn decode(header: &RequestHeader, payload: &[u8]) -> Result<Self> {
        let unsupported = || ProtoError::Unsupported {
            kind: header.kind,
            device: header.device,
        };

        if DeviceKind::from_raw(header.device) != Some(DeviceKind::Block) {
            return Err(unsupported());
        }

        match RequestKind::from_raw(header.kind) {
            Some(RequestKind::Add) => decode_add(payload),
            Some(RequestKind::Remove) => {
                let (subtype, major, minor) = decode_devnum(payload)?;
                Ok(DevRequest::Remove { subtype, major, minor })
            }
            Some(RequestKind::Query) => {
                let (subtype, major, minor) = decode_devnum(payload)?;
                Ok(DevRequest::Query { subtype, major, minor })
            }
            Some(RequestKind::None) | None => Err(unsupported()),
        }
    }

    /// Encode into a header and payload ready for the socket.
    pub fn encode(&self) -> (RequestHeader, Vec<u8>) {
        let mut buf = BytesMut::new();

        match self {
            DevRequest::Add { subtype, mode, filename } => {
                put_tag(&mut buf, subtype, SUBTYPE_TAG_LEN);
                put_tag(&mut buf, mode, MODE_TAG_LEN);
                buf.put_slice(filename.as_bytes());
                buf.put_u8(0);
            }
            DevRequest::Remove { subtype, major, minor }
            | DevRequest::Query { subtype, major, minor } => {
                put_tag(&mut buf, subtype, SUBTYPE_TAG_LEN);
                buf.put_bytes(0, DEVNUM_PAYLOAD_LEN - DEVNUM_PACKED_LEN);
                buf.put_i32_ne(*major as i32);
                buf.put_i32_ne(*minor as i32);
            }
        }

        let header = RequestHeader {
            kind: self.kind() as i32,
            device: DeviceKind::Block as i32,
            payload_len: buf.len() as i32,
        };
        (header, buf.to_vec())
    }
}

fn decode_add(payload: &[u8]) -> Result<DevRequest> {
    let fixed = SUBTYPE_TAG_LEN + MODE_TAG_LEN;
    if payload.len() <= fixed {
        return Err(ProtoError::Malformed(format!(
            "add payload of {} bytes carries no filename",
            payload.len()
        )));
    }

    let subtype = decode_tag(&payload[..SUBTYPE_TAG_LEN]);
    let mode = decode_tag(&payload[SUBTYPE_TAG_LEN..fixed]);
    let filename = decode_cstr(&payload[fixed..])?;

    Ok(DevRequest::Add { subtype, mode, filename })
}

fn decode_devnum(payload: &[u8]) -> Result<(String, u32, u32)> {
    let offset = match payload.len() {
        DEVNUM_PAYLOAD_LEN => DEVNUM_PAYLOAD_LEN - 8,
        DEVNUM_PACKED_LEN => SUBTYPE_TAG_LEN,
        other => {
            return Err(ProtoError::Malformed(format!(
                "device number payload must be {} bytes, got {}",
                DEVNUM_PAYLOAD_LEN, other
            )))
        }
    };

    let subtype = decode_tag(&payload[..SUBTYPE_TAG_LEN]);
    let mut cursor = &payload[offset..];
    let major = devnum_part(cursor.get_i32_ne(), "major")?;
    let minor = devnum_part(cursor.get_i32_ne(), "minor")?;

    Ok((subtype, major, minor))
}

fn devnum_part(raw: i32, what: &str) -> Result<u32> {
    u32::try_from(raw).map_err(|_| ProtoError::Malformed(format!("negative {} number {}", what, raw)))
}

/// Fixed-width tags are NUL- or space-padded.
fn decode_tag(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

fn put_tag(buf: &mut BytesMut, tag: &str, width: usize) {
    let bytes = tag.as_bytes();
    let len = bytes.len().min(width);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
}

fn decode_cstr(raw: &[u8]) -> Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if end == 0 {
        return Err(ProtoError::Malformed("empty filename".to_string()));
    }
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| ProtoError::Malformed("filename is not valid UTF-8".to_string()))
}

/// A response: error code plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevResponse {
    pub error: i32,
    pub payload: Vec<u8>,
}

impl DevResponse {
    /// Successful `add`, carrying the bound device's number.
    pub fn added(major: u32, minor: u32) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i32_ne(major as i32);
        buf.put_i32_ne(minor as i32);
        Self { error: 0, payload: buf.to_vec() }
    }

    /// Successful `remove`.
    pub fn removed() -> Self {
        Self { error: 0, payload: Vec::new() }
    }

    /// Successful `query`, carrying a NUL-terminated path.
    pub fn queried(filename: &str) -> Self {
        let mut payload = filename.as_bytes().to_vec();
        payload.push(0);
        Self { error: 0, payload }
    }

    /// Failure with an OS error code and no payload.
    pub fn failure(errno: i32) -> Self {
        Self { error: errno, payload: Vec::new() }
    }

    pub fn is_success(&self) -> bool {
        self.error == 0
    }

    pub fn header(&self) -> ResponseHeader {
        ResponseHeader {
            error: self.error,
            payload_len: self.payload.len() as i32,
        }
    }

    /// Interpret the payload of an `add` response.
    pub fn device_number(&self) -> Result<(u32, u32)> {
        self.check()?;
        if self.payload.len() != 8 {
            return Err(ProtoError::Malformed(format!(
                "add response payload must be 8 bytes, got {}",
                self.payload.len()
            )));
        }
        let mut cursor = &self.payload[..];
        let major = devnum_part(cursor.get_i32_ne(), "major")?;
        let minor = devnum_part(cursor.get_i32_ne(), "minor")?;
        Ok((major, minor))
    }

    /// Interpret the payload of a `query` response.
    pub fn filename(&self) -> Result<String> {
        self.check()?;
        decode_cstr(&self.payload)
    }

    fn check(&self) -> Result<()> {
        if self.error != 0 {
            return Err(ProtoError::Rejected(self.error));
        }
        Ok(())
    }
}

/// Read one request header and its payload.
pub async fn read_request<R>(reader: &mut R) -> Result<(RequestHeader, Vec<u8>)>
where
    R: AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; REQUEST_HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = RequestHeader::from_bytes(&header_buf);

    let len = header.payload_len()?;
    trace!(kind = header.kind, device = header.device, length = len, "Reading request payload");

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    debug!(kind = header.kind, device = header.device, length = len, "Request received");
    Ok((header, payload))
}

/// Write one request header and its payload.
pub async fn write_request<W>(writer: &mut W, request: &DevRequest) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let (header, payload) = request.encode();
    writer.write_all(&header.to_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(&payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one response header and its payload.
pub async fn read_response<R>(reader: &mut R) -> Result<DevResponse>
where
    R: AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; RESPONSE_HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = ResponseHeader::from_bytes(&header_buf);

    let len = payload_len(header.payload_len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(DevResponse { error: header.error, payload })
}

/// Write one response header and its payload.
pub async fn write_response<W>(writer: &mut W, response: &DevResponse) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(&response.header().to_bytes()).await?;
    if !response.payload.is_empty() {
        writer.write_all(&response.payload).await?;
    }
    writer.flush().await?;

    debug!(error = response.error, length = response.payload.len(), "Response written");
    Ok(())
}
