//! Toolstack side of a device-management exchange.

use std::path::Path;

use tokio::net::UnixStream;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::wire::{read_response, write_request, DevRequest, DevResponse};

/// Perform one request/response exchange against the daemon socket.
///
/// The connection is closed when this returns, whether or not the
/// exchange succeeded. A non-zero error code in the response is returned
/// as-is; use [`DevResponse::device_number`] or [`DevResponse::filename`]
/// to turn it into an error.
#[instrument(skip_all, fields(socket = %socket_path.as_ref().display(), kind = ?request.kind()))]
pub async fn request(socket_path: impl AsRef<Path>, request: &DevRequest) -> Result<DevResponse> {
    let mut stream = UnixStream::connect(socket_path.as_ref()).await?;

    write_request(&mut stream, request).await?;
    let response = read_response(&mut stream).await?;

    debug!(error = response.error, length = response.payload.len(), "Exchange complete");
    Ok(response)
}

/// Bind `filename` to a fresh loop device; returns `(major, minor)`.
pub async fn add(
    socket_path: impl AsRef<Path>,
    filename: &str,
    subtype: &str,
    mode: &str,
) -> Result<(u32, u32)> {
    let req = DevRequest::Add {
        subtype: subtype.to_string(),
        mode: mode.to_string(),
        filename: filename.to_string(),
    };
    request(socket_path, &req).await?.device_number()
}

/// Unbind the device with the given number.
pub async fn remove(socket_path: impl AsRef<Path>, major: u32, minor: u32) -> Result<()> {
    let req = DevRequest::Remove {
        subtype: "file".to_string(),
        major,
        minor,
    };
    let response = request(socket_path, &req).await?;
    if !response.is_success() {
        return Err(crate::ProtoError::Rejected(response.error));
    }
    Ok(())
}

/// Backing file of a loop device, or the node path of any other device.
pub async fn query(socket_path: impl AsRef<Path>, major: u32, minor: u32) -> Result<String> {
    let req = DevRequest::Query {
        subtype: "file".to_string(),
        major,
        minor,
    };
    request(socket_path, &req).await?.filename()
}
