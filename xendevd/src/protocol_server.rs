//! Local device-management protocol server.
//!
//! One listening socket, one request/response exchange per connection.
//! Requests act on loop devices directly, without the store.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, instrument, warn};

use xendevd_hotplug::{require_regular_file, DeviceIdentity, HotplugError, LoopDevices, LoopMode};
use xendevd_proto::{read_request, write_response, DevRequest, DevResponse, ProtoError};

/// Executes decoded requests against the loop subsystem.
#[derive(Clone)]
pub struct DeviceService {
    loops: Arc<dyn LoopDevices>,
    identity: Arc<dyn DeviceIdentity>,
}

impl DeviceService {
    pub fn new(loops: Arc<dyn LoopDevices>, identity: Arc<dyn DeviceIdentity>) -> Self {
        Self { loops, identity }
    }

    /// Run one request; failures become an error code with no payload.
    pub fn execute(&self, request: &DevRequest) -> DevResponse {
        let result = match request {
            DevRequest::Add { mode, filename, .. } => self
                .add(Path::new(filename), LoopMode::from_tag(mode))
                .map(|(major, minor)| DevResponse::added(major, minor)),
            DevRequest::Remove { major, minor, .. } => {
                self.remove(*major, *minor).map(|()| DevResponse::removed())
            }
            DevRequest::Query { major, minor, .. } => self
                .query(*major, *minor)
                .map(|filename| DevResponse::queried(&filename.to_string_lossy())),
        };

        result.unwrap_or_else(|e| {
            warn!(kind = ?request.kind(), error = %e, errno = e.errno(), "Request failed");
            DevResponse::failure(e.errno())
        })
    }

    /// Bind `filename` to the next free loop device.
    ///
    /// The subtype tag is not consulted: `add` always produces a
    /// loop-backed device.
    fn add(&self, filename: &Path, mode: LoopMode) -> Result<(u32, u32), HotplugError> {
        require_regular_file(filename)?;

        let device = self.loops.next_available_device()?;
        let binding = self.loops.bind(&device, filename, mode)?;
        let (major, minor) = self.identity.device_number(&binding.device)?;

        info!(
            device = %binding.device.display(),
            file = %filename.display(),
            mode = mode.as_str(),
            major,
            minor,
            "Loop device added"
        );
        Ok((major, minor))
    }

    fn remove(&self, major: u32, minor: u32) -> Result<(), HotplugError> {
        let node = self.identity.resolve(major, minor)?;
        self.loops.unbind(&node)?;
        info!(device = %node.display(), major, minor, "Loop device removed");
        Ok(())
    }

    /// Backing file of a loop device, else the device node itself.
    fn query(&self, major: u32, minor: u32) -> Result<PathBuf, HotplugError> {
        let node = self.identity.resolve(major, minor)?;
        let answer = self.identity.backing_file(major, minor)?.unwrap_or(node);
        debug!(major, minor, answer = %answer.display(), "Device queried");
        Ok(answer)
    }
}

/// Serve exactly one exchange on `stream`.
///
/// A request that cannot be read at all (short read, oversized length)
/// is answered with an error code when possible; the connection is closed
/// by the caller dropping the stream either way.
#[instrument(skip_all)]
pub async fn serve_connection<S>(stream: &mut S, service: &DeviceService) -> xendevd_proto::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = match read_request(stream).await {
        Ok((header, payload)) => match DevRequest::decode(&header, &payload) {
            Ok(request) => {
                debug!(request = ?request, "Request decoded");
                service.execute(&request)
            }
            Err(e) => {
                warn!(error = %e, "Rejecting request");
                DevResponse::failure(e.errno())
            }
        },
        Err(ProtoError::Io(e)) => return Err(ProtoError::Io(e)),
        Err(e) => {
            warn!(error = %e, "Rejecting request");
            DevResponse::failure(e.errno())
        }
    };

    write_response(stream, &response).await
}

/// The listening socket. Its file is removed on drop.
pub struct ProtocolServer {
    listener: UnixListener,
    path: PathBuf,
    service: DeviceService,
}

impl ProtocolServer {
    /// Bind the listener at `path`, replacing a stale socket file.
    pub fn bind(path: impl Into<PathBuf>, service: DeviceService) -> Result<Self> {
        let path = path.into();

        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
            }
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind protocol socket {}", path.display()))?;

        info!(socket = %path.display(), "Protocol server listening");
        Ok(Self { listener, path, service })
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Run one exchange to completion and close the connection.
    pub async fn handle(&self, mut stream: UnixStream) {
        if let Err(e) = serve_connection(&mut stream, &self.service).await {
            warn!(error = %e, "Protocol exchange aborted");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(socket = %self.path.display(), error = %e, "Socket file not removed");
        }
    }
}
