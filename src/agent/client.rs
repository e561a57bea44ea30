//! Client for the vmdisk guest agent.
//!
//! The VM runtime exposes the agent's vsock port as a Unix socket on the
//! host. Requests are length-prefixed JSON frames, one response per request.

use crate::error::{Error, Result};
use crate::vm::{Guest, GuestError, GuestResult};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use vmdisk_protocol::{encode_message, AgentRequest, AgentResponse, MAX_FRAME_SIZE};

// ============================================================================
// Socket Timeout Constants
// ============================================================================

/// Default socket read timeout (30 seconds).
/// Device lookups retry inside the guest for a few seconds, so this leaves
/// room for hotplug to settle.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default socket write timeout (10 seconds).
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Read timeout for mount and filesystem probing (2 minutes).
/// Journal replay on a dirty filesystem can take a while.
const MOUNT_TIMEOUT_SECS: u64 = 120;

/// Delay between connection attempts while the VM boots.
const CONNECT_RETRY_DELAY_MS: u64 = 100;

/// Client for the guest agent.
///
/// Safe to share between threads; requests are serialized on one
/// connection. A connection that failed mid-request is dropped and
/// reopened on the next call.
pub struct AgentClient {
    socket_path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl AgentClient {
    /// Connect to the agent via Unix socket.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let path = socket_path.as_ref().to_path_buf();
        let stream = Self::connect_once(&path)?;
        Ok(Self {
            socket_path: path,
            stream: Mutex::new(Some(stream)),
        })
    }

    /// Connect, retrying until `timeout` elapses.
    ///
    /// Used right after VM start, before the agent has bound its port.
    pub fn connect_with_retry(socket_path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = socket_path.as_ref();
        let deadline = Instant::now() + timeout;
        loop {
            match Self::connect(path) {
                Ok(client) => return Ok(client),
                Err(e) if Instant::now() < deadline => {
                    tracing::trace!(error = %e, "agent not ready");
                    std::thread::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Internal connect implementation (single attempt).
    fn connect_once(socket_path: &Path) -> Result<UnixStream> {
        let stream = UnixStream::connect(socket_path)
            .map_err(|e| Error::agent("connect to agent", e.to_string()))?;

        // Fail early if timeouts can't be set to prevent indefinite hangs
        stream
            .set_read_timeout(Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)))
            .map_err(|e| Error::agent("set read timeout", e.to_string()))?;
        stream
            .set_write_timeout(Some(Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)))
            .map_err(|e| Error::agent("set write timeout", e.to_string()))?;

        Ok(stream)
    }

    /// Ping the agent. Returns its protocol version.
    pub fn ping(&self) -> Result<u32> {
        match self.request(&AgentRequest::Ping, None)? {
            AgentResponse::Pong { version } => Ok(version),
            AgentResponse::Error { message, .. } => Err(Error::agent("ping", message)),
            _ => Err(Error::agent("ping", "unexpected response type")),
        }
    }

    /// Ask the agent to exit.
    pub fn shutdown(&self) -> Result<()> {
        match self.request(&AgentRequest::Shutdown, None)? {
            AgentResponse::Ok { .. } => Ok(()),
            AgentResponse::Error { message, .. } => Err(Error::agent("shutdown", message)),
            _ => Err(Error::agent("shutdown", "unexpected response type")),
        }
    }

    /// Send a request and receive a response.
    fn request(&self, req: &AgentRequest, timeout: Option<Duration>) -> Result<AgentResponse> {
        let data = encode_message(req).map_err(|e| Error::agent("encode message", e.to_string()))?;

        let mut guard = self.stream.lock();
        if guard.is_none() {
            *guard = Some(Self::connect_once(&self.socket_path)?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(Error::agent("connect to agent", "no connection"));
        };

        if let Some(timeout) = timeout {
            stream
                .set_read_timeout(Some(timeout))
                .map_err(|e| Error::agent("set read timeout", e.to_string()))?;
        }

        let result = stream
            .write_all(&data)
            .map_err(|e| Error::agent("send message", e.to_string()))
            .and_then(|_| read_response(stream));

        if timeout.is_some() {
            if let Err(e) =
                stream.set_read_timeout(Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)))
            {
                tracing::warn!(error = %e, "failed to reset socket read timeout to default");
            }
        }

        if result.is_err() {
            // The stream may hold a late response; never reuse it.
            *guard = None;
        }
        result
    }

    /// Run a guest primitive and return its data payload.
    fn call(
        &self,
        req: AgentRequest,
        timeout: Option<Duration>,
    ) -> GuestResult<Option<serde_json::Value>> {
        let resp = self
            .request(&req, timeout)
            .map_err(|e| GuestError::transport(e.to_string()))?;
        match resp {
            AgentResponse::Ok { data } => Ok(data),
            AgentResponse::Error { errno, message } => Err(GuestError::new(errno, message)),
            AgentResponse::Pong { .. } => Err(GuestError::transport("unexpected pong")),
        }
    }

    /// Run a guest primitive that returns a single string.
    fn call_string(&self, req: AgentRequest, timeout: Option<Duration>) -> GuestResult<String> {
        match self.call(req, timeout)? {
            Some(serde_json::Value::String(s)) => Ok(s),
            other => Err(GuestError::transport(format!(
                "expected string response, got {:?}",
                other
            ))),
        }
    }
}

/// Read a response from the stream.
fn read_response(stream: &mut UnixStream) -> Result<AgentResponse> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .map_err(|e| Error::agent("read header", e.to_string()))?;

    let len = u32::from_be_bytes(header) as usize;

    // Validate frame size to prevent OOM from malicious/buggy responses
    if len > MAX_FRAME_SIZE as usize {
        return Err(Error::agent(
            "validate frame",
            format!(
                "frame too large: {} bytes (max: {} bytes)",
                len, MAX_FRAME_SIZE
            ),
        ));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .map_err(|e| Error::agent("read payload", e.to_string()))?;

    serde_json::from_slice(&buf).map_err(|e| Error::agent("deserialize response", e.to_string()))
}

impl Guest for AgentClient {
    fn resolve_device(&self, lun: u32) -> GuestResult<String> {
        self.call_string(AgentRequest::ResolveDevice { lun }, None)
    }

    fn probe_device(&self, device: &str) -> GuestResult<()> {
        self.call(
            AgentRequest::ProbeDevice {
                device: device.to_string(),
            },
            None,
        )
        .map(|_| ())
    }

    fn find_partition(&self, device: &str, index: u32) -> GuestResult<String> {
        self.call_string(
            AgentRequest::FindPartition {
                device: device.to_string(),
                index,
            },
            None,
        )
    }

    fn detect_filesystem(&self, device: &str) -> GuestResult<String> {
        self.call_string(
            AgentRequest::DetectFilesystem {
                device: device.to_string(),
            },
            Some(Duration::from_secs(MOUNT_TIMEOUT_SECS)),
        )
    }

    fn create_mountpoint(&self, path: &str) -> GuestResult<()> {
        self.call(
            AgentRequest::CreateMountpoint {
                path: path.to_string(),
            },
            None,
        )
        .map(|_| ())
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        options: Option<&str>,
    ) -> GuestResult<()> {
        self.call(
            AgentRequest::Mount {
                source: source.to_string(),
                target: target.to_string(),
                fstype: fstype.to_string(),
                options: options.map(str::to_string),
            },
            Some(Duration::from_secs(MOUNT_TIMEOUT_SECS)),
        )
        .map(|_| ())
    }

    fn unmount(&self, target: &str) -> GuestResult<()> {
        self.call(
            AgentRequest::Unmount {
                target: target.to_string(),
            },
            Some(Duration::from_secs(MOUNT_TIMEOUT_SECS)),
        )
        .map(|_| ())
    }

    fn remove_mountpoint(&self, path: &str) -> GuestResult<()> {
        self.call(
            AgentRequest::RemoveMountpoint {
                path: path.to_string(),
            },
            None,
        )
        .map(|_| ())
    }

    fn release_device(&self, lun: u32) -> GuestResult<()> {
        self.call(AgentRequest::ReleaseDevice { lun }, None)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;
    use vmdisk_protocol::{decode_message, errno, PROTOCOL_VERSION};

    /// Serve one connection with a canned handler, answering until EOF.
    fn fake_agent(
        dir: &TempDir,
        handler: impl Fn(AgentRequest) -> AgentResponse + Send + 'static,
    ) -> PathBuf {
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                let mut header = [0u8; 4];
                if stream.read_exact(&mut header).is_err() {
                    return;
                }
                let len = u32::from_be_bytes(header) as usize;
                let mut payload = vec![0u8; len];
                stream.read_exact(&mut payload).unwrap();
                let mut frame = header.to_vec();
                frame.extend_from_slice(&payload);
                let req: AgentRequest = decode_message(&frame).unwrap();
                let resp = encode_message(&handler(req)).unwrap();
                stream.write_all(&resp).unwrap();
            }
        });
        path
    }

    #[test]
    fn test_ping() {
        let dir = TempDir::new().unwrap();
        let path = fake_agent(&dir, |_| AgentResponse::Pong {
            version: PROTOCOL_VERSION,
        });

        let client = AgentClient::connect(&path).unwrap();
        assert_eq!(client.ping().unwrap(), PROTOCOL_VERSION);
    }

    #[test]
    fn test_guest_calls_map_responses() {
        let dir = TempDir::new().unwrap();
        let path = fake_agent(&dir, |req| match req {
            AgentRequest::ResolveDevice { lun: 2 } => AgentResponse::ok_value("/dev/sdd"),
            AgentRequest::FindPartition { index: 1, .. } => AgentResponse::ok_value("/dev/sdd1"),
            AgentRequest::FindPartition { .. } => {
                AgentResponse::error(errno::ENOENT, "partition not found")
            }
            AgentRequest::Mount { fstype, .. } if fstype == "vfat" => {
                AgentResponse::error(errno::EINVAL, "wrong fs type")
            }
            _ => AgentResponse::ok(),
        });

        let client = AgentClient::connect(&path).unwrap();
        assert_eq!(client.resolve_device(2).unwrap(), "/dev/sdd");
        assert_eq!(client.find_partition("/dev/sdd", 1).unwrap(), "/dev/sdd1");

        let err = client.find_partition("/dev/sdd", 9).unwrap_err();
        assert_eq!(err.errno, errno::ENOENT);

        let err = client
            .mount("/dev/sdd1", "/mnt/vmdisk/x", "vfat", None)
            .unwrap_err();
        assert_eq!(err.errno, errno::EINVAL);

        client.create_mountpoint("/mnt/vmdisk/x").unwrap();
    }

    #[test]
    fn test_connect_failure() {
        let dir = TempDir::new().unwrap();
        let result = AgentClient::connect(dir.path().join("missing.sock"));
        assert!(matches!(result, Err(Error::Agent { .. })));
    }

    #[test]
    fn test_dead_agent_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let client = AgentClient::connect(&path).unwrap();

        // Accept and immediately drop the connection.
        drop(listener.accept().unwrap());
        let err = client.probe_device("/dev/sdb").unwrap_err();
        assert_eq!(err.errno, errno::EIO);
    }
}
