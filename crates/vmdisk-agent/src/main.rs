//! vmdisk guest agent.
//!
//! This agent runs inside the utility VM and handles:
//! - Resolving hot-added SCSI disks to block devices
//! - Partition lookup and filesystem detection
//! - Mountpoint creation, mount and unmount
//! - Releasing devices before the host detaches them
//!
//! Communication is via vsock on port 6100. For development the agent can
//! listen on a Unix socket instead (`--socket <path>`).

#[cfg(target_os = "linux")]
mod disk;
mod error;
#[cfg(target_os = "linux")]
mod mount;
mod paths;
#[cfg(target_os = "linux")]
mod vsock;

#[cfg(target_os = "linux")]
fn main() {
    use tracing::{error, info};

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vmdisk_agent=debug")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting vmdisk-agent");

    if let Err(e) = server::run(std::env::args().skip(1).collect()) {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("vmdisk-agent only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod server {
    use crate::error::AgentError;
    use crate::{disk, mount, vsock};
    use std::io::{Read, Write};
    use tracing::{debug, info, warn};
    use vmdisk_protocol::{ports, AgentRequest, AgentResponse, MAX_FRAME_SIZE, PROTOCOL_VERSION};

    /// Run the accept loop until a shutdown request arrives.
    pub fn run(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = match args.iter().position(|a| a == "--socket") {
            Some(i) => {
                let path = args.get(i + 1).ok_or("--socket requires a path")?;
                info!(path = %path, "listening on unix socket");
                vsock::listen_unix(std::path::Path::new(path))?
            }
            None => {
                info!(port = ports::AGENT_CONTROL, "listening on vsock");
                vsock::listen_vsock(ports::AGENT_CONTROL)?
            }
        };

        loop {
            match listener.accept() {
                Ok(mut stream) => {
                    debug!("accepted connection");
                    match handle_connection(&mut stream) {
                        Ok(true) => {
                            info!("shutdown requested");
                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "connection error"),
                    }
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }

    /// Serve one connection. Returns true when the host asked for shutdown.
    pub fn handle_connection(
        stream: &mut (impl Read + Write),
    ) -> Result<bool, Box<dyn std::error::Error>> {
        let mut buf = vec![0u8; 4096];

        loop {
            let mut header = [0u8; 4];
            match stream.read_exact(&mut header) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("connection closed");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_be_bytes(header);
            if len > MAX_FRAME_SIZE {
                return Err(format!("frame too large: {} bytes", len).into());
            }
            let len = len as usize;
            if len > buf.len() {
                buf.resize(len, 0);
            }
            stream.read_exact(&mut buf[..len])?;

            let request: AgentRequest = match serde_json::from_slice(&buf[..len]) {
                Ok(req) => req,
                Err(e) => {
                    warn!(error = %e, "invalid request");
                    send_response(
                        stream,
                        &AgentResponse::error(
                            vmdisk_protocol::errno::EINVAL,
                            format!("invalid request: {}", e),
                        ),
                    )?;
                    continue;
                }
            };

            debug!(?request, "received request");
            let shutdown = matches!(request, AgentRequest::Shutdown);
            let response = handle_request(request);
            send_response(stream, &response)?;

            if shutdown {
                return Ok(true);
            }
        }
    }

    /// Dispatch a request to the matching guest primitive.
    pub fn handle_request(request: AgentRequest) -> AgentResponse {
        let result: Result<AgentResponse, AgentError> = match request {
            AgentRequest::Ping => Ok(AgentResponse::Pong {
                version: PROTOCOL_VERSION,
            }),

            AgentRequest::ResolveDevice { lun } => disk::resolve_device(lun).map(AgentResponse::ok_value),

            AgentRequest::ProbeDevice { device } => {
                disk::probe_device(&device).map(|_| AgentResponse::ok())
            }

            AgentRequest::FindPartition { device, index } => {
                disk::find_partition(&device, index).map(AgentResponse::ok_value)
            }

            AgentRequest::DetectFilesystem { device } => {
                disk::detect_filesystem(&device).map(AgentResponse::ok_value)
            }

            AgentRequest::CreateMountpoint { path } => {
                mount::create_mountpoint(&path).map(|_| AgentResponse::ok())
            }

            AgentRequest::Mount {
                source,
                target,
                fstype,
                options,
            } => mount::mount(&source, &target, &fstype, options.as_deref())
                .map(|_| AgentResponse::ok()),

            AgentRequest::Unmount { target } => {
                mount::unmount(&target).map(|_| AgentResponse::ok())
            }

            AgentRequest::RemoveMountpoint { path } => {
                mount::remove_mountpoint(&path).map(|_| AgentResponse::ok())
            }

            AgentRequest::ReleaseDevice { lun } => {
                disk::release_device(lun).map(|_| AgentResponse::ok())
            }

            AgentRequest::Shutdown => Ok(AgentResponse::ok()),
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "request failed");
            e.into()
        })
    }

    /// Send a response to the client.
    fn send_response(
        stream: &mut impl Write,
        response: &AgentResponse,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let frame = vmdisk_protocol::encode_message(response)?;
        stream.write_all(&frame)?;
        stream.flush()?;

        debug!(?response, "sent response");
        Ok(())
    }

}
