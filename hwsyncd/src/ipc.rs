use hwsync_common::ipc_client::{IpcError, MAX_MESSAGE_SIZE};
use hwsync_common::{deserialize, serialize, tracing, Request, Response};
use nix::unistd::{chown, Group};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::config::SecurityOptions;
use crate::DaemonState;

/// IPC server answering GUI requests
pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create a new IPC server with the specified socket path, removing a stale socket
    pub fn new<P: AsRef<Path>>(socket_path: P) -> io::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        Ok(Self {
            socket_path,
            shutdown_tx: None,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and serve requests on a background task
    pub async fn start(&mut self, state: Arc<DaemonState>, security: &SecurityOptions) -> io::Result<()> {
        info!("Starting IPC server at {}", self.socket_path.display());

        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        if let Err(e) = restrict_socket(&self.socket_path, security) {
            warn!("Failed to set socket permissions: {}", e);
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        task::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => {
                        match connection {
                            Ok((stream, _)) => {
                                debug!("New client connected");
                                let state = Arc::clone(&state);
                                task::spawn(async move {
                                    if let Err(e) = handle_client(stream, state).await {
                                        error!("Error handling client: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Error accepting connection: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("IPC accept loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting connections and remove the socket file
    pub async fn shutdown(&mut self) -> io::Result<()> {
        info!("Shutting down IPC server");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }

        Ok(())
    }
}

/// Apply the configured mode and group to the socket file
fn restrict_socket(socket_path: &Path, security: &SecurityOptions) -> io::Result<()> {
    let mode = security.socket_mode().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid socket permissions {:?}", security.socket_permissions),
        )
    })?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(mode))?;

    let group = Group::from_name(&security.socket_group)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("group '{}' not found", security.socket_group),
        )
    })?;
    chown(socket_path, None, Some(group.gid))?;

    info!(
        "Socket permissions set: group={}, mode={:o}",
        security.socket_group, mode
    );
    Ok(())
}

/// Handle a client connection: one framed request, one framed response
pub async fn handle_client(mut stream: UnixStream, state: Arc<DaemonState>) -> Result<(), IpcError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_SIZE {
        warn!("Received oversized message: {} bytes", msg_len);
        return Err(IpcError::MessageTooLarge(msg_len, MAX_MESSAGE_SIZE));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;

    let response = match deserialize::<Request>(&msg_buf) {
        Ok(request) => {
            debug!("Received request: {:?}", request);
            handle_request(request, &state).await
        }
        Err(e) => {
            warn!("Malformed request: {}", e);
            Response::Error(format!("Malformed request: {}", e))
        }
    };
    debug!("Sending response: {:?}", response);

    let response_bytes = serialize(&response);
    let len = response_bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&response_bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Process a request and generate a response
pub async fn handle_request(request: Request, state: &DaemonState) -> Response {
    match request {
        Request::GetCapabilities => Response::Capabilities(state.backlight.capabilities().await),
        Request::GetBacklightState => Response::BacklightState(state.backlight.state().await),
        Request::PushBacklightState { payload } => {
            state.backlight.push_state(payload);
            Response::Ack
        }
        Request::GetDisplayModes => Response::DisplayModes(state.display.display_modes().await),
        Request::SetRefreshRate { rate } => {
            state.display.set_refresh_rate(rate).await;
            Response::Ack
        }
        Request::SetResolution { x, y } => {
            state.display.set_resolution(x, y).await;
            Response::Ack
        }
        Request::SetRefreshResolution { x, y, rate } => {
            state.display.set_refresh_resolution(x, y, rate).await;
            Response::Ack
        }
        Request::GetStatus => Response::Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            backlight_supported: state.backlight.capabilities().await.is_some(),
        },
    }
}
