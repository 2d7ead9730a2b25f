//! IPC client for communicating with the hwsync daemon
//!
//! Requests travel over a Unix domain socket as a 4-byte little-endian length
//! followed by a bincode payload; the daemon answers with one framed response.

use crate::{Request, Response};
use serde::{de::DeserializeOwned, Serialize};

use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Errors that can occur during IPC communication
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Operation timeout after {0}ms")]
    OperationTimeout(u64),

    #[error("Daemon not running at {0}")]
    DaemonNotRunning(String),

    #[error("Message too large: {0} bytes exceeds maximum of {1} bytes")]
    MessageTooLarge(usize, usize),
}

/// Default socket path for the hwsync daemon
pub const DEFAULT_SOCKET_PATH: &str = "/run/hwsyncd/hwsyncd.sock";

/// Default timeout for operations (in milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of reconnection attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay between reconnection attempts (in milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// IPC client with connection management and error handling
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcClient {
    /// Create a new IPC client with default settings
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    /// Create a new IPC client with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Set the timeout for operations
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Set reconnection parameters
    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = Duration::from_millis(retry_delay_ms);
        self
    }

    /// Check if the daemon is running by attempting to connect to its socket
    pub async fn is_daemon_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Connect to the daemon with retry logic
    pub async fn connect(&self) -> Result<UnixStream, IpcError> {
        let mut attempts = 0;

        loop {
            match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    if attempts >= self.max_retries {
                        return Err(IpcError::DaemonNotRunning(self.socket_path.clone()));
                    }
                    tracing::warn!("Connection attempt {} failed: {}, retrying...", attempts + 1, e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempts += 1;
                }
                Err(_) => return Err(IpcError::ConnectionTimeout),
            }
        }
    }

    /// Send a request to the daemon and wait for its response
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let mut stream = self.connect().await?;
        self.send_with_stream(&mut stream, request).await
    }

    async fn send_with_stream(&self, stream: &mut UnixStream, request: &Request) -> Result<Response, IpcError> {
        let serialized = serialize(request)?;

        if serialized.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::MessageTooLarge(serialized.len(), MAX_MESSAGE_SIZE));
        }

        let write = timeout(self.timeout, async {
            let len = serialized.len() as u32;
            stream.write_all(&len.to_le_bytes()).await?;
            stream.write_all(&serialized).await?;
            stream.flush().await?;
            Ok::<(), io::Error>(())
        })
        .await;
        match write {
            Ok(result) => result?,
            Err(_) => return Err(IpcError::OperationTimeout(self.timeout.as_millis() as u64)),
        }

        let response = timeout(self.timeout, async {
            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let response_len = u32::from_le_bytes(len_bytes) as usize;

            if response_len > MAX_MESSAGE_SIZE {
                return Err(IpcError::MessageTooLarge(response_len, MAX_MESSAGE_SIZE));
            }

            let mut buffer = vec![0u8; response_len];
            stream.read_exact(&mut buffer).await?;

            deserialize(&buffer)
        })
        .await;

        match response {
            Ok(result) => result,
            Err(_) => Err(IpcError::OperationTimeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Send a request to the daemon at a specific socket path
pub async fn send_to_path<P: AsRef<Path>>(request: &Request, socket_path: P) -> Result<Response, IpcError> {
    let client = IpcClient::with_socket_path(socket_path);
    client.send(request).await
}

/// Serialize a message using bincode
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    bincode::serialize(msg).map_err(|e| IpcError::Serialization(e.to_string()))
}

/// Deserialize a message using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    bincode::deserialize(bytes).map_err(|e| IpcError::Serialization(e.to_string()))
}
