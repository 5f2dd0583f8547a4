//! IPC client for communicating with the harvester daemon.

use crate::{IpcError, Request, Response, ResponseData, RunSummary};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/harvester.sock";

/// Connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Request/response timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Answer to a harvest trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestAck {
    /// Run accepted; its outcome is only visible through logs and `last_run`
    Accepted,
    /// Rejected, retry after the given number of seconds
    Throttled { retry_after_secs: u64 },
}

/// IPC client for communicating with the daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a client with default socket path
    pub fn new() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }

    /// Create a client with custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Connect with custom socket path
    pub async fn connect_to<P: AsRef<Path>>(socket_path: P) -> Result<ConnectedClient, IpcError> {
        Self::with_socket_path(socket_path).do_connect().await
    }

    async fn do_connect(&self) -> Result<ConnectedClient, IpcError> {
        if !self.socket_path.exists() {
            return Err(IpcError::DaemonNotRunning);
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| IpcError::ConnectionFailed("Connection timed out".to_string()))??;

        Ok(ConnectedClient { stream })
    }

    /// Check if daemon is running
    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists()
    }
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected IPC client that can send requests and receive responses
pub struct ConnectedClient {
    stream: UnixStream,
}

impl ConnectedClient {
    /// Send a request and wait for response
    pub async fn send(&mut self, request: Request) -> Result<Response, IpcError> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.do_send(request))
            .await
            .map_err(|_| IpcError::ConnectionFailed("Request timed out".to_string()))?
    }

    async fn do_send(&mut self, request: Request) -> Result<Response, IpcError> {
        let request_bytes = rmp_serde::to_vec(&request)?;
        let len_bytes = (request_bytes.len() as u32).to_le_bytes();

        self.stream.write_all(&len_bytes).await?;
        self.stream.write_all(&request_bytes).await?;
        self.stream.flush().await?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut response_buf = vec![0u8; len];
        self.stream.read_exact(&mut response_buf).await?;

        let response: Response = rmp_serde::from_slice(&response_buf)?;

        Ok(response)
    }
}

/// Convenience functions for one-off requests
impl IpcClient {
    /// Send a request and wait for response (opens new connection)
    pub async fn request(&self, request: Request) -> Result<Response, IpcError> {
        let mut client = self.do_connect().await?;
        client.send(request).await
    }

    /// Trigger a harvest for a workspace
    pub async fn harvest(&self, workspace: &str) -> Result<HarvestAck, IpcError> {
        let response = self
            .request(Request::Harvest {
                workspace: workspace.to_string(),
            })
            .await?;

        match response {
            Response::Ack => Ok(HarvestAck::Accepted),
            Response::Throttled { retry_after_secs } => {
                Ok(HarvestAck::Throttled { retry_after_secs })
            }
            Response::Error { message, .. } => Err(IpcError::Daemon(message)),
            other => Err(IpcError::Daemon(format!("Unexpected response: {other:?}"))),
        }
    }

    /// Get the last finished run of a workspace
    pub async fn last_run(&self, workspace: &str) -> Result<Option<RunSummary>, IpcError> {
        let response = self
            .request(Request::LastRun {
                workspace: workspace.to_string(),
            })
            .await?;

        match response {
            Response::Ok {
                data: Some(ResponseData::LastRun { summary }),
            } => Ok(summary),
            Response::Error { message, .. } => Err(IpcError::Daemon(message)),
            other => Err(IpcError::Daemon(format!("Unexpected response: {other:?}"))),
        }
    }

    /// Get daemon status
    pub async fn get_status(&self) -> Result<ResponseData, IpcError> {
        let response = self.request(Request::Status).await?;

        match response {
            Response::Ok { data: Some(data) } => Ok(data),
            Response::Error { message, .. } => Err(IpcError::Daemon(message)),
            _ => Err(IpcError::Daemon("Unexpected response".to_string())),
        }
    }
}
