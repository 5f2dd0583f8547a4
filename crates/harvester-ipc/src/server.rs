//! Unix socket IPC server for the harvester daemon.
//!
//! Handles incoming connections and dispatches requests to handlers.

use crate::{ErrorCode, IpcError, Request, Response};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Maximum request size (1MB)
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Request timeout for reading from socket
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Body encoding of a frame. Replies use the encoding of their request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    MessagePack,
    Json,
}

/// Unix socket IPC server
pub struct IpcServer {
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
}

impl IpcServer {
    /// Create a new IPC server bound to the given socket path
    pub async fn new<P: AsRef<Path>>(
        socket_path: P,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, IpcError> {
        let socket_path = socket_path.as_ref();

        // Remove stale socket file if it exists
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;

        // Socket is user-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!("IPC server listening on {}", socket_path.display());

        Ok(Self { listener, handler })
    }

    /// Run the server, accepting connections until shutdown
    pub async fn run(&self) -> Result<(), IpcError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, handler).await {
                            tracing::debug!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), IpcError> {
        let request = tokio::time::timeout(REQUEST_TIMEOUT, Self::read_request(&mut stream))
            .await
            .map_err(IpcError::Timeout)?;

        let (request, encoding) = match request {
            Ok(decoded) => decoded,
            Err(e) => {
                let response = Response::error(
                    ErrorCode::InvalidRequest,
                    format!("Failed to parse request: {}", e),
                );
                Self::write_response(&mut stream, &response, Encoding::MessagePack).await?;
                return Err(e);
            }
        };

        match &request {
            Request::Harvest { workspace } | Request::LastRun { workspace } => {
                tracing::debug!(workspace = %workspace, ?encoding, "Received {:?}", request);
            }
            _ => tracing::debug!(?encoding, "Received {:?}", request),
        }

        let response = handler.handle(request).await;

        Self::write_response(&mut stream, &response, encoding).await?;

        Ok(())
    }

    async fn read_request(stream: &mut UnixStream) -> Result<(Request, Encoding), IpcError> {
        // Length prefix (4 bytes, little-endian)
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_REQUEST_SIZE {
            return Err(IpcError::RequestTooLarge);
        }

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        decode_request(&buf)
    }

    async fn write_response(
        stream: &mut UnixStream,
        response: &Response,
        encoding: Encoding,
    ) -> Result<(), IpcError> {
        let response_bytes = match encoding {
            Encoding::MessagePack => rmp_serde::to_vec(response)?,
            Encoding::Json => serde_json::to_vec(response)?,
        };
        let len_bytes = (response_bytes.len() as u32).to_le_bytes();

        stream.write_all(&len_bytes).await?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        Ok(())
    }
}

/// Decode a request body: MessagePack first, JSON as a fallback for
/// hand-written requests (nc/socat).
fn decode_request(buf: &[u8]) -> Result<(Request, Encoding), IpcError> {
    match rmp_serde::from_slice(buf) {
        Ok(request) => Ok((request, Encoding::MessagePack)),
        Err(msgpack_err) => serde_json::from_slice(buf)
            .map(|request| (request, Encoding::Json))
            .map_err(|_| IpcError::Deserialize(msgpack_err)),
    }
}

/// Trait for handling incoming requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request and return a response
    async fn handle(&self, request: Request) -> Response;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResponseData;

    struct TestHandler;

    #[async_trait]
    impl RequestHandler for TestHandler {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Ping => Response::ok_with(ResponseData::Pong {
                    timestamp: chrono::Utc::now().timestamp(),
                }),
                _ => Response::ack(),
            }
        }
    }

    #[test]
    fn test_decode_json_fallback() {
        let (request, encoding) =
            decode_request(br#"{"action":"last_run","workspace":"alice"}"#).unwrap();
        assert!(matches!(request, Request::LastRun { workspace } if workspace == "alice"));
        assert_eq!(encoding, Encoding::Json);

        let msgpack = rmp_serde::to_vec(&Request::Status).unwrap();
        let (request, encoding) = decode_request(&msgpack).unwrap();
        assert!(matches!(request, Request::Status));
        assert_eq!(encoding, Encoding::MessagePack);

        assert!(matches!(
            decode_request(b"\xc1garbage"),
            Err(IpcError::Deserialize(_))
        ));
    }

    #[tokio::test]
    async fn test_server_ping() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("server.sock");

        let handler = Arc::new(TestHandler);
        let server = IpcServer::new(&socket_path, handler).await.unwrap();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();

        let request_bytes = rmp_serde::to_vec(&Request::Ping).unwrap();
        let len_bytes = (request_bytes.len() as u32).to_le_bytes();

        stream.write_all(&len_bytes).await.unwrap();
        stream.write_all(&request_bytes).await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut response_buf = vec![0u8; len];
        stream.read_exact(&mut response_buf).await.unwrap();

        let response: Response = rmp_serde::from_slice(&response_buf).unwrap();

        if let Response::Ok {
            data: Some(ResponseData::Pong { .. }),
        } = response
        {
            // Success
        } else {
            panic!("Expected Pong response, got {:?}", response);
        }
    }
}
