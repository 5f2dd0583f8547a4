//! IPC Protocol definitions for harvester daemon communication.
//!
//! Uses MessagePack for efficient serialization over Unix sockets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request from client (CLI / request layer) to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Run a harvest for a workspace (accepted or throttled, never awaited)
    Harvest { workspace: String },

    /// Summary of the most recent finished run of a workspace
    LastRun { workspace: String },

    /// Get daemon status
    Status,

    /// Graceful shutdown
    Shutdown,

    /// Ping for health check
    Ping,
}

/// Response from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success with optional data
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },

    /// Acknowledgment: the harvest was accepted and runs in the background
    Ack,

    /// Harvest rejected, retry later
    Throttled { retry_after_secs: u64 },

    /// Error response
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Create a success response with no data
    pub fn ok() -> Self {
        Response::Ok { data: None }
    }

    /// Create a success response with data
    pub fn ok_with(data: ResponseData) -> Self {
        Response::Ok { data: Some(data) }
    }

    /// Create an acknowledgment response
    pub fn ack() -> Self {
        Response::Ack
    }

    /// Create a throttle rejection, rounding the wait up to whole seconds
    pub fn throttled(retry_after: Duration) -> Self {
        let mut secs = retry_after.as_secs();
        if retry_after.subsec_nanos() > 0 || secs == 0 {
            secs += 1;
        }
        Response::Throttled {
            retry_after_secs: secs,
        }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Daemon status
    Status {
        version: String,
        uptime_secs: u64,
        /// Runs currently executing
        active_runs: usize,
        #[serde(default)]
        runs_started: u64,
        #[serde(default)]
        runs_completed: u64,
        #[serde(default)]
        runs_failed: u64,
        #[serde(default)]
        runs_throttled: u64,
        #[serde(default)]
        batches_emitted: u64,
        /// Average run duration in milliseconds
        #[serde(default)]
        avg_run_ms: u64,
        /// P99 run duration in milliseconds
        #[serde(default)]
        p99_run_ms: u64,
    },

    /// Pong response
    Pong { timestamp: i64 },

    /// Last finished run of a workspace, if any
    LastRun { summary: Option<RunSummary> },
}

/// How a finished run ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Summary of one finished run, kept by the daemon for operators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub workspace: String,
    pub status: RunStatus,
    /// Unix timestamps (seconds)
    pub started_at: i64,
    pub finished_at: i64,
    #[serde(default)]
    pub listed: usize,
    #[serde(default)]
    pub changed: usize,
    #[serde(default)]
    pub deleted: usize,
    #[serde(default)]
    pub cascaded: usize,
    #[serde(default)]
    pub failures: usize,
    #[serde(default)]
    pub batches: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error codes for error responses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request format is invalid
    InvalidRequest,
    /// Internal daemon error
    InternalError,
    /// Operation timed out
    Timeout,
    /// Daemon is shutting down
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::Harvest {
            workspace: "alice".to_string(),
        };

        // JSON form is what nc/socat users type
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"action":"harvest","workspace":"alice"}"#);

        let msgpack = rmp_serde::to_vec(&req).unwrap();
        let decoded: Request = rmp_serde::from_slice(&msgpack).unwrap();

        if let Request::Harvest { workspace } = decoded {
            assert_eq!(workspace, "alice");
        } else {
            panic!("Decoded wrong variant");
        }
    }

    #[test]
    fn test_throttled_rounds_up() {
        let resp = Response::throttled(Duration::from_millis(6_200));
        assert!(matches!(resp, Response::Throttled { retry_after_secs: 7 }));

        let resp = Response::throttled(Duration::from_millis(300));
        assert!(matches!(resp, Response::Throttled { retry_after_secs: 1 }));

        let resp = Response::throttled(Duration::from_secs(4));
        assert!(matches!(resp, Response::Throttled { retry_after_secs: 4 }));

        let json = serde_json::to_string(&Response::throttled(Duration::from_secs(4))).unwrap();
        assert!(json.contains("throttled"));
        assert!(json.contains("\"retry_after_secs\":4"));
    }

    #[test]
    fn test_last_run_response_roundtrip() {
        let summary = RunSummary {
            workspace: "alice".to_string(),
            status: RunStatus::Failed,
            started_at: 1_700_000_000,
            finished_at: 1_700_000_002,
            listed: 12,
            changed: 3,
            deleted: 1,
            cascaded: 0,
            failures: 0,
            batches: 1,
            error: Some("Batch emission failed for alice".to_string()),
        };

        let response = Response::ok_with(ResponseData::LastRun {
            summary: Some(summary.clone()),
        });
        let msgpack = rmp_serde::to_vec(&response).unwrap();
        let decoded: Response = rmp_serde::from_slice(&msgpack).unwrap();

        if let Response::Ok {
            data: Some(ResponseData::LastRun { summary: Some(decoded) }),
        } = decoded
        {
            assert_eq!(decoded, summary);
        } else {
            panic!("Decoded wrong response variant");
        }
    }

    #[test]
    fn test_status_serialization() {
        let resp = Response::ok_with(ResponseData::Status {
            version: "0.1.0".to_string(),
            uptime_secs: 3600,
            active_runs: 1,
            runs_started: 10,
            runs_completed: 8,
            runs_failed: 1,
            runs_throttled: 4,
            batches_emitted: 9,
            avg_run_ms: 120,
            p99_run_ms: 900,
        });

        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("ok"));
        assert!(json.contains("runs_throttled"));
    }
}
