//! Error types shared across the queue, the asset server and the decode gateway.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("no free port in range {from}..{to}")]
    NoFreePort { from: u16, to: u16 },

    #[error("failed to probe port {port} on {host}: {source}")]
    Io {
        host: std::net::IpAddr,
        port: u16,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("tried {attempts} times to find a free port, giving up")]
    BindExhausted { attempts: usize },

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server task failed: {0}")]
    Serve(String),

    #[error("decode backend shutdown failed: {0}")]
    DecoderShutdown(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job id collision: {0}")]
    DuplicateId(String),

    #[error("invalid render request: {0}")]
    InvalidRequest(String),

    #[error("{} cleanup action(s) failed for job {job_id}: {}", failures.len(), failures.join("; "))]
    CleanupFailure {
        job_id: String,
        failures: Vec<String>,
    },
}

/// Failures reported by (or on behalf of) the external rendering engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },

    #[error("render was cancelled")]
    Cancelled,

    #[error("render timed out after {0} ms")]
    TimedOut(u64),

    #[error("render engine crashed: {0}")]
    Crashed(String),
}

impl EngineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }
}

/// Errors surfaced by the frame-decode gateway. Cloneable so joined
/// requests for the same frame all observe the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("frame decode backend is unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    DecodeFailed(String),
}

/// Errors a [`crate::gateway::FrameDecoder`] backend may return.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The request failed; the backend stays usable.
    #[error("{0}")]
    Failed(String),

    /// The backend cannot serve any further requests.
    #[error("{0}")]
    Fatal(String),
}
