//! Error taxonomy for the streaming engine
//!
//! Every variant renders a human-readable reason; the CLI prints it verbatim
//! and picks an exit code from [`ErrorKind`].

use thiserror::Error;

/// Errors surfaced by the streaming engine
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("device discovery failed: {0}")]
    Discovery(String),

    #[error("could not bind local relay - port {port} in use")]
    Bind { port: u16 },

    #[error("receiver {app_id} on '{device}' did not respond in time")]
    ReceiverTimeout { device: String, app_id: String },

    #[error("remote device '{0}' unreachable")]
    DeviceUnreachable(String),

    #[error("device '{0}' not found in the last scan")]
    DeviceNotFound(String),

    #[error("encoder for feed '{feed}' exited ({})", exit_label(.code))]
    EncoderExited { feed: String, code: Option<i32> },

    #[error("sync degraded after {failures} consecutive probe failures")]
    SyncProbeDegraded { failures: u32 },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output for feed '{feed}' not available after {waited_ms}ms")]
    OutputTimeout { feed: String, waited_ms: u64 },

    #[error("relay is not live")]
    RelayDown,

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("cast call failed: {0}")]
    Cast(String),

    #[error("local audio control failed: {0}")]
    AudioControl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled by stop request")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "killed by signal".to_string(),
    }
}

/// Coarse classification used for exit codes and fault policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    Bind,
    Receiver,
    Unreachable,
    Encoder,
    Sync,
    Cancelled,
    Other,
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Discovery(_) => ErrorKind::Discovery,
            StreamError::Bind { .. } => ErrorKind::Bind,
            StreamError::ReceiverTimeout { .. } | StreamError::Cast(_) => ErrorKind::Receiver,
            StreamError::DeviceUnreachable(_) | StreamError::DeviceNotFound(_) => {
                ErrorKind::Unreachable
            }
            StreamError::EncoderExited { .. }
            | StreamError::Spawn { .. }
            | StreamError::OutputTimeout { .. } => ErrorKind::Encoder,
            StreamError::SyncProbeDegraded { .. } => ErrorKind::Sync,
            StreamError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
