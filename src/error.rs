use thiserror::Error;

/// Categorized failures for every phase of the controller's bring-up.
///
/// `Oom` from the original design has no variant here: Rust's global
/// allocator aborts the process on allocation failure rather than
/// returning a catchable error (see DESIGN.md).
#[derive(Debug, Error)]
pub enum ScError {
    #[error("bridge daemon is unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("no eligible device found")]
    NoDevice,

    #[error("multiple eligible devices found: {0:?}")]
    AmbiguousDevice(Vec<String>),

    #[error("server payload not found: {0}")]
    PayloadMissing(String),

    #[error("push of {local} to {serial}:{remote} failed")]
    PushFailed {
        serial: String,
        local: String,
        remote: String,
    },

    #[error("could not switch {serial} to TCP/IP: {reason}")]
    TcpipSetupFailed { serial: String, reason: String },

    #[error("could not establish tunnel: {0}")]
    TunnelSetupFailed(String),

    #[error("failed to spawn remote server process")]
    RemoteSpawnFailed,

    #[error("device handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("remote process exited before the device handshake completed")]
    RemoteExitedEarly,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScError>;
