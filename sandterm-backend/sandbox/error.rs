use std::io;

/// Which half of the exec create → start sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStage {
    Create,
    Start,
}

impl std::fmt::Display for ExecStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecStage::Create => f.write_str("create"),
            ExecStage::Start => f.write_str("start"),
        }
    }
}

/// Errors surfaced by the container session subsystem.
///
/// Lifecycle failures (`SandboxUnavailable`, `PortUnresolved`) are absorbed by
/// the lifecycle manager and reported to callers as an absent result; the
/// other variants drive terminal close codes.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("no host port bound for {0}")]
    PortUnresolved(String),

    #[error("exec {stage} failed: {message}")]
    ExecUnavailable { stage: ExecStage, message: String },

    #[error("stream fault: {0}")]
    StreamFault(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

/// Errors returned by a [`RuntimeClient`](super::runtime::RuntimeClient).
///
/// Backends map their transport-specific errors into these variants.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("runtime api error: {0}")]
    Api(String),

    #[error("runtime transport error: {0}")]
    Transport(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
