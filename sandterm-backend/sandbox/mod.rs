pub mod demux;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod runtime;
pub mod session;

#[cfg(test)]
pub mod testing;

pub use error::{ExecStage, RuntimeError, SandboxError};
pub use lifecycle::{ReadySandbox, SandboxManager, SandboxSettings};
pub use registry::SessionRegistry;
pub use runtime::RuntimeClient;
pub use session::{
    ClientEvent, ClientTransport, CloseReason, ServerMessage, SessionContext, TerminalSession,
};
