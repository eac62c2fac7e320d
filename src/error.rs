use std::path::PathBuf;

/// Errors produced while bringing up or driving a backend connection.
///
/// Failures that happen before the connection is established are converted
/// by the relay into synthetic DAP failure responses; failures local to a
/// single message never reach this type at all (they are logged and the
/// session continues).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    // --------------------------------- sequencing errors -----------------------------------------
    #[error("the first message must be an initialize request, got `{0}`")]
    BadFirstMessage(String),

    // --------------------------------- startup errors --------------------------------------------
    #[error("cannot find debugger backend `{0}`")]
    BackendNotFound(String),
    #[error("debuggee program is not usable: {0}")]
    ProgramInvalid(String),
    #[error("failed to spawn `{tool}`: {source}")]
    Spawn {
        tool: PathBuf,
        source: std::io::Error,
    },
    #[error("backend exited before becoming ready ({status}): {stderr}")]
    EarlyExit { status: String, stderr: String },
    #[error("timed out while waiting for the backend to print its ready marker")]
    ReadyTimeout,
    #[error("failed to connect to backend at {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("timed out while waiting for the backend to dial back")]
    RendezvousTimeout,

    // --------------------------------- configuration errors --------------------------------------
    #[error("using a relative path for `logDest` is not allowed: {0}")]
    RelativeLogDest(PathBuf),
    #[error("`logDest` is not supported on this platform")]
    LogDestUnsupported,

    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
