//! Error taxonomy for the interpreter session core.
//!
//! Faults fall into four families with different blast radii:
//! transport faults abort the current start attempt and force a full
//! teardown; protocol and tool faults are logged and processing
//! continues; persistence faults trigger a locally synthesized fallback
//! so the summary view is never empty.

use thiserror::Error;

/// Errors surfaced by the session core.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Permission denial, negotiation failure, or network failure while
    /// establishing the peer connection. Fatal to the current start
    /// attempt; the message is suitable for direct display as a status.
    #[error("{0}")]
    Transport(String),

    /// Malformed inbound JSON, unknown event kind, or a tool-call for an
    /// unregistered tool. Never fatal to the event loop.
    #[error("protocol fault: {0}")]
    Protocol(String),

    /// A tool handler failed or reported `success: false`.
    #[error("tool fault: {0}")]
    Tool(String),

    /// The conversation archive rejected a save or query.
    #[error("persistence fault: {0}")]
    Persistence(String),
}

impl SessionError {
    /// Build a transport fault from any displayable cause.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
