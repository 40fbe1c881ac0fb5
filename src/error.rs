//! Error kinds shared across the runtime.
//!
//! Every failure carries a machine tag (for transport layers to map onto
//! HTTP statuses or WS error frames) and a human-readable message.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Match, engine snapshot, token or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Token invalid, or the user may not perform this host/match action.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation would violate a match invariant (seat taken, not ready, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The rule engine rejected the action.
    #[error("illegal action: {0}")]
    IllegalAction(String),

    /// Action submitted by a player who is not on turn.
    #[error("not your turn")]
    NotYourTurn,

    /// Lock not acquired within the allowed wait; callers should retry.
    #[error("busy: {0}")]
    Busy(String),

    /// Lock fence invalidated mid-section; the section aborted without writing.
    #[error("lock lost: {0}")]
    LockLost(String),

    /// Engine snapshot failed to deserialize. Fatal for the match.
    #[error("engine corrupt: {0}")]
    EngineCorrupt(String),

    /// A deadline sweep fired. Internal only.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The runtime is stopping.
    #[error("shutting down")]
    Shutdown,

    #[error("config: {0}")]
    Config(String),

    #[error("store: {0}")]
    Store(String),
}

impl Error {
    /// Stable machine tag for the command-port boundary.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "notFound",
            Error::Unauthorized(_) => "unauthorized",
            Error::Conflict(_) => "conflict",
            Error::IllegalAction(_) => "illegalAction",
            Error::NotYourTurn => "notYourTurn",
            Error::Busy(_) => "busy",
            Error::LockLost(_) => "lockLost",
            Error::EngineCorrupt(_) => "engineCorrupt",
            Error::Timeout(_) => "timeout",
            Error::Shutdown => "shutdown",
            Error::Config(_) => "config",
            Error::Store(_) => "store",
        }
    }

    /// True for failures a caller should simply retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::LockLost(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(Error::NotYourTurn.tag(), "notYourTurn");
        assert_eq!(Error::Busy("x".into()).tag(), "busy");
        assert_eq!(Error::EngineCorrupt("bad json".into()).tag(), "engineCorrupt");
    }

    #[test]
    fn transient_kinds() {
        assert!(Error::Busy("lock".into()).is_transient());
        assert!(Error::LockLost("lock".into()).is_transient());
        assert!(!Error::NotFound("m".into()).is_transient());
    }
}
