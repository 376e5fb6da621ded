//! Error taxonomy shared by the session directory, the hub and the gateway.

/// Every failure a broker operation can report to a connection.
///
/// None of these are fatal to the process: the offending connection gets an
/// `error` frame and the rest of the broker carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Unknown session id on join/message/end or a directory lookup.
    #[error("session not found: {0}")]
    NotFound(String),
    /// Illegal state transition or an operation the leg is not allowed to perform.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Lost an admin join race: another admin leg is already bound.
    #[error("session {0} already has an admin bound")]
    AlreadyBound(String),
    /// Undecodable frame or a missing/empty required field.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// Id generation produced an id that is already in the directory.
    #[error("session id collision: {0}")]
    IdCollision(String),
}

impl BrokerError {
    /// Stable wire code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::AlreadyBound(_) => "already_bound",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::IdCollision(_) => "id_collision",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}
