//! Session state machine: which transitions are legal and who may trigger them.

use chrono::{DateTime, Utc};

use super::traits::{EndReason, Role, Session, SessionStatus};
use crate::error::BrokerError;

/// A requested lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// waiting → active, binding `admin` as the session's operator.
    Join { admin: String },
    /// active → ended, requested over the socket by the leg playing `by`.
    End { by: Role },
    /// waiting → ended, fired by the waiting-timeout monitor.
    Abandon,
    /// active → ended, fired when a disconnected admin never returned.
    AdminLeft,
}

impl Transition {
    pub fn target(&self) -> SessionStatus {
        match self {
            Self::Join { .. } => SessionStatus::Active,
            Self::End { .. } | Self::Abandon | Self::AdminLeft => SessionStatus::Ended,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::End { .. } => "end",
            Self::Abandon => "abandon",
            Self::AdminLeft => "admin_left",
        }
    }

    fn required_status(&self) -> SessionStatus {
        match self {
            Self::Join { .. } | Self::Abandon => SessionStatus::Waiting,
            Self::End { .. } | Self::AdminLeft => SessionStatus::Active,
        }
    }
}

/// Check `transition` against `session` and apply it.
///
/// On error `session` is left untouched.
pub fn apply(
    session: &mut Session,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<(), BrokerError> {
    if let Transition::End { by: Role::User } = transition {
        return Err(BrokerError::invalid(format!(
            "session {}: only the admin leg may end a session",
            session.id
        )));
    }

    let required = transition.required_status();
    if session.status != required {
        return Err(BrokerError::invalid(format!(
            "session {}: cannot {} while {}",
            session.id,
            transition.name(),
            session.status.as_str()
        )));
    }
    debug_assert!(session.status.can_advance_to(transition.target()));

    match transition {
        Transition::Join { admin } => {
            if session.assigned_admin.is_some() {
                return Err(BrokerError::invalid(format!(
                    "session {}: admin already assigned",
                    session.id
                )));
            }
            if admin.trim().is_empty() {
                return Err(BrokerError::MalformedFrame("admin identity is empty".into()));
            }
            session.assigned_admin = Some(admin.clone());
            session.status = SessionStatus::Active;
        }
        Transition::End { .. } => seal(session, EndReason::Closed, now),
        Transition::Abandon => seal(session, EndReason::Abandoned, now),
        Transition::AdminLeft => seal(session, EndReason::AdminLeft, now),
    }
    Ok(())
}

fn seal(session: &mut Session, reason: EndReason, now: DateTime<Utc>) {
    session.status = SessionStatus::Ended;
    session.end_reason = Some(reason);
    session.ended_at = Some(now);
}
