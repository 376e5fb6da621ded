//! Session directory traits and types for visitor/operator chats.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::Transition;
use crate::error::BrokerError;

pub type SessionId = String;

/// Which side of a chat a leg or a transcript entry belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The anonymous visitor.
    User,
    /// The human operator.
    Admin,
}

impl Role {
    /// The other leg of the session.
    pub fn peer(self) -> Self {
        match self {
            Self::User => Self::Admin,
            Self::Admin => Self::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. Only ever advances: waiting → active → ended, or waiting → ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Active => 1,
            Self::Ended => 2,
        }
    }

    /// True when `next` is a strict forward move from `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

/// Why a session reached `ended`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The bound admin sent `end`.
    Closed,
    /// No admin joined within the waiting bound.
    Abandoned,
    /// The admin leg dropped and never came back within the grace period.
    AdminLeft,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
            Self::AdminLeft => "admin_left",
        }
    }
}

/// A single transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A visitor-to-operator chat exchange, as served to the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub user_name: String,
    pub user_email: String,
    pub status: SessionStatus,
    pub end_reason: Option<EndReason>,
    /// The transcript. Append-only; frozen once `status` is `ended`.
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub assigned_admin: Option<String>,
}

impl Session {
    pub(crate) fn new(id: SessionId, user_name: &str, user_email: &str) -> Self {
        Self {
            id,
            user_name: user_name.to_string(),
            user_email: user_email.to_string(),
            status: SessionStatus::Waiting,
            end_reason: None,
            messages: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
            assigned_admin: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }
}

/// Authoritative record of every session, current and historical.
///
/// Every mutation on a single session is linearizable with respect to the
/// others; implementations must not serialize unrelated sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocate a fresh id and store a `waiting` session, seeding the transcript
    /// with one `user` message when `initial_message` is non-empty.
    async fn create(
        &self,
        user_name: &str,
        user_email: &str,
        initial_message: &str,
    ) -> Result<Session, BrokerError>;

    /// Fetch a snapshot of a session.
    async fn get(&self, id: &str) -> Result<Session, BrokerError>;

    /// Current status without cloning the transcript.
    async fn status(&self, id: &str) -> Result<SessionStatus, BrokerError>;

    /// All sessions in creation order.
    async fn list(&self) -> Vec<Session>;

    /// Append to the transcript. Fails with `InvalidState` once ended.
    async fn append_message(
        &self,
        id: &str,
        sender: Role,
        content: &str,
    ) -> Result<Message, BrokerError>;

    /// Apply a state-machine transition atomically and return the new snapshot.
    async fn transition(&self, id: &str, transition: Transition) -> Result<Session, BrokerError>;

    /// Evict an ended session from the directory.
    async fn remove(&self, id: &str) -> Result<(), BrokerError>;

    /// The name of this store implementation.
    fn name(&self) -> &str;
}
