//! JSON wire frames exchanged over the chat socket.
//!
//! Every frame is an object tagged by `type`; field names are camelCase so the
//! existing visitor widget and admin dashboard keep working unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::sessions::{EndReason, Message, Role, SessionId};

/// Client → broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Visitor opens a chat.
    #[serde(rename_all = "camelCase")]
    Init {
        user_name: String,
        user_email: String,
        #[serde(default)]
        content: String,
    },
    /// Operator claims a waiting session.
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: SessionId,
        #[serde(default)]
        role: Option<Role>,
    },
    /// Chat line from either leg. `sender` is advisory; the bound role wins.
    #[serde(rename_all = "camelCase")]
    Message {
        session_id: SessionId,
        #[serde(default)]
        sender: Option<Role>,
        content: String,
    },
    /// Operator closes the chat.
    #[serde(rename_all = "camelCase")]
    End { session_id: SessionId },
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, BrokerError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Join { .. } => "join",
            Self::Message { .. } => "message",
            Self::End { .. } => "end",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Init { .. } => None,
            Self::Join { session_id, .. }
            | Self::Message { session_id, .. }
            | Self::End { session_id } => Some(session_id),
        }
    }
}

/// Broker → client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    AdminJoined { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Message {
        session_id: SessionId,
        sender: Role,
        content: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: SessionId,
        reason: EndReason,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { session_id: SessionId, role: Role },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
}

impl OutboundFrame {
    pub fn relayed(session_id: &str, message: &Message) -> Self {
        Self::Message {
            session_id: session_id.to_string(),
            sender: message.sender,
            content: message.content.clone(),
            timestamp: message.timestamp,
        }
    }

    pub fn error(err: &BrokerError, session_id: Option<&str>) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::AdminJoined { .. } => "admin_joined",
            Self::Message { .. } => "message",
            Self::SessionEnded { .. } => "session_ended",
            Self::PeerLeft { .. } => "peer_left",
            Self::Error { .. } => "error",
        }
    }
}
