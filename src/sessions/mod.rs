//! Session directory: chat session state and transcripts.

pub mod in_memory;
pub mod query;
pub mod state;
pub mod traits;

pub use in_memory::InMemorySessionStore;
pub use query::{DirectoryQuery, StatusCounts};
pub use state::Transition;
pub use traits::{EndReason, Message, Role, Session, SessionId, SessionStatus, SessionStore};

use std::sync::Arc;

/// Create a default in-memory session store.
pub fn create_session_store() -> Arc<dyn SessionStore> {
    Arc::new(InMemorySessionStore::new())
}
