//! Directory query service backing the dashboard's list and history search.

use serde::Serialize;
use std::sync::Arc;

use super::traits::{Session, SessionStatus, SessionStore};
use crate::error::BrokerError;

/// Session counts by status, for health reporting.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub waiting: usize,
    pub active: usize,
    pub ended: usize,
}

/// Read-only view over a [`SessionStore`].
#[derive(Clone)]
pub struct DirectoryQuery {
    store: Arc<dyn SessionStore>,
}

impl DirectoryQuery {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Every session, transcripts included, in creation order.
    pub async fn list_all(&self) -> Vec<Session> {
        self.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Session, BrokerError> {
        self.store.get(id).await
    }

    /// Ended sessions whose name or email contains `needle`, ignoring case.
    pub async fn search(&self, needle: &str) -> Vec<Session> {
        let needle = needle.trim().to_lowercase();
        self.store
            .list()
            .await
            .into_iter()
            .filter(|s| s.status == SessionStatus::Ended && matches_needle(s, &needle))
            .collect()
    }

    pub async fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for session in self.store.list().await {
            match session.status {
                SessionStatus::Waiting => counts.waiting += 1,
                SessionStatus::Active => counts.active += 1,
                SessionStatus::Ended => counts.ended += 1,
            }
        }
        counts
    }
}

fn matches_needle(session: &Session, needle_lower: &str) -> bool {
    needle_lower.is_empty()
        || session.user_name.to_lowercase().contains(needle_lower)
        || session.user_email.to_lowercase().contains(needle_lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{InMemorySessionStore, Transition};

    async fn seeded() -> (DirectoryQuery, Vec<Session>) {
        let store = Arc::new(InMemorySessionStore::new());
        let alice = store.create("Alice Smith", "alice@x.com", "").await.unwrap();
        let bob = store.create("Bob", "BOB@Example.org", "").await.unwrap();
        let carol = store.create("Carol", "carol@x.com", "").await.unwrap();

        store.transition(&alice.id, Transition::Abandon).await.unwrap();
        store.transition(&bob.id, Transition::Abandon).await.unwrap();
        // Carol stays waiting.

        let query = DirectoryQuery::new(store);
        (query, vec![alice, bob, carol])
    }

    #[tokio::test]
    async fn search_is_case_insensitive_on_name_and_email() {
        let (query, sessions) = seeded().await;

        let by_name = query.search("SMITH").await;
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, sessions[0].id);

        let by_email = query.search("example").await;
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].id, sessions[1].id);
    }

    #[tokio::test]
    async fn search_excludes_live_sessions() {
        let (query, _) = seeded().await;
        assert!(query.search("carol").await.is_empty());
        // Empty needle lists all ended sessions.
        assert_eq!(query.search("").await.len(), 2);
    }

    #[tokio::test]
    async fn list_all_and_counts_cover_every_status() {
        let (query, _) = seeded().await;
        assert_eq!(query.list_all().await.len(), 3);
        assert_eq!(
            query.counts().await,
            StatusCounts {
                waiting: 1,
                active: 0,
                ended: 2
            }
        );
    }
}
