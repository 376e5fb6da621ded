//! In-memory session directory.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::state::{self, Transition};
use super::traits::{Message, Role, Session, SessionId, SessionStatus, SessionStore};
use crate::error::BrokerError;

#[derive(Default)]
struct Directory {
    by_id: HashMap<SessionId, Arc<Mutex<Session>>>,
    /// Creation order, for stable listing.
    order: Vec<SessionId>,
}

/// An in-memory session store with one lock per session.
///
/// The outer `RwLock` is only write-locked to insert or evict an entry, so
/// relays on unrelated sessions never contend.
pub struct InMemorySessionStore {
    inner: RwLock<Directory>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Directory::default()),
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<Session>>, BrokerError> {
        self.inner
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    fn insert_with_id(
        &self,
        id: SessionId,
        user_name: &str,
        user_email: &str,
        initial_message: &str,
    ) -> Result<Session, BrokerError> {
        let mut session = Session::new(id.clone(), user_name, user_email);
        if !initial_message.trim().is_empty() {
            session.messages.push(Message {
                sender: Role::User,
                content: initial_message.to_string(),
                timestamp: session.created_at,
            });
        }

        let mut dir = self.inner.write();
        if dir.by_id.contains_key(&id) {
            return Err(BrokerError::IdCollision(id));
        }
        dir.by_id
            .insert(id.clone(), Arc::new(Mutex::new(session.clone())));
        dir.order.push(id);
        Ok(session)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        user_name: &str,
        user_email: &str,
        initial_message: &str,
    ) -> Result<Session, BrokerError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.insert_with_id(id, user_name, user_email, initial_message)
    }

    async fn get(&self, id: &str) -> Result<Session, BrokerError> {
        let entry = self.entry(id)?;
        let session = entry.lock().clone();
        Ok(session)
    }

    async fn status(&self, id: &str) -> Result<SessionStatus, BrokerError> {
        let entry = self.entry(id)?;
        let status = entry.lock().status;
        Ok(status)
    }

    async fn list(&self) -> Vec<Session> {
        let entries: Vec<Arc<Mutex<Session>>> = {
            let dir = self.inner.read();
            dir.order
                .iter()
                .filter_map(|id| dir.by_id.get(id).cloned())
                .collect()
        };
        entries.iter().map(|e| e.lock().clone()).collect()
    }

    async fn append_message(
        &self,
        id: &str,
        sender: Role,
        content: &str,
    ) -> Result<Message, BrokerError> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        if session.is_ended() {
            return Err(BrokerError::invalid(format!(
                "session {id} has ended; transcript is sealed"
            )));
        }
        let message = Message {
            sender,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        session.messages.push(message.clone());
        Ok(message)
    }

    async fn transition(&self, id: &str, transition: Transition) -> Result<Session, BrokerError> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        state::apply(&mut session, &transition, Utc::now())?;
        Ok(session.clone())
    }

    async fn remove(&self, id: &str) -> Result<(), BrokerError> {
        let mut dir = self.inner.write();
        let ended = match dir.by_id.get(id) {
            Some(entry) => entry.lock().is_ended(),
            None => return Err(BrokerError::NotFound(id.to_string())),
        };
        if !ended {
            return Err(BrokerError::invalid(format!(
                "session {id} is still live and cannot be evicted"
            )));
        }
        dir.by_id.remove(id);
        dir.order.retain(|existing| existing != id);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::EndReason;

    fn join(admin: &str) -> Transition {
        Transition::Join {
            admin: admin.to_string(),
        }
    }

    #[tokio::test]
    async fn create_seeds_transcript_with_initial_message() {
        let store = InMemorySessionStore::new();
        let created = store.create("Alice", "a@x.com", "Need help").await.unwrap();
        assert_eq!(created.status, SessionStatus::Waiting);
        assert_eq!(created.messages.len(), 1);
        assert_eq!(created.messages[0].sender, Role::User);
        assert_eq!(created.messages[0].content, "Need help");

        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn create_with_blank_message_leaves_transcript_empty() {
        let store = InMemorySessionStore::new();
        let created = store.create("Bob", "b@x.com", "   ").await.unwrap();
        assert!(created.messages.is_empty());
    }

    #[tokio::test]
    async fn create_assigns_distinct_ids() {
        let store = InMemorySessionStore::new();
        let a = store.create("A", "a@x.com", "").await.unwrap();
        let b = store.create("B", "b@x.com", "").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_collision() {
        let store = InMemorySessionStore::new();
        store
            .insert_with_id("fixed".into(), "A", "a@x.com", "")
            .unwrap();
        let err = store
            .insert_with_id("fixed".into(), "B", "b@x.com", "")
            .unwrap_err();
        assert_eq!(err, BrokerError::IdCollision("fixed".into()));
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn get_returns_not_found_for_missing_session() {
        let store = InMemorySessionStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_preserves_creation_order() {
        let store = InMemorySessionStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let s = store
                .create(&format!("user-{i}"), "u@x.com", "")
                .await
                .unwrap();
            ids.push(s.id);
        }
        let listed: Vec<String> = store.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn append_after_end_is_rejected_and_transcript_frozen() {
        let store = InMemorySessionStore::new();
        let s = store.create("Alice", "a@x.com", "hi").await.unwrap();
        store.transition(&s.id, join("ops")).await.unwrap();
        store
            .append_message(&s.id, Role::Admin, "hello")
            .await
            .unwrap();
        store
            .transition(&s.id, Transition::End { by: Role::Admin })
            .await
            .unwrap();

        let sealed = store.get(&s.id).await.unwrap();
        let err = store
            .append_message(&s.id, Role::User, "late")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
        assert_eq!(store.get(&s.id).await.unwrap(), sealed);
        assert_eq!(store.get(&s.id).await.unwrap(), sealed);
    }

    #[tokio::test]
    async fn failed_transition_does_not_mutate() {
        let store = InMemorySessionStore::new();
        let s = store.create("Alice", "a@x.com", "").await.unwrap();
        let err = store
            .transition(&s.id, Transition::End { by: Role::Admin })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
        assert_eq!(store.get(&s.id).await.unwrap(), s);
    }

    #[tokio::test]
    async fn remove_only_evicts_ended_sessions() {
        let store = InMemorySessionStore::new();
        let s = store.create("Alice", "a@x.com", "").await.unwrap();
        assert!(matches!(
            store.remove(&s.id).await,
            Err(BrokerError::InvalidState(_))
        ));

        let ended = store.transition(&s.id, Transition::Abandon).await.unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Abandoned));
        store.remove(&s.id).await.unwrap();
        assert!(store.list().await.is_empty());
        assert!(matches!(
            store.remove(&s.id).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_from_one_sender_keep_order() {
        let store = Arc::new(InMemorySessionStore::new());
        let s = store.create("Alice", "a@x.com", "").await.unwrap();
        store.transition(&s.id, join("ops")).await.unwrap();

        let visitor = {
            let store = Arc::clone(&store);
            let id = s.id.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    store
                        .append_message(&id, Role::User, &format!("u{i}"))
                        .await
                        .unwrap();
                }
            })
        };
        let admin = {
            let store = Arc::clone(&store);
            let id = s.id.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    store
                        .append_message(&id, Role::Admin, &format!("a{i}"))
                        .await
                        .unwrap();
                }
            })
        };
        visitor.await.unwrap();
        admin.await.unwrap();

        let transcript = store.get(&s.id).await.unwrap().messages;
        assert_eq!(transcript.len(), 400);
        let user_seq: Vec<&str> = transcript
            .iter()
            .filter(|m| m.sender == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        let expected: Vec<String> = (0..200).map(|i| format!("u{i}")).collect();
        assert_eq!(user_seq, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }
}
