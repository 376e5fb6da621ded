//! Connection hub: binds visitor/admin legs to sessions and relays between them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, warn};

use super::frames::OutboundFrame;
use crate::error::BrokerError;
use crate::sessions::{Message, Role, SessionId, SessionStore};

/// Result of handing a frame to a leg's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the frame was dropped.
    Dropped,
    /// Queue full and the leg crossed its drop budget; it should be detached.
    Evict,
    /// The connection's writer is gone.
    Closed,
}

/// Outbound handle for one live socket.
///
/// Created once per connection; bound to at most one session at a time.
pub struct Leg {
    conn_id: String,
    tx: mpsc::Sender<OutboundFrame>,
    drops: AtomicU64,
    evicted: Notify,
}

impl Leg {
    pub fn new(conn_id: impl Into<String>, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            conn_id: conn_id.into(),
            tx,
            drops: AtomicU64::new(0),
            evicted: Notify::new(),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Enqueue without waiting. A slow peer must never stall the sender.
    pub fn send(&self, frame: OutboundFrame, max_drops: u64) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    conn_id = %self.conn_id,
                    frame = frame.kind(),
                    total_drops = drops,
                    "outbound queue full, dropping frame"
                );
                if drops >= max_drops {
                    Delivery::Evict
                } else {
                    Delivery::Dropped
                }
            }
        }
    }

    /// Ask the owning connection to shut down.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once [`Leg::evict`] has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}

/// The (at most) two legs bound to one session.
#[derive(Default)]
pub struct LegSlots {
    user: Option<Arc<Leg>>,
    admin: Option<Arc<Leg>>,
}

impl LegSlots {
    fn slot_mut(&mut self, role: Role) -> &mut Option<Arc<Leg>> {
        match role {
            Role::User => &mut self.user,
            Role::Admin => &mut self.admin,
        }
    }

    pub fn get(&self, role: Role) -> Option<&Arc<Leg>> {
        match role {
            Role::User => self.user.as_ref(),
            Role::Admin => self.admin.as_ref(),
        }
    }

    pub fn is_bound(&self, role: Role) -> bool {
        self.get(role).is_some()
    }

    /// Bind `leg` as `role`. Fails if that role already has a leg.
    pub fn bind(&mut self, session_id: &str, role: Role, leg: Arc<Leg>) -> Result<(), BrokerError> {
        let slot = self.slot_mut(role);
        if slot.is_some() {
            return Err(match role {
                Role::Admin => BrokerError::AlreadyBound(session_id.to_string()),
                Role::User => BrokerError::invalid(format!(
                    "session {session_id} already has a visitor leg"
                )),
            });
        }
        *slot = Some(leg);
        Ok(())
    }

    /// Remove the leg for `role` if it still belongs to `conn_id`.
    pub fn take(&mut self, role: Role, conn_id: &str) -> Option<Arc<Leg>> {
        let slot = self.slot_mut(role);
        if slot.as_ref().is_some_and(|leg| leg.conn_id() == conn_id) {
            slot.take()
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> Vec<Arc<Leg>> {
        self.user.take().into_iter().chain(self.admin.take()).collect()
    }
}

pub type SlotGuard = OwnedMutexGuard<LegSlots>;

/// Maps session ids to their bound legs.
///
/// Each session has its own async slot lock; holding it serializes binds,
/// transitions and relays for that session only.
pub struct ConnectionHub {
    slots: RwLock<HashMap<SessionId, Arc<Mutex<LegSlots>>>>,
    max_dropped_frames: u64,
}

impl ConnectionHub {
    pub fn new(max_dropped_frames: u64) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            max_dropped_frames: max_dropped_frames.max(1),
        }
    }

    /// Lock the slot for `session_id`, creating it on first use.
    pub async fn lock(&self, session_id: &str) -> SlotGuard {
        let existing = self.slots.read().get(session_id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut slots = self.slots.write();
                Arc::clone(
                    slots
                        .entry(session_id.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(LegSlots::default()))),
                )
            }
        };
        slot.lock_owned().await
    }

    /// Lock an existing slot without creating one.
    pub async fn lock_existing(&self, session_id: &str) -> Option<SlotGuard> {
        let slot = self.slots.read().get(session_id).cloned()?;
        Some(slot.lock_owned().await)
    }

    /// Bind a leg outside any broker operation.
    #[cfg(test)]
    pub async fn bind(&self, session_id: &str, role: Role, leg: Arc<Leg>) -> Result<(), BrokerError> {
        let mut slots = self.lock(session_id).await;
        slots.bind(session_id, role, leg)?;
        debug!(session_id, %role, "leg bound");
        Ok(())
    }

    /// Remove a leg. Returns the peer leg, if one is still bound.
    ///
    /// Unbinding never ends the session.
    pub async fn unbind(&self, session_id: &str, role: Role, conn_id: &str) -> Option<Arc<Leg>> {
        let mut slots = self.lock_existing(session_id).await?;
        slots.take(role, conn_id)?;
        debug!(session_id, %role, conn_id, "leg unbound");
        slots.get(role.peer()).cloned()
    }

    /// Append to the transcript, then forward to the peer leg if one is bound.
    ///
    /// The append always happens first; peer delivery is best effort.
    pub async fn relay(
        &self,
        store: &dyn SessionStore,
        session_id: &str,
        sender: Role,
        content: &str,
    ) -> Result<(Message, Delivery), BrokerError> {
        let Some(mut slots) = self.lock_existing(session_id).await else {
            // No legs bound (e.g. both dropped); the transcript is still the record.
            let message = store.append_message(session_id, sender, content).await?;
            return Ok((message, Delivery::Closed));
        };
        let message = store.append_message(session_id, sender, content).await?;
        let frame = OutboundFrame::relayed(session_id, &message);
        let delivery = self.deliver(&mut slots, session_id, sender.peer(), frame);
        Ok((message, delivery))
    }

    /// Send `frame` to the leg bound as `role`, detaching it if it is hopelessly behind.
    ///
    /// A detached leg is gone from the slots before its socket closes, so the
    /// peer is told here; the later unbind finds nothing to report.
    pub fn deliver(
        &self,
        slots: &mut LegSlots,
        session_id: &str,
        role: Role,
        frame: OutboundFrame,
    ) -> Delivery {
        let Some(leg) = slots.get(role).cloned() else {
            return Delivery::Closed;
        };
        let delivery = leg.send(frame, self.max_dropped_frames);
        if delivery == Delivery::Evict {
            warn!(session_id, conn_id = leg.conn_id(), %role, drops = leg.drop_count(), "detaching slow leg");
            slots.take(role, leg.conn_id());
            leg.evict();

            if let Some(peer) = slots.get(role.peer()).cloned() {
                let left = OutboundFrame::PeerLeft {
                    session_id: session_id.to_string(),
                    role,
                };
                if peer.send(left, self.max_dropped_frames) == Delivery::Evict {
                    slots.take(role.peer(), peer.conn_id());
                    peer.evict();
                }
            }
        }
        delivery
    }

    /// Forget a session's slot entirely, returning whatever legs were bound.
    pub async fn close(&self, session_id: &str) -> Vec<Arc<Leg>> {
        let slot = self.slots.write().remove(session_id);
        match slot {
            Some(slot) => slot.lock().await.drain(),
            None => Vec::new(),
        }
    }

    /// Drop the slot entry while the caller already holds its lock.
    pub fn forget(&self, session_id: &str) {
        self.slots.write().remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn max_dropped_frames(&self) -> u64 {
        self.max_dropped_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{InMemorySessionStore, Transition};

    fn leg(id: &str, capacity: usize) -> (Arc<Leg>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Leg::new(id, tx)), rx)
    }

    #[tokio::test]
    async fn second_admin_bind_is_rejected() {
        let hub = ConnectionHub::new(100);
        let (a1, _rx1) = leg("a1", 4);
        let (a2, _rx2) = leg("a2", 4);
        hub.bind("S1", Role::Admin, a1).await.unwrap();
        let err = hub.bind("S1", Role::Admin, a2).await.unwrap_err();
        assert_eq!(err, BrokerError::AlreadyBound("S1".into()));
    }

    #[tokio::test]
    async fn second_visitor_bind_is_invalid_state() {
        let hub = ConnectionHub::new(100);
        let (u1, _rx1) = leg("u1", 4);
        let (u2, _rx2) = leg("u2", 4);
        hub.bind("S1", Role::User, u1).await.unwrap();
        let err = hub.bind("S1", Role::User, u2).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn unbind_returns_peer_and_ignores_foreign_connections() {
        let hub = ConnectionHub::new(100);
        let (u, _urx) = leg("u", 4);
        let (a, _arx) = leg("a", 4);
        hub.bind("S1", Role::User, u).await.unwrap();
        hub.bind("S1", Role::Admin, a).await.unwrap();

        assert!(hub.unbind("S1", Role::Admin, "someone-else").await.is_none());
        let peer = hub.unbind("S1", Role::Admin, "a").await.unwrap();
        assert_eq!(peer.conn_id(), "u");
        assert!(hub.unbind("unknown", Role::User, "u").await.is_none());
    }

    #[tokio::test]
    async fn relay_appends_even_without_peer() {
        let store = InMemorySessionStore::new();
        let s = store.create("Alice", "a@x.com", "").await.unwrap();
        let hub = ConnectionHub::new(100);
        let (u, _urx) = leg("u", 4);
        hub.bind(&s.id, Role::User, u).await.unwrap();

        let (_, delivery) = hub.relay(&store, &s.id, Role::User, "anyone?").await.unwrap();
        assert_eq!(delivery, Delivery::Closed);
        assert_eq!(store.get(&s.id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn relay_forwards_to_peer_only() {
        let store = InMemorySessionStore::new();
        let s = store.create("Alice", "a@x.com", "").await.unwrap();
        store
            .transition(&s.id, Transition::Join { admin: "ops".into() })
            .await
            .unwrap();
        let hub = ConnectionHub::new(100);
        let (u, mut urx) = leg("u", 4);
        let (a, mut arx) = leg("a", 4);
        hub.bind(&s.id, Role::User, u).await.unwrap();
        hub.bind(&s.id, Role::Admin, a).await.unwrap();

        hub.relay(&store, &s.id, Role::Admin, "Hi Alice").await.unwrap();
        match urx.try_recv().unwrap() {
            OutboundFrame::Message { sender, content, .. } => {
                assert_eq!(sender, Role::Admin);
                assert_eq!(content, "Hi Alice");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(arx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_then_evicts_slow_peer() {
        let store = InMemorySessionStore::new();
        let s = store.create("Alice", "a@x.com", "").await.unwrap();
        let hub = ConnectionHub::new(2);
        let (u, mut urx) = leg("u", 8);
        let (a, _arx) = leg("a", 1);
        hub.bind(&s.id, Role::User, u).await.unwrap();
        hub.bind(&s.id, Role::Admin, Arc::clone(&a)).await.unwrap();

        let mut outcomes = Vec::new();
        for i in 0..3 {
            let (_, d) = hub
                .relay(&store, &s.id, Role::User, &format!("m{i}"))
                .await
                .unwrap();
            outcomes.push(d);
        }
        assert_eq!(
            outcomes,
            vec![Delivery::Queued, Delivery::Dropped, Delivery::Evict]
        );
        // Every message is still in the transcript.
        assert_eq!(store.get(&s.id).await.unwrap().messages.len(), 3);
        // The slow admin leg is detached and told to go away.
        let slots = hub.lock(&s.id).await;
        assert!(!slots.is_bound(Role::Admin));
        drop(slots);
        tokio::time::timeout(std::time::Duration::from_secs(1), a.evicted())
            .await
            .expect("evicted leg should be notified");
        // The sender learns its peer is gone.
        assert_eq!(
            urx.try_recv().unwrap(),
            OutboundFrame::PeerLeft {
                session_id: s.id.clone(),
                role: Role::Admin
            }
        );
        assert!(urx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_drains_both_legs() {
        let hub = ConnectionHub::new(100);
        let (u, _urx) = leg("u", 4);
        let (a, _arx) = leg("a", 4);
        hub.bind("S1", Role::User, u).await.unwrap();
        hub.bind("S1", Role::Admin, a).await.unwrap();
        assert_eq!(hub.session_count(), 1);
        assert_eq!(hub.close("S1").await.len(), 2);
        assert_eq!(hub.session_count(), 0);
    }
}
