//! Live chat broker. Pairs a visitor leg with one admin leg per session.
//!
//! The [`Broker`] is the single entry point used by the socket handler. It
//! owns the session directory, the [`ConnectionHub`] and the
//! [`TimeoutMonitor`], and enforces ordering by taking the per-session hub slot
//! lock around every bind, transition and relay.

pub mod frames;
pub mod hub;
pub mod monitor;

pub use frames::{InboundFrame, OutboundFrame};
pub use hub::{ConnectionHub, Delivery, Leg, LegSlots};
pub use monitor::{TimeoutMonitor, TimerKind};

use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::observability::BrokerMetrics;
use crate::sessions::{
    DirectoryQuery, EndReason, Role, SessionId, SessionStatus, SessionStore, Transition,
};

/// Identity claim handed over by the surrounding auth layer.
///
/// The broker never authenticates; it trusts whatever sits in front of it to
/// set `X-Chat-Identity: admin:<name>` on operator sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Admin(String),
}

impl Identity {
    pub const HEADER: &'static str = "x-chat-identity";

    pub fn parse(raw: &str) -> Self {
        match raw.trim().split_once(':') {
            Some((kind, name)) if kind.eq_ignore_ascii_case("admin") && !name.trim().is_empty() => {
                Self::Admin(name.trim().to_string())
            }
            _ => Self::Anonymous,
        }
    }
}

/// Per-socket state: who is on the other end and which leg it plays.
pub struct ConnectionContext {
    identity: Identity,
    leg: Arc<Leg>,
    binding: Option<(SessionId, Role)>,
}

impl ConnectionContext {
    pub fn conn_id(&self) -> &str {
        self.leg.conn_id()
    }

    pub fn leg(&self) -> &Arc<Leg> {
        &self.leg
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn binding(&self) -> Option<(&str, Role)> {
        self.binding.as_ref().map(|(id, role)| (id.as_str(), *role))
    }
}

struct BrokerInner {
    store: Arc<dyn SessionStore>,
    hub: ConnectionHub,
    monitor: TimeoutMonitor,
    config: BrokerConfig,
    metrics: Arc<BrokerMetrics>,
}

/// Cheap to clone; all clones share one directory and hub.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        config: BrokerConfig,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                store,
                hub: ConnectionHub::new(config.max_dropped_frames),
                monitor: TimeoutMonitor::new(),
                config,
                metrics,
            }),
        }
    }

    fn from_weak(weak: &Weak<BrokerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn query(&self) -> DirectoryQuery {
        DirectoryQuery::new(Arc::clone(&self.inner.store))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.inner.metrics
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.inner.hub
    }

    pub fn monitor(&self) -> &TimeoutMonitor {
        &self.inner.monitor
    }

    // ── Connections ──────────────────────────────────────────────

    /// Register a new socket. The receiver feeds that socket's writer.
    pub fn connect(&self, identity: Identity) -> (ConnectionContext, mpsc::Receiver<OutboundFrame>) {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_queue_capacity.max(1));
        let leg = Arc::new(Leg::new(conn_id, tx));
        self.inner.metrics.connection_opened();
        debug!(conn_id = leg.conn_id(), ?identity, "connection opened");
        (
            ConnectionContext {
                identity,
                leg,
                binding: None,
            },
            rx,
        )
    }

    /// Tear down a socket's leg. Never ends the session by itself.
    pub async fn disconnect(&self, mut ctx: ConnectionContext) {
        self.inner.metrics.connection_closed();
        let Some((session_id, role)) = ctx.binding.take() else {
            debug!(conn_id = ctx.conn_id(), "unbound connection closed");
            return;
        };

        if let Some(peer) = self
            .inner
            .hub
            .unbind(&session_id, role, ctx.conn_id())
            .await
        {
            self.send_to(
                &peer,
                OutboundFrame::PeerLeft {
                    session_id: session_id.clone(),
                    role,
                },
            );
        }
        info!(session_id = %session_id, %role, conn_id = ctx.conn_id(), "leg disconnected");

        if role == Role::Admin {
            if let Some(grace) = self.inner.config.admin_disconnect_grace() {
                if matches!(
                    self.inner.store.status(&session_id).await,
                    Ok(SessionStatus::Active)
                ) {
                    let weak = Arc::downgrade(&self.inner);
                    let id = session_id.clone();
                    self.inner
                        .monitor
                        .arm(&session_id, TimerKind::AdminGrace, grace, async move {
                            if let Some(broker) = Broker::from_weak(&weak) {
                                broker.expire_admin(&id).await;
                            }
                        });
                }
            }
        }
    }

    // ── Frame dispatch ───────────────────────────────────────────

    /// Decode and handle one text frame, answering failures with an `error` frame.
    pub async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.reject(ctx, &err, None);
                return;
            }
        };
        let session_id = frame.session_id().map(str::to_string);
        if let Err(err) = self.handle_frame(ctx, frame).await {
            self.reject(ctx, &err, session_id.as_deref());
        }
    }

    pub async fn handle_frame(
        &self,
        ctx: &mut ConnectionContext,
        frame: InboundFrame,
    ) -> Result<(), BrokerError> {
        debug!(conn_id = ctx.conn_id(), frame = frame.kind(), "frame received");
        match frame {
            InboundFrame::Init {
                user_name,
                user_email,
                content,
            } => self.init(ctx, &user_name, &user_email, &content).await.map(|_| ()),
            InboundFrame::Join { session_id, role } => self.join(ctx, &session_id, role).await,
            InboundFrame::Message {
                session_id,
                sender,
                content,
            } => self.message(ctx, &session_id, sender, &content).await,
            InboundFrame::End { session_id } => self.end(ctx, &session_id).await,
        }
    }

    /// Answer a bad frame with an `error` frame; the connection stays open.
    pub fn reject(&self, ctx: &ConnectionContext, err: &BrokerError, session_id: Option<&str>) {
        warn!(conn_id = ctx.conn_id(), code = err.code(), error = %err, "frame rejected");
        self.inner.metrics.frame_rejected(err.code());
        self.send_to(&ctx.leg, OutboundFrame::error(err, session_id));
    }

    // ── Operations ───────────────────────────────────────────────

    /// Visitor opens a chat: create a waiting session and bind the visitor leg.
    pub async fn init(
        &self,
        ctx: &mut ConnectionContext,
        user_name: &str,
        user_email: &str,
        content: &str,
    ) -> Result<SessionId, BrokerError> {
        self.release_sealed_binding(ctx).await?;
        let user_name = user_name.trim();
        let user_email = user_email.trim();
        if user_name.is_empty() {
            return Err(BrokerError::MalformedFrame("userName is required".into()));
        }
        if user_email.is_empty() {
            return Err(BrokerError::MalformedFrame("userEmail is required".into()));
        }

        let session = self
            .inner
            .store
            .create(user_name, user_email, content)
            .await?;
        let id = session.id.clone();

        let mut slots = self.inner.hub.lock(&id).await;
        slots.bind(&id, Role::User, Arc::clone(&ctx.leg))?;
        ctx.binding = Some((id.clone(), Role::User));
        self.send_to(
            &ctx.leg,
            OutboundFrame::SessionCreated {
                session_id: id.clone(),
            },
        );
        // An admin may have joined between create and bind.
        match self.inner.store.status(&id).await? {
            SessionStatus::Waiting => self.arm_waiting_timer(&id),
            SessionStatus::Active => self.send_to(
                &ctx.leg,
                OutboundFrame::AdminJoined {
                    session_id: id.clone(),
                },
            ),
            SessionStatus::Ended => {}
        }
        drop(slots);

        self.inner.metrics.session_created();
        if !session.messages.is_empty() {
            self.inner.metrics.message_relayed(Role::User);
        }
        info!(session_id = %id, conn_id = ctx.conn_id(), "chat session created");
        Ok(id)
    }

    /// Admin claims a waiting session. Exactly one concurrent join wins.
    pub async fn join(
        &self,
        ctx: &mut ConnectionContext,
        session_id: &str,
        role: Option<Role>,
    ) -> Result<(), BrokerError> {
        if role.is_some_and(|r| r != Role::Admin) {
            return Err(BrokerError::MalformedFrame("join requires role=admin".into()));
        }
        self.release_sealed_binding(ctx).await?;
        let admin = self.admin_name(ctx)?;
        // Resolve unknown ids before a hub slot is created for them.
        self.inner.store.status(session_id).await?;

        let mut slots = self.inner.hub.lock(session_id).await;
        if slots.is_bound(Role::Admin) {
            return Err(BrokerError::AlreadyBound(session_id.to_string()));
        }
        if let Err(err) = self
            .inner
            .store
            .transition(session_id, Transition::Join { admin: admin.clone() })
            .await
        {
            if !slots.is_bound(Role::User) {
                self.inner.hub.forget(session_id);
            }
            return Err(err);
        }
        slots.bind(session_id, Role::Admin, Arc::clone(&ctx.leg))?;
        self.inner.monitor.cancel(session_id, TimerKind::Waiting);
        ctx.binding = Some((session_id.to_string(), Role::Admin));

        let joined = OutboundFrame::AdminJoined {
            session_id: session_id.to_string(),
        };
        self.inner
            .hub
            .deliver(&mut slots, session_id, Role::User, joined.clone());
        self.send_to(&ctx.leg, joined);
        drop(slots);

        info!(session_id, admin = %admin, conn_id = ctx.conn_id(), "admin joined");
        Ok(())
    }

    /// Relay a chat line from whichever leg this connection plays.
    pub async fn message(
        &self,
        ctx: &mut ConnectionContext,
        session_id: &str,
        claimed_sender: Option<Role>,
        content: &str,
    ) -> Result<(), BrokerError> {
        let role = self.bound_role(ctx, session_id).await?;
        if content.trim().is_empty() {
            return Err(BrokerError::MalformedFrame("content is required".into()));
        }
        if claimed_sender.is_some_and(|claimed| claimed != role) {
            debug!(session_id, %role, "ignoring sender field that disagrees with bound role");
        }

        let (_, delivery) = self
            .inner
            .hub
            .relay(self.inner.store.as_ref(), session_id, role, content)
            .await?;
        self.inner.metrics.message_relayed(role);
        if matches!(delivery, Delivery::Dropped | Delivery::Evict) {
            self.inner.metrics.frame_dropped();
        }
        Ok(())
    }

    /// Admin closes the chat; both legs are told and unbound.
    pub async fn end(&self, ctx: &mut ConnectionContext, session_id: &str) -> Result<(), BrokerError> {
        let role = self.bound_role(ctx, session_id).await?;

        let mut slots = self.inner.hub.lock(session_id).await;
        if let Err(err) = self
            .inner
            .store
            .transition(session_id, Transition::End { by: role })
            .await
        {
            if !slots.is_bound(Role::User) && !slots.is_bound(Role::Admin) {
                self.inner.hub.forget(session_id);
            }
            return Err(err);
        }
        let legs = slots.drain();
        self.inner.hub.forget(session_id);
        drop(slots);

        self.inner.monitor.cancel_all(session_id);
        ctx.binding = None;
        self.notify_ended(session_id, &legs, EndReason::Closed);
        info!(session_id, conn_id = ctx.conn_id(), "chat session ended");
        Ok(())
    }

    // ── Autonomous transitions ───────────────────────────────────

    /// Waiting bound expired. Returns true if this call ended the session.
    pub async fn abandon(&self, session_id: &str) -> bool {
        self.expire(session_id, Transition::Abandon, EndReason::Abandoned)
            .await
    }

    /// Admin grace period expired. Returns true if this call ended the session.
    pub async fn expire_admin(&self, session_id: &str) -> bool {
        self.expire(session_id, Transition::AdminLeft, EndReason::AdminLeft)
            .await
    }

    async fn expire(&self, session_id: &str, transition: Transition, reason: EndReason) -> bool {
        let Some(mut slots) = self.inner.hub.lock_existing(session_id).await else {
            // No slot: nothing bound, just move the record.
            return match self.inner.store.transition(session_id, transition).await {
                Ok(_) => {
                    self.notify_ended(session_id, &[], reason);
                    true
                }
                Err(err) => {
                    debug!(session_id, error = %err, "expiry skipped");
                    false
                }
            };
        };
        if reason == EndReason::AdminLeft && slots.is_bound(Role::Admin) {
            return false;
        }
        if let Err(err) = self.inner.store.transition(session_id, transition).await {
            debug!(session_id, error = %err, "expiry skipped");
            return false;
        }
        let legs = slots.drain();
        self.inner.hub.forget(session_id);
        drop(slots);

        self.inner.monitor.cancel_all(session_id);
        self.notify_ended(session_id, &legs, reason);
        true
    }

    /// Evict ended sessions older than the retention window. Returns the count.
    pub async fn sweep_ended(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.inner.config.ended_retention() else {
            return 0;
        };
        let mut evicted = 0;
        for session in self.inner.store.list().await {
            let expired = session.ended_at.is_some_and(|ended_at| {
                u64::try_from((now - ended_at).num_seconds()).unwrap_or(0) >= retention.as_secs()
            });
            if !expired {
                continue;
            }
            if self.inner.store.remove(&session.id).await.is_ok() {
                self.inner.hub.close(&session.id).await;
                self.inner.monitor.cancel_all(&session.id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "evicted ended sessions past retention");
        }
        evicted
    }

    /// Start the retention sweep, if retention is configured.
    pub fn spawn_background(&self) -> Option<JoinHandle<()>> {
        self.inner.config.ended_retention()?;
        let every = self.inner.config.sweep_interval();
        let weak = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(broker) = Broker::from_weak(&weak) else {
                    break;
                };
                broker.sweep_ended(Utc::now()).await;
            }
        }))
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn arm_waiting_timer(&self, session_id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let id = session_id.to_string();
        self.inner.monitor.arm(
            session_id,
            TimerKind::Waiting,
            self.inner.config.waiting_timeout(),
            async move {
                if let Some(broker) = Broker::from_weak(&weak) {
                    broker.abandon(&id).await;
                }
            },
        );
    }

    fn admin_name(&self, ctx: &ConnectionContext) -> Result<String, BrokerError> {
        match &ctx.identity {
            Identity::Admin(name) => Ok(name.clone()),
            Identity::Anonymous if self.inner.config.require_admin_claim => Err(
                BrokerError::invalid("joining requires an admin identity claim"),
            ),
            Identity::Anonymous => Ok(format!("admin-{}", ctx.conn_id())),
        }
    }

    /// Drop a binding whose session has ended or been evicted; a live one is an error.
    async fn release_sealed_binding(&self, ctx: &mut ConnectionContext) -> Result<(), BrokerError> {
        let Some((bound, _)) = ctx.binding.clone() else {
            return Ok(());
        };
        match self.inner.store.status(&bound).await {
            Ok(SessionStatus::Ended) | Err(BrokerError::NotFound(_)) => {
                debug!(session_id = %bound, conn_id = ctx.conn_id(), "releasing binding to sealed session");
                ctx.binding = None;
                Ok(())
            }
            _ => Err(BrokerError::invalid(format!(
                "connection is already bound to session {bound}"
            ))),
        }
    }

    /// The role this connection plays in `session_id`, or why it plays none.
    async fn bound_role(&self, ctx: &ConnectionContext, session_id: &str) -> Result<Role, BrokerError> {
        match &ctx.binding {
            Some((bound, role)) if bound == session_id => Ok(*role),
            _ => {
                self.inner.store.status(session_id).await?;
                Err(BrokerError::invalid(format!(
                    "connection is not a leg of session {session_id}"
                )))
            }
        }
    }

    fn notify_ended(&self, session_id: &str, legs: &[Arc<Leg>], reason: EndReason) {
        for leg in legs {
            self.send_to(
                leg,
                OutboundFrame::SessionEnded {
                    session_id: session_id.to_string(),
                    reason,
                },
            );
        }
        self.inner.metrics.session_ended(reason);
        info!(session_id, reason = reason.as_str(), "session sealed");
    }

    fn send_to(&self, leg: &Leg, frame: OutboundFrame) {
        match leg.send(frame, self.inner.hub.max_dropped_frames()) {
            Delivery::Queued | Delivery::Closed => {}
            Delivery::Dropped => self.inner.metrics.frame_dropped(),
            Delivery::Evict => {
                self.inner.metrics.frame_dropped();
                leg.evict();
            }
        }
    }
}
