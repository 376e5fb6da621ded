//! Prometheus metrics for the broker.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::sessions::{EndReason, Role};

/// Counters and gauges exported on `/metrics`.
pub struct BrokerMetrics {
    registry: Registry,
    sessions_created: IntCounter,
    sessions_ended: IntCounterVec,
    messages_relayed: IntCounterVec,
    frames_dropped: IntCounter,
    frames_rejected: IntCounterVec,
    connections: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("chatbroker".into()), None)
            .context("failed to create metrics registry")?;

        let sessions_created =
            IntCounter::new("sessions_created_total", "Chat sessions opened by visitors")?;
        let sessions_ended = IntCounterVec::new(
            Opts::new("sessions_ended_total", "Chat sessions ended, by reason"),
            &["reason"],
        )?;
        let messages_relayed = IntCounterVec::new(
            Opts::new("messages_relayed_total", "Transcript messages, by sender"),
            &["sender"],
        )?;
        let frames_dropped = IntCounter::new(
            "frames_dropped_total",
            "Outbound frames dropped because a peer queue was full",
        )?;
        let frames_rejected = IntCounterVec::new(
            Opts::new("frames_rejected_total", "Inbound frames answered with an error, by code"),
            &["code"],
        )?;
        let connections = IntGauge::new("connections", "Open chat sockets")?;

        registry.register(Box::new(sessions_created.clone()))?;
        registry.register(Box::new(sessions_ended.clone()))?;
        registry.register(Box::new(messages_relayed.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self {
            registry,
            sessions_created,
            sessions_ended,
            messages_relayed,
            frames_dropped,
            frames_rejected,
            connections,
        })
    }

    pub fn session_created(&self) {
        self.sessions_created.inc();
    }

    pub fn session_ended(&self, reason: EndReason) {
        self.sessions_ended.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn message_relayed(&self, sender: Role) {
        self.messages_relayed.with_label_values(&[sender.as_str()]).inc();
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.inc();
    }

    pub fn frame_rejected(&self, code: &str) {
        self.frames_rejected.with_label_values(&[code]).inc();
    }

    pub fn connection_opened(&self) {
        self.connections.inc();
    }

    pub fn connection_closed(&self) {
        self.connections.dec();
    }

    pub fn open_connections(&self) -> i64 {
        self.connections.get()
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output was not utf-8")
    }
}
