//! WebSocket chat socket.
//!
//! One socket is one leg. The reader task feeds frames into the [`Broker`];
//! a writer task drains the leg's bounded outbound queue and keeps the
//! connection alive with periodic pings.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use super::AppState;
use crate::broker::{Broker, Identity};
use crate::error::BrokerError;

/// GET /ws: upgrade to the chat socket
pub async fn handle_ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = headers
        .get(Identity::HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or(Identity::Anonymous, Identity::parse);
    let max_frame = state.broker.config().max_frame_bytes;

    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state.broker, identity))
}

async fn handle_socket(socket: WebSocket, broker: Broker, identity: Identity) {
    let (mut ctx, mut outbound) = broker.connect(identity);
    let conn_id = ctx.conn_id().to_string();
    let leg = Arc::clone(ctx.leg());
    let (mut sink, mut stream) = socket.split();

    let ping_every = broker.config().ping_interval();
    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(conn_id = %writer_conn, "failed to encode outbound frame: {e}");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            () = leg.evicted() => {
                warn!(conn_id = %conn_id, "closing connection that fell too far behind");
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => broker.handle_text(&mut ctx, text.as_str()).await,
                Some(Ok(WsMessage::Binary(_))) => {
                    let err = BrokerError::MalformedFrame("binary frames are not supported".into());
                    broker.reject(&ctx, &err, None);
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, "socket read failed: {e}");
                    break;
                }
            },
        }
    }

    broker.disconnect(ctx).await;
    writer.abort();
    debug!(conn_id = %conn_id, "connection closed");
}
