use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::DeviceId,
    error::{ApiError, ErrorCode},
    protocol::{Envelope, LinkMessage},
};
use sync_api::handle_inbound;
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct LinkQuery {
    #[serde(default)]
    device_id: String,
}

pub(crate) async fn link_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<LinkQuery>,
) -> Response {
    let device_id = q.device_id.trim();
    if device_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "device_id is required")),
        )
            .into_response();
    }
    let device_id = DeviceId::new(device_id);
    ws.on_upgrade(move |socket| link_session(state, socket, device_id))
}

/// One device link. Everything bound for the device, replies included, goes
/// through a single writer so outbound sequence numbers stay monotonic.
async fn link_session(state: Arc<AppState>, socket: WebSocket, device_id: DeviceId) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<LinkMessage>();
    let connection_id = state
        .sync
        .mediator
        .on_connect(&device_id, outbound_tx.clone(), Instant::now());

    let writer_device = device_id.clone();
    let send_task = tokio::spawn(async move {
        let mut sequence: u64 = 0;
        while let Some(message) = outbound_rx.recv().await {
            sequence += 1;
            let envelope = Envelope::new(writer_device.clone(), sequence, message);
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    error!(device_id = %writer_device, error = %err, "link: failed to encode envelope");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let raw = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(device_id = %device_id, error = %err, "link: socket read failed");
                break;
            }
        };
        let envelope = match serde_json::from_slice::<Envelope>(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "link: malformed envelope dropped");
                continue;
            }
        };
        match handle_inbound(&state.sync, &device_id, envelope, Instant::now()).await {
            Ok(Some(reply)) => {
                if outbound_tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => error!(device_id = %device_id, error = %err, "link: failed to handle envelope"),
        }
    }

    send_task.abort();
    if let Err(err) = state.sync.mediator.on_disconnect(&device_id, connection_id).await {
        error!(device_id = %device_id, error = %err, "link: failed to record disconnect");
    }
}

pub(crate) async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| events_connection(state, socket))
}

/// Subscriber feed: every switch update and command resolution as JSON text.
async fn events_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.sync.mediator.subscribe());
    info!("events: subscriber connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "events: subscriber lagging, events dropped");
                    continue;
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!("events: subscriber disconnected");
}
