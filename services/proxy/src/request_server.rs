//! Request Server.
//!
//! Owns the external request WebSocket endpoint. One task per connection,
//! shaped as a `tokio::select!` over socket receive and an internal reply
//! channel. Also owns the external publish WebSocket endpoint, fanning every
//! subscribed store's `PublishRelay` out to each connected consumer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use pot_protocol::{
    decode_command_line, ClientFrame, MessageKind, ParsedRequest, RequestKind, ResponseMessage,
    TransactionId,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RequestError;
use crate::request_relay::OutboundFrame;
use crate::AppState;

/// Ids generated locally when a client omits one, purely for ACK symmetry.
/// Independent of any store's id allocator — these never cross a worker
/// socket.
static ACK_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_ack_id() -> TransactionId {
    TransactionId(ACK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// `GET /request` — the external request/reply endpoint.
pub async fn ws_request_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_request_socket(socket, state))
}

async fn handle_request_socket(mut socket: WebSocket, state: AppState) {
    let client_route = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(64);
    state
        .client_registry
        .write()
        .await
        .insert(client_route.clone(), tx);
    info!(client_route = %client_route, "external client connected to request endpoint");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&mut socket, &state, &client_route, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(client_route = %client_route, error = %e, "websocket error on request endpoint");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                let sent = match frame {
                    OutboundFrame::Json(json) => socket.send(Message::Text(json.into())).await,
                    OutboundFrame::Bulk(bytes) => socket.send(Message::Binary(bytes.into())).await,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    state.client_registry.write().await.remove(&client_route);
    info!(client_route = %client_route, "external client disconnected from request endpoint");
}

/// Parse and dispatch one client frame.
async fn handle_client_frame(socket: &mut WebSocket, state: &AppState, client_route: &str, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            // No id could be recovered from an unparseable envelope; `0` is
            // the best this layer can do — a client that sends non-JSON on
            // this endpoint has bigger problems than a cosmetic id mismatch.
            send_error(
                socket,
                TransactionId(0),
                RequestError::Value(format!("malformed request envelope: {e}")),
            )
            .await;
            return;
        }
    };

    let original_id = frame
        .id
        .as_deref()
        .and_then(|s| TransactionId::parse_hex(s).ok())
        .unwrap_or_else(next_ack_id);

    let parsed = match decode_command_line(&frame.body) {
        Ok(parsed) => parsed,
        Err(e @ pot_protocol::CodecError::InvalidWriteArgument(_)) => {
            send_error(socket, original_id, RequestError::Type(e.to_string())).await;
            return;
        }
        Err(e) => {
            send_error(socket, original_id, RequestError::Value(e.to_string())).await;
            return;
        }
    };

    match parsed.kind.normalize() {
        RequestKind::Read | RequestKind::Write => {
            // No ACK from here: the owning store's Request Relay forwards the
            // worker's own ACK and REP.
            if let Err(err) = dispatch_to_store(state, client_route, parsed, original_id).await {
                send_error(socket, original_id, err).await;
            }
        }
        RequestKind::Id => {
            send_ack(socket, original_id).await;
            let entries = state.config_cache.id_entries(parsed.name.as_deref()).await;
            send_rep(socket, original_id, None, Some(serde_json::json!(entries))).await;
        }
        RequestKind::Config => {
            send_ack(socket, original_id).await;
            match parsed.name.as_deref() {
                None => {
                    send_error(
                        socket,
                        original_id,
                        RequestError::Key("missing required field: store".into()),
                    )
                    .await;
                }
                Some(store) => match state.config_cache.get(store).await {
                    Some(block) => {
                        let data = serde_json::to_value(&block)
                            .expect("ConfigBlock always serializes to JSON");
                        send_rep(socket, original_id, Some(block.name.clone()), Some(data)).await;
                    }
                    None => {
                        send_error(
                            socket,
                            original_id,
                            RequestError::Key(format!("no local configuration for '{store}'")),
                        )
                        .await;
                    }
                },
            }
        }
        RequestKind::Hash => unreachable!("RequestKind::normalize maps Hash to Id"),
    }
}

/// Route a `READ`/`WRITE` to the owning store's Request Relay: the store is
/// the first dotted segment of the element name.
async fn dispatch_to_store(
    state: &AppState,
    client_route: &str,
    parsed: ParsedRequest,
    original_id: TransactionId,
) -> Result<(), RequestError> {
    let name = parsed
        .name
        .clone()
        .ok_or_else(|| RequestError::Key("missing required field: name".into()))?;
    let store = name.split('.').next().filter(|s| !s.is_empty()).ok_or_else(|| {
        RequestError::Key(format!("no local store for '{name}'"))
    })?;
    let handle = state
        .store_registry
        .get(store)
        .ok_or_else(|| RequestError::Key(format!("no local store for '{store}'")))?;
    let relay = handle.request_relay().await.ok_or_else(|| {
        RequestError::Runtime(format!("store '{store}' worker is not currently available"))
    })?;
    relay
        .external_request(client_route.to_owned(), parsed, original_id)
        .await
        .map_err(|e| RequestError::Runtime(e.to_string()))
}

async fn send_ack(socket: &mut WebSocket, id: TransactionId) {
    send_message(
        socket,
        ResponseMessage {
            message: MessageKind::Ack,
            id,
            time: pot_protocol::unix_timestamp(),
            name: None,
            data: None,
            error: None,
        },
    )
    .await;
}

async fn send_rep(
    socket: &mut WebSocket,
    id: TransactionId,
    name: Option<String>,
    data: Option<serde_json::Value>,
) {
    send_message(
        socket,
        ResponseMessage {
            message: MessageKind::Rep,
            id,
            time: pot_protocol::unix_timestamp(),
            name,
            data,
            error: None,
        },
    )
    .await;
}

async fn send_error(socket: &mut WebSocket, id: TransactionId, err: RequestError) {
    let payload = err.into_payload();
    send_message(
        socket,
        ResponseMessage {
            message: MessageKind::Rep,
            id,
            time: pot_protocol::unix_timestamp(),
            name: None,
            data: None,
            error: Some(payload),
        },
    )
    .await;
}

async fn send_message(socket: &mut WebSocket, msg: ResponseMessage) {
    match pot_protocol::encode_response(&msg) {
        Ok(json) => {
            let _ = socket.send(Message::Text(json.into())).await;
        }
        Err(e) => warn!(error = %e, "failed to encode response"),
    }
}

// ---------------------------------------------------------------------------
// Publish endpoint (the Publish Relay's external-facing side)
// ---------------------------------------------------------------------------

/// How long to wait for an optional subscription message before defaulting
/// to "all topics".
const SUBSCRIBE_WINDOW: Duration = Duration::from_millis(200);

/// `GET /publish` — the external publish/subscribe endpoint.
pub async fn ws_publish_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_publish_socket(socket, state))
}

async fn handle_publish_socket(mut socket: WebSocket, state: AppState) {
    let topics = read_subscription(&mut socket).await;
    info!(topics = ?topics, "external client connected to publish endpoint");

    let (tx, mut rx) = mpsc::channel::<Bytes>(256);
    let mut fanout_tasks = Vec::new();
    for (store, handle) in state.store_registry.iter() {
        if !topics.is_empty() && !topics.iter().any(|t| t == store) {
            continue;
        }
        let Some(relay) = handle.publish_relay().await else {
            continue;
        };
        let store = store.clone();
        let tx = tx.clone();
        let mut receiver = relay.subscribe();
        fanout_tasks.push(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(store, skipped, "publish consumer lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
    drop(tx);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(bytes) = frame else { break };
                if socket.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for task in fanout_tasks {
        task.abort();
    }
    debug!("external client disconnected from publish endpoint");
}

/// Read an optional `{"topics": [...]}` message sent immediately after
/// connecting. An empty or absent list means "subscribe to everything".
async fn read_subscription(socket: &mut WebSocket) -> Vec<String> {
    #[derive(serde::Deserialize)]
    struct Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    }

    let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(SUBSCRIBE_WINDOW, socket.recv()).await
    else {
        return Vec::new();
    };
    serde_json::from_str::<Subscribe>(&text)
        .map(|s| s.topics)
        .unwrap_or_default()
}
