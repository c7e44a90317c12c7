//! Request Relay.
//!
//! The asymmetric heart of the proxy: one instance per store, bound to that
//! store's worker request socket. Provides two entry points
//! (`external_request`, `internal_request`) plus a background dispatcher
//! that demultiplexes the worker's responses back to whichever caller is
//! waiting on them. An internal request is a `reply_rx.await` on a oneshot
//! channel a background task completes; an external request is routed by a
//! per-connection sender held in the client registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pot_protocol::{
    BulkFrame, CodecError, MessageKind, ParsedRequest, RequestKind, ResponseMessage, TransactionId,
    WorkerRequestMessage,
};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::id_alloc::IdAllocator;
use crate::pending::{DispatchAction, PendingKind, PendingTable};

/// A frame destined for one external client connection: either the JSON
/// descriptor or a raw bulk continuation.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Json(String),
    Bulk(Vec<u8>),
}

/// Shared, proxy-wide table of connected external client routes. Owned by
/// the Request Server; Request Relays hold a clone to deliver responses
/// back to whichever connection is waiting.
pub type ClientRegistry = Arc<RwLock<HashMap<String, mpsc::Sender<OutboundFrame>>>>;

pub fn new_client_registry() -> ClientRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

/// How long a pending entry may linger before the sweep evicts it with a
/// synthetic error.
pub const DEFAULT_PENDING_CEILING: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct RequestRelay {
    store: String,
    allocator: Mutex<IdAllocator>,
    pending: Arc<PendingTable>,
    outbound_to_worker: mpsc::Sender<Bytes>,
    registry: ClientRegistry,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RequestRelay {
    /// Take ownership of an accepted worker connection and start its
    /// reader, writer, and sweep background tasks.
    pub fn spawn(
        store: String,
        stream: UnixStream,
        registry: ClientRegistry,
        pending_ceiling: Duration,
    ) -> Self {
        let pending = Arc::new(PendingTable::new());
        let (read_half, write_half) = stream.into_split();
        let mut framed_reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut framed_writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(256);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if framed_writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let dispatcher_pending = pending.clone();
        let dispatcher_registry = registry.clone();
        let dispatcher_store = store.clone();
        let dispatcher_task = tokio::spawn(async move {
            while let Some(Ok(frame)) = framed_reader.next().await {
                dispatch_worker_frame(
                    &dispatcher_store,
                    &frame,
                    &dispatcher_pending,
                    &dispatcher_registry,
                )
                .await;
            }
            debug!(store = %dispatcher_store, "worker request socket closed");
        });

        let sweep_pending = pending.clone();
        let sweep_registry = registry.clone();
        let sweep_store = store.clone();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let expired = sweep_pending.sweep_expired(pending_ceiling).await;
                for (id, kind) in expired {
                    warn!(store = %sweep_store, id = %id, "pending transaction evicted after ceiling");
                    complete_with_runtime_error(id, kind, &sweep_registry).await;
                }
            }
        });

        Self {
            store,
            allocator: Mutex::new(IdAllocator::new()),
            pending,
            outbound_to_worker: outbound_tx,
            registry,
            tasks: vec![writer_task, dispatcher_task, sweep_task],
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.len().await
    }

    /// Invoked by the Request Server for `READ`/`WRITE`. `original_id` is
    /// the id the client chose (or that the Request Server generated for
    /// ACK symmetry).
    pub async fn external_request(
        &self,
        client_route: String,
        request: ParsedRequest,
        original_id: TransactionId,
    ) -> Result<(), RelayError> {
        let kind = PendingKind::External {
            client_route,
            original_id,
        };
        let internal_id = self.allocate_and_insert(kind).await?;
        self.send_to_worker(request, internal_id).await
    }

    /// Invoked by the Worker Supervisor to issue a `CONFIG` request at
    /// start-up or restart. Blocks until the terminal `REP` arrives — or
    /// until the pending-table sweep completes it with a synthetic
    /// `RuntimeError` if the worker never answers.
    pub async fn internal_request(
        &self,
        request: ParsedRequest,
    ) -> Result<ResponseMessage, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let kind = PendingKind::Internal {
            completion: reply_tx,
        };
        let internal_id = self.allocate_and_insert(kind).await?;
        self.send_to_worker(request, internal_id).await?;
        reply_rx.await.map_err(|_| RelayError::WorkerGone)?
    }

    async fn allocate_and_insert(&self, mut kind: PendingKind) -> Result<TransactionId, RelayError> {
        let mut allocator = self.allocator.lock().await;
        let start = allocator.peek();
        loop {
            let candidate = allocator.advance();
            match self.pending.try_insert(candidate, kind).await {
                Ok(()) => return Ok(candidate),
                Err(returned) => {
                    kind = returned;
                    if allocator.peek() == start {
                        return Err(RelayError::IdSpaceExhausted);
                    }
                }
            }
        }
    }

    async fn send_to_worker(
        &self,
        request: ParsedRequest,
        internal_id: TransactionId,
    ) -> Result<(), RelayError> {
        let message = WorkerRequestMessage {
            request: request.kind.normalize(),
            name: request.name,
            id: internal_id,
            data: request.data,
        };
        let json = serde_json::to_string(&message).map_err(CodecError::from)?;
        self.outbound_to_worker
            .send(Bytes::from(json.into_bytes()))
            .await
            .map_err(|_| RelayError::WorkerGone)
    }
}

impl Drop for RequestRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn dispatch_worker_frame(
    store: &str,
    frame: &[u8],
    pending: &PendingTable,
    registry: &ClientRegistry,
) {
    if let Ok(response) = pot_protocol::decode_response(frame) {
        dispatch_descriptor(store, response, pending, registry).await;
        return;
    }

    match BulkFrame::decode(frame) {
        Ok(bulk) => dispatch_bulk(store, bulk, pending, registry).await,
        Err(e) => warn!(store, error = %e, "worker sent an unparseable frame, dropping"),
    }
}

async fn dispatch_descriptor(
    store: &str,
    response: ResponseMessage,
    pending: &PendingTable,
    registry: &ClientRegistry,
) {
    let id = response.id;
    match pending.dispatch(id, response.message).await {
        DispatchAction::Unknown => {
            debug!(store, id = %id, "response for unknown or already-completed transaction, dropping");
        }
        DispatchAction::InternalIgnore => {}
        DispatchAction::InternalComplete(completion) => {
            let _ = completion.send(Ok(response));
        }
        DispatchAction::External {
            client_route,
            original_id,
        } => {
            let mut restored = response;
            restored.id = original_id;
            deliver_json(store, &client_route, restored, registry).await;
        }
    }
}

async fn dispatch_bulk(
    store: &str,
    bulk: BulkFrame,
    pending: &PendingTable,
    registry: &ClientRegistry,
) {
    let id = bulk.id;
    match pending.complete_bulk(id).await {
        None => {
            debug!(store, id = %id, "bulk frame for unknown transaction, dropping");
        }
        Some((client_route, original_id)) => {
            let rewritten = bulk.with_id(original_id);
            deliver_bulk(store, &client_route, rewritten, registry).await;
        }
    }
}

async fn deliver_json(
    store: &str,
    client_route: &str,
    response: ResponseMessage,
    registry: &ClientRegistry,
) {
    let Ok(json) = pot_protocol::encode_response(&response) else {
        warn!(store, client_route, "failed to encode response, dropping");
        return;
    };
    let senders = registry.read().await;
    if let Some(sender) = senders.get(client_route) {
        let _ = sender.send(OutboundFrame::Json(json)).await;
    } else {
        debug!(store, client_route, "client route no longer connected");
    }
}

async fn deliver_bulk(store: &str, client_route: &str, bulk: BulkFrame, registry: &ClientRegistry) {
    let senders = registry.read().await;
    if let Some(sender) = senders.get(client_route) {
        let _ = sender.send(OutboundFrame::Bulk(bulk.encode())).await;
    } else {
        debug!(store, client_route, "client route no longer connected");
    }
}

async fn complete_with_runtime_error(id: TransactionId, kind: PendingKind, registry: &ClientRegistry) {
    let error = pot_protocol::ErrorPayload::new(
        pot_protocol::error_codes::RUNTIME_ERROR,
        "transaction timed out waiting for the worker",
    );
    let response = ResponseMessage {
        message: MessageKind::Rep,
        id,
        time: pot_protocol::unix_timestamp(),
        name: None,
        data: None,
        error: Some(error),
    };
    match kind {
        PendingKind::Internal { completion } => {
            let _ = completion.send(Ok(response));
        }
        PendingKind::External {
            client_route,
            original_id,
        } => {
            let mut response = response;
            response.id = original_id;
            deliver_json("(sweep)", &client_route, response, registry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn connected_pair() -> (UnixStream, UnixStream) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let connector = UnixStream::connect(&path);
        let (client, accepted) = tokio::join!(connector, listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    /// Stand-in for a worker: reads one request frame, decodes it, and hands
    /// back a canned `REP` addressed to the same internal id.
    async fn recv_request(
        reader: &mut FramedRead<tokio::net::unix::OwnedReadHalf, LengthDelimitedCodec>,
    ) -> WorkerRequestMessage {
        let frame = reader.next().await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    async fn send_rep(
        writer: &mut FramedWrite<tokio::net::unix::OwnedWriteHalf, LengthDelimitedCodec>,
        rep: ResponseMessage,
    ) {
        writer
            .send(Bytes::from(
                pot_protocol::encode_response(&rep).unwrap().into_bytes(),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn external_request_round_trips_id_through_the_worker() {
        let (proxy_side, worker_side) = connected_pair().await;
        let (worker_read, worker_write) = worker_side.into_split();
        let mut worker_reader = FramedRead::new(worker_read, LengthDelimitedCodec::new());
        let mut worker_writer = FramedWrite::new(worker_write, LengthDelimitedCodec::new());

        let registry = new_client_registry();
        let (client_tx, mut client_rx) = mpsc::channel(8);
        registry
            .write()
            .await
            .insert("route-a".to_owned(), client_tx);

        let relay = RequestRelay::spawn(
            "kpfguide".to_owned(),
            proxy_side,
            registry,
            DEFAULT_PENDING_CEILING,
        );

        let request = ParsedRequest {
            kind: RequestKind::Read,
            name: Some("kpfguide.DISP2MSG".to_owned()),
            data: None,
        };

        relay
            .external_request("route-a".to_owned(), request, TransactionId(0x0a))
            .await
            .unwrap();

        let worker_req = recv_request(&mut worker_reader).await;
        assert_eq!(worker_req.request, RequestKind::Read);
        assert_ne!(worker_req.id, TransactionId(0x0a), "id must be remapped internally");

        send_rep(
            &mut worker_writer,
            ResponseMessage {
                message: MessageKind::Rep,
                id: worker_req.id,
                time: 1.0,
                name: worker_req.name.clone(),
                data: Some(serde_json::json!("ok")),
                error: None,
            },
        )
        .await;

        let delivered = client_rx.recv().await.unwrap();
        match delivered {
            OutboundFrame::Json(json) => {
                let parsed: ResponseMessage = serde_json::from_str(&json).unwrap();
                assert_eq!(parsed.id, TransactionId(0x0a));
            }
            OutboundFrame::Bulk(_) => panic!("expected json frame"),
        }
    }

    #[tokio::test]
    async fn route_isolation_keeps_distinct_client_routes_separate() {
        let (proxy_side, worker_side) = connected_pair().await;
        let (worker_read, worker_write) = worker_side.into_split();
        let mut worker_reader = FramedRead::new(worker_read, LengthDelimitedCodec::new());
        let mut worker_writer = FramedWrite::new(worker_write, LengthDelimitedCodec::new());

        let registry = new_client_registry();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.write().await.insert("a".to_owned(), tx_a);
        registry.write().await.insert("b".to_owned(), tx_b);

        let relay = RequestRelay::spawn(
            "kpfguide".to_owned(),
            proxy_side,
            registry,
            DEFAULT_PENDING_CEILING,
        );

        let req = ParsedRequest {
            kind: RequestKind::Read,
            name: Some("kpfguide.DISP2MSG".to_owned()),
            data: None,
        };
        relay
            .external_request("a".to_owned(), req.clone(), TransactionId(1))
            .await
            .unwrap();
        relay
            .external_request("b".to_owned(), req, TransactionId(1))
            .await
            .unwrap();

        for _ in 0..2 {
            let worker_req = recv_request(&mut worker_reader).await;
            send_rep(
                &mut worker_writer,
                ResponseMessage {
                    message: MessageKind::Rep,
                    id: worker_req.id,
                    time: 1.0,
                    name: worker_req.name,
                    data: None,
                    error: None,
                },
            )
            .await;
        }

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        for got in [got_a, got_b] {
            match got {
                OutboundFrame::Json(json) => {
                    let parsed: ResponseMessage = serde_json::from_str(&json).unwrap();
                    assert_eq!(parsed.id, TransactionId(1));
                }
                OutboundFrame::Bulk(_) => panic!("expected json"),
            }
        }
    }
}
