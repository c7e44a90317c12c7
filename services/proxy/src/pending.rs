//! Pending Table.
//!
//! Maps an internal transaction id to the bookkeeping needed to route the
//! worker's eventual response: either back out to an external client route,
//! or to whatever is awaiting an internal request's completion.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pot_protocol::{MessageKind, TransactionId};
use tokio::sync::{oneshot, Mutex};

use crate::error::RelayError;

/// What an entry resolves to when its terminal response arrives.
pub enum PendingKind {
    External {
        client_route: String,
        original_id: TransactionId,
    },
    Internal {
        completion: oneshot::Sender<Result<pot_protocol::ResponseMessage, RelayError>>,
    },
}

struct PendingEntry {
    kind: PendingKind,
    created_at: Instant,
}

/// Action the Request Relay's dispatcher should take after looking up a
/// frame's internal id.
pub enum DispatchAction {
    /// No entry for this id — the worker answered a transaction the relay
    /// no longer knows about (e.g. it was swept). Drop the frame.
    Unknown,
    /// An `ACK` for an internal request; internal callers never see acks.
    InternalIgnore,
    /// The terminal `REP` for an internal request.
    InternalComplete(oneshot::Sender<Result<pot_protocol::ResponseMessage, RelayError>>),
    /// Forward to this external client route, restoring `original_id`.
    External {
        client_route: String,
        original_id: TransactionId,
    },
}

#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<TransactionId, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `kind` under `id` unless the slot is already occupied. Returns
    /// the unused `kind` back to the caller on collision so the id allocator
    /// can probe for another slot without losing the pending entry payload.
    pub async fn try_insert(&self, id: TransactionId, kind: PendingKind) -> Result<(), PendingKind> {
        let mut map = self.inner.lock().await;
        if map.contains_key(&id) {
            Err(kind)
        } else {
            map.insert(
                id,
                PendingEntry {
                    kind,
                    created_at: Instant::now(),
                },
            );
            Ok(())
        }
    }

    /// Resolve a response frame's internal id into the action the dispatcher
    /// should take, applying the terminal-response rule: `ACK` never
    /// removes; plain `REP` always removes; `REP+B`'s descriptor frame does
    /// *not* remove (the caller must call `complete_bulk` after forwarding
    /// the bulk frame).
    pub async fn dispatch(&self, id: TransactionId, kind: MessageKind) -> DispatchAction {
        let mut map = self.inner.lock().await;
        let remove_now = match map.get(&id) {
            None => return DispatchAction::Unknown,
            Some(entry) => match &entry.kind {
                PendingKind::Internal { .. } => matches!(kind, MessageKind::Rep),
                PendingKind::External { .. } => matches!(kind, MessageKind::Rep),
            },
        };

        if remove_now {
            let entry = map.remove(&id).expect("presence checked above");
            match entry.kind {
                PendingKind::Internal { completion } => DispatchAction::InternalComplete(completion),
                PendingKind::External {
                    client_route,
                    original_id,
                } => DispatchAction::External {
                    client_route,
                    original_id,
                },
            }
        } else {
            match &map.get(&id).expect("presence checked above").kind {
                PendingKind::Internal { .. } => DispatchAction::InternalIgnore,
                PendingKind::External {
                    client_route,
                    original_id,
                } => DispatchAction::External {
                    client_route: client_route.clone(),
                    original_id: *original_id,
                },
            }
        }
    }

    /// Remove the entry for a `REP+B` transaction after its bulk frame has
    /// been forwarded, returning the route to address it to.
    pub async fn complete_bulk(&self, id: TransactionId) -> Option<(String, TransactionId)> {
        let mut map = self.inner.lock().await;
        map.remove(&id).and_then(|entry| match entry.kind {
            PendingKind::External {
                client_route,
                original_id,
            } => Some((client_route, original_id)),
            PendingKind::Internal { .. } => None,
        })
    }

    /// Evict entries older than `ceiling`, returning them so the caller can
    /// complete them with a synthetic error. Bounds otherwise-unbounded
    /// growth of this table when a worker stops answering.
    pub async fn sweep_expired(&self, ceiling: Duration) -> Vec<(TransactionId, PendingKind)> {
        let mut map = self.inner.lock().await;
        let now = Instant::now();
        let expired: Vec<TransactionId> = map
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.created_at) > ceiling)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| map.remove(&id).map(|entry| (id, entry.kind)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external(route: &str, original: u32) -> PendingKind {
        PendingKind::External {
            client_route: route.to_owned(),
            original_id: TransactionId(original),
        }
    }

    #[tokio::test]
    async fn ack_does_not_remove_external_entry() {
        let table = PendingTable::new();
        table
            .try_insert(TransactionId(1), external("route-a", 10))
            .await
            .unwrap();

        match table.dispatch(TransactionId(1), MessageKind::Ack).await {
            DispatchAction::External {
                client_route,
                original_id,
            } => {
                assert_eq!(client_route, "route-a");
                assert_eq!(original_id, TransactionId(10));
            }
            _ => panic!("expected External"),
        }
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn rep_removes_external_entry() {
        let table = PendingTable::new();
        table
            .try_insert(TransactionId(1), external("route-a", 10))
            .await
            .unwrap();

        table.dispatch(TransactionId(1), MessageKind::Rep).await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn rep_bulk_defers_removal_until_complete_bulk() {
        let table = PendingTable::new();
        table
            .try_insert(TransactionId(1), external("route-a", 10))
            .await
            .unwrap();

        table
            .dispatch(TransactionId(1), MessageKind::RepBulk)
            .await;
        assert_eq!(table.len().await, 1, "entry must survive the descriptor frame");

        let (route, original) = table.complete_bulk(TransactionId(1)).await.unwrap();
        assert_eq!(route, "route-a");
        assert_eq!(original, TransactionId(10));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_id_is_reported_and_does_not_panic() {
        let table = PendingTable::new();
        assert!(matches!(
            table.dispatch(TransactionId(99), MessageKind::Rep).await,
            DispatchAction::Unknown
        ));
    }

    #[tokio::test]
    async fn internal_ignores_ack_and_completes_on_rep() {
        let table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table
            .try_insert(TransactionId(5), PendingKind::Internal { completion: tx })
            .await
            .unwrap();

        assert!(matches!(
            table.dispatch(TransactionId(5), MessageKind::Ack).await,
            DispatchAction::InternalIgnore
        ));
        assert_eq!(table.len().await, 1);

        match table.dispatch(TransactionId(5), MessageKind::Rep).await {
            DispatchAction::InternalComplete(completion) => {
                let response = pot_protocol::ResponseMessage {
                    message: MessageKind::Rep,
                    id: TransactionId(5),
                    time: 0.0,
                    name: None,
                    data: None,
                    error: None,
                };
                completion.send(Ok(response)).unwrap();
            }
            _ => panic!("expected InternalComplete"),
        }
        assert!(table.is_empty().await);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn try_insert_collision_returns_kind_back() {
        let table = PendingTable::new();
        table
            .try_insert(TransactionId(1), external("route-a", 1))
            .await
            .unwrap();
        let result = table.try_insert(TransactionId(1), external("route-b", 2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sweep_expired_evicts_entries_older_than_ceiling() {
        let table = PendingTable::new();
        table
            .try_insert(TransactionId(1), external("route-a", 1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = table.sweep_expired(Duration::from_millis(1)).await;
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_expired_leaves_fresh_entries() {
        let table = PendingTable::new();
        table
            .try_insert(TransactionId(1), external("route-a", 1))
            .await
            .unwrap();
        let expired = table.sweep_expired(Duration::from_secs(30)).await;
        assert!(expired.is_empty());
        assert_eq!(table.len().await, 1);
    }
}
