//! Publish Relay.
//!
//! One instance per store, bound to that store's worker publish socket.
//! Forwards every frame it reads, byte-exact and in order, to every
//! currently-connected external publish consumer. No parsing, no
//! rewriting — a `PUB+B` descriptor and its bulk continuation are two
//! separate frames here exactly as the worker emitted them, and it is the
//! caller's job (the external publish endpoint) never to interleave them
//! with another transaction's frames on the same outbound socket. A
//! broadcast channel fed by one reader task, subscribed to by one task per
//! consumer.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Capacity of the broadcast channel. A slow consumer that falls this far
/// behind misses frames (reported via `RecvError::Lagged`) rather than
/// blocking every other consumer or the worker reader.
const CHANNEL_CAPACITY: usize = 1024;

pub struct PublishRelay {
    store: String,
    tx: broadcast::Sender<Bytes>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl PublishRelay {
    /// Take ownership of an accepted worker publish connection and start
    /// reading frames from it immediately.
    pub fn spawn(store: String, stream: UnixStream) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let mut reader = FramedRead::new(stream, LengthDelimitedCodec::new());
        let reader_tx = tx.clone();
        let reader_store = store.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(bytes) => {
                        let _ = reader_tx.send(bytes.freeze());
                    }
                    Err(e) => {
                        warn!(store = %reader_store, error = %e, "error reading worker publish frame");
                        break;
                    }
                }
            }
            debug!(store = %reader_store, "worker publish socket closed");
        });

        Self {
            store,
            tx,
            reader_task,
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Subscribe a new external consumer. Every frame published after this
    /// call is delivered to the returned receiver; frames published before
    /// it are not replayed — no backlog, no persistence.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }
}

impl Drop for PublishRelay {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Drive one external consumer connection: forward every broadcast frame
/// via `send` until it returns an error (connection gone) or the channel
/// closes. `send` is typically a WebSocket binary-frame send.
pub async fn serve_consumer<F, Fut>(store: &str, mut rx: broadcast::Receiver<Bytes>, mut send: F)
where
    F: FnMut(Bytes) -> Fut,
    Fut: std::future::Future<Output = Result<(), ()>>,
{
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if send(frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(store, skipped, "publish consumer lagged, frames dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
