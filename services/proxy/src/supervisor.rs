//! Worker Supervisor.
//!
//! One instance per store. Owns the store's ephemeral socket directory, its
//! `PublishRelay` and `RequestRelay`, and the backend worker process itself:
//! spawns it, waits for it, and respawns it on exit with a fixed backoff,
//! reusing the same socket endpoints across restarts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pot_protocol::{ConfigBlock, ParsedRequest, RequestKind};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config_cache::ConfigCache;
use crate::error::SupervisorError;
use crate::publish_relay::PublishRelay;
use crate::request_relay::{ClientRegistry, RequestRelay};

/// Fixed restart backoff: pause briefly after a worker exits before trying
/// again, rather than busy-looping on a worker that keeps crashing.
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// How long to wait for a freshly spawned worker to connect both sockets
/// before giving up on it and retrying. A worker that never connects is
/// indistinguishable from one that is simply slow to start, so this needs
/// to be long enough to tolerate a slow start without blocking shutdown
/// indefinitely.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SupervisorConfig {
    pub worker_bin: PathBuf,
    pub pending_ceiling: Duration,
}

/// The handle the Request Server and the publish WebSocket endpoint use to
/// reach a store's current relays. Swapped out by the supervisor on every
/// restart; readers always see either the live relay or `None` during the
/// brief reconnect gap. Pending entries belonging to the previous worker
/// instance are simply abandoned along with that instance's relay.
pub struct StoreHandle {
    store: String,
    request_relay: RwLock<Option<Arc<RequestRelay>>>,
    publish_relay: RwLock<Option<Arc<PublishRelay>>>,
}

impl StoreHandle {
    pub(crate) fn new(store: String) -> Self {
        Self {
            store,
            request_relay: RwLock::new(None),
            publish_relay: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub async fn request_relay(&self) -> Option<Arc<RequestRelay>> {
        self.request_relay.read().await.clone()
    }

    pub async fn publish_relay(&self) -> Option<Arc<PublishRelay>> {
        self.publish_relay.read().await.clone()
    }

    pub(crate) async fn set_request_relay(&self, relay: Arc<RequestRelay>) {
        *self.request_relay.write().await = Some(relay);
    }

    pub(crate) async fn set_publish_relay(&self, relay: Arc<PublishRelay>) {
        *self.publish_relay.write().await = Some(relay);
    }
}

/// Bind a store's ephemeral request/publish socket directory, then start the
/// spawn/monitor/restart loop as a background task. Returns immediately with
/// a `StoreHandle` the rest of the proxy can route through; the handle's
/// relays populate once the worker has connected.
pub fn spawn_supervisor(
    store: String,
    config: SupervisorConfig,
    client_registry: ClientRegistry,
    config_cache: ConfigCache,
) -> Result<(Arc<StoreHandle>, tokio::task::JoinHandle<()>), SupervisorError> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("pot-{store}-"))
        .tempdir()
        .map_err(SupervisorError::TempDir)?;
    let req_path = dir.path().join("req");
    let pub_path = dir.path().join("pub");

    let req_listener = UnixListener::bind(&req_path).map_err(|e| SupervisorError::Bind {
        path: req_path.clone(),
        source: e,
    })?;
    let pub_listener = UnixListener::bind(&pub_path).map_err(|e| SupervisorError::Bind {
        path: pub_path.clone(),
        source: e,
    })?;

    let handle = Arc::new(StoreHandle::new(store.clone()));
    let loop_handle = handle.clone();
    let join = tokio::spawn(async move {
        // `dir` is held here for the lifetime of the supervisor task; it is
        // unlinked on drop (i.e. when this task is aborted at shutdown).
        let _dir = dir;
        run_supervisor_loop(
            store,
            config,
            req_listener,
            req_path,
            pub_listener,
            pub_path,
            loop_handle,
            client_registry,
            config_cache,
        )
        .await;
    });

    Ok((handle, join))
}

#[allow(clippy::too_many_arguments)]
async fn run_supervisor_loop(
    store: String,
    config: SupervisorConfig,
    req_listener: UnixListener,
    req_path: PathBuf,
    pub_listener: UnixListener,
    pub_path: PathBuf,
    handle: Arc<StoreHandle>,
    client_registry: ClientRegistry,
    config_cache: ConfigCache,
) {
    loop {
        info!(store = %store, worker_bin = ?config.worker_bin, "spawning backend worker process");
        let mut child = match Command::new(&config.worker_bin)
            .arg(&req_path)
            .arg(&pub_path)
            .arg(&store)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let err = SupervisorError::Spawn {
                    command: format!(
                        "{} {} {} {store}",
                        config.worker_bin.display(),
                        req_path.display(),
                        pub_path.display()
                    ),
                    source: e,
                };
                error!(store = %store, %err, "failed to spawn worker; retrying after backoff");
                tokio::time::sleep(RESTART_BACKOFF).await;
                continue;
            }
        };

        let accepted = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio::try_join!(req_listener.accept(), pub_listener.accept()),
        )
        .await;
        let (req_stream, pub_stream) = match accepted {
            Ok(Ok(((req_stream, _), (pub_stream, _)))) => (req_stream, pub_stream),
            Ok(Err(e)) => {
                error!(store = %store, error = %e, "worker did not connect its sockets; killing and retrying");
                let _ = child.kill().await;
                tokio::time::sleep(RESTART_BACKOFF).await;
                continue;
            }
            Err(_) => {
                warn!(store = %store, "worker did not connect within the connect timeout; killing and retrying");
                let _ = child.kill().await;
                tokio::time::sleep(RESTART_BACKOFF).await;
                continue;
            }
        };

        let relay = Arc::new(RequestRelay::spawn(
            store.clone(),
            req_stream,
            client_registry.clone(),
            config.pending_ceiling,
        ));
        handle.set_request_relay(relay.clone()).await;
        handle
            .set_publish_relay(Arc::new(PublishRelay::spawn(store.clone(), pub_stream)))
            .await;

        fetch_initial_config(&store, &relay, &config_cache).await;

        match child.wait().await {
            Ok(status) => warn!(store = %store, %status, "worker process exited, respawning"),
            Err(e) => warn!(store = %store, error = %e, "failed to wait on worker process, respawning"),
        }

        tokio::time::sleep(RESTART_BACKOFF).await;
    }
}

/// Issue the start-up/restart `CONFIG` request and cache the result.
/// Fail-shut: an error here is logged and operation continues — the config
/// cache simply keeps whatever block (or none) it already had.
async fn fetch_initial_config(store: &str, relay: &RequestRelay, config_cache: &ConfigCache) {
    let request = ParsedRequest {
        kind: RequestKind::Config,
        name: Some(store.to_owned()),
        data: None,
    };

    match relay.internal_request(request).await {
        Ok(response) => {
            if let Some(error) = response.error {
                let err = SupervisorError::InitialConfig {
                    store: store.to_owned(),
                    source: crate::error::RelayError::WorkerError(format!(
                        "{}: {}",
                        error.error_type, error.text
                    )),
                };
                error!(store, %err, "worker reported a CONFIG error");
                return;
            }
            match response
                .data
                .and_then(|data| serde_json::from_value::<ConfigBlock>(data).ok())
            {
                Some(block) => {
                    info!(store, id = %block.id, "configuration cached");
                    config_cache.put(store, block).await;
                }
                None => error!(store, "CONFIG response carried no usable configuration block"),
            }
        }
        Err(e) => {
            let err = SupervisorError::InitialConfig {
                store: store.to_owned(),
                source: e,
            };
            error!(store, %err, "initial CONFIG request failed; continuing with stale or absent cache");
        }
    }
}
