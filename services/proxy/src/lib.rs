//! pot-proxy: library entry point for the POT telemetry broker proxy —
//! the Process Controller, plus the shared `AppState` that wires the
//! Request Server to the per-store Worker Supervisor handles.
//!
//! Exposes modules for integration testing: a thin `main.rs` over a
//! `lib.rs` that holds everything actually worth testing.

pub mod config_cache;
pub mod error;
pub mod id_alloc;
pub mod pending;
pub mod publish_relay;
pub mod request_relay;
pub mod request_server;
pub mod supervisor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::info;

use config_cache::ConfigCache;
use request_relay::{new_client_registry, ClientRegistry, DEFAULT_PENDING_CEILING};
use supervisor::{spawn_supervisor, StoreHandle, SupervisorConfig};

/// CLI surface: the store list comes from invocation arguments; everything
/// else is ambient configuration this implementation picks concretely.
#[derive(Parser, Debug)]
#[command(author, version, about = "POT telemetry broker proxy")]
pub struct Args {
    /// Store names this proxy instance serves, e.g. `kpfguide deimot`.
    /// At least one is required, else the process exits with a non-zero
    /// status at the argument-parsing layer.
    #[arg(required = true)]
    pub stores: Vec<String>,

    /// Path to the backend worker binary, invoked as
    /// `<bin> <req-socket-path> <pub-socket-path> <store-name>`.
    #[arg(long, env = "POT_WORKER_BIN", default_value = "pot-worker")]
    pub worker_bin: PathBuf,

    /// Address to bind the external request/publish WebSocket server to.
    #[arg(long, env = "POT_BIND_ADDR", default_value = "0.0.0.0:5000")]
    pub bind_addr: String,

    /// How long a pending transaction may linger, unanswered, before a
    /// Request Relay evicts it with a synthetic error REP.
    #[arg(long, env = "POT_PENDING_CEILING_SECS", default_value_t = DEFAULT_PENDING_CEILING.as_secs())]
    pub pending_ceiling_secs: u64,
}

/// Shared state reachable from every axum handler: the immutable store
/// registry built at start-up, the Configuration Cache, and the client
/// route registry Request Relays use to address responses back out.
#[derive(Clone)]
pub struct AppState {
    pub store_registry: Arc<HashMap<String, Arc<StoreHandle>>>,
    pub config_cache: ConfigCache,
    pub client_registry: ClientRegistry,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/request", get(request_server::ws_request_handler))
        .route("/publish", get(request_server::ws_publish_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Process Controller. Instantiates one Worker Supervisor per configured
/// store, wires up the Request Server over both external sockets, and
/// blocks until shutdown is requested.
pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.stores.is_empty() {
        return Err("at least one store name must be given".into());
    }

    let config_cache = ConfigCache::new();
    let client_registry = new_client_registry();
    let pending_ceiling = Duration::from_secs(args.pending_ceiling_secs);

    let mut registry = HashMap::with_capacity(args.stores.len());
    let mut supervisor_tasks = Vec::with_capacity(args.stores.len());
    for store in &args.stores {
        let supervisor_config = SupervisorConfig {
            worker_bin: args.worker_bin.clone(),
            pending_ceiling,
        };
        let (handle, task) = spawn_supervisor(
            store.clone(),
            supervisor_config,
            client_registry.clone(),
            config_cache.clone(),
        )?;
        registry.insert(store.clone(), handle);
        supervisor_tasks.push(task);
    }

    let state = AppState {
        store_registry: Arc::new(registry),
        config_cache,
        client_registry,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&args.bind_addr).await?;
    info!(addr = %args.bind_addr, stores = ?args.stores, "pot-proxy listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping each supervisor task drops its held `TempDir`, unlinking the
    // store's ephemeral socket directory.
    for task in supervisor_tasks {
        task.abort();
    }
    info!("pot-proxy shut down gracefully");
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_reject_empty_store_list_at_the_clap_layer() {
        let result = Args::try_parse_from(["pot-proxy"]);
        assert!(result.is_err(), "at least one store is required");
    }

    #[test]
    fn args_parse_multiple_stores_and_defaults() {
        let args = Args::try_parse_from(["pot-proxy", "kpfguide", "deimot"]).unwrap();
        assert_eq!(args.stores, vec!["kpfguide", "deimot"]);
        assert_eq!(args.bind_addr, "0.0.0.0:5000");
        assert_eq!(args.pending_ceiling_secs, DEFAULT_PENDING_CEILING.as_secs());
    }
}
