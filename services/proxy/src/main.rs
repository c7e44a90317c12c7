// pot-proxy: telemetry message broker proxy for the POT instrument-control
// protocol. See `pot_proxy::run` for the entry point proper; this file only
// wires up logging and argument parsing.

use clap::Parser;
use pot_proxy::Args;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = pot_proxy::run(args).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
}
