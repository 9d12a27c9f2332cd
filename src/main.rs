//! edge-proxy
//!
//! # Architecture Overview
//!
//! ```text
//!   providers (files, adapters)            ┌──────────────────────────────┐
//!   ─────── TopologyFragment ─────────────▶│ reconciler                   │
//!                                          │  merge → compile → build     │
//!                                          └──────────────┬───────────────┘
//!                                                         │ atomic swap
//!                                                         ▼
//!     Client Request   ┌─────────┐    ┌──────────────────────────────────┐
//!     ────────────────▶│  http   │───▶│ RoutingSnapshot                  │
//!                      │ server  │    │  route table → middleware chain  │
//!                      └─────────┘    │  → service pool → target         │
//!                                     └────────────────┬─────────────────┘
//!     Client Response                                  │ forward / retry
//!     ◀────────────────────────────────────────────────┴──────── Backend
//!
//!   health monitor ── probes ──▶ target health (atomics, shared across snapshots)
//! ```

use std::path::PathBuf;

use clap::Parser;

use edge_proxy::config::{load_config, ProxyConfig};
use edge_proxy::lifecycle;

#[derive(Parser)]
#[command(name = "edge-proxy", version, about = "Edge reverse proxy with dynamic routing")]
struct Args {
    /// Static configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, env = "EDGE_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("edge-proxy: {}", e);
                std::process::exit(2);
            }
        },
        None => ProxyConfig::default(),
    };

    if args.check {
        println!("configuration ok");
        return Ok(());
    }

    lifecycle::run(config).await?;
    Ok(())
}
