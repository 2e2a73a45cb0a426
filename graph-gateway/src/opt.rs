//! Command-line entry point configuration. Environment variables are the
//! primary configuration channel (see `gateway_framework::Config::from_env`);
//! these flags cover what only makes sense to set per-process-start.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "graph-gateway", version)]
pub struct Opt {
    /// Port the control-plane API listens on.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Port the Prometheus `/metrics` endpoint listens on. Kept separate
    /// from `port` so it can be firewalled off from public traffic.
    #[arg(long, env = "GATEWAY_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Path to the tier catalog manifest (see `gateway_framework::tiers`).
    #[arg(long, env = "GRAPH_TIER_MANIFEST", default_value = "graph.yml")]
    pub tier_manifest: PathBuf,

    /// Emit structured JSON logs instead of the human-readable format.
    #[arg(long, env = "GATEWAY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
