use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Serve multi-tenant Microsoft 365 and Azure reports over HTTP
#[derive(Parser)]
#[command(name = "tenantlens", version)]
pub struct Cli {
    /// Address to listen on (overrides the configured bind address)
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// YAML file layered over environment configuration
    #[arg(short, long, env = "TENANTLENS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}
