//! Command-line argument parsing.

use clap::Parser;

/// hostman node agent - local storage pools for a hypervisor host
#[derive(Parser, Debug)]
#[command(name = "hostman-node")]
#[command(about = "hostman node agent - local storage pools for a hypervisor host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Zone this host belongs to
    #[arg(long)]
    pub zone: Option<String>,

    /// Management IP used to compose pool names
    #[arg(long, env = "HOSTMAN_MASTER_IP")]
    pub master_ip: Option<String>,

    /// Local storage pool root (repeatable, replaces configured paths)
    #[arg(long = "storage-path")]
    pub storage_paths: Vec<String>,

    /// Do not register or sync pools with the control plane
    #[arg(long)]
    pub no_sync: bool,
}
