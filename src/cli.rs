//! Command-line surface for the audit core.
//!
//! This binary is a thin exerciser of the library API, not the
//! operator-facing tool — that is the excluded GUI shell. It exists so
//! the crate is runnable: register a device, seed the rule catalogue,
//! run a check pass, print results.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "netaudit-core")]
#[command(about = "Security compliance audit core for network devices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, global = true, default_value = "network_checker.db")]
    pub data_dir: PathBuf,

    /// Passphrase used to derive the credential encryption key.
    #[arg(long, global = true, env = "NETAUDIT_PASSPHRASE", default_value = "changeme")]
    pub passphrase: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a new device.
    AddDevice {
        #[arg(long)]
        name: String,
        #[arg(long)]
        ip: String,
        #[arg(long, default_value = "router")]
        device_type: String,
        #[arg(long)]
        vendor: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "22")]
        port: u16,
        #[arg(long)]
        snmp_community: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// List every registered device.
    ListDevices,
    /// Import devices from a CSV file in the format documented in the
    /// external-interfaces section of the design.
    ImportDevices { path: PathBuf },
    /// Seed the rule catalogue with the built-in rules.
    LoadRules,
    /// Run every applicable rule against one device.
    RunCheck { device_id: String },
    /// Run a bulk audit across every registered device.
    RunBulk {
        #[arg(long, default_value = "5")]
        workers: usize,
    },
    /// Print per-host SSH connection-pool statistics.
    SshStats,
}
