//! Command line and environment configuration for the tapmesh daemon.
//!
//! The flag surface is deliberately small and non-strict: unknown arguments
//! are ignored so the daemon can be driven by wrapper scripts that pass
//! extra options through. Environment variables override flags.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tapmesh_session::Seed;
use tracing::{info, warn};

/// Peer-to-peer layer-2 VPN over mutually-authenticated TLS
#[derive(Parser, Debug)]
#[command(
    name = "tapmesh",
    version,
    about = "Peer-to-peer layer-2 VPN over mutually-authenticated TLS",
    ignore_errors = true
)]
pub struct Args {
    /// TLS private key (PEM)
    #[arg(short = 'k', long = "key", default_value = "conf/client.key")]
    pub key: PathBuf,

    /// TLS certificate (PEM); its CN is this node's MAC identity
    #[arg(short = 'c', long = "cert", default_value = "conf/client.crt")]
    pub cert: PathBuf,

    /// CA bundle (PEM) peers are verified against
    #[arg(short = 'a', long = "ca", default_value = "conf/ca.crt")]
    pub ca: PathBuf,

    /// SQLite database path
    #[arg(short = 's', long = "db", default_value = "conf/client.db")]
    pub db: PathBuf,

    /// Listen port
    #[arg(short = 'p', long = "port", default_value_t = 41744)]
    pub port: u16,

    /// Initial seed, MAC@HOST:PORT
    #[arg(short = 't', long = "seed")]
    pub seed: Option<String>,

    /// Announce interval, e.g. 10s
    #[arg(long, default_value = "10s")]
    pub announce_interval: humantime::Duration,

    /// Reconnect interval, e.g. 60s
    #[arg(long, default_value = "60s")]
    pub reconnect_interval: humantime::Duration,

    /// TAP interface name template
    #[arg(long, default_value = "tapmesh%d")]
    pub ifname: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Resolved daemon configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TLS private key path
    pub key_path: PathBuf,
    /// TLS certificate path
    pub cert_path: PathBuf,
    /// CA bundle path
    pub ca_path: PathBuf,
    /// SQLite database path
    pub db_path: PathBuf,
    /// Listen port
    pub port: u16,
    /// Parsed bootstrap seed, if any
    pub seed: Option<Seed>,
    /// Announce interval
    pub announce_interval: Duration,
    /// Reconnect interval
    pub reconnect_interval: Duration,
    /// TAP interface name template
    pub ifname: String,
}

impl NodeConfig {
    /// Build the configuration from parsed flags plus environment overrides.
    pub fn from_args(args: &Args) -> Self {
        let mut config = Self {
            key_path: args.key.clone(),
            cert_path: args.cert.clone(),
            ca_path: args.ca.clone(),
            db_path: args.db.clone(),
            port: args.port,
            seed: None,
            announce_interval: args.announce_interval.into(),
            reconnect_interval: args.reconnect_interval.into(),
            ifname: args.ifname.clone(),
        };

        let mut seed_str = args.seed.clone();
        config.apply_environment_overrides(&mut seed_str);

        // A bad seed only disables the dialer; the node still accepts
        config.seed = seed_str.as_deref().and_then(|s| match s.parse::<Seed>() {
            Ok(seed) => Some(seed),
            Err(e) => {
                warn!("Bad syntax for initial seed {:?}: {}", s, e);
                None
            }
        });

        config
    }

    fn apply_environment_overrides(&mut self, seed_str: &mut Option<String>) {
        if let Ok(port) = std::env::var("TAPMESH_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Listen port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring unparsable TAPMESH_PORT {:?}", port),
            }
        }

        if let Ok(seed) = std::env::var("TAPMESH_SEED") {
            info!("Seed overridden by environment: {}", seed);
            *seed_str = Some(seed);
        }
    }
}
