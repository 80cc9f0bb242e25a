use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tor_fleet::registry::Selector;

#[derive(Parser)]
#[command(name = "tor-fleet")]
#[command(about = "Manage a fleet of independently configured Tor clients")]
#[command(version)]
pub struct Cli {
    /// Directory holding torrc descriptors (overrides settings and TOR_FLEET_CONFIG_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Directory for runtime state between runs (overrides settings and TOR_FLEET_CACHE_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Settings file (defaults to $XDG_CONFIG_HOME/tor-fleet/settings.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List every configured client
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List running clients with their identities
    Running {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start one client
    Start {
        #[command(flatten)]
        target: Target,
    },
    /// Stop one client
    Stop {
        #[command(flatten)]
        target: Target,
    },
    /// Start every stopped client
    StartAll,
    /// Stop every running client (the system daemon is left alone)
    StopAll,
    /// Request a new identity (all running clients when no client is given)
    Rotate {
        #[command(flatten)]
        target: OptionalTarget,
    },
    /// Show a client's identity
    Ip {
        #[command(flatten)]
        target: Target,

        /// Ask the identity services again instead of showing the last result
        #[arg(long)]
        refresh: bool,
    },
    /// Create a new client descriptor
    Create {
        /// SocksPort of the new client; its ControlPort is the next port
        #[arg(long)]
        port: u16,

        /// Exit country label, e.g. `us` (can be repeated)
        #[arg(short, long = "label", value_name = "LABEL")]
        labels: Vec<String>,

        /// DataDirectory (defaults to <data_root>/tor<n>)
        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Delete a stopped client's descriptor
    Delete {
        #[command(flatten)]
        target: Target,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Exactly one way of naming a client.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct Target {
    /// SocksPort or ControlPort of the client
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Exit country label; picks the first client restricted to it
    #[arg(short, long)]
    pub label: Option<String>,

    /// Position in `tor-fleet list`, starting at 0
    #[arg(short, long)]
    pub index: Option<usize>,
}

impl Target {
    pub fn selector(&self) -> Selector {
        to_selector(self.port, self.label.as_deref(), self.index)
            .unwrap_or(Selector::Index(0))
    }
}

/// Like [`Target`], but naming no client is allowed.
#[derive(Args, Debug, Clone)]
#[group(required = false, multiple = false)]
pub struct OptionalTarget {
    /// SocksPort or ControlPort of the client
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Exit country label; picks the first client restricted to it
    #[arg(short, long)]
    pub label: Option<String>,

    /// Position in `tor-fleet list`, starting at 0
    #[arg(short, long)]
    pub index: Option<usize>,
}

impl OptionalTarget {
    pub fn selector(&self) -> Option<Selector> {
        to_selector(self.port, self.label.as_deref(), self.index)
    }
}

fn to_selector(port: Option<u16>, label: Option<&str>, index: Option<usize>) -> Option<Selector> {
    match (port, label, index) {
        (Some(port), _, _) => Some(Selector::Port(port)),
        (None, Some(label), _) => Some(Selector::label(label)),
        (None, None, Some(index)) => Some(Selector::Index(index)),
        (None, None, None) => None,
    }
}
