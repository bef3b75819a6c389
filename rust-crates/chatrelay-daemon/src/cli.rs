//! Command line interface

use chatrelay_broadcaster::ListenerConfig;
use clap::Parser;
use std::path::PathBuf;

/// TCP broadcast relay: every chunk a client sends is forwarded to all clients
#[derive(Parser, Debug, Default)]
#[command(name = "chatrelay-daemon", version, about)]
pub struct Cli {
    /// Config file (default: platform config dir)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(short, long, value_name = "IP")]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long, value_name = "N")]
    pub max_pending: Option<u32>,

    /// Do not relay a client's messages back to itself
    #[arg(long)]
    pub no_echo: bool,

    /// Drop connections idle for this many seconds
    #[arg(long, value_name = "SECS")]
    pub read_timeout: Option<u64>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Override file settings with whatever was given on the command line
    pub fn apply(&self, config: &mut ListenerConfig) {
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_pending) = self.max_pending {
            config.max_pending = max_pending;
        }
        if self.no_echo {
            config.echo_to_sender = false;
        }
        if self.read_timeout.is_some() {
            config.read_timeout_secs = self.read_timeout;
        }
    }
}
