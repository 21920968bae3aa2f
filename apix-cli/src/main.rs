//! apix-cli - Command-line interface for apix
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;
mod worker;

use apix_core::Config;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apix-cli")]
#[command(about = "Open descriptors, move bytes and exchange SRRP packets through apix")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "APIX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Send a raw message and print what comes back
    Send {
        /// Peer address (host:port, or a socket path with --unix)
        addr: String,

        /// Message to send
        message: String,

        /// Connect to a Unix domain socket
        #[arg(long)]
        unix: bool,

        /// Milliseconds to wait for a reply
        #[arg(short, long, default_value = "500")]
        wait: u64,
    },

    /// Send an SRRP packet and print the packets that come back
    Srrp {
        /// Peer address (host:port, or a socket path with --unix)
        addr: String,

        /// Packet category (ctrl, request, response, subscribe, unsubscribe, publish)
        #[arg(short = 'C', long, default_value = "request")]
        category: String,

        /// Leader (node id), decimal or 0x hex
        #[arg(short, long, default_value = "0x1111")]
        leader: String,

        /// Anchor, e.g. /motor/speed
        #[arg(short, long)]
        anchor: String,

        /// Payload
        #[arg(short, long, default_value = "")]
        payload: String,

        /// Connect to a Unix domain socket
        #[arg(long)]
        unix: bool,

        /// Milliseconds to wait for replies
        #[arg(short, long, default_value = "1000")]
        wait: u64,
    },

    /// Listen on an address and print everything received
    Listen {
        /// Address to listen on (host:port, or a socket path with --unix)
        addr: String,

        /// Listen on a Unix domain socket
        #[arg(long)]
        unix: bool,

        /// Decode accepted connections as SRRP, announcing this node id
        #[arg(long)]
        srrp: Option<String>,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Print the wire frame of a packet as hex
    Encode {
        /// Packet category
        #[arg(short = 'C', long, default_value = "request")]
        category: String,

        /// Leader, decimal or 0x hex
        #[arg(short, long, default_value = "0")]
        leader: String,

        /// Anchor
        #[arg(short, long, default_value = "")]
        anchor: String,

        /// Payload
        #[arg(short, long, default_value = "")]
        payload: String,
    },

    /// Decode hex-encoded frames
    Decode {
        /// Hex string (whitespace is ignored)
        hex: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    if let Err(e) = config.validate() {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(config)?;
        }
        Some(cmd) => match commands::execute(config, cmd) {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{}", output);
                }
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
