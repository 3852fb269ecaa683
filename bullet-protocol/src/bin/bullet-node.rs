//! Runs one Bullet node with a line-oriented shell on stdin.
//!
//! Start a 3-node cluster:
//! ```bash
//! cargo run --bin bullet-node -- --id 0 --nodes 3 --listen 127.0.0.1:9876 \
//!   --peer 1=127.0.0.1:9877,2=127.0.0.1:9878
//! cargo run --bin bullet-node -- --id 1 --nodes 3 --listen 127.0.0.1:9877 \
//!   --peer 0=127.0.0.1:9876,2=127.0.0.1:9878
//! cargo run --bin bullet-node -- --id 2 --nodes 3 --listen 127.0.0.1:9878 \
//!   --peer 0=127.0.0.1:9876,1=127.0.0.1:9877
//! ```

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tracing::{info, warn};

use bullet_protocol::bridge::Bridge;
use bullet_protocol::config::{NodeConfig, parse_peers};
use bullet_protocol::console::{ConsoleCommand, HELP_TEXT};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a Bullet protocol node")]
struct Args {
    /// This node's acceptor id
    #[arg(long)]
    id: u8,

    /// Number of acceptors in the cluster
    #[arg(long)]
    nodes: usize,

    /// Address to listen on for peer messages, e.g. 127.0.0.1:9876
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=host:port,id=host:port,...
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Connect, write and ACK timeout for each outbound message
    #[arg(long, default_value_t = 2000)]
    send_timeout_ms: u64,

    /// How long LEADER waits for promises before trying the election
    #[arg(long, default_value_t = 500)]
    promise_wait_ms: u64,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;
    let config = NodeConfig::new(args.id, args.nodes, args.listen.clone(), peers)
        .with_send_timeout(Duration::from_millis(args.send_timeout_ms))
        .with_promise_wait(Duration::from_millis(args.promise_wait_ms));

    let mut bridge =
        Bridge::bind(config).with_context(|| format!("failed to start node {}", args.id))?;
    print_status(&bridge)?;
    println!("Type HELP (or h) for commands.");

    let result = run_shell(&bridge);
    bridge.shutdown();
    result
}

fn run_shell(bridge: &Bridge) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("bullet[{}]> ", bridge.node_id());
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            info!("stdin closed, shutting down");
            return Ok(());
        };
        let line = line.context("failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Propose { value }) => match bridge.propose_value(value) {
                Ok(()) => println!("OK: log length {}", bridge.status().log_length),
                Err(err) => println!("ERROR: {err}"),
            },
            Ok(ConsoleCommand::Leader) => match bridge.request_leadership() {
                Ok(()) => println!("OK: leader for term {}", bridge.status().term),
                Err(err) => println!("ERROR: {err}"),
            },
            Ok(ConsoleCommand::Pass { target }) => match bridge.transfer_leadership(target) {
                Ok(()) => println!("OK: bullet passed to {target}"),
                Err(err) => println!("ERROR: {err}"),
            },
            Ok(ConsoleCommand::Status) => print_status(bridge)?,
            Ok(ConsoleCommand::Safety) => match bridge.check_safety() {
                Ok(()) => println!("Safety OK"),
                Err(violation) => {
                    warn!(%violation, "safety check failed");
                    println!("UNSAFE: {violation}");
                }
            },
            Ok(ConsoleCommand::Help) => println!("{HELP_TEXT}"),
            Ok(ConsoleCommand::Exit) => {
                println!("Shutting down...");
                return Ok(());
            }
            Err(err) => println!("ERROR: {err}"),
        }
    }
}

fn print_status(bridge: &Bridge) -> Result<()> {
    let status = serde_json::to_string_pretty(&bridge.status()).context("failed to encode status")?;
    println!("{status}");
    Ok(())
}
