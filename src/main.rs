//! ws-router binary
//!
//! Loads the JSON configuration, builds tunnel clients first (so the client
//! registry is populated before servers decide their short-circuit routes),
//! then servers and UDP tunnels, and runs until interrupted.

use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ws_router::client::{ClientRegistry, TunnelClient};
use ws_router::config::{self, Config};
use ws_router::io::{BufferPool, RELAY_BUFFER_SIZE, UDP_BUFFER_SIZE};
use ws_router::proxy::DialerRegistry;
use ws_router::server::{ServerRegistry, WsServer};
use ws_router::udp::UdpTunnel;

/// Buffers held ready per pool; overflow allocations are freed on return.
const POOL_CAPACITY: usize = 128;

struct Args {
    config_path: String,
    check_only: bool,
    generate: bool,
}

fn print_help() {
    println!("ws-router {} - tunnel router for TCP and UDP over framed transport", ws_router::VERSION);
    println!();
    println!("USAGE:");
    println!("    ws-router [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>    Configuration file [default: config.json]");
    println!("        --check            Validate the configuration and exit");
    println!("    -g, --generate         Print a starter configuration and exit");
    println!("    -h, --help             Print help");
    println!("    -v, --version          Print version");
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config_path: "config.json".to_string(),
        check_only: false,
        generate: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                args.config_path = iter
                    .next()
                    .ok_or_else(|| format!("{arg} requires a file path"))?;
            }
            "--check" => args.check_only = true,
            "-g" | "--generate" => args.generate = true,
            "-h" | "--help" => {
                print_help();
                process::exit(0);
            }
            "-v" | "--version" => {
                println!("ws-router {}", ws_router::VERSION);
                process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ws_router={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Build and spawn everything the configuration describes.
///
/// A client or server whose build fails is logged and skipped; the rest of
/// the configuration still comes up.
fn spawn_from_config(config: &Config) -> anyhow::Result<()> {
    let dialers = Arc::new(DialerRegistry::with_defaults());
    let relay_pool = Arc::new(BufferPool::new(POOL_CAPACITY, RELAY_BUFFER_SIZE));
    let udp_pool = Arc::new(BufferPool::new(POOL_CAPACITY, UDP_BUFFER_SIZE));

    // Clients first: the registry drives short-circuit decisions below.
    let clients = ClientRegistry::new();
    for entry in &config.clients {
        let client = match TunnelClient::from_config(
            entry,
            Arc::clone(&dialers),
            Arc::clone(&relay_pool),
        ) {
            Ok(client) => client,
            Err(e) => {
                warn!(listen = %entry.listen, error = %e, "skipping tunnel client");
                continue;
            }
        };
        let port = entry.port().context("client listen port")?;
        clients.insert(port, Arc::clone(&client));
        tokio::spawn(async move {
            if let Err(e) = client.run().await {
                error!(error = %e, "tunnel client exited");
            }
        });
    }

    let servers = ServerRegistry::new();
    for entry in &config.servers {
        let server = match WsServer::from_config(entry, &clients, Arc::clone(&relay_pool)) {
            Ok(server) => server,
            Err(e) => {
                warn!(listen = %entry.listen, error = %e, "skipping tunnel server");
                continue;
            }
        };
        let port = entry.port().context("server listen port")?;
        servers.insert(port, Arc::clone(&server));
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "tunnel server exited");
            }
        });
    }

    for entry in &config.udp {
        let tunnel = UdpTunnel::from_config(entry, Arc::clone(&udp_pool));
        tokio::spawn(async move {
            if let Err(e) = tunnel.run().await {
                error!(error = %e, "UDP tunnel exited");
            }
        });
    }

    info!(
        clients = clients.len(),
        servers = servers.len(),
        udp = config.udp.len(),
        "ws-router started"
    );
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let args = parse_args().map_err(|e| anyhow::anyhow!(e))?;

    if args.generate {
        let config = config::create_default_config();
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = config::load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path))?;

    if args.check_only {
        println!("configuration OK: {}", args.config_path);
        return Ok(());
    }

    init_tracing(&config.log.level);
    spawn_from_config(&config)?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ws-router: {e:#}");
        process::exit(1);
    }
}
