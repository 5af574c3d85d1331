//! wsbus CLI - run a hub or talk to one from the command line.
//!
//! See the `wsbus` library for the bus itself.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use wsbus::{Config, Hub, Notify, Peer, Request, Responder};

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "wsbus")]
#[command(version)]
#[command(about = "Hub-and-spoke message bus over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a hub until Ctrl-C
    Hub {
        /// Address to bind (defaults to the configured bind_address)
        #[arg(long)]
        bind: Option<String>,
        /// Notify names to log as they arrive
        #[arg(long = "log", default_value = "log")]
        log_names: Vec<String>,
    },
    /// Connect, send one notify, disconnect
    Notify {
        /// Hub address (host:port or ws:// URL)
        #[arg(long)]
        hub: String,
        /// Identity to register as
        #[arg(long, default_value = "cli")]
        name: String,
        /// Notify name
        message: String,
        /// Payload as JSON
        payload: Option<String>,
        /// Identity of the peer to address
        #[arg(long)]
        target: Option<String>,
    },
    /// Connect, send one request, print every response
    Request {
        /// Hub address (host:port or ws:// URL)
        #[arg(long)]
        hub: String,
        /// Identity to register as
        #[arg(long, default_value = "cli")]
        name: String,
        /// Request name
        message: String,
        /// Payload as JSON
        payload: Option<String>,
        /// Seconds to wait for the final response
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Hub { bind, log_names } => run_hub(config, bind, log_names).await,
        Commands::Notify {
            hub,
            name,
            message,
            payload,
            target,
        } => {
            let peer = connect_peer(config, &name, &hub).await?;
            let payload = parse_payload(payload.as_deref())?;
            peer.notify(&message, payload, target.as_deref())?;
            // Let the write task flush before closing.
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.close();
            Ok(())
        }
        Commands::Request {
            hub,
            name,
            message,
            payload,
            timeout,
        } => run_request(config, &name, &hub, &message, payload.as_deref(), timeout).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn parse_payload(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("payload is not valid JSON: {text}")),
    }
}

async fn connect_peer(config: Config, name: &str, hub: &str) -> Result<Peer> {
    let peer = Peer::with_config(name, config);
    peer.connect(hub)
        .await
        .with_context(|| format!("failed to connect to hub at {hub}"))?;
    Ok(peer)
}

/// Runs a hub with an `echo` request handler until Ctrl-C.
async fn run_hub(config: Config, bind: Option<String>, log_names: Vec<String>) -> Result<()> {
    let hub = Hub::with_config(config);

    for name in log_names {
        let label = name.clone();
        hub.on_notify(
            &name,
            move |notify: Notify| {
                log::info!(
                    "[Hub] [{}] from {}: {}",
                    label,
                    notify.sender_id,
                    notify.payload
                );
            },
            None,
        );
    }
    hub.on_request(
        "echo",
        |request: Request, responder: Responder| {
            responder.respond(json!({ "received": true }));
            responder.end(request.payload);
        },
        None,
    );

    let addr = match bind {
        Some(bind) => hub.start(&bind).await?,
        None => hub.listen().await?,
    };
    println!("ws://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    hub.shutdown();
    Ok(())
}

async fn run_request(
    config: Config,
    name: &str,
    hub: &str,
    message: &str,
    payload: Option<&str>,
    timeout_secs: u64,
) -> Result<()> {
    let peer = connect_peer(config, name, hub).await?;
    let handle = peer.request(message, parse_payload(payload)?)?;

    let (final_tx, mut final_rx) = mpsc::unbounded_channel();
    handle
        .on_partial(|response| println!("partial: {}", response.payload))
        .on_final(move |response| {
            let _ = final_tx.send(response.payload);
        });

    let request_id = handle.request_id();
    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), final_rx.recv()).await;
    peer.close();
    match outcome {
        Ok(Some(payload)) => {
            println!("final: {payload}");
            Ok(())
        }
        Ok(None) => bail!("connection closed before request {request_id} completed"),
        Err(_) => bail!("request {request_id} timed out after {timeout_secs}s"),
    }
}
