//! HubShare CLI - join the shared echo connection from a terminal.
//!
//! Run several instances against the same data directory. The first one owns
//! the connection; every instance can send messages and sees every echo.

use anyhow::{Context, Result};
use clap::Parser;
use hubshare_core::config::SqliteConfig;
use hubshare_core::{
    ChannelConfig, ChannelProxy, ConnectionEvent, FileLockService, LoopbackTransport,
    OsProcess, SharedConnection, SqliteStore,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "hubshare")]
#[command(about = "Share one echo connection between terminal sessions")]
struct Args {
    /// Directory holding the shared database and lock files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Key namespace, so unrelated groups can share a data directory
    #[arg(long)]
    namespace: Option<String>,

    /// Simulated connect latency of the owned connection, in milliseconds
    #[arg(long, default_value = "0")]
    connect_delay_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("hubshare"))
        .context("no data directory on this platform, pass --data-dir")
}

fn print_echo(args: &[Value]) {
    match args.first() {
        Some(Value::String(message)) => println!("< {}", message),
        Some(other) => println!("< {}", other),
        None => println!("<"),
    }
}

fn print_status(connection: &SharedConnection, echo: &ChannelProxy) {
    let methods: Vec<&str> = echo.server().methods().iter().map(String::as_str).collect();
    println!(
        "role={} state={} connection={} owner={} methods={}",
        connection.role(),
        connection.state(),
        connection.connection_id().unwrap_or_else(|| "-".into()),
        connection
            .owner_process_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into()),
        methods.join(","),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging, RUST_LOG overrides --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let data_dir = match args.data_dir {
        Some(path) => path,
        None => default_data_dir()?,
    };
    info!("Data directory: {}", data_dir.display());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;

    let store = SqliteStore::open_at(&data_dir.join(SqliteConfig::DB_FILENAME))?;
    let locks = FileLockService::new(data_dir.join(SqliteConfig::LOCK_DIR_NAME))?;
    let process = Arc::new(OsProcess::current());
    let transport = LoopbackTransport::echo()
        .with_connect_delay(Duration::from_millis(args.connect_delay_ms));

    let mut builder = SharedConnection::builder(Arc::new(transport))
        .store(Arc::new(store))
        .locks(Arc::new(locks))
        .process(process.clone());
    if let Some(namespace) = args.namespace {
        builder = builder.namespace(namespace);
    }
    let connection = builder.build().await?;

    let echo = connection.channel_proxy("echo", ChannelConfig::new().on("displayMsg", print_echo))?;
    let mut events = connection.subscribe();

    match connection.start(None).await {
        Ok(()) => info!("Joined as {} ({})", connection.role(), connection.process_id()),
        Err(e) => warn!("Connection did not start: {}", e),
    }
    println!("Type a message to echo, /join, /status or /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let result = match line.trim() {
                    "" => continue,
                    "/quit" => break,
                    "/status" => {
                        print_status(&connection, &echo);
                        continue;
                    }
                    "/join" => echo.server().invoke("join", vec![]).await,
                    message => echo.server().invoke("send", vec![Value::String(message.to_string())]).await,
                };
                match result {
                    Err(e) if e.is_retryable() => {
                        warn!("Call failed, the connection is not ready: {}", e)
                    }
                    Err(e) => warn!("Call failed: {}", e),
                    Ok(_) => {}
                }
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::StateChanged { new, old }) => info!("Connection {} -> {}", old, new),
                Ok(ConnectionEvent::Received) => {}
                Ok(event) => info!("Connection event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} connection events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    process.terminate().await;
    info!("Left the shared connection");
    Ok(())
}
