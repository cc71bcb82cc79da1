// meshvault-node — the node binary for a MeshVault mesh.
//
// Cross-platform (macOS, Linux, Windows) command-line interface wiring the
// Discovery Plane, Replication Plane, Mix Relay Plane, and Secrets Vault
// into one running process.

mod config;
mod http_error;
mod identity;
mod server_loopback;
mod server_peer;
mod state;

use std::collections::VecDeque;
use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshvault_core::command::CommandEngine;
use meshvault_core::escrow::EscrowClient;
use meshvault_core::replication::seen::SeenSet;
use meshvault_core::{
    beacon::iface::select_interface, beacon::BeaconConfig, beacon::BeaconEmitter, beacon::BeaconReceiver, ChainLog,
    EventSink, MemoryKv, PeerDirectory, ReplicationEngine, Vault,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use config::Config;
use state::AppState;

#[derive(Parser)]
#[command(name = "meshvault-node")]
#[command(about = "MeshVault — LAN peer-to-peer data distribution mesh", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new sealed vault (beacon key + file key) under a passphrase.
    Provision {
        /// Overwrite an existing vault, keeping the old one as a `.backup` sibling.
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Re-seal the vault under a new passphrase, keeping the same keys.
    Reseal,
    /// Start the mesh node: discovery, replication, mix relay, and HTTP surfaces.
    Start {
        /// Force the network interface the beacon transport binds to.
        #[arg(long)]
        interface: Option<String>,
    },
    /// Query a running node's loopback status endpoint.
    Status,
    /// List peers currently known to a running node.
    Peers,
    /// Inspect the local hash chain.
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },
    /// Send a one-off onion-routed text message to a peer.
    SendText {
        /// Destination node id (hex).
        to: String,
        /// Message body.
        text: String,
    },
    /// Originate and replicate a file's contents across the mesh.
    SendFile {
        /// Path to the file to read and seal.
        path: std::path::PathBuf,
        /// Name to record for the artifact (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Fetch and decrypt a replicated artifact by content hash.
    Decrypt {
        hash: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "key")]
        key_b64: Option<String>,
        #[arg(long)]
        out: Option<std::path::PathBuf>,
    },
    /// Broadcast an encrypt or decrypt command to the mesh.
    Command {
        #[command(subcommand)]
        action: CommandAction,
    },
    /// Manage node configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ChainAction {
    List,
}

#[derive(Subcommand)]
enum CommandAction {
    Encrypt {
        folder_path: String,
        #[arg(long, default_value_t = false)]
        recursive: bool,
    },
    Decrypt {
        folder_path: String,
        #[arg(long, default_value_t = false)]
        recursive: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

fn vault_path(config: &Config) -> Result<std::path::PathBuf> {
    Ok(config.base_dir()?.join("vault.menv"))
}

fn read_passphrase(prompt: &str) -> Result<String> {
    print!("{prompt}: ");
    std::io::stdout().flush().ok();
    rpassword::read_password().context("failed to read passphrase")
}

/// Installs the tracing subscriber. If `MESHVAULT_LOG_DIR` is set, logs are
/// additionally written to a daily-rolling file in that directory; the
/// returned guard must be held for the lifetime of the process to flush the
/// non-blocking writer on exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("MESHVAULT_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "meshvault-node.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn cmd_provision(overwrite: bool) -> Result<()> {
    let config = Config::load()?;
    let path = vault_path(&config)?;
    let passphrase = read_passphrase("Vault passphrase")?;
    let confirm = read_passphrase("Confirm passphrase")?;
    if passphrase != confirm {
        anyhow::bail!("passphrases did not match");
    }

    Vault::provision(&path, &passphrase, overwrite).context("failed to provision vault")?;
    println!("vault provisioned at {}", path.display());
    Ok(())
}

async fn cmd_reseal() -> Result<()> {
    let config = Config::load()?;
    let path = vault_path(&config)?;
    let current = read_passphrase("Current passphrase")?;
    let vault = Vault::open(&path, &current).context("failed to open vault")?;

    let next = read_passphrase("New passphrase")?;
    let confirm = read_passphrase("Confirm new passphrase")?;
    if next != confirm {
        anyhow::bail!("passphrases did not match");
    }
    vault.reseal(&path, &next).context("failed to reseal vault")?;
    println!("vault resealed at {}", path.display());
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = Config::load()?;
    let url = format!("http://127.0.0.1:{}/status", config.loopback_port);
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    let body: serde_json::Value = response.json().await.context("malformed status response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_peers() -> Result<()> {
    let config = Config::load()?;
    let url = format!("http://127.0.0.1:{}/peers", config.loopback_port);
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    let body: serde_json::Value = response.json().await.context("malformed peers response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_chain(action: ChainAction) -> Result<()> {
    let ChainAction::List = action;
    let config = Config::load()?;
    let url = format!("http://127.0.0.1:{}/chain/list", config.loopback_port);
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    let body: serde_json::Value = response.json().await.context("malformed chain response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_send_text(to: String, text: String) -> Result<()> {
    let config = Config::load()?;
    let url = format!("http://127.0.0.1:{}/mix/send-text?to={to}", config.loopback_port);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .body(text)
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    let body: serde_json::Value = response.json().await.context("malformed send-text response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_send_file(path: std::path::PathBuf, name: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let name = name.or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned())).context("could not derive an artifact name from path")?;
    let data = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let url = format!("http://127.0.0.1:{}/mix/send-file?name={name}", config.loopback_port);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .body(data)
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    let body: serde_json::Value = response.json().await.context("malformed send-file response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_decrypt(hash: String, name: Option<String>, key_b64: Option<String>, out: Option<std::path::PathBuf>) -> Result<()> {
    let config = Config::load()?;
    let mut url = format!("http://127.0.0.1:{}/chunks/decrypt?hash={hash}", config.loopback_port);
    if let Some(name) = &name {
        url.push_str(&format!("&name={name}"));
    }
    if let Some(key_b64) = &key_b64 {
        url.push_str(&format!("&keyB64={key_b64}"));
    }
    if let Some(out) = &out {
        url.push_str(&format!("&out={}", out.display()));
    }
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    if out.is_some() {
        let body: serde_json::Value = response.json().await.context("malformed decrypt response")?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let bytes = response.bytes().await.context("failed to read decrypted body")?;
        std::io::stdout().write_all(&bytes)?;
    }
    Ok(())
}

async fn cmd_command(action: CommandAction) -> Result<()> {
    let config = Config::load()?;
    let (kind, folder_path, recursive) = match action {
        CommandAction::Encrypt { folder_path, recursive } => ("encrypt", folder_path, recursive),
        CommandAction::Decrypt { folder_path, recursive } => ("decrypt", folder_path, recursive),
    };
    let url = format!("http://127.0.0.1:{}/command/broadcast", config.loopback_port);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&serde_json::json!({ "type": kind, "folder_path": folder_path, "recursive": recursive }))
        .send()
        .await
        .context("failed to reach local node — is it running?")?;
    let body: serde_json::Value = response.json().await.context("malformed broadcast response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = Config::load()?;
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{key} = {value}");
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("unknown config key: {key}"),
        },
        ConfigAction::List => {
            for (key, value) in config.list() {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

/// Periodically re-seal the peer directory snapshot to disk, per the
/// discovery plane's five-minute persistence tick.
async fn run_snapshot_saver(state: Arc<AppState>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let path = state.peers_snapshot_path();
                if let Err(err) = state.directory.seal_to(&path, &state.file_key) {
                    tracing::warn!(error = %err, "periodic peer directory snapshot failed");
                }
            }
        }
    }
}

async fn cmd_start(forced_interface: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(interface) = forced_interface {
        config.interface_name = Some(interface);
    }
    let node_config = config.to_node_config()?;

    let vault_file = vault_path(&config)?;
    if !vault_file.exists() {
        anyhow::bail!("no vault found at {} — run `meshvault-node provision` first", vault_file.display());
    }
    let passphrase = read_passphrase("Vault passphrase")?;
    let vault = Vault::open(&vault_file, &passphrase).context("failed to open vault")?;

    let selected = select_interface(node_config.interface_name.as_deref(), node_config.multicast_cidr_parsed())
        .context("failed to select a network interface for the beacon transport")?;
    let bind_ip = node_config.bind_ip.unwrap_or(IpAddr::V4(selected.address));
    let bind_ipv4 = match bind_ip {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => selected.address,
    };
    tracing::info!(interface = %selected.name, address = %selected.address, "bound beacon transport interface");

    let base_dir = node_config.base_dir.clone();
    let identity = Arc::new(identity::load_or_create(&base_dir)?);
    tracing::info!(node_id = %identity.node_id(), "loaded node identity");

    let directory = Arc::new(PeerDirectory::new());
    let peers_snapshot = base_dir.join("peers.enc");
    if peers_snapshot.exists() {
        let loaded = PeerDirectory::load_from(&peers_snapshot, &vault.file_key);
        let merged = directory.merge(&loaded.list());
        tracing::info!(merged, "restored peer directory snapshot");
    }

    let chain = Arc::new(ChainLog::open(&base_dir.join("chain.jsonl"))?);
    let seen = Arc::new(SeenSet::new());
    let command_seen = Arc::new(SeenSet::new());
    let cache: Arc<dyn meshvault_core::KvStore> = Arc::new(MemoryKv::new());
    let events = EventSink::new();
    let escrow = EscrowClient::new(node_config.escrow_url.clone(), node_config.escrow_token.clone());

    let replication = Arc::new(ReplicationEngine::new(
        identity.node_id(),
        chain.clone(),
        directory.clone(),
        seen,
        cache.clone(),
        base_dir.join("chunks"),
        base_dir.join("keys"),
        escrow,
        events.clone(),
    ));
    let commands = Arc::new(CommandEngine::new(identity.node_id(), directory.clone(), command_seen, events.clone()));

    let cancel = CancellationToken::new();
    let state = Arc::new(AppState {
        node_config: node_config.clone(),
        identity: identity.clone(),
        beacon_key: vault.beacon_key.clone(),
        file_key: vault.file_key.clone(),
        directory: directory.clone(),
        chain,
        replication,
        commands,
        cache,
        events,
        pending_commands: Arc::new(Mutex::new(VecDeque::new())),
        cancel: cancel.clone(),
    });

    let beacon_config = BeaconConfig {
        interval: node_config.broadcast_interval(),
        multicast_group: node_config.multicast_group,
        multicast_port: node_config.multicast_port,
        interface_name: Some(selected.name.clone()),
        api_port: node_config.peer_port,
        hostname: node_config.hostname.clone(),
    };

    let emitter = BeaconEmitter::new(
        beacon_config.clone(),
        identity.node_id(),
        identity.mix_public_key(),
        *vault.beacon_key,
        bind_ipv4,
    );
    let receiver = BeaconReceiver::new(beacon_config, *vault.beacon_key, bind_ipv4);

    let peer_bind = SocketAddr::new(bind_ip, node_config.peer_port);
    let loopback_port = node_config.loopback_port;

    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = emitter.run(cancel).await {
                tracing::error!(error = %err, "beacon emitter exited");
            }
        }
    }));

    tasks.push(tokio::spawn({
        let directory = directory.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(err) = receiver.run(directory, cancel).await {
                tracing::error!(error = %err, "beacon receiver exited");
            }
        }
    }));

    tasks.push(tokio::spawn(run_snapshot_saver(state.clone(), cancel.clone())));

    tasks.push(tokio::spawn({
        let state = state.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(err) = server_peer::run(state, peer_bind, cancel).await {
                tracing::error!(error = %err, "peer-facing HTTP surface exited");
            }
        }
    }));

    tasks.push(tokio::spawn({
        let state = state.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(err) = server_loopback::run(state, loopback_port, cancel).await {
                tracing::error!(error = %err, "loopback HTTP surface exited");
            }
        }
    }));

    tracing::info!(
        node_id = %identity.node_id(),
        peer_port = node_config.peer_port,
        loopback_port = node_config.loopback_port,
        "meshvault-node is running"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
    if let Err(err) = directory.seal_to(&peers_snapshot, &vault.file_key) {
        tracing::warn!(error = %err, "final peer directory snapshot failed");
    }

    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), futures::future::join_all(tasks)).await;
    if drain.is_err() {
        tracing::warn!("background tasks did not shut down within the 5-second drain window");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Provision { overwrite } => cmd_provision(overwrite).await,
        Commands::Reseal => cmd_reseal().await,
        Commands::Start { interface } => cmd_start(interface).await,
        Commands::Status => cmd_status().await,
        Commands::Peers => cmd_peers().await,
        Commands::Chain { action } => cmd_chain(action).await,
        Commands::SendText { to, text } => cmd_send_text(to, text).await,
        Commands::SendFile { path, name } => cmd_send_file(path, name).await,
        Commands::Decrypt { hash, name, key_b64, out } => cmd_decrypt(hash, name, key_b64, out).await,
        Commands::Command { action } => cmd_command(action).await,
        Commands::Config { action } => cmd_config(action),
    }
}
