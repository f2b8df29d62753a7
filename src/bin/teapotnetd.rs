//! `teapotnetd` — the Teapotnet node binary (spec §6 "CLI/environment").
//! Mirrors `original_source/tpn/main.cpp`'s argument handling: a config
//! file overlaid with command-line overrides, then a long-running node.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

use teapotnet::addressbook::AddressBook;
use teapotnet::config::Config;
use teapotnet::identity::Identity;
use teapotnet::overlay::backend::stream::StreamLink;
use teapotnet::overlay::peerstore::PeerStore;
use teapotnet::overlay::tracker::{TrackerClient, ANNOUNCE_PERIOD};
use teapotnet::overlay::{Link, Overlay};
use teapotnet::pubsub::Fabric;
use teapotnet::runtime::Runtime;
use teapotnet::store::BlockStore;
use teapotnet::tunneler::Tunneler;

#[derive(Parser)]
#[command(name = "teapotnetd", version, about = "Teapotnet peer-to-peer node")]
struct Cli {
    /// Working directory; config, identity and store all live here.
    #[arg(long, default_value = ".")]
    directory: PathBuf,

    /// Config file name, relative to `--directory` unless absolute.
    #[arg(long, default_value = "config.txt")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or load) this node's long-lived identity and print its id.
    Keygen,
    /// Run the node (default if no subcommand is given).
    Run {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long = "ifport")]
        interface_port: Option<u16>,
        #[arg(long)]
        tracker: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    tokio::fs::create_dir_all(&cli.directory).await?;
    let config_path = resolve(&cli.directory, &cli.config);
    let config = Config::load(&config_path)?;

    match cli.command.unwrap_or(Command::Run { port: None, interface_port: None, tracker: None }) {
        Command::Keygen => keygen(&cli.directory).await,
        Command::Run { port, interface_port, tracker } => {
            let mut config = config;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(interface_port) = interface_port {
                config.interface_port = interface_port;
            }
            if tracker.is_some() {
                config.tracker = tracker;
            }
            run(cli.directory, config).await
        }
    }
}

fn resolve(directory: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        directory.join(file)
    }
}

async fn keygen(directory: &Path) -> anyhow::Result<()> {
    let identity = Identity::load_or_generate(directory.join("identity.json")).await?;
    println!("{}", identity.id.to_hex());
    Ok(())
}

async fn run(directory: PathBuf, config: Config) -> anyhow::Result<()> {
    log::info!("starting on port {} (interface {})...", config.port, config.interface_port);

    let identity = Identity::load_or_generate(directory.join("identity.json")).await?;
    log::info!("node identity: {}", identity.id.to_hex());

    let store = Arc::new(
        BlockStore::open(
            directory.join(&config.data_dir),
            config.cache_max_size,
            config.cache_max_file_size,
            config.store_max_age,
        )
        .await?,
    );
    store.spawn_purge_loop(Duration::from_secs(300));

    let (overlay, mut inbound) = Overlay::new(identity.id, store.clone());
    let fabric = Arc::new(Fabric::new(store.clone()));
    let addressbook = Arc::new(AddressBook::new(fabric));
    let runtime = Runtime::new(overlay.clone(), store.clone(), addressbook);
    runtime.spawn_beacon_loop(Duration::from_secs(10));

    let peerstore = Arc::new(AsyncMutex::new(PeerStore::load(directory.join("peers.json")).await?));
    let local_private = identity.keypair.private.clone();
    let local_public = identity.keypair.public.clone();

    // User-to-user tunnels (spec §4.5) ride the same node identity's
    // keypair and share the network handler's alarm timeouts (spec §4.6),
    // so a single config produces both. Dispatching inbound
    // `MessageType::Tunnel` datagrams to `tunneler` is not wired up yet
    // (see DESIGN.md); for now this just makes it available to callers
    // that perform an out-of-band tunnel handshake directly.
    let tunneler = Arc::new(Tunneler::new(
        local_private.clone(),
        local_public.clone(),
        config.idle_timeout,
        config.retransmit_timeout,
        config.keepalive_timeout,
    ));
    log::debug!(
        "tunneler ready (idle_timeout={:?}, retransmit_timeout={:?}, keepalive_timeout={:?})",
        tunneler.idle_timeout(),
        tunneler.retransmit_timeout(),
        tunneler.keepalive_timeout()
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!("listening on {}", listener.local_addr()?);
    tokio::spawn(accept_loop(listener, overlay.clone(), peerstore.clone(), local_private.clone(), local_public.clone()));

    // Reconnect to cached peers before falling back to the tracker (spec
    // §4.4 "record known peers on disk, so the next run skips the tracker
    // when enough cached neighbors remain").
    let cached_addresses: Vec<String> = peerstore.lock().await.addresses().map(|(addr, _)| addr.to_string()).collect();
    for addr in cached_addresses {
        tokio::spawn(dial(
            addr,
            overlay.clone(),
            peerstore.clone(),
            local_private.clone(),
            local_public.clone(),
        ));
    }

    if let Some(base_url) = config.tracker.clone() {
        let tracker = TrackerClient::new(base_url);
        let self_id = identity.id;
        let port = config.port;
        let overlay = overlay.clone();
        let peerstore = peerstore.clone();
        tokio::spawn(async move {
            loop {
                match tracker.announce(self_id, &[], Some(port), overlay.handler_count().await.max(1) as u32).await {
                    Ok(candidates) => {
                        log::debug!("tracker: announce returned {} candidates", candidates.len());
                        for (node_id, addresses) in candidates {
                            if node_id == self_id || overlay.is_neighbor(&node_id).await {
                                continue;
                            }
                            if let Some(addr) = addresses.into_iter().next() {
                                tokio::spawn(dial(
                                    addr,
                                    overlay.clone(),
                                    peerstore.clone(),
                                    local_private.clone(),
                                    local_public.clone(),
                                ));
                            }
                        }
                    }
                    Err(e) => log::warn!("tracker: announce failed: {e}"),
                }
                tokio::time::sleep(ANNOUNCE_PERIOD).await;
            }
        });
    }

    log::info!("ready.");
    while let Some(message) = inbound.recv().await {
        if let Err(e) = runtime.handle_inbound(message).await {
            log::warn!("runtime: failed to handle inbound message: {e}");
        }
    }
    Ok(())
}

/// Accept loop for the stream (TCP) backend: one handshake + pump task per
/// incoming connection (spec §4.4 "Backends").
async fn accept_loop(
    listener: TcpListener,
    overlay: Arc<Overlay>,
    peerstore: Arc<AsyncMutex<PeerStore>>,
    local_private: RsaPrivateKey,
    local_public: RsaPublicKey,
) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let overlay = overlay.clone();
        let peerstore = peerstore.clone();
        let local_private = local_private.clone();
        let local_public = local_public.clone();
        tokio::spawn(async move {
            match StreamLink::accept(socket, &local_private, &local_public).await {
                Ok(link) => {
                    let remote = link.remote_node();
                    remember(&peerstore, peer_addr.to_string(), remote).await;
                    spawn_link_pump(overlay, Arc::new(link));
                }
                Err(e) => log::warn!("handshake with {peer_addr} failed: {e}"),
            }
        });
    }
}

/// Dial `addr`, register the resulting link, and remember it on success.
/// Failures are logged and otherwise silent — the tracker/peer cache will
/// offer another address on the next round (spec §4.4 connection churn).
async fn dial(
    addr: String,
    overlay: Arc<Overlay>,
    peerstore: Arc<AsyncMutex<PeerStore>>,
    local_private: RsaPrivateKey,
    local_public: RsaPublicKey,
) {
    match StreamLink::connect(&addr, &local_private, &local_public).await {
        Ok(link) => {
            let remote = link.remote_node();
            remember(&peerstore, addr, remote).await;
            spawn_link_pump(overlay, Arc::new(link));
        }
        Err(e) => log::debug!("dial {addr} failed: {e}"),
    }
}

async fn remember(peerstore: &Arc<AsyncMutex<PeerStore>>, addr: String, node_id: teapotnet::ident::Identifier) {
    let mut guard = peerstore.lock().await;
    guard.remember(addr, node_id);
    if let Err(e) = guard.save().await {
        log::warn!("peerstore: failed to persist: {e}");
    }
}

/// Register `link` with the overlay and pump its inbound frames into
/// `overlay.handle_inbound` until it closes (spec §4.4: nothing else feeds
/// a link's traffic into the routing core).
fn spawn_link_pump(overlay: Arc<Overlay>, link: Arc<dyn Link>) {
    let remote = link.remote_node();
    tokio::spawn(async move {
        overlay.register_handler(link.clone()).await;
        loop {
            match link.recv().await {
                Ok(message) => {
                    if let Err(e) = overlay.handle_inbound(message, remote).await {
                        log::warn!("overlay: failed to handle inbound from {remote}: {e}");
                    }
                }
                Err(e) => {
                    log::info!("link to {remote} closed: {e}");
                    overlay.unregister_handler(&remote).await;
                    break;
                }
            }
        }
    });
}
