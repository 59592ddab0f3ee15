#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

use ringnode::discovery::Discovery;
use ringnode::id::Identifier;
use ringnode::node::{Peer, PeerSettings};
use ringnode::store_client::{StoreClient, StoreSettings};
use ringnode::transport::{Connection, ConnectionCache, EventHandler, TransportSettings};
use ringnode::wire::Message;

pub fn id(hex: &str) -> Identifier {
    hex.parse().unwrap()
}

pub fn transport() -> TransportSettings {
    TransportSettings {
        connect_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn peer_settings(root: &Path, discovery: &str) -> PeerSettings {
    PeerSettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        discovery: discovery.to_string(),
        storage_root: root.to_path_buf(),
        join_timeout: Some(Duration::from_secs(10)),
        leave_grace: Duration::from_millis(50),
        transport: transport(),
    }
}

pub fn store_settings(root: &Path, discovery: &str) -> StoreSettings {
    StoreSettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        discovery: discovery.to_string(),
        workdir: root.join("data"),
        reads_dir: root.join("reads"),
        transport: transport(),
    }
}

pub async fn spawn_peer(root: &Path, hex: &str, discovery: &str) -> Arc<Peer> {
    Peer::bind(Some(id(hex)), peer_settings(root, discovery))
        .await
        .unwrap()
}

pub async fn spawn_discovery() -> Arc<Discovery> {
    Discovery::bind("127.0.0.1:0", Duration::from_millis(500))
        .await
        .unwrap()
}

pub async fn spawn_client(root: &Path, discovery: &str) -> Arc<StoreClient> {
    StoreClient::bind(store_settings(root, discovery)).await.unwrap()
}

/// Build a ring without the rendezvous service: the first peer bootstraps,
/// every later one joins through it.
pub async fn ring(root: &Path, ids: &[&str]) -> Vec<Arc<Peer>> {
    let mut peers: Vec<Arc<Peer>> = Vec::new();
    for hex in ids {
        let peer = spawn_peer(root, hex, "127.0.0.1:1").await;
        match peers.first() {
            None => peer.bootstrap_alone().await.unwrap(),
            Some(first) => {
                assert!(peer.join_via(&first.identity()).await);
                let joined = peer.clone();
                wait_until("join to finish", move || {
                    let joined = joined.clone();
                    async move { joined.routing().is_initialized() }
                })
                .await;
            }
        }
        peers.push(peer);
    }
    peers
}

/// Poll `check` until it holds, panicking after ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

struct Inbox(mpsc::UnboundedSender<Message>);

#[async_trait]
impl EventHandler for Inbox {
    async fn on_event(&self, message: Message, _connection: Connection) {
        let _ = self.0.send(message);
    }
}

/// Raw sender for messages no node would originate on its own.
pub struct Probe {
    _inbox: Arc<dyn EventHandler>,
    pub cache: ConnectionCache,
    pub replies: mpsc::UnboundedReceiver<Message>,
}

impl Probe {
    pub fn new() -> Self {
        let (tx, replies) = mpsc::unbounded_channel();
        let inbox: Arc<dyn EventHandler> = Arc::new(Inbox(tx));
        let cache = ConnectionCache::new(Arc::downgrade(&inbox), transport());
        Self {
            _inbox: inbox,
            cache,
            replies,
        }
    }

    pub async fn send(&self, address: &str, message: &Message) -> bool {
        self.cache.send(address, message, true).await
    }
}
