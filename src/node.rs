// ring-node/src/node.rs
//! An overlay peer: joins the ring, relays messages toward their key's
//! owner, stores the files it owns and hands them over as membership shifts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::id::{Identifier, PeerIdentity};
use crate::routing::{closer_to, RoutingError, RoutingInformation};
use crate::storage::FileStore;
use crate::transport::{self, Connection, ConnectionCache, EventHandler, TransportSettings};
use crate::wire::{JoinRequest, Message, SeekOp, SeekRequest};

#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Advertised host; also the address the listener binds.
    pub host: String,
    pub port: u16,
    /// Rendezvous `host:port`.
    pub discovery: String,
    pub storage_root: PathBuf,
    pub join_timeout: Option<Duration>,
    pub leave_grace: Duration,
    pub transport: TransportSettings,
}

impl PeerSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            discovery: config.discovery_address(),
            storage_root: PathBuf::from(&config.storage_root),
            join_timeout: config.join_timeout(),
            leave_grace: config.leave_grace(),
            transport: config.transport_settings(),
        }
    }

    fn peer_dir(&self, id: Identifier) -> PathBuf {
        self.storage_root.join(format!("peer-{}", id))
    }
}

pub struct Peer {
    me: RwLock<PeerIdentity>,
    routing: RoutingInformation,
    connections: ConnectionCache,
    files: FileStore,
    settings: PeerSettings,
    migration: Mutex<()>,
    listener: StdMutex<Option<AbortHandle>>,
}

impl Peer {
    /// Bind the listening socket and start accepting. The peer is not part of
    /// any ring until it registers or bootstraps.
    pub async fn bind(id: Option<Identifier>, settings: PeerSettings) -> Result<Arc<Self>> {
        let bind_addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let port = listener.local_addr()?.port();
        let me = PeerIdentity::new(id.unwrap_or_else(Identifier::random), settings.host.clone(), port);
        let files = FileStore::new(settings.peer_dir(me.id))?;

        let peer = Arc::new_cyclic(|weak: &Weak<Peer>| {
            let handler: Weak<dyn EventHandler> = weak.clone();
            Peer {
                me: RwLock::new(me),
                routing: RoutingInformation::new(settings.join_timeout),
                connections: ConnectionCache::new(handler, settings.transport.clone()),
                files,
                settings,
                migration: Mutex::new(()),
                listener: StdMutex::new(None),
            }
        });

        let handler: Weak<dyn EventHandler> = Arc::<Peer>::downgrade(&peer);
        let task = tokio::spawn(transport::serve(
            listener,
            handler,
            peer.settings.transport.max_frame_len,
        ));
        *peer.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());

        info!("Peer {} listening", peer.identity());
        Ok(peer)
    }

    pub fn identity(&self) -> PeerIdentity {
        self.me.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn routing(&self) -> &RoutingInformation {
        &self.routing
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn connections(&self) -> &ConnectionCache {
        &self.connections
    }

    /// Announce ourselves to the rendezvous service; its answer arrives on
    /// the same connection.
    pub async fn register(&self) -> bool {
        let me = self.identity();
        self.connections
            .send(&self.settings.discovery, &Message::Register(me), true)
            .await
    }

    /// Become the first peer of a new ring.
    pub async fn bootstrap_alone(&self) -> Result<(), RoutingError> {
        info!("Registered as {}. First peer in the network.", self.identity());
        self.routing.initialize(self.identity(), None, &self.connections).await
    }

    /// Send a fresh join request, keyed by our own identifier, to `entry`.
    pub async fn join_via(&self, entry: &PeerIdentity) -> bool {
        let me = self.identity();
        let mut join = JoinRequest::new(me.clone());
        join.hops.push(me);
        self.connections
            .send(&entry.address(), &Message::Join(join), false)
            .await
    }

    /// Hand `message` to the closest known peer for `key`, dropping peers
    /// that cannot be reached and trying again. Returns the peer that took it,
    /// or ourselves when we are the closest.
    async fn relay(&self, key: Identifier, message: &Message, hop: usize) -> Result<PeerIdentity, RoutingError> {
        let me = self.identity();
        let mut failed: Vec<Identifier> = Vec::new();
        loop {
            let next = self.routing.lookup_excluding(key, &failed).await?;
            if next == me {
                return Ok(me);
            }
            if self.connections.send(&next.address(), message, false).await {
                info!(
                    "{} with key {} relayed to {}, hop {}",
                    message.kind(),
                    key,
                    next.id,
                    hop
                );
                return Ok(next);
            }
            warn!("Peer {} unreachable, removing it from routing", next);
            self.routing.remove_peer(&next);
            failed.push(next.id);
        }
    }

    async fn on_entry_peer(&self, entry: PeerIdentity) {
        let me = self.identity();
        if self.join_via(&entry).await {
            info!("Registered as {}. Entry peer: {}", me, entry);
            return;
        }
        warn!("Entry peer {} unreachable, asking for another", entry);
        let request = Message::SelectRequest(me.id.to_string());
        if !self.connections.send(&self.settings.discovery, &request, true).await {
            warn!("Discovery at {} unreachable", self.settings.discovery);
        }
    }

    async fn on_collision(&self) {
        if self.routing.is_initialized() {
            warn!("Ignoring identifier collision reported after joining");
            return;
        }
        let fresh = Identifier::random();
        let old = {
            let mut me = self.me.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut me.id, fresh)
        };
        if let Err(e) = self.files.relocate(self.settings.peer_dir(fresh)) {
            warn!("Could not move file store for {}: {}", fresh, e);
        }
        warn!("Identifier {} is taken, registering as {}", old, fresh);
        if !self.register().await {
            warn!("Discovery at {} unreachable", self.settings.discovery);
        }
    }

    async fn on_join(&self, mut join: JoinRequest) {
        let me = self.identity();
        if join.destination == me {
            join.hops.push(me.clone());
            info!("Join traceroute: {}", join.trace());
            if let Err(e) = self.routing.initialize(me, Some(join), &self.connections).await {
                warn!("Join completed twice: {}", e);
            }
            return;
        }

        if let Err(e) = self.routing.attach_to_join(&mut join).await {
            warn!("Dropping join request for {}: {}", join.destination, e);
            return;
        }
        join.hops.push(me.clone());
        let destination = join.destination.clone();
        let hop = join.hops.len();
        let message = Message::Join(join);

        match self.relay(destination.id, &message, hop).await {
            Ok(next) if next == me => {
                if self.connections.send(&destination.address(), &message, false).await {
                    info!("{} with key {} relayed to {}, hop {}", message.kind(), destination.id, destination.id, hop);
                } else {
                    warn!("Join request could not be delivered to {}", destination);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Dropping join request for {}: {}", destination, e),
        }
    }

    async fn on_broadcast(&self, origin: PeerIdentity, peers: Vec<PeerIdentity>) {
        let me = self.identity();
        let mut added = self.routing.add_peer(origin);
        for peer in peers {
            if peer != me && self.routing.add_peer(peer) {
                added = true;
            }
        }
        if added {
            info!("Routing updated\n{}", self.routing.describe());
            self.migrate_files().await;
        }
    }

    async fn on_leave(&self, peer: PeerIdentity) {
        if self.routing.remove_peer(&peer) {
            info!("Peer {} left\n{}", peer, self.routing.describe());
            self.migrate_files().await;
        }
    }

    async fn on_relay_file(&self, message: Message) {
        let Message::RelayFile { key, filename, content, address, hops } = message else {
            return;
        };
        let Ok(key_id) = key.parse::<Identifier>() else {
            warn!("Dropping {} with malformed key {:?}", filename, key);
            return;
        };
        let hops = hops.saturating_add(1);
        let message = Message::RelayFile { key, filename, content, address, hops };

        let me = self.identity();
        match self.relay(key_id, &message, hops as usize).await {
            Ok(next) if next == me => {}
            Ok(_) => return,
            Err(e) => {
                warn!("Dropping relayed file: {}", e);
                return;
            }
        }

        if let Message::RelayFile { filename, content, address, .. } = &message {
            self.store_file(filename, key_id, content, address).await;
        }
        match self.routing.lookup(key_id).await {
            Ok(owner) if owner != me => self.migrate_files().await,
            _ => {}
        }
    }

    async fn store_file(&self, filename: &str, key: Identifier, content: &[u8], reply_to: &str) {
        let written = match self.files.write(filename, key, content) {
            Ok(written) => written,
            Err(e) => {
                warn!("Failed to write {}: {}", filename, e);
                false
            }
        };
        if written {
            info!("{} was written to {}", filename, self.files.dir().display());
        } else {
            info!("{} was not written", filename);
        }

        if !reply_to.is_empty() {
            let status = if written {
                Message::WriteSuccess(filename.to_string())
            } else {
                Message::WriteFail(filename.to_string())
            };
            if !self.connections.send(reply_to, &status, false).await {
                warn!("Could not report write status to {}", reply_to);
            }
        }
    }

    async fn on_seek(&self, mut seek: SeekRequest) {
        let me = self.identity();
        let Ok(key) = seek.key.parse::<Identifier>() else {
            warn!("Dropping seek with malformed key {:?}", seek.key);
            return;
        };
        seek.hops.push(me.clone());
        let hop = seek.hops.len();
        let message = Message::Seek(seek);

        match self.relay(key, &message, hop).await {
            Ok(next) if next == me => {
                if let Message::Seek(seek) = message {
                    self.answer_seek(seek).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Dropping seek for {}: {}", key, e),
        }
    }

    /// We own the key: tell the client what happens next.
    async fn answer_seek(&self, seek: SeekRequest) {
        let filename = Path::new(&seek.path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&seek.path)
            .to_string();

        let reply = match seek.op {
            SeekOp::Store => {
                let text = format!("{}|{}", seek.path, seek.trace());
                if self.files.contains(&filename) {
                    Message::DenyStorage(text)
                } else {
                    Message::AcceptStorage(text)
                }
            }
            SeekOp::Retrieve => {
                let content = match self.files.read(&filename) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Failed to read {}: {}", filename, e);
                        None
                    }
                };
                Message::ServeFile {
                    filename,
                    content: content.map(Bytes::from),
                }
            }
            SeekOp::Delete => match self.files.delete(&filename) {
                Ok(true) => {
                    info!("{} deleted on request", filename);
                    Message::WriteSuccess(filename)
                }
                Ok(false) => Message::WriteFail(filename),
                Err(e) => {
                    warn!("Failed to delete {}: {}", filename, e);
                    Message::WriteFail(filename)
                }
            },
        };

        if !self.connections.send(&seek.address, &reply, true).await {
            warn!("Could not answer {} at {}", reply.kind(), seek.address);
        }
    }

    /// Re-home every stored file whose key now belongs to someone else. A
    /// file is deleted here only after another peer took it.
    pub async fn migrate_files(&self) {
        let _migrating = self.migration.lock().await;
        let me = self.identity();
        for (filename, key) in self.files.list() {
            match self.routing.lookup(key).await {
                Ok(owner) if owner == me => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!("Migration skipped: {}", e);
                    return;
                }
            }
            let content = match self.files.read(&filename) {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {} for migration: {}", filename, e);
                    continue;
                }
            };
            let message = Message::RelayFile {
                key: key.to_string(),
                filename: filename.clone(),
                content: Bytes::from(content),
                address: String::new(),
                hops: 0,
            };
            match self.relay(key, &message, 0).await {
                Ok(next) if next != me => {
                    if let Err(e) = self.files.delete(&filename) {
                        warn!("Relocated {} but could not delete it: {}", filename, e);
                    }
                    info!("File {} was relocated to {} and deleted", filename, next.id);
                }
                Ok(_) => debug!("File {} was not relocated", filename),
                Err(e) => warn!("File {} was not relocated: {}", filename, e),
            }
        }
    }

    /// Leave the ring: deregister, say goodbye, hand every file to the best
    /// peer still answering, then close everything.
    pub async fn leave(&self) {
        let me = self.identity();
        debug!("Notifying discovery of deregistration");
        if !self
            .connections
            .send(&self.settings.discovery, &Message::Deregister(me.clone()), false)
            .await
        {
            warn!("Discovery at {} unreachable while leaving", self.settings.discovery);
        }

        let peers = self.routing.peer_set(false);
        let notice = Message::Leave(me);
        for peer in &peers {
            self.connections.send(&peer.address(), &notice, false).await;
        }

        tokio::time::sleep(self.settings.leave_grace).await;
        self.hand_off_files(peers).await;
        tokio::time::sleep(self.settings.leave_grace).await;
        self.shutdown().await;
    }

    async fn hand_off_files(&self, mut candidates: Vec<PeerIdentity>) {
        let _migrating = self.migration.lock().await;
        for (filename, key) in self.files.list() {
            let content = match self.files.read(&filename) {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {} before leaving: {}", filename, e);
                    continue;
                }
            };
            let message = Message::RelayFile {
                key: key.to_string(),
                filename: filename.clone(),
                content: Bytes::from(content),
                address: String::new(),
                hops: 0,
            };

            let mut taker = None;
            while let Some(closest) = closest_of(key, &candidates) {
                if self.connections.send(&closest.address(), &message, false).await {
                    taker = Some(closest);
                    break;
                }
                candidates.retain(|peer| peer != &closest);
            }

            match taker {
                Some(peer) => {
                    if let Err(e) = self.files.delete(&filename) {
                        warn!("Handed off {} but could not delete it: {}", filename, e);
                    }
                    info!("File {} sent to {}", filename, peer);
                }
                None => warn!("File {} is permanently lost", filename),
            }
        }
    }

    /// Stop accepting and close every cached connection.
    pub async fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        self.connections.close_all().await;
    }

    /// Human-readable list for the `files` command.
    pub fn describe_files(&self) -> String {
        let files = self.files.list();
        if files.is_empty() {
            return "  No files stored.".to_string();
        }
        let mut lines: Vec<String> = files
            .iter()
            .map(|(name, key)| format!("  {} (key {})", name, key))
            .collect();
        if let Ok(bytes) = self.files.usage() {
            lines.push(format!("  {} file(s), {} bytes in {}", files.len(), bytes, self.files.dir().display()));
        }
        lines.join("\n")
    }
}

fn closest_of(key: Identifier, candidates: &[PeerIdentity]) -> Option<PeerIdentity> {
    let mut best: Option<&PeerIdentity> = None;
    for candidate in candidates {
        best = match best {
            Some(current) if !closer_to(key, candidate.id, current.id) => Some(current),
            _ => Some(candidate),
        };
    }
    best.cloned()
}

#[async_trait]
impl EventHandler for Peer {
    async fn on_event(&self, message: Message, _connection: Connection) {
        match message {
            Message::SelectResponse(entry) => self.on_entry_peer(entry).await,
            Message::NoPeers(_) => {
                if let Err(e) = self.bootstrap_alone().await {
                    warn!("Cannot bootstrap: {}", e);
                }
            }
            Message::IdCollision(_) => self.on_collision().await,
            Message::Join(join) => self.on_join(join).await,
            Message::Seek(seek) => self.on_seek(seek).await,
            message @ Message::RelayFile { .. } => self.on_relay_file(message).await,
            Message::PeerBroadcast { origin, peers } => self.on_broadcast(origin, peers).await,
            Message::Leave(peer) => self.on_leave(peer).await,
            other => debug!("Ignoring {} at peer", other.kind()),
        }
    }
}
