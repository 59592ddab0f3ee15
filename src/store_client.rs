// ring-node/src/store_client.rs
//! Client that stores, retrieves and deletes files in the ring.
//!
//! Each operation waits in a queue until the rendezvous service names an entry
//! peer; the seek then travels to the key's owner, who answers directly.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::id::{key_for_filename, PeerIdentity};
use crate::transport::{self, Connection, ConnectionCache, EventHandler, TransportSettings};
use crate::wire::{Message, SeekOp, SeekRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Store(PathBuf),
    Retrieve(PathBuf),
    Delete(PathBuf),
}

impl Operation {
    pub fn path(&self) -> &Path {
        match self {
            Operation::Store(path) | Operation::Retrieve(path) | Operation::Delete(path) => path,
        }
    }

    fn seek_op(&self) -> SeekOp {
        match self {
            Operation::Store(_) => SeekOp::Store,
            Operation::Retrieve(_) => SeekOp::Retrieve,
            Operation::Delete(_) => SeekOp::Delete,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Operation::Store(_) => "store",
            Operation::Retrieve(_) => "retrieve",
            Operation::Delete(_) => "delete",
        }
    }

    fn filename(&self) -> Option<String> {
        self.path()
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub host: String,
    pub port: u16,
    pub discovery: String,
    pub workdir: PathBuf,
    pub reads_dir: PathBuf,
    pub transport: TransportSettings,
}

impl StoreSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: 0,
            discovery: config.discovery_address(),
            workdir: expand_home(&config.workdir),
            reads_dir: expand_home(&config.reads_dir),
            transport: config.transport_settings(),
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StoreClient {
    address: String,
    discovery: String,
    connections: ConnectionCache,
    pending: StdMutex<VecDeque<Operation>>,
    stored: StdMutex<BTreeSet<PathBuf>>,
    workdir: StdMutex<PathBuf>,
    reads_dir: PathBuf,
    listener: StdMutex<Option<AbortHandle>>,
}

impl StoreClient {
    pub async fn bind(settings: StoreSettings) -> Result<Arc<Self>> {
        let bind_addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let address = format!("{}:{}", settings.host, listener.local_addr()?.port());

        let client = Arc::new_cyclic(|weak: &Weak<StoreClient>| {
            let handler: Weak<dyn EventHandler> = weak.clone();
            StoreClient {
                address,
                discovery: settings.discovery.clone(),
                connections: ConnectionCache::new(handler, settings.transport.clone()),
                pending: StdMutex::new(VecDeque::new()),
                stored: StdMutex::new(BTreeSet::new()),
                workdir: StdMutex::new(settings.workdir.clone()),
                reads_dir: settings.reads_dir.clone(),
                listener: StdMutex::new(None),
            }
        });

        let handler: Weak<dyn EventHandler> = Arc::<StoreClient>::downgrade(&client);
        let task = tokio::spawn(transport::serve(
            listener,
            handler,
            settings.transport.max_frame_len,
        ));
        *lock(&client.listener) = Some(task.abort_handle());

        info!("StoreData started at {}", client.address);
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn workdir(&self) -> PathBuf {
        lock(&self.workdir).clone()
    }

    pub fn set_workdir(&self, dir: &str) {
        *lock(&self.workdir) = expand_home(dir);
    }

    /// Resolve a local path against the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = expand_home(path);
        if path.is_absolute() {
            path
        } else {
            self.workdir().join(path)
        }
    }

    /// Files this client has handed to the ring and not seen fail or deleted.
    pub fn stored_files(&self) -> Vec<PathBuf> {
        lock(&self.stored).iter().cloned().collect()
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn describe_files(&self) -> String {
        let files = self.stored_files();
        if files.is_empty() {
            return "  No files stored.".to_string();
        }
        files
            .iter()
            .map(|path| format!("  {}", path.display()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn store(&self, path: &str) -> bool {
        let path = self.resolve(path);
        self.submit(Operation::Store(path)).await
    }

    pub async fn retrieve(&self, name: &str) -> bool {
        self.submit(Operation::Retrieve(PathBuf::from(name))).await
    }

    pub async fn delete(&self, name: &str) -> bool {
        self.submit(Operation::Delete(PathBuf::from(name))).await
    }

    /// Queue an operation and ask the rendezvous service for an entry peer.
    /// The operation is dropped again if the service cannot be reached.
    pub async fn submit(&self, op: Operation) -> bool {
        if op.filename().is_none() {
            warn!("Cannot {} {}: no file name", op.verb(), op.path().display());
            return false;
        }
        lock(&self.pending).push_back(op.clone());
        let sent = self
            .connections
            .send(&self.discovery, &Message::SelectRequest(String::new()), true)
            .await;
        if !sent {
            warn!("Discovery at {} unreachable", self.discovery);
            let mut pending = lock(&self.pending);
            if let Some(index) = pending.iter().rposition(|queued| queued == &op) {
                pending.remove(index);
            }
        }
        sent
    }

    async fn on_entry_peer(&self, entry: Option<PeerIdentity>) {
        let Some(op) = lock(&self.pending).pop_front() else {
            debug!("There are no operations to initiate");
            return;
        };
        let Some(entry) = entry else {
            info!("Cannot {} {}. No peers.", op.verb(), op.path().display());
            return;
        };
        let Some(filename) = op.filename() else {
            return;
        };

        let key = key_for_filename(&filename);
        let seek = Message::Seek(SeekRequest {
            op: op.seek_op(),
            key: key.to_string(),
            path: op.path().to_string_lossy().into_owned(),
            address: self.address.clone(),
            hops: Vec::new(),
        });

        if !self.connections.send(&entry.address(), &seek, false).await {
            warn!("Entry peer {} unreachable, asking for another", entry);
            lock(&self.pending).push_back(op);
            if !self
                .connections
                .send(&self.discovery, &Message::SelectRequest(String::new()), true)
                .await
            {
                warn!("Discovery at {} unreachable", self.discovery);
            }
            return;
        }

        info!(
            "{} is our random peer to {} {}, whose key is {}",
            entry.id,
            op.verb(),
            op.path().display(),
            key
        );
        if let Operation::Delete(_) = op {
            lock(&self.stored).retain(|path| path.file_name().and_then(|n| n.to_str()) != Some(filename.as_str()));
        }
    }

    async fn on_accept(&self, text: &str, connection: Connection) {
        let (path, trace) = split_reply(text);
        info!("Traceroute of file lookup: {}", trace);

        let path = PathBuf::from(path);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Unable to read {}: {}", path.display(), e);
                return;
            }
        };
        let Some(filename) = path.file_name().and_then(|name| name.to_str()).map(str::to_string) else {
            return;
        };

        let relay = Message::RelayFile {
            key: key_for_filename(&filename).to_string(),
            filename: filename.clone(),
            content: Bytes::from(content),
            address: self.address.clone(),
            hops: 0,
        };
        match connection.send(&relay).await {
            Ok(()) => {
                lock(&self.stored).insert(path);
                info!("Sent {} to peer", filename);
            }
            Err(e) => warn!("Failed to send {} to peer for storage: {}", path.display(), e),
        }
    }

    fn on_write_status(&self, filename: &str, success: bool) {
        if success {
            info!("Storage operation of {} succeeded", filename);
            return;
        }
        info!("Storage operation of {} failed", filename);
        lock(&self.stored).retain(|path| path.file_name().and_then(|n| n.to_str()) != Some(filename));
    }

    fn on_served(&self, filename: &str, content: Option<Bytes>) {
        let Some(content) = content else {
            info!("No content was served for {}", filename);
            return;
        };
        let Some(name) = Path::new(filename).file_name() else {
            warn!("Refusing to write served file {:?}", filename);
            return;
        };
        let target = self.reads_dir.join(name);
        let written = std::fs::create_dir_all(&self.reads_dir).and_then(|_| std::fs::write(&target, &content));
        match written {
            Ok(()) => info!("Wrote {} to {}", filename, self.reads_dir.display()),
            Err(e) => warn!("Unable to write {}: {}", target.display(), e),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.connections.close_all().await;
    }
}

/// Split `"path|hop,hop"` into the path and an arrow trace.
fn split_reply(text: &str) -> (&str, String) {
    let (path, hops) = text.split_once('|').unwrap_or((text, ""));
    (path, hops.replace(',', " -> "))
}

#[async_trait]
impl EventHandler for StoreClient {
    async fn on_event(&self, message: Message, connection: Connection) {
        match message {
            Message::SelectResponse(entry) => self.on_entry_peer(Some(entry)).await,
            Message::NoPeers(_) => self.on_entry_peer(None).await,
            Message::AcceptStorage(text) => self.on_accept(&text, connection).await,
            Message::DenyStorage(text) => {
                let (path, trace) = split_reply(&text);
                info!("Peer denied storage request for {}. Possible filename conflict.", path);
                info!("Traceroute of file lookup: {}", trace);
            }
            Message::WriteSuccess(filename) => self.on_write_status(&filename, true),
            Message::WriteFail(filename) => self.on_write_status(&filename, false),
            Message::ServeFile { filename, content } => self.on_served(&filename, content),
            other => debug!("Ignoring {} at store client", other.kind()),
        }
    }
}
