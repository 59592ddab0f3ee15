// ring-node/src/discovery.rs
//! Rendezvous service: hands joining peers one live entry point and keeps the
//! membership list for people to look at.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::id::{Identifier, PeerIdentity};
use crate::transport::{self, Connection, EventHandler, DEFAULT_MAX_FRAME_LEN};
use crate::wire::Message;

#[derive(Debug, Clone)]
pub struct RegisteredPeer {
    pub peer: PeerIdentity,
    pub registered_at: DateTime<Utc>,
}

pub struct Discovery {
    registry: Mutex<Vec<RegisteredPeer>>,
    connect_timeout: Duration,
    local_addr: SocketAddr,
    listener: StdMutex<Option<AbortHandle>>,
}

impl Discovery {
    pub async fn bind(address: &str, connect_timeout: Duration) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;
        let local_addr = listener.local_addr()?;
        let discovery = Arc::new(Self {
            registry: Mutex::new(Vec::new()),
            connect_timeout,
            local_addr,
            listener: StdMutex::new(None),
        });

        let handler: Weak<dyn EventHandler> = Arc::<Discovery>::downgrade(&discovery);
        let task = tokio::spawn(transport::serve(listener, handler, DEFAULT_MAX_FRAME_LEN));
        *discovery.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());

        info!("Discovery started at {}", local_addr);
        Ok(discovery)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Everyone who registered and has not deregistered, live or not.
    pub async fn peers(&self) -> Vec<RegisteredPeer> {
        self.registry.lock().await.clone()
    }

    pub async fn describe_peers(&self) -> String {
        let peers = self.peers().await;
        if peers.is_empty() {
            return "  No peers registered.".to_string();
        }
        peers
            .iter()
            .map(|entry| {
                format!(
                    "  {} (since {})",
                    entry.peer,
                    entry.registered_at.format("%Y-%m-%d %H:%M:%S")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn register(&self, peer: PeerIdentity, connection: Connection) {
        let mut registry = self.registry.lock().await;
        if registry.iter().any(|entry| entry.peer == peer) {
            debug!("Collision when {} tried to register", peer.id);
            if let Err(e) = connection.send(&Message::IdCollision(String::new())).await {
                warn!("Failed to send ID_COLLISION reply: {}", e);
            }
            return;
        }

        let reply = self.select_from(&registry, Some(peer.id)).await;
        if let Err(e) = connection.send(&reply).await {
            warn!("Failed to answer registration of {}: {}", peer, e);
        }
        info!("Peer joined: {}", peer);
        registry.push(RegisteredPeer {
            peer,
            registered_at: Utc::now(),
        });
    }

    async fn deregister(&self, peer: PeerIdentity) {
        let mut registry = self.registry.lock().await;
        let before = registry.len();
        registry.retain(|entry| entry.peer != peer);
        if registry.len() < before {
            info!("Peer left: {}", peer);
        } else {
            info!("Unknown peer tried to leave: {}", peer);
        }
    }

    async fn select(&self, exclude: Option<Identifier>, connection: Connection) {
        let reply = {
            let registry = self.registry.lock().await;
            self.select_from(&registry, exclude).await
        };
        if let Err(e) = connection.send(&reply).await {
            warn!("Failed to send {} reply: {}", reply.kind(), e);
        }
    }

    /// SELECT_RESPONSE with a random live peer other than `exclude`, or NO_PEERS.
    async fn select_from(&self, registry: &[RegisteredPeer], exclude: Option<Identifier>) -> Message {
        let mut candidates: Vec<&PeerIdentity> = registry
            .iter()
            .map(|entry| &entry.peer)
            .filter(|peer| Some(peer.id) != exclude)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        for candidate in candidates {
            if self.is_live(candidate).await {
                return Message::SelectResponse(candidate.clone());
            }
            debug!("Registered peer {} did not answer", candidate);
        }
        Message::NoPeers(String::new())
    }

    /// A peer is live if it accepts a TCP connection.
    async fn is_live(&self, peer: &PeerIdentity) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer.address())).await,
            Ok(Ok(_))
        )
    }

    pub fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}

#[async_trait]
impl EventHandler for Discovery {
    async fn on_event(&self, message: Message, connection: Connection) {
        match message {
            Message::Register(peer) => self.register(peer, connection).await,
            Message::Deregister(peer) => self.deregister(peer).await,
            Message::SelectRequest(text) => self.select(text.parse().ok(), connection).await,
            other => warn!("Discovery cannot process {}", other.kind()),
        }
    }
}
