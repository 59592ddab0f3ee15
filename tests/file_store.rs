#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{spawn_client, spawn_discovery, spawn_peer, wait_until};
use ringnode::node::Peer;

fn holders(peers: &[Arc<Peer>], filename: &str) -> usize {
    peers.iter().filter(|peer| peer.files().contains(filename)).count()
}

#[tokio::test]
async fn store_retrieve_and_delete_through_the_ring() {
    let root = tempfile::tempdir().unwrap();
    let discovery = spawn_discovery().await;
    let address = discovery.local_addr().to_string();

    let mut peers = Vec::new();
    for hex in ["1000", "8000"] {
        let peer = spawn_peer(root.path(), hex, &address).await;
        assert!(peer.register().await);
        let watched = peer.clone();
        wait_until("peer to join", move || {
            let peer = watched.clone();
            async move { peer.routing().is_initialized() }
        })
        .await;
        peers.push(peer);
    }

    let client_root = tempfile::tempdir().unwrap();
    let client = spawn_client(client_root.path(), &address).await;
    std::fs::create_dir_all(client_root.path().join("data")).unwrap();
    std::fs::write(client_root.path().join("data").join("hello.txt"), b"hello ring").unwrap();

    assert!(client.store("hello.txt").await);
    let watched = peers.clone();
    wait_until("the file to be stored", move || {
        let peers = watched.clone();
        async move { holders(&peers, "hello.txt") == 1 }
    })
    .await;
    let stored = client.clone();
    wait_until("the client to record the store", move || {
        let client = stored.clone();
        async move { !client.stored_files().is_empty() }
    })
    .await;
    assert_eq!(
        client.stored_files(),
        vec![client_root.path().join("data").join("hello.txt")]
    );

    // A second store of the same name is denied and leaves one copy.
    assert!(client.store("hello.txt").await);
    assert!(client.retrieve("hello.txt").await);
    let served = client_root.path().join("reads").join("hello.txt");
    let target = served.clone();
    wait_until("the file to be served", move || {
        let target = target.clone();
        async move { target.exists() }
    })
    .await;
    assert_eq!(std::fs::read(&served).unwrap(), b"hello ring");
    assert_eq!(holders(&peers, "hello.txt"), 1);

    assert!(client.delete("hello.txt").await);
    let watched = peers.clone();
    wait_until("the file to be deleted", move || {
        let peers = watched.clone();
        async move { holders(&peers, "hello.txt") == 0 }
    })
    .await;
    assert!(client.stored_files().is_empty());

    client.shutdown().await;
    for peer in &peers {
        peer.shutdown().await;
    }
    discovery.shutdown();
}

#[tokio::test]
async fn operations_without_peers_are_dropped() {
    let root = tempfile::tempdir().unwrap();
    let discovery = spawn_discovery().await;
    let client = spawn_client(root.path(), &discovery.local_addr().to_string()).await;

    assert!(client.retrieve("nothing.txt").await);
    let watched = client.clone();
    wait_until("the operation to be answered", move || {
        let client = watched.clone();
        async move { client.pending() == 0 }
    })
    .await;
    assert!(!root.path().join("reads").join("nothing.txt").exists());

    client.shutdown().await;
    discovery.shutdown();
}
