// ring-node/src/lib.rs
//! Prefix-routing overlay with a file store on top.
//!
//! Peers keep a leaf set and a prefix table keyed by 16-bit identifiers and
//! forward messages toward the peer numerically closest to a key. A rendezvous
//! service hands new peers an entry point, and a store client writes, reads
//! and deletes files through whichever peer owns the file's key.

pub mod config;
pub mod discovery;
pub mod id;
pub mod node;
pub mod routing;
pub mod storage;
pub mod store_client;
pub mod transport;
pub mod wire;
