//! # minivol
//!
//! A clustered storage-volume daemon:
//! - custom, image and instance volumes on storage pools
//! - copy, refresh, rename and move with compensating rollback
//! - asynchronous operations with cancel and wait
//! - push and pull migration of volumes between members over websockets
//! - request forwarding to the member that holds a volume
//!
//! ## Architecture
//!
//! ```text
//!   HTTP /1.0 ──► api (route table, auth, forwarding)
//!                  │
//!                  ▼
//!            orchestrator ──► operations (tracker, runners)
//!              │      │
//!              ▼      ▼
//!          storage   migration (source / sink, wire sections)
//!              │
//!              ▼
//!         cluster::db (RocksDB metadata)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minivold --config ./minivol.toml --member node1 --bind 0.0.0.0:8443
//! ```

#![allow(clippy::result_large_err)]

pub mod api;
pub mod cluster;
pub mod common;
pub mod daemon;
pub mod migration;
pub mod operations;
pub mod orchestrator;
pub mod revert;
pub mod storage;

pub use common::{Config, Error, Result};
pub use daemon::Daemon;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
