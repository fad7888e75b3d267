//! Common utilities and types shared across minivol

pub mod auth;
pub mod auth_middleware;
pub mod config;
pub mod error;
pub mod hash;
pub mod tracing_middleware;
pub mod utils;

pub use config::{ClusterConfig, Config, MigrationConfig, ServerConfig};
pub use error::{Error, Result};
pub use hash::{blake3_hash, etag, sha256_hex, Blake3Hasher};
pub use utils::{decode_segment, encode_segment, format_bytes, parse_size, random_secret, timestamp_now};
