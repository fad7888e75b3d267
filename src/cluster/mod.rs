//! Cluster plumbing: metadata store, member liveness, volume location and
//! request forwarding

pub mod client;
pub mod db;
pub mod forward;
pub mod heartbeat;
pub mod location;
pub mod tls;

pub use client::MemberClient;
pub use db::{ClusterDb, ClusterTx, MemberRecord, VolumeRecord};
pub use forward::{Forwarder, FORWARDED_HEADER};
pub use location::{Location, LocationResolver};
