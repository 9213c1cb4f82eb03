//! Storage node implementation
//!
//! A minimal chunk server for the master to place data on:
//! - Content-addressed chunk files, verified against their id on store
//! - Membership handshake with a persisted master-assigned id

pub mod blob;
pub mod server;

pub use blob::BlobStore;
pub use server::VolumeServer;
