//! BlobVault - an authenticated, persistent key/value server
//!
//! This library provides:
//! - an encrypted, length-prefixed TCP protocol with an RSA/AES handshake
//! - per-user accounts with salted password hashes
//! - a sharded in-memory store with a bounded most-recently-used index
//! - per-user request and bandwidth quotas
//! - an append-only, fsynced persistence log with compaction
//! - a worker-pool server and an async client

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod mru;
pub mod protocol;
pub mod quota;
pub mod server;
pub mod store;
pub mod wal;

pub use client::{Client, Credentials};
pub use config::{ServerArgs, ServerConfig};
pub use engine::{LoadOutcome, Vault};
pub use error::{Result, VaultError};
pub use protocol::{Command, Request, Response, Status};
pub use server::VaultServer;
