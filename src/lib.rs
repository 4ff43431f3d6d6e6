//! wgmux is a multiplexing forwarding proxy for WireGuard.
//!
//! A single UDP listener terminates traffic from many WireGuard peers,
//! identifies each peer by decrypting the static public key out of its
//! handshake initiation, and forwards its datagrams to a per-peer upstream
//! endpoint. Optionally the client-facing leg is obfuscated so that passive
//! classifiers see only random-looking UDP: frame lengths are randomized,
//! the all-zero MAC2 known plaintext is eliminated, and the canonical
//! WireGuard header is hidden under a keyed XOR stream.
//!
//! The obfuscation is a shim over WireGuard, not a transport of its own:
//! it never re-encrypts payload, never validates MACs, and never looks
//! inside the tunnel.
//!
//! ```no_run
//! # async fn run() -> Result<(), wgmux::Error> {
//! use std::path::Path;
//! use wgmux::{Server, ServerConfig};
//!
//! let config = ServerConfig::load(Path::new("wgmux.json5"))?;
//! Server::new(&config)?.run().await
//! # }
//! ```
#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod forward;
pub mod messages;
pub mod obfs;
pub mod packet;
pub mod route;

mod client;
mod server;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::Error;
pub use obfs::WireGuardObfuscator;
pub use packet::Packet;
pub use server::Server;
