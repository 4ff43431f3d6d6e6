//! Handshake-driven peer routing.
//!
//! The routing key for a new session is the initiator's static public key,
//! which only becomes visible after the initiation frame is decrypted with
//! some served endpoint's private key. Servers are tried in configuration
//! order; AEAD authentication makes a wrong-server decryption fail, so the
//! first success identifies both the served endpoint and the peer.

use std::net::SocketAddr;

use base64ct::{Base64, Encoding};
use hashbrown::HashMap;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::decrypt_initiation;
use crate::error::Error;
use crate::messages::MessageInitiation;

/// One served WireGuard endpoint and its peer routing entries.
pub struct RouteServer {
    private_key: StaticSecret,
    public_key: PublicKey,
    peers: HashMap<[u8; 32], SocketAddr>,
    fallback: Option<SocketAddr>,
}

impl RouteServer {
    pub fn new(
        private_key: StaticSecret,
        peers: HashMap<[u8; 32], SocketAddr>,
        fallback: Option<SocketAddr>,
    ) -> Self {
        Self {
            public_key: PublicKey::from(&private_key),
            private_key,
            peers,
            fallback,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// All served endpoints behind one listen socket.
pub struct RouteTable {
    servers: Vec<RouteServer>,
}

impl RouteTable {
    pub fn new(servers: Vec<RouteServer>) -> Self {
        Self { servers }
    }

    /// Resolve the upstream endpoint for a fresh initiation.
    ///
    /// Non-initiation frames never come here; they ride existing forwarding
    /// entries keyed by source address.
    pub fn route_initiation(&self, init: &MessageInitiation) -> Result<SocketAddr, Error> {
        for server in &self.servers {
            let Ok(decrypted) =
                decrypt_initiation(init, &server.private_key, &server.public_key)
            else {
                continue;
            };

            let spk = decrypted.static_key.to_bytes();
            if let Some(&upstream) = server.peers.get(&spk) {
                return Ok(upstream);
            }
            if let Some(upstream) = server.fallback {
                return Ok(upstream);
            }
            return Err(Error::NoPeerRoute {
                pubkey: Base64::encode_string(&spk),
            });
        }
        Err(Error::HandshakeDecryptFailed)
    }
}
