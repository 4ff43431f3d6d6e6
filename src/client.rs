//! The client leg: a thin mangler in front of a local WireGuard peer.
//!
//! Historically paired with fixed-port deployments: the peer id stamped into
//! `packet[1]` lets the remote end demultiplex without touching the
//! handshake, and the optional repeating-key XOR hides the WireGuard header
//! bytes. Replies are un-XORed symmetrically; the remote end restores
//! `packet[1]` itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::forward::{ForwardTable, ReplyEncoder};
use crate::packet::Packet;

pub struct Client {
    id: u8,
    server: SocketAddr,
    listen: SocketAddr,
    timeout: Duration,
    xor_key: Vec<u8>,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self {
            id: config.peer_id()?,
            server: config.server_addr()?,
            listen: config.listen_addr()?,
            timeout: config.timeout(),
            xor_key: config
                .xor_key
                .clone()
                .map(String::into_bytes)
                .unwrap_or_default(),
        })
    }

    pub async fn run(self) -> Result<(), Error> {
        let listen = Arc::new(UdpSocket::bind(self.listen).await?);
        info!(listen = %listen.local_addr()?, server = %self.server, id = self.id, "wgmux client up");

        let table = ForwardTable::new(self.timeout);
        let sweeper = table.spawn_sweeper();
        let encoder = Arc::new(ReplyEncoder::Xor(self.xor_key.clone()));

        let mut packet = Box::new(Packet::new());
        let result = loop {
            let (len, src) = match listen.recv_from(packet.storage_mut()).await {
                Ok(v) => v,
                Err(e) => break Err(Error::SocketIo(e)),
            };
            packet.reset(len);
            if len < 4 {
                warn!(%src, "{}", Error::PacketTooShort { length: len });
                continue;
            }

            self.mangle(&mut packet);
            if let Err(e) = table
                .forward(src, self.server, &listen, &encoder, &packet)
                .await
            {
                warn!(%src, server = %self.server, "forward failed: {e}");
            }
        };

        sweeper.abort();
        table.clear();
        result
    }

    fn mangle(&self, packet: &mut Packet) {
        packet.bytes_mut()[1] = self.id;
        if !self.xor_key.is_empty() {
            for (i, b) in packet.bytes_mut().iter_mut().enumerate() {
                *b ^= self.xor_key[i % self.xor_key.len()];
            }
        }
    }
}
