//! The server leg: one listen socket multiplexing many WireGuard peers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::forward::{ForwardTable, ReplyEncoder};
use crate::messages::WgMessage;
use crate::obfs::WireGuardObfuscator;
use crate::packet::Packet;
use crate::route::RouteTable;

enum Verdict {
    /// Fresh initiation, resolved to an upstream endpoint.
    Route(SocketAddr),
    /// Any other WireGuard frame; must ride an existing entry.
    Established,
    Drop,
}

pub struct Server {
    listen: SocketAddr,
    timeout: Duration,
    obfuscator: Arc<WireGuardObfuscator>,
    route: RouteTable,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Result<Self, Error> {
        Ok(Self {
            listen: config.listen_addr()?,
            timeout: config.timeout(),
            obfuscator: Arc::new(WireGuardObfuscator::new(
                config.obfs.as_deref().unwrap_or(""),
            )),
            route: config.route_table()?,
        })
    }

    /// Run until the listen socket fails. Per-packet errors are logged and
    /// the datagram dropped; a dead listen socket tears down the sweeper
    /// and every forwarding entry before returning.
    pub async fn run(self) -> Result<(), Error> {
        let listen = Arc::new(UdpSocket::bind(self.listen).await?);
        info!(listen = %listen.local_addr()?, obfs = self.obfuscator.enabled(), "wgmux server up");

        let table = ForwardTable::new(self.timeout);
        let sweeper = table.spawn_sweeper();
        let encoder = Arc::new(ReplyEncoder::Obfuscate(self.obfuscator.clone()));

        let mut packet = Box::new(Packet::new());
        let result = loop {
            let (len, src) = match listen.recv_from(packet.storage_mut()).await {
                Ok(v) => v,
                // A dead listen socket takes the whole leg down.
                Err(e) => break Err(Error::SocketIo(e)),
            };
            packet.reset(len);
            if len < 4 {
                warn!(%src, "{}", Error::PacketTooShort { length: len });
                continue;
            }

            self.obfuscator.deobfuscate(&mut packet);

            let verdict = match WgMessage::mut_from(packet.bytes_mut()) {
                Some(WgMessage::Initiation(init)) => match self.route.route_initiation(init) {
                    Ok(upstream) => Verdict::Route(upstream),
                    Err(e @ Error::HandshakeDecryptFailed) => {
                        debug!(%src, "{e}");
                        Verdict::Drop
                    }
                    Err(e) => {
                        warn!(%src, "{e}");
                        Verdict::Drop
                    }
                },
                Some(_) => Verdict::Established,
                None => {
                    warn!(%src, len = packet.len(), "unrecognized datagram");
                    Verdict::Drop
                }
            };

            match verdict {
                Verdict::Route(upstream) => {
                    if let Err(e) = table.forward(src, upstream, &listen, &encoder, &packet).await {
                        warn!(%src, %upstream, "forward failed: {e}");
                    }
                }
                Verdict::Established => {
                    if !table.forward_established(src, &packet).await {
                        debug!(%src, "no forwarding entry for non-handshake frame");
                    }
                }
                Verdict::Drop => {}
            }
        };

        sweeper.abort();
        table.clear();
        result
    }
}
