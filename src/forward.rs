//! Bidirectional forwarding table with idle eviction.
//!
//! One entry per active client source address. The entry owns an ephemeral
//! outbound socket connected to the peer's upstream endpoint and a reader
//! task that carries upstream replies back through the shared listen socket.
//! All map mutations happen under one lock; per-packet state on entries is
//! atomic so readers never take the lock on the hot path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::obfs::WireGuardObfuscator;
use crate::packet::{Packet, FLAG_DEOBFUSCATED_AFTER_RECEIVED, FLAG_OBFUSCATE_BEFORE_SEND};

/// Transform applied to upstream replies before they leave the listen
/// socket toward the client.
pub enum ReplyEncoder {
    /// Server leg: obfuscate when the client's own traffic arrived
    /// obfuscated.
    Obfuscate(Arc<WireGuardObfuscator>),
    /// Client leg: undo the server-side repeating-key XOR. An empty key is
    /// the identity.
    Xor(Vec<u8>),
}

impl ReplyEncoder {
    pub(crate) fn encode(&self, packet: &mut Packet, obfuscate: bool) {
        match self {
            ReplyEncoder::Obfuscate(obfs) => {
                if obfuscate {
                    packet.flags |= FLAG_OBFUSCATE_BEFORE_SEND;
                    obfs.obfuscate(packet);
                }
            }
            ReplyEncoder::Xor(key) => {
                if !key.is_empty() {
                    for (i, b) in packet.bytes_mut().iter_mut().enumerate() {
                        *b ^= key[i % key.len()];
                    }
                }
            }
        }
    }
}

/// Per-client forwarding state. Sole writer to its outbound socket.
struct ForwardEntry {
    client_source: SocketAddr,
    upstream: SocketAddr,
    socket: Arc<UdpSocket>,
    /// Milliseconds since the table's epoch; updated on traffic in either
    /// direction.
    last_activity: AtomicU64,
    /// Whether the client's latest datagram arrived obfuscated; replies
    /// mirror it.
    obfuscate_replies: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardEntry {
    fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

pub struct ForwardTable {
    entries: Mutex<HashMap<SocketAddr, Arc<ForwardEntry>>>,
    timeout: Duration,
    epoch: Instant,
}

impl ForwardTable {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
            epoch: Instant::now(),
        })
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Forward a client datagram upstream, creating the entry (and its
    /// reply reader) on first contact. A fresh initiation that re-routes an
    /// existing source to a different upstream replaces the old entry.
    pub async fn forward(
        self: &Arc<Self>,
        src: SocketAddr,
        upstream: SocketAddr,
        listen: &Arc<UdpSocket>,
        encoder: &Arc<ReplyEncoder>,
        packet: &Packet,
    ) -> Result<(), Error> {
        let existing = self.entries.lock().unwrap().get(&src).cloned();
        let entry = match existing {
            Some(entry) if entry.upstream == upstream => entry,
            Some(entry) => {
                info!(%src, old = %entry.upstream, new = %upstream, "re-routing client");
                self.remove(src);
                self.insert(src, upstream, listen, encoder).await?
            }
            None => self.insert(src, upstream, listen, encoder).await?,
        };

        entry.obfuscate_replies.store(
            packet.has_flag(FLAG_DEOBFUSCATED_AFTER_RECEIVED),
            Ordering::Relaxed,
        );
        entry.last_activity.store(self.now_millis(), Ordering::Relaxed);

        if let Err(e) = entry.socket.send(packet.bytes()).await {
            self.remove(src);
            return Err(Error::SocketIo(e));
        }
        Ok(())
    }

    /// Forward along an entry that must already exist. Returns `false` when
    /// the source is unknown, which is how non-handshake frames from
    /// strangers die.
    pub async fn forward_established(&self, src: SocketAddr, packet: &Packet) -> bool {
        let Some(entry) = self.entries.lock().unwrap().get(&src).cloned() else {
            return false;
        };
        entry.obfuscate_replies.store(
            packet.has_flag(FLAG_DEOBFUSCATED_AFTER_RECEIVED),
            Ordering::Relaxed,
        );
        entry.last_activity.store(self.now_millis(), Ordering::Relaxed);
        if let Err(e) = entry.socket.send(packet.bytes()).await {
            warn!(%src, upstream = %entry.upstream, "outbound send failed: {e}");
            self.remove(src);
        }
        true
    }

    async fn insert(
        self: &Arc<Self>,
        src: SocketAddr,
        upstream: SocketAddr,
        listen: &Arc<UdpSocket>,
        encoder: &Arc<ReplyEncoder>,
    ) -> Result<Arc<ForwardEntry>, Error> {
        let bind_ip: IpAddr = if upstream.is_ipv6() {
            Ipv6Addr::UNSPECIFIED.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        };
        let socket = UdpSocket::bind((bind_ip, 0)).await?;
        socket.connect(upstream).await?;
        let entry = Arc::new(ForwardEntry {
            client_source: src,
            upstream,
            socket: Arc::new(socket),
            last_activity: AtomicU64::new(self.now_millis()),
            obfuscate_replies: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let reader = spawn_reader(
            Arc::downgrade(self),
            entry.clone(),
            listen.clone(),
            encoder.clone(),
        );
        *entry.reader.lock().unwrap() = Some(reader);

        self.entries.lock().unwrap().insert(src, entry.clone());
        info!(%src, %upstream, "new forwarding entry");
        Ok(entry)
    }

    fn remove(&self, src: SocketAddr) {
        if let Some(entry) = self.entries.lock().unwrap().remove(&src) {
            entry.shutdown();
        }
    }

    /// Evict every entry idle longer than the timeout.
    pub fn sweep(&self) {
        let now = self.now_millis();
        let timeout = self.timeout.as_millis() as u64;
        let mut evicted = Vec::new();
        self.entries.lock().unwrap().retain(|_, entry| {
            let idle = now.saturating_sub(entry.last_activity.load(Ordering::Relaxed));
            if idle > timeout {
                evicted.push(entry.clone());
                false
            } else {
                true
            }
        });
        for entry in evicted {
            info!(src = %entry.client_source, upstream = %entry.upstream, "evicting idle entry");
            entry.shutdown();
        }
    }

    /// Run [`sweep`](Self::sweep) on a coarse timer until the table is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let table = Arc::downgrade(self);
        let period = (self.timeout / 4).max(Duration::from_millis(250));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Some(table) = table.upgrade() else { return };
                table.sweep();
            }
        })
    }

    /// Drop all entries and cancel their readers.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        for entry in entries.values() {
            entry.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Carry upstream replies back to the client through the listen socket.
fn spawn_reader(
    table: Weak<ForwardTable>,
    entry: Arc<ForwardEntry>,
    listen: Arc<UdpSocket>,
    encoder: Arc<ReplyEncoder>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut packet = Box::new(Packet::new());
        loop {
            let len = match entry.socket.recv(packet.storage_mut()).await {
                Ok(len) => len,
                Err(e) => {
                    warn!(upstream = %entry.upstream, "outbound socket failed: {e}");
                    if let Some(table) = table.upgrade() {
                        table.remove(entry.client_source);
                    }
                    return;
                }
            };
            packet.reset(len);

            // A dead table means the leg shut down without evicting us.
            let Some(live) = table.upgrade() else { return };
            entry
                .last_activity
                .store(live.now_millis(), Ordering::Relaxed);
            drop(live);

            encoder.encode(&mut packet, entry.obfuscate_replies.load(Ordering::Relaxed));
            if let Err(e) = listen.send_to(packet.bytes(), entry.client_source).await {
                debug!(client = %entry.client_source, "reply send failed: {e}");
            }
        }
    })
}
