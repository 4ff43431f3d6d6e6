use thiserror::Error;

/// All errors surfaced by the proxy.
///
/// Startup errors (`ResolveAddr`, `InvalidPeerId`, `Config`) are fatal to the
/// leg being constructed. Per-packet errors (`PacketTooShort`,
/// `HandshakeDecryptFailed`, `NoPeerRoute`) never propagate out of the server
/// loop; the datagram is dropped and the error is logged.
#[derive(Debug, Error)]
pub enum Error {
    /// DNS or parse failure on a configured address.
    #[error("failed to resolve {role} address {literal:?}")]
    ResolveAddr {
        role: &'static str,
        literal: String,
        #[source]
        cause: std::io::Error,
    },

    /// Client peer id outside `0..256`.
    #[error("invalid peer id {id}, must be in 0..256")]
    InvalidPeerId { id: u16 },

    /// Datagram shorter than the smallest WireGuard frame.
    #[error("packet too short ({length} bytes)")]
    PacketTooShort { length: usize },

    /// No configured server key decrypted the handshake initiation.
    #[error("no server key decrypted the handshake initiation")]
    HandshakeDecryptFailed,

    /// The initiation decrypted, but the sender is neither a configured
    /// peer nor covered by a fallback entry.
    #[error("no peer route for initiator public key {pubkey}")]
    NoPeerRoute { pubkey: String },

    /// Transient or fatal socket error, depending on which socket raised it.
    #[error("socket i/o")]
    SocketIo(#[from] std::io::Error),

    /// Configuration rejected before any socket was opened.
    #[error("invalid configuration: {0}")]
    Config(String),
}
