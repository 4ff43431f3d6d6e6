//! Configuration loading for the server and client legs.
//!
//! Config files are JSON5: comments and trailing commas are tolerated, which
//! keeps hand-maintained peer lists readable. Key material is base64, as
//! `wg genkey` emits it.

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use hashbrown::HashMap;
use serde::Deserialize;
use x25519_dalek::StaticSecret;

use crate::error::Error;
use crate::route::{RouteServer, RouteTable};

fn default_timeout() -> u64 {
    60
}

/// Server-leg configuration.
///
/// ```json5
/// {
///     listen: ":27100",
///     timeout: 60,
///     obfs: "my user key",
///     servers: [
///         {
///             privkey: "EFt3ELmZeM/M47qFkgF4RbSOijtdHS43BNIxvxstREI=",
///             address: "192.0.2.1",
///             peers: [
///                 { pubkey: "mCXTsTRyjQKV74eWR2Ka1LIdIptCG9K0FXlrG2NC4EQ=", forward_to: ":1000" },
///                 { forward_to: ":1003" }, // fallback
///             ],
///         },
///     ],
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub obfs: Option<String>,
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ServerEntry {
    pub privkey: String,
    /// Default host for peers whose `forward_to` omits the host part.
    #[serde(default)]
    pub address: Option<String>,
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PeerEntry {
    /// Absent means this entry is the server's fallback peer.
    #[serde(default)]
    pub pubkey: Option<String>,
    pub forward_to: String,
}

/// Client-leg configuration.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub server: String,
    pub id: u16,
    pub listen: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub xor_key: Option<String>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        from_file(path)
    }

    pub fn from_str(text: &str) -> Result<Self, Error> {
        json5::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        resolve_addr("listen", &self.listen, None)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Decode and resolve every served endpoint into a routing table.
    pub fn route_table(&self) -> Result<RouteTable, Error> {
        let mut servers = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            let private_key = StaticSecret::from(decode_key("privkey", &entry.privkey)?);

            let mut peers = HashMap::new();
            let mut fallback = None;
            for peer in &entry.peers {
                let upstream =
                    resolve_addr("forward_to", &peer.forward_to, entry.address.as_deref())?;
                match &peer.pubkey {
                    Some(pubkey) => {
                        peers.insert(decode_key("pubkey", pubkey)?, upstream);
                    }
                    None if fallback.is_none() => fallback = Some(upstream),
                    None => {
                        return Err(Error::Config(
                            "at most one fallback peer (no pubkey) per server".into(),
                        ))
                    }
                }
            }
            servers.push(RouteServer::new(private_key, peers, fallback));
        }
        Ok(RouteTable::new(servers))
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        from_file(path)
    }

    pub fn from_str(text: &str) -> Result<Self, Error> {
        json5::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        resolve_addr("listen", &self.listen, None)
    }

    pub fn server_addr(&self) -> Result<SocketAddr, Error> {
        resolve_addr("server", &self.server, None)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn peer_id(&self) -> Result<u8, Error> {
        u8::try_from(self.id).map_err(|_| Error::InvalidPeerId { id: self.id })
    }
}

fn from_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Error> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    json5::from_str(&text).map_err(|e| Error::Config(e.to_string()))
}

pub(crate) fn decode_key(role: &str, b64: &str) -> Result<[u8; 32], Error> {
    let bytes = Base64::decode_vec(b64)
        .map_err(|e| Error::Config(format!("{role}: invalid base64: {e}")))?;
    <[u8; 32]>::try_from(bytes).map_err(|_| Error::Config(format!("{role}: key must be 32 bytes")))
}

/// Resolve `host:port`, borrowing the host from `default_host` when the
/// literal only carries a port. A missing default falls back to the
/// wildcard address, which is what a bare `:port` listen string means.
pub(crate) fn resolve_addr(
    role: &'static str,
    literal: &str,
    default_host: Option<&str>,
) -> Result<SocketAddr, Error> {
    let target = if literal.starts_with(':') {
        format!("{}{literal}", default_host.unwrap_or("0.0.0.0"))
    } else {
        literal.to_string()
    };

    let err = |cause| Error::ResolveAddr {
        role,
        literal: literal.to_string(),
        cause,
    };
    target
        .to_socket_addrs()
        .map_err(&err)?
        .next()
        .ok_or_else(|| {
            err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no addresses",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_DOC: &str = r#"{
        // one served endpoint, one routed peer, one fallback
        listen: ":27100",
        timeout: 60,
        obfs: "kisekimo, mahoumo, muryoudewaarimasen",
        servers: [
            {
                privkey: "EFt3ELmZeM/M47qFkgF4RbSOijtdHS43BNIxvxstREI=",
                address: "192.0.2.1",
                peers: [
                    { pubkey: "mCXTsTRyjQKV74eWR2Ka1LIdIptCG9K0FXlrG2NC4EQ=", forward_to: ":1000" },
                    { forward_to: ":1003" },
                ],
            },
        ],
    }"#;

    #[test]
    fn parses_json5_with_comments_and_trailing_commas() {
        let config = ServerConfig::from_str(SERVER_DOC).unwrap();
        assert_eq!(config.timeout, 60);
        assert_eq!(config.obfs.as_deref(), Some("kisekimo, mahoumo, muryoudewaarimasen"));
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].peers.len(), 2);
        assert_eq!(config.listen_addr().unwrap().port(), 27100);
    }

    #[test]
    fn forward_to_inherits_the_server_host() {
        let config = ServerConfig::from_str(SERVER_DOC).unwrap();
        let addr =
            resolve_addr("forward_to", ":1000", config.servers[0].address.as_deref()).unwrap();
        assert_eq!(addr, "192.0.2.1:1000".parse().unwrap());
        config.route_table().unwrap();
    }

    #[test]
    fn two_fallback_peers_are_rejected() {
        let config = ServerConfig::from_str(
            r#"{
                listen: ":27100",
                servers: [{
                    privkey: "EFt3ELmZeM/M47qFkgF4RbSOijtdHS43BNIxvxstREI=",
                    peers: [
                        { forward_to: "192.0.2.1:1003" },
                        { forward_to: "192.0.2.1:1004" },
                    ],
                }],
            }"#,
        )
        .unwrap();
        assert!(matches!(config.route_table(), Err(Error::Config(_))));
    }

    #[test]
    fn truncated_key_is_rejected() {
        assert!(matches!(
            decode_key("pubkey", "AAAA"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn client_peer_id_bounds() {
        let mut config = ClientConfig::from_str(
            r#"{ server: "192.0.2.9:27100", id: 3, listen: ":51820", xor_key: "sayonara" }"#,
        )
        .unwrap();
        assert_eq!(config.peer_id().unwrap(), 3);
        assert_eq!(config.timeout, 60);

        config.id = 256;
        assert!(matches!(
            config.peer_id(),
            Err(Error::InvalidPeerId { id: 256 })
        ));
    }
}
