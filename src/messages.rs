//! WireGuard frame layouts.
//!
//! Every WireGuard message starts with a one byte type tag and three zero
//! bytes, which reads naturally as a little-endian `u32`. The structs here
//! map the fixed layouts byte for byte so a received datagram can be
//! reinterpreted in place without copying.

use zerocopy::{byteorder::little_endian, AsBytes, FromBytes, FromZeroes};

pub const MSG_INITIATION: u32 = 1;
pub const MSG_RESPONSE: u32 = 2;
pub const MSG_COOKIE_REPLY: u32 = 3;
pub const MSG_TRANSPORT: u32 = 4;

pub const INITIATION_SIZE: usize = 148;
pub const RESPONSE_SIZE: usize = 92;
pub const COOKIE_REPLY_SIZE: usize = 64;
pub const TRANSPORT_HEADER_SIZE: usize = 16;

/// Offset of the MAC2 field inside an initiation frame.
pub const INITIATION_MAC2_OFFSET: usize = 132;
/// Offset of the MAC2 field inside a response frame.
pub const RESPONSE_MAC2_OFFSET: usize = 76;

/// A transport keepalive: header plus an empty encrypted payload.
/// Nothing valid on a WireGuard port is shorter.
pub const MIN_MESSAGE_SIZE: usize = 32;

pub type Mac = [u8; 16];

/// A 16-byte Poly1305 authenticator over the preceding ciphertext.
pub type Tag = [u8; 16];

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct EncryptedEmpty {
    pub msg: [u8; 0],
    pub tag: Tag,
}

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct EncryptedTimestamp {
    pub msg: [u8; 12],
    pub tag: Tag,
}

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct EncryptedPublicKey {
    pub msg: [u8; 32],
    pub tag: Tag,
}

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    pub msg: Mac,
    pub tag: Tag,
}

/// The first handshake message. Carries the initiator's static public key
/// encrypted under the Noise IK `es` key, which is the field this proxy
/// decrypts to route new sessions.
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, align(4))]
pub struct MessageInitiation {
    pub _type: little_endian::U32,
    pub sender: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub static_key: EncryptedPublicKey,
    pub timestamp: EncryptedTimestamp,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// The second handshake message.
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, align(4))]
pub struct MessageResponse {
    pub _type: little_endian::U32,
    pub sender: little_endian::U32,
    pub receiver: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub empty: EncryptedEmpty,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Cookie reply, sent under load for DDoS mitigation. No MAC2 field.
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, align(4))]
pub struct MessageCookieReply {
    pub _type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub nonce: [u8; 24],
    pub cookie: EncryptedCookie,
}

/// Header of a transport data message. The encrypted payload and its tag
/// follow in the datagram.
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, align(8))]
pub struct MessageTransport {
    pub _type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub counter: little_endian::U64,
}

/// A canonical WireGuard frame viewed in place.
pub enum WgMessage<'a> {
    Initiation(&'a mut MessageInitiation),
    Response(&'a mut MessageResponse),
    CookieReply(&'a mut MessageCookieReply),
    Transport(&'a mut MessageTransport),
}

impl<'a> WgMessage<'a> {
    /// Reinterpret a datagram as a WireGuard frame.
    ///
    /// Fixed-size messages must match their layout exactly; transport
    /// messages only need a complete header. The buffer must be at least
    /// 8-byte aligned.
    pub fn mut_from(b: &'a mut [u8]) -> Option<Self> {
        let msg_type = little_endian::U32::ref_from_prefix(b)?;
        match msg_type.get() {
            MSG_INITIATION => Some(WgMessage::Initiation(FromBytes::mut_from(b)?)),
            MSG_RESPONSE => Some(WgMessage::Response(FromBytes::mut_from(b)?)),
            MSG_COOKIE_REPLY => Some(WgMessage::CookieReply(FromBytes::mut_from(b)?)),
            MSG_TRANSPORT if b.len() >= MIN_MESSAGE_SIZE => {
                Some(WgMessage::Transport(FromBytes::mut_from_prefix(b)?))
            }
            _ => None,
        }
    }
}
