//! WireGuard-aware wire obfuscation.
//!
//! The transform is a length/entropy shim, not a cryptographic transport:
//! WireGuard's own Noise layer stays responsible for confidentiality and
//! integrity. On the wire an obfuscated datagram is a keyed-XOR prefix
//! followed by random padding whose final 16 bytes double as the keystream
//! nonce.
//!
//! Layout decisions, all reversed exactly on ingress:
//!
//! * Fixed-size frames (initiation, response, cookie reply) are padded with
//!   a random suffix so their lengths stop being a fingerprint.
//! * An all-zero MAC2 in initiation/response frames would hand a classifier
//!   sixteen bytes of known plaintext, so it is dropped from the XOR region
//!   (random bytes go out in its place) and the frame is marked by setting
//!   `data[1]` to `0x01` before obfuscation.
//! * Transport frames shorter than [`TRANSPORT_SUFFIX_THRESHOLD`] gain a
//!   16-byte random suffix (also marked via `data[1]`); longer ones already
//!   end in ciphertext, which serves as the nonce for free.
//! * Only the first [`XOR_STEP`] bytes have to be deobfuscated to learn the
//!   message type, which keeps the transport hot path short.

use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::Xxh64;

use crate::messages::{
    COOKIE_REPLY_SIZE, INITIATION_MAC2_OFFSET, INITIATION_SIZE, MIN_MESSAGE_SIZE, MSG_COOKIE_REPLY,
    MSG_INITIATION, MSG_RESPONSE, MSG_TRANSPORT, RESPONSE_MAC2_OFFSET, RESPONSE_SIZE,
    TRANSPORT_HEADER_SIZE,
};
use crate::packet::{Packet, FLAG_DEOBFUSCATED_AFTER_RECEIVED, FLAG_OBFUSCATE_BEFORE_SEND};

/// Bytes of nonce carried at the tail of every obfuscated datagram.
pub const NONCE_LEN: usize = 16;
/// Bytes of keystream produced per hash round.
pub const XOR_STEP: usize = 8;
/// Exclusive upper bound on the random suffix appended to fixed-size frames.
pub const MAX_RANDOM_SUFFIX: usize = 384;
/// Transport frames shorter than this get an explicit random nonce suffix.
pub const TRANSPORT_SUFFIX_THRESHOLD: usize = 256;

/// Marker value stamped into `data[1]` when a frame was altered beyond the
/// plain XOR (zeroed MAC2 replaced, or nonce suffix appended).
const ALTERED_MARKER: u8 = 0x01;

/// Stateless-per-packet obfuscation codec keyed by a SHA-256 user key hash.
///
/// An empty user key disables the codec entirely: both transforms become the
/// identity and the wire carries canonical WireGuard.
pub struct WireGuardObfuscator {
    enabled: bool,
    user_key_hash: [u8; 32],
}

impl WireGuardObfuscator {
    pub fn new(user_key: &str) -> Self {
        if user_key.is_empty() {
            return Self {
                enabled: false,
                user_key_hash: [0; 32],
            };
        }
        Self {
            enabled: true,
            user_key_hash: Sha256::digest(user_key.as_bytes()).into(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Obfuscate `packet` in place for the wire.
    ///
    /// No-op unless the codec is enabled and the packet is flagged
    /// [`FLAG_OBFUSCATE_BEFORE_SEND`]. Non-WireGuard first bytes pass
    /// through untouched.
    pub fn obfuscate(&self, packet: &mut Packet) {
        if !self.enabled || !packet.has_flag(FLAG_OBFUSCATE_BEFORE_SEND) {
            return;
        }

        let obfs_len = match packet.message_type() {
            Some(t) if t == MSG_INITIATION as u8 => {
                self.pad_fixed(packet, INITIATION_SIZE, Some(INITIATION_MAC2_OFFSET))
            }
            Some(t) if t == MSG_RESPONSE as u8 => {
                self.pad_fixed(packet, RESPONSE_SIZE, Some(RESPONSE_MAC2_OFFSET))
            }
            Some(t) if t == MSG_COOKIE_REPLY as u8 => self.pad_fixed(packet, COOKIE_REPLY_SIZE, None),
            Some(t) if t == MSG_TRANSPORT as u8 => {
                if packet.len() < TRANSPORT_SUFFIX_THRESHOLD {
                    let len = packet.len();
                    packet.set_len(len + NONCE_LEN);
                    packet.bytes_mut()[1] = ALTERED_MARKER;
                    OsRng.fill_bytes(&mut packet.bytes_mut()[len..]);
                }
                TRANSPORT_HEADER_SIZE
            }
            _ => return,
        };

        let nonce = nonce_of(packet);
        let mut stream = KeyStream::new(&nonce, &self.user_key_hash);
        let data = packet.bytes_mut();
        for i in (0..obfs_len).step_by(XOR_STEP) {
            let mut block = stream.next_block();
            if i == 0 {
                mask_header_conflict(&mut block);
            }
            for (b, k) in data[i..obfs_len.min(i + XOR_STEP)].iter_mut().zip(block) {
                *b ^= k;
            }
        }
    }

    /// Pad a fixed-size frame with `NONCE_LEN + uniform(0, MAX_RANDOM_SUFFIX)`
    /// random bytes, substituting an all-zero MAC2 when the frame has one.
    /// Returns the prefix length to XOR.
    fn pad_fixed(&self, packet: &mut Packet, size: usize, mac2_offset: Option<usize>) -> usize {
        packet.set_len(size + NONCE_LEN + OsRng.gen_range(0..MAX_RANDOM_SUFFIX));

        let mut obfs_len = size;
        if let Some(offset) = mac2_offset {
            if packet.bytes()[offset..size].iter().all(|&b| b == 0) {
                packet.bytes_mut()[1] = ALTERED_MARKER;
                obfs_len = offset;
            }
        }
        OsRng.fill_bytes(&mut packet.bytes_mut()[obfs_len..]);
        obfs_len
    }

    /// Restore an obfuscated datagram in place.
    ///
    /// Canonical WireGuard frames pass through unchanged; the first-block
    /// mask guarantees obfuscated traffic never matches that check. Anything
    /// that reveals an unknown message type is left as junk for the caller
    /// to drop.
    pub fn deobfuscate(&self, packet: &mut Packet) {
        if !self.enabled || packet.len() < MIN_MESSAGE_SIZE {
            return;
        }
        {
            let data = packet.bytes();
            if (1..=4).contains(&data[0]) && data[1] == 0 && data[2] == 0 && data[3] == 0 {
                return;
            }
        }

        let nonce = nonce_of(packet);
        let mut stream = KeyStream::new(&nonce, &self.user_key_hash);

        // Reveal the message type first; the rest of the XOR region depends
        // on it.
        let mut block = stream.next_block();
        mask_header_conflict(&mut block);
        for (b, k) in packet.bytes_mut()[..XOR_STEP].iter_mut().zip(block) {
            *b ^= k;
        }

        let (msg_type, marked) = {
            let data = packet.bytes();
            (data[0] as u32, data[1] == ALTERED_MARKER)
        };
        let obfs_len = match msg_type {
            MSG_INITIATION => {
                packet.set_len(INITIATION_SIZE);
                if marked {
                    let data = packet.bytes_mut();
                    data[1] = 0;
                    data[INITIATION_MAC2_OFFSET..INITIATION_SIZE].fill(0);
                    INITIATION_MAC2_OFFSET
                } else {
                    INITIATION_SIZE
                }
            }
            MSG_RESPONSE => {
                packet.set_len(RESPONSE_SIZE);
                if marked {
                    let data = packet.bytes_mut();
                    data[1] = 0;
                    data[RESPONSE_MAC2_OFFSET..RESPONSE_SIZE].fill(0);
                    RESPONSE_MAC2_OFFSET
                } else {
                    RESPONSE_SIZE
                }
            }
            MSG_COOKIE_REPLY => {
                packet.set_len(COOKIE_REPLY_SIZE);
                COOKIE_REPLY_SIZE
            }
            MSG_TRANSPORT => {
                if marked {
                    packet.bytes_mut()[1] = 0;
                    let len = packet.len() - NONCE_LEN;
                    packet.set_len(len);
                }
                TRANSPORT_HEADER_SIZE
            }
            _ => return,
        };

        let data = packet.bytes_mut();
        for i in (XOR_STEP..obfs_len).step_by(XOR_STEP) {
            let block = stream.next_block();
            for (b, k) in data[i..obfs_len.min(i + XOR_STEP)].iter_mut().zip(block) {
                *b ^= k;
            }
        }

        packet.flags |= FLAG_DEOBFUSCATED_AFTER_RECEIVED;
    }
}

fn nonce_of(packet: &Packet) -> [u8; NONCE_LEN] {
    let data = packet.bytes();
    data[data.len() - NONCE_LEN..].try_into().unwrap()
}

/// Keystream of 8-byte blocks derived from `(nonce, user_key_hash)`.
///
/// One running XXH64 state: the nonce is written once, then the key hash is
/// appended before each block is snapshotted. Digest bytes are taken
/// big-endian, matching how a streaming xxhash sum is serialized.
struct KeyStream<'a> {
    digest: Xxh64,
    user_key_hash: &'a [u8; 32],
}

impl<'a> KeyStream<'a> {
    fn new(nonce: &[u8; NONCE_LEN], user_key_hash: &'a [u8; 32]) -> Self {
        let mut digest = Xxh64::new(0);
        digest.update(nonce);
        Self {
            digest,
            user_key_hash,
        }
    }

    fn next_block(&mut self) -> [u8; XOR_STEP] {
        self.digest.update(self.user_key_hash);
        self.digest.digest().to_be_bytes()
    }
}

/// Force the first keystream block away from patterns that could turn a
/// canonical WireGuard header `{1..4, 0, 0, 0}` into another canonical
/// header. Keeps the ingress pass-through check sound.
fn mask_header_conflict(block: &mut [u8; XOR_STEP]) {
    if block[0] & 0b1111_1000 == 0 && block[1] & 0b1111_1110 == 0 {
        block[0] |= 0b1101_0111;
        block[1] |= 0b0110_1001;
    }
}
