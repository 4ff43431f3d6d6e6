//! The Noise IKpsk2 prefix needed to classify handshake initiations.
//!
//! The proxy is not a WireGuard endpoint: it never completes a handshake and
//! never derives transport keys. It replays just enough of the initiator-side
//! message processing (`<- s`, `-> e, es, s, ss`) to decrypt the static
//! public key and timestamp out of an initiation frame, which is all the
//! routing layer needs.

use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit, Nonce};
use rand::rngs::OsRng;
pub use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::{byteorder::little_endian, AsBytes};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;
use crate::messages::{
    EncryptedPublicKey, EncryptedTimestamp, Mac, MessageInitiation, MSG_INITIATION,
};

/// Construction: the UTF-8 string literal "Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s".
/// Identifier: the UTF-8 string literal "WireGuard v1 zx2c4 Jason@zx2c4.com".
/// Ci := Hash(Construction)
/// Hi := Hash(Ci || Identifier)
const CONSTRUCTION_HASH: [u8; 32] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];
const IDENTIFIER_HASH: [u8; 32] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];
const LABEL_MAC1: [u8; 8] = *b"mac1----";

type Key = [u8; 32];

fn hash(msg: [&[u8]; 2]) -> [u8; 32] {
    use blake2::digest::Digest;
    let mut mac = blake2::Blake2s256::default();
    for msg in msg {
        mac.update(msg);
    }
    mac.finalize().into()
}

fn mac(key: &[u8], msg: &[u8]) -> Mac {
    use blake2::digest::{KeyInit, Mac};
    let mut mac: blake2::Blake2sMac<blake2::digest::consts::U16> =
        KeyInit::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn hkdf<const N: usize>(key: &Key, msg: &[u8]) -> [Key; N] {
    use hmac::{Mac, SimpleHmac};
    use blake2::digest::KeyInit;
    type Hmac = SimpleHmac<blake2::Blake2s256>;

    assert!(N <= 255);

    let mut output = [[0u8; 32]; N];

    if N == 0 {
        return output;
    }

    let t0 = {
        KeyInit::new_from_slice(key)
            .map(|h: Hmac| h)
            .unwrap()
            .chain_update(msg)
            .finalize()
            .into_bytes()
    };
    let new_hmac2 = || -> Hmac { KeyInit::new_from_slice(&t0).unwrap() };

    let mut ti = {
        let mut hmac2 = new_hmac2();
        hmac2.update(&[1]);
        hmac2.finalize().into_bytes()
    };
    output[0] = ti.into();

    for i in 1..N as u8 {
        ti = {
            let mut hmac2 = new_hmac2();
            hmac2.update(&ti[..]);
            hmac2.update(&[i + 1]);
            hmac2.finalize().into_bytes()
        };
        output[i as usize] = ti.into();
    }

    output
}

/// The running (chain, hash) pair of the handshake transcript.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    hash: [u8; 32],
    chain: Key,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self {
            chain: CONSTRUCTION_HASH,
            hash: IDENTIFIER_HASH,
        }
    }
}

impl HandshakeState {
    fn mix_chain(&mut self, b: &[u8]) {
        let [c] = hkdf(&self.chain, b);
        self.chain = c;
    }

    fn mix_key(&mut self, b: &[u8]) -> Key {
        let [c, k] = hkdf(&self.chain, b);
        self.chain = c;
        k
    }

    fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Key {
        self.mix_key(sk.diffie_hellman(pk).as_bytes())
    }

    fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash([&self.hash, b]);
    }
}

macro_rules! sealed {
    ($i:ident, $n:literal) => {
        impl $i {
            fn decrypt_and_hash(
                &mut self,
                state: &mut HandshakeState,
                key: &Key,
            ) -> Result<&mut [u8; $n], Error> {
                let aad = state.hash;
                state.mix_hash(self.as_bytes());

                ChaCha20Poly1305::new(key.into())
                    .decrypt_in_place_detached(
                        &Nonce::default(),
                        &aad,
                        &mut self.msg,
                        (&self.tag).into(),
                    )
                    .map_err(|_| Error::HandshakeDecryptFailed)?;
                Ok(&mut self.msg)
            }

            fn encrypt_and_hash(mut msg: [u8; $n], state: &mut HandshakeState, key: &Key) -> Self {
                let tag = ChaCha20Poly1305::new(key.into())
                    .encrypt_in_place_detached(&Nonce::default(), &state.hash, &mut msg)
                    .expect("message fits in a single aead block");

                let out = Self {
                    msg,
                    tag: tag.into(),
                };
                state.mix_hash(out.as_bytes());

                out
            }
        }
    };
}

sealed!(EncryptedPublicKey, 32);
sealed!(EncryptedTimestamp, 12);

/// The static public key and timestamp recovered from an initiation.
pub struct DecryptedInitiation {
    pub static_key: PublicKey,
    pub timestamp: [u8; 12],
}

/// Replay the responder side of the IK prefix against one candidate server
/// key. Succeeds only if `init` was actually addressed to that server, so a
/// failure here means "try the next server", not "malformed packet".
///
/// Works on a stack copy of the frame: the caller still owns the original
/// ciphertext bytes untouched, and forwards them verbatim.
pub fn decrypt_initiation(
    init: &MessageInitiation,
    private_key: &StaticSecret,
    public_key: &PublicKey,
) -> Result<DecryptedInitiation, Error> {
    let mut init = *init;
    let hs = &mut HandshakeState::default();

    // IKpsk2:
    // <- s
    // -> e, es, s, ss

    // <- s:
    hs.mix_hash(public_key.as_bytes());

    // -> e:
    // wireguard goes off-spec here with mix-chain.
    hs.mix_chain(&init.ephemeral_key);
    hs.mix_hash(&init.ephemeral_key);

    // -> es:
    let epk_i = PublicKey::from(init.ephemeral_key);
    let k = hs.mix_key_dh(private_key, &epk_i);

    // -> s:
    let spk_i = PublicKey::from(*init.static_key.decrypt_and_hash(hs, &k)?);

    // -> ss:
    let k = hs.mix_key_dh(private_key, &spk_i);

    // payload:
    let timestamp = *init.timestamp.decrypt_and_hash(hs, &k)?;

    Ok(DecryptedInitiation {
        static_key: spk_i,
        timestamp,
    })
}

/// Build a genuine initiation frame addressed to `responder_public`.
///
/// The proxy never originates handshakes; this is the interop counterpart of
/// [`decrypt_initiation`] used to drive the proxy end to end in tests and by
/// library consumers that need to probe a served endpoint. MAC2 is left zero,
/// as a client without a cookie sends it.
pub fn encrypt_initiation(
    initiator_secret: &StaticSecret,
    responder_public: &PublicKey,
    sender: u32,
    timestamp: [u8; 12],
) -> MessageInitiation {
    let hs = &mut HandshakeState::default();
    let esk_i = StaticSecret::random_from_rng(OsRng);
    let epk_i = PublicKey::from(&esk_i);
    let spk_i = PublicKey::from(initiator_secret);

    // <- s:
    hs.mix_hash(responder_public.as_bytes());

    // -> e:
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    // -> es:
    let k = hs.mix_key_dh(&esk_i, responder_public);

    // -> s:
    let static_key = EncryptedPublicKey::encrypt_and_hash(spk_i.to_bytes(), hs, &k);

    // -> ss:
    let k = hs.mix_key_dh(initiator_secret, responder_public);

    // payload:
    let timestamp = EncryptedTimestamp::encrypt_and_hash(timestamp, hs, &k);

    let mut msg = MessageInitiation {
        _type: little_endian::U32::new(MSG_INITIATION),
        sender: little_endian::U32::new(sender),
        ephemeral_key: epk_i.to_bytes(),
        static_key,
        timestamp,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = mac(
        &mac1_key(responder_public),
        &msg.as_bytes()[..core::mem::offset_of!(MessageInitiation, mac1)],
    );

    msg
}

fn mac1_key(spk: &PublicKey) -> Key {
    hash([&LABEL_MAC1, spk.as_bytes()])
}
