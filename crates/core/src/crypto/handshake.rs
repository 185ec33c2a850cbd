//! Circuit-extension handshakes.
//!
//! The standard handshake is ntor-style: the initiator sends its ephemeral
//! X25519 key bound to the responder's identity and onion key; the responder
//! answers with its own ephemeral key and a MAC over the shared transcript.
//! Both sides derive the per-direction cipher keys, IVs and digest seeds
//! from the shared secret. CREATE_FAST is the first-hop shortcut with no
//! asymmetric work, never usable to extend.

use rand::{CryptoRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey, ReusableSecret, StaticSecret};

use super::layer::LayerKeys;
use crate::cell::msg::{CreateFastMsg, CreatedFastMsg};
use crate::util::ct;
use veil_common::{Result, VeilError};

/// Handshake-type value carried in CREATE2/EXTEND2.
pub const HANDSHAKE_TYPE_NTOR: u16 = 2;

/// Initiator blob: identity(32) | onion key B(32) | ephemeral X(32).
pub const NTOR_ONIONSKIN_LEN: usize = 96;

/// Responder blob: ephemeral Y(32) | auth MAC(32).
pub const NTOR_REPLY_LEN: usize = 64;

const KDF_CONTEXT_SEED: &str = "veil-ntor-v1 key seed";
const KDF_CONTEXT_VERIFY: &str = "veil-ntor-v1 verify";
const KDF_CONTEXT_EXPAND: &str = "veil-circuit-v1 key expand";
const KDF_CONTEXT_FAST_SEED: &str = "veil-fast-v1 key seed";
const KDF_CONTEXT_FAST_CHECK: &str = "veil-fast-v1 check";
const AUTH_SUFFIX: &[u8] = b"veil-ntor-v1 server";

/// Shared-secret seed from which a hop's key material is expanded.
pub struct KeySeed([u8; 32]);

impl KeySeed {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Expand into the forward/backward cipher keys, IVs and digest seeds.
    pub fn expand(&self) -> HopKeyMaterial {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_EXPAND);
        hasher.update(&self.0);
        let mut xof = hasher.finalize_xof();

        let mut df = [0u8; 32];
        let mut db = [0u8; 32];
        let mut kf = [0u8; 32];
        let mut kb = [0u8; 32];
        let mut nf = [0u8; 12];
        let mut nb = [0u8; 12];
        xof.fill(&mut df);
        xof.fill(&mut db);
        xof.fill(&mut kf);
        xof.fill(&mut kb);
        xof.fill(&mut nf);
        xof.fill(&mut nb);

        HopKeyMaterial {
            forward: LayerKeys {
                key: kf,
                iv: nf,
                digest_seed: df,
            },
            backward: LayerKeys {
                key: kb,
                iv: nb,
                digest_seed: db,
            },
        }
    }
}

impl std::fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySeed").finish_non_exhaustive()
    }
}

/// Expanded key material for one hop, both directions.
pub struct HopKeyMaterial {
    pub forward: LayerKeys,
    pub backward: LayerKeys,
}

/// A relay's long-term onion keypair, the `B`/`b` of the handshake.
pub struct OnionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl OnionKeypair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild the keypair from persisted secret bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }
}

impl std::fmt::Debug for OnionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Everything a responder needs to answer CREATE2 cells.
pub struct ResponderKeys {
    pub identity_digest: [u8; 32],
    pub onion: OnionKeypair,
}

fn derive(
    xy: &[u8; 32],
    xb: &[u8; 32],
    identity: &[u8; 32],
    b_pub: &[u8; 32],
    x_pub: &[u8; 32],
    y_pub: &[u8; 32],
) -> (KeySeed, [u8; 32]) {
    let mut secret_input = Vec::with_capacity(32 * 6);
    secret_input.extend_from_slice(xy);
    secret_input.extend_from_slice(xb);
    secret_input.extend_from_slice(identity);
    secret_input.extend_from_slice(b_pub);
    secret_input.extend_from_slice(x_pub);
    secret_input.extend_from_slice(y_pub);

    let seed = blake3::derive_key(KDF_CONTEXT_SEED, &secret_input);
    let verify = blake3::derive_key(KDF_CONTEXT_VERIFY, &secret_input);

    let mut auth_input = Vec::with_capacity(32 * 4 + AUTH_SUFFIX.len());
    auth_input.extend_from_slice(identity);
    auth_input.extend_from_slice(b_pub);
    auth_input.extend_from_slice(x_pub);
    auth_input.extend_from_slice(y_pub);
    auth_input.extend_from_slice(AUTH_SUFFIX);
    let auth = *blake3::keyed_hash(&verify, &auth_input).as_bytes();

    (KeySeed::from_bytes(seed), auth)
}

/// Initiator side of the ntor-style handshake.
pub struct ClientHandshake {
    x: ReusableSecret,
    x_pub: PublicKey,
    peer_identity: [u8; 32],
    peer_onion: PublicKey,
}

impl ClientHandshake {
    /// Produce the onionskin for a CREATE2/EXTEND2 toward the given relay.
    pub fn start<R: RngCore + CryptoRng>(
        rng: &mut R,
        peer_identity: [u8; 32],
        peer_onion_key: [u8; 32],
    ) -> (Self, Vec<u8>) {
        let x = ReusableSecret::random_from_rng(&mut *rng);
        let x_pub = PublicKey::from(&x);
        let peer_onion = PublicKey::from(peer_onion_key);

        let mut onionskin = Vec::with_capacity(NTOR_ONIONSKIN_LEN);
        onionskin.extend_from_slice(&peer_identity);
        onionskin.extend_from_slice(&peer_onion_key);
        onionskin.extend_from_slice(x_pub.as_bytes());

        (
            Self {
                x,
                x_pub,
                peer_identity,
                peer_onion,
            },
            onionskin,
        )
    }

    /// Verify the responder's reply and derive the shared seed.
    pub fn complete(self, reply: &[u8]) -> Result<KeySeed> {
        if reply.len() != NTOR_REPLY_LEN {
            return Err(VeilError::handshake("bad handshake reply length"));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[..32]);
        let y_pub = PublicKey::from(y_bytes);

        let xy = *self.x.diffie_hellman(&y_pub).as_bytes();
        let xb = *self.x.diffie_hellman(&self.peer_onion).as_bytes();
        if ct::is_zero(&xy) || ct::is_zero(&xb) {
            return Err(VeilError::handshake("degenerate handshake key"));
        }

        let (seed, auth) = derive(
            &xy,
            &xb,
            &self.peer_identity,
            self.peer_onion.as_bytes(),
            self.x_pub.as_bytes(),
            y_pub.as_bytes(),
        );
        if !ct::bytes_eq(&auth, &reply[32..64]) {
            return Err(VeilError::handshake("handshake MAC mismatch"));
        }
        Ok(seed)
    }
}

/// Responder side: answer an onionskin with a reply blob and the seed.
pub fn respond<R: RngCore + CryptoRng>(
    rng: &mut R,
    keys: &ResponderKeys,
    onionskin: &[u8],
) -> Result<(Vec<u8>, KeySeed)> {
    if onionskin.len() != NTOR_ONIONSKIN_LEN {
        return Err(VeilError::handshake("bad onionskin length"));
    }
    let mut identity = [0u8; 32];
    let mut b_bytes = [0u8; 32];
    let mut x_bytes = [0u8; 32];
    identity.copy_from_slice(&onionskin[..32]);
    b_bytes.copy_from_slice(&onionskin[32..64]);
    x_bytes.copy_from_slice(&onionskin[64..96]);

    if identity != keys.identity_digest {
        return Err(VeilError::handshake("onionskin addressed to another relay"));
    }
    if b_bytes != keys.onion.public_bytes() {
        return Err(VeilError::handshake("onionskin built for a stale onion key"));
    }

    let x_pub = PublicKey::from(x_bytes);
    let y = EphemeralSecret::random_from_rng(&mut *rng);
    let y_pub = PublicKey::from(&y);

    let xy = *y.diffie_hellman(&x_pub).as_bytes();
    let xb = *keys.onion.secret.diffie_hellman(&x_pub).as_bytes();
    if ct::is_zero(&xy) || ct::is_zero(&xb) {
        return Err(VeilError::handshake("degenerate handshake key"));
    }

    let (seed, auth) = derive(
        &xy,
        &xb,
        &identity,
        &b_bytes,
        &x_bytes,
        y_pub.as_bytes(),
    );

    let mut reply = Vec::with_capacity(NTOR_REPLY_LEN);
    reply.extend_from_slice(y_pub.as_bytes());
    reply.extend_from_slice(&auth);
    Ok((reply, seed))
}

/// Initiator side of CREATE_FAST.
pub struct FastClientHandshake {
    x: [u8; 32],
}

impl FastClientHandshake {
    pub fn start<R: RngCore + CryptoRng>(rng: &mut R) -> (Self, CreateFastMsg) {
        let mut x = [0u8; 32];
        rng.fill_bytes(&mut x);
        (Self { x }, CreateFastMsg { x })
    }

    pub fn complete(self, reply: &CreatedFastMsg) -> Result<KeySeed> {
        let (seed, derivative) = fast_derive(&self.x, &reply.y);
        if !ct::bytes_eq(&derivative, &reply.derivative) {
            return Err(VeilError::handshake("CREATE_FAST check value mismatch"));
        }
        Ok(seed)
    }
}

/// Responder side of CREATE_FAST.
pub fn fast_respond<R: RngCore + CryptoRng>(
    rng: &mut R,
    msg: &CreateFastMsg,
) -> (CreatedFastMsg, KeySeed) {
    let mut y = [0u8; 32];
    rng.fill_bytes(&mut y);
    let (seed, derivative) = fast_derive(&msg.x, &y);
    (CreatedFastMsg { y, derivative }, seed)
}

fn fast_derive(x: &[u8; 32], y: &[u8; 32]) -> (KeySeed, [u8; 32]) {
    let mut material = Vec::with_capacity(64);
    material.extend_from_slice(x);
    material.extend_from_slice(y);
    let seed = blake3::derive_key(KDF_CONTEXT_FAST_SEED, &material);
    let check = blake3::derive_key(KDF_CONTEXT_FAST_CHECK, &material);
    (KeySeed::from_bytes(seed), check)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder_keys<R: RngCore + CryptoRng>(rng: &mut R) -> ResponderKeys {
        let onion = OnionKeypair::generate(rng);
        ResponderKeys {
            identity_digest: [0x44; 32],
            onion,
        }
    }

    #[test]
    fn test_ntor_both_sides_agree() {
        let mut rng = rand::thread_rng();
        let keys = responder_keys(&mut rng);

        let (client, onionskin) =
            ClientHandshake::start(&mut rng, keys.identity_digest, keys.onion.public_bytes());
        let (reply, server_seed) = respond(&mut rng, &keys, &onionskin).unwrap();
        let client_seed = client.complete(&reply).unwrap();

        assert_eq!(client_seed.as_bytes(), server_seed.as_bytes());
    }

    #[test]
    fn test_ntor_tampered_reply_rejected() {
        let mut rng = rand::thread_rng();
        let keys = responder_keys(&mut rng);

        let (client, onionskin) =
            ClientHandshake::start(&mut rng, keys.identity_digest, keys.onion.public_bytes());
        let (mut reply, _) = respond(&mut rng, &keys, &onionskin).unwrap();
        reply[40] ^= 0x01;
        assert!(client.complete(&reply).is_err());
    }

    #[test]
    fn test_ntor_wrong_identity_refused() {
        let mut rng = rand::thread_rng();
        let keys = responder_keys(&mut rng);

        let (_, mut onionskin) =
            ClientHandshake::start(&mut rng, keys.identity_digest, keys.onion.public_bytes());
        onionskin[0] ^= 0xFF;
        assert!(respond(&mut rng, &keys, &onionskin).is_err());
    }

    #[test]
    fn test_ntor_stale_onion_key_refused() {
        let mut rng = rand::thread_rng();
        let keys = responder_keys(&mut rng);
        let other = OnionKeypair::generate(&mut rng);

        let (_, onionskin) =
            ClientHandshake::start(&mut rng, keys.identity_digest, other.public_bytes());
        assert!(respond(&mut rng, &keys, &onionskin).is_err());
    }

    #[test]
    fn test_fast_handshake_agrees() {
        let mut rng = rand::thread_rng();
        let (client, create) = FastClientHandshake::start(&mut rng);
        let (created, server_seed) = fast_respond(&mut rng, &create);
        let client_seed = client.complete(&created).unwrap();
        assert_eq!(client_seed.as_bytes(), server_seed.as_bytes());
    }

    #[test]
    fn test_fast_handshake_bad_check_rejected() {
        let mut rng = rand::thread_rng();
        let (client, create) = FastClientHandshake::start(&mut rng);
        let (mut created, _) = fast_respond(&mut rng, &create);
        created.derivative[3] ^= 0x10;
        assert!(client.complete(&created).is_err());
    }

    #[test]
    fn test_key_expansion_directions_differ() {
        let seed = KeySeed::from_bytes([7; 32]);
        let material = seed.expand();
        assert_ne!(material.forward.key, material.backward.key);
        assert_ne!(material.forward.digest_seed, material.backward.digest_seed);
        assert_ne!(material.forward.iv, material.backward.iv);
    }

    #[test]
    fn test_key_expansion_deterministic() {
        let a = KeySeed::from_bytes([9; 32]).expand();
        let b = KeySeed::from_bytes([9; 32]).expand();
        assert_eq!(a.forward.key, b.forward.key);
        assert_eq!(a.backward.iv, b.backward.iv);
    }
}
