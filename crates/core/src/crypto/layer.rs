//! Per-hop relay-cell cryptography.
//!
//! Each hop of a circuit shares two stream ciphers and two running digests
//! with the origin, one pair per direction. A cell destined for a hop has
//! its recognized field zeroed and the leading bytes of that hop's running
//! digest written into its digest field before encryption; after the right
//! number of decryptions the receiving hop sees `recognized == 0` and a
//! matching digest, and knows the cell is addressed to it.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;

use crate::cell::relay::{RelayCellBody, DIGEST_RANGE};
use crate::util::ct;
use veil_common::{Result, VeilError};

/// Bytes of the running digest echoed inside an authenticated SENDME.
pub const SENDME_TAG_LEN: usize = 20;

/// Truncated running-digest value identifying one relay cell.
pub type SendmeTag = [u8; SENDME_TAG_LEN];

fn tag_from(digest: &[u8; 32]) -> SendmeTag {
    let mut tag = [0u8; SENDME_TAG_LEN];
    tag.copy_from_slice(&digest[..SENDME_TAG_LEN]);
    tag
}

/// Key material for one direction of one hop.
pub struct LayerKeys {
    pub key: [u8; 32],
    pub iv: [u8; 12],
    pub digest_seed: [u8; 32],
}

/// One direction of one hop's shared state: a stream cipher plus a running
/// digest over every relay cell recognized in that direction.
pub struct RelayCrypt {
    cipher: ChaCha20,
    digest: blake3::Hasher,
    last_digest: [u8; 32],
}

impl std::fmt::Debug for RelayCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCrypt").finish_non_exhaustive()
    }
}

impl RelayCrypt {
    pub fn new(keys: &LayerKeys) -> Self {
        let cipher = ChaCha20::new((&keys.key).into(), (&keys.iv).into());
        let mut digest = blake3::Hasher::new();
        digest.update(&keys.digest_seed);
        Self {
            cipher,
            digest,
            last_digest: [0u8; 32],
        }
    }

    /// Prepare a cell originating here for the peer sharing this state:
    /// set the digest field, fold the cell into the running digest, then
    /// encrypt. Returns the tag a future SENDME may echo.
    pub fn originate(&mut self, body: &mut RelayCellBody) -> SendmeTag {
        self.set_digest(body);
        self.cipher.apply_keystream(body.as_mut_bytes());
        tag_from(&self.last_digest)
    }

    /// Apply this layer's keystream without any recognition check.
    pub fn crypt(&mut self, body: &mut RelayCellBody) {
        self.cipher.apply_keystream(body.as_mut_bytes());
    }

    /// Remove one layer and test whether the plaintext is addressed to the
    /// holder of this state. On recognition the running digest absorbs the
    /// cell and the tag is returned.
    pub fn decrypt_recognize(&mut self, body: &mut RelayCellBody) -> Option<SendmeTag> {
        self.cipher.apply_keystream(body.as_mut_bytes());
        if self.is_recognized(body) {
            Some(tag_from(&self.last_digest))
        } else {
            None
        }
    }

    fn set_digest(&mut self, body: &mut RelayCellBody) {
        body.zero_recognized_and_digest();
        self.digest.update(body.as_bytes());
        let snapshot = *self.digest.clone().finalize().as_bytes();
        self.last_digest = snapshot;
        let mut field = [0u8; 4];
        field.copy_from_slice(&snapshot[..4]);
        body.set_digest_field(&field);
    }

    fn is_recognized(&mut self, body: &RelayCellBody) -> bool {
        if !ct::is_zero(body.recognized_field()) {
            return false;
        }

        // Digest of the body as it was hashed by the sender: the digest
        // field itself counted as zeros.
        let mut trial = self.digest.clone();
        trial.update(&body.as_bytes()[..DIGEST_RANGE.start]);
        trial.update(&[0u8; 4]);
        trial.update(&body.as_bytes()[DIGEST_RANGE.end..]);
        let advanced = trial.clone();
        let result = *trial.finalize().as_bytes();

        if ct::bytes_eq(&body.digest_field(), &result[..4]) {
            self.digest = advanced;
            self.last_digest = result;
            true
        } else {
            false
        }
    }
}

/// Outbound pipeline at the origin: one forward layer per hop, index 0 for
/// the first hop.
pub struct OutboundClientCrypt {
    layers: Vec<RelayCrypt>,
}

impl OutboundClientCrypt {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn add_layer(&mut self, layer: RelayCrypt) {
        self.layers.push(layer);
    }

    /// Drop the layers past `n_hops`, for a truncated circuit.
    pub fn truncate(&mut self, n_hops: usize) {
        self.layers.truncate(n_hops);
    }

    /// Onion-encrypt `body` for the hop at `hop` (0-based): originate at
    /// that hop's layer, then add each earlier hop's layer so the first
    /// hop's encryption is outermost.
    pub fn encrypt(&mut self, body: &mut RelayCellBody, hop: usize) -> Result<SendmeTag> {
        let layer = self
            .layers
            .get_mut(hop)
            .ok_or_else(|| VeilError::internal(format!("no crypto layer for hop {}", hop)))?;
        let tag = layer.originate(body);
        for layer in self.layers[..hop].iter_mut().rev() {
            layer.crypt(body);
        }
        Ok(tag)
    }
}

impl Default for OutboundClientCrypt {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound pipeline at the origin: one backward layer per hop.
pub struct InboundClientCrypt {
    layers: Vec<RelayCrypt>,
}

impl InboundClientCrypt {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn add_layer(&mut self, layer: RelayCrypt) {
        self.layers.push(layer);
    }

    /// Drop the layers past `n_hops`, for a truncated circuit.
    pub fn truncate(&mut self, n_hops: usize) {
        self.layers.truncate(n_hops);
    }

    /// Decrypt hop by hop; the first layer that recognizes the plaintext
    /// identifies the cell's source. `None` means no hop matched and the
    /// cell is noise.
    pub fn decrypt(&mut self, body: &mut RelayCellBody) -> Option<(usize, SendmeTag)> {
        for (hop, layer) in self.layers.iter_mut().enumerate() {
            if let Some(tag) = layer.decrypt_recognize(body) {
                return Some((hop, tag));
            }
        }
        None
    }
}

impl Default for InboundClientCrypt {
    fn default() -> Self {
        Self::new()
    }
}

/// The single layer a forwarding node holds for one circuit.
pub struct RelayLayerCrypt {
    fwd: RelayCrypt,
    back: RelayCrypt,
}

impl RelayLayerCrypt {
    pub fn new(fwd: RelayCrypt, back: RelayCrypt) -> Self {
        Self { fwd, back }
    }

    /// Cell arriving from the previous hop (flowing away from the origin):
    /// strip our layer; `Some` if the plaintext is addressed to us.
    pub fn decrypt_forward(&mut self, body: &mut RelayCellBody) -> Option<SendmeTag> {
        self.fwd.decrypt_recognize(body)
    }

    /// Cell arriving from the next hop (flowing toward the origin): add our
    /// backward layer before passing it on.
    pub fn encrypt_back(&mut self, body: &mut RelayCellBody) {
        self.back.crypt(body);
    }

    /// Originate a cell here, addressed to the origin.
    pub fn originate_back(&mut self, body: &mut RelayCellBody) -> SendmeTag {
        self.back.originate(body)
    }
}
