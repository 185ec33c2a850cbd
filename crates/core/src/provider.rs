//! Interfaces the relay core consumes from the rest of the system.
//!
//! Path selection, identity keys, DNS, exit policy and time are external
//! collaborators: the core only sees these traits. Tests and the daemon
//! plug in their own implementations.

use std::net::{IpAddr, SocketAddr};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};

use crate::circuit::CircuitPurpose;
use veil_common::{Result, VeilError};

/// One hop a path provider hands back: who to reach, how to key to them,
/// and where they listen.
#[derive(Debug, Clone)]
pub struct HopSpec {
    /// Identity digest of the relay
    pub identity: [u8; 32],
    /// X25519 onion key used by the extension handshake
    pub onion_key: [u8; 32],
    /// Transport address
    pub addr: SocketAddr,
}

/// Chooses the hops for a new circuit.
pub trait PathProvider: Send {
    fn next_hops_for(&self, purpose: CircuitPurpose) -> Result<Vec<HopSpec>>;
}

/// Provider for a pure relay: this node never builds its own circuits.
pub struct NoPaths;

impl PathProvider for NoPaths {
    fn next_hops_for(&self, _purpose: CircuitPurpose) -> Result<Vec<HopSpec>> {
        Err(VeilError::internal("this node does not build circuits"))
    }
}

/// A fixed path, used by clients with externally chosen routes and by
/// tests.
pub struct StaticPathProvider {
    hops: Vec<HopSpec>,
}

impl StaticPathProvider {
    pub fn new(hops: Vec<HopSpec>) -> Self {
        Self { hops }
    }
}

impl PathProvider for StaticPathProvider {
    fn next_hops_for(&self, _purpose: CircuitPurpose) -> Result<Vec<HopSpec>> {
        if self.hops.is_empty() {
            return Err(VeilError::internal("no path configured"));
        }
        Ok(self.hops.clone())
    }
}

/// Access to this node's long-term identity signing key.
pub trait IdentityKeystore: Send + Sync {
    /// Raw ed25519 verifying key bytes.
    fn identity_public(&self) -> [u8; 32];

    /// Digest under which peers index this identity.
    fn my_identity_digest(&self) -> [u8; 32] {
        *blake3::hash(&self.identity_public()).as_bytes()
    }

    fn sign_with_identity(&self, bytes: &[u8]) -> [u8; 64];
}

/// Verify a signature against a claimed identity key.
pub fn verify_identity_signature(public: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public)
        .map_err(|_| VeilError::handshake("bad identity key"))?;
    key.verify(msg, &Signature::from_bytes(sig))
        .map_err(|_| VeilError::handshake("bad identity signature"))
}

/// Digest under which an identity key is indexed.
pub fn identity_digest_of(public: &[u8; 32]) -> [u8; 32] {
    *blake3::hash(public).as_bytes()
}

/// In-process keystore holding the signing key directly.
pub struct LocalKeystore {
    signing: SigningKey,
}

impl LocalKeystore {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }
}

impl IdentityKeystore for LocalKeystore {
    fn identity_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    fn sign_with_identity(&self, bytes: &[u8]) -> [u8; 64] {
        self.signing.sign(bytes).to_bytes()
    }
}

/// Name resolution on the exit side. The core itself only emits resolve
/// requests; the runtime performs them through this interface.
pub trait Resolver: Send + Sync {
    fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>>;
    fn reverse(&self, addr: IpAddr) -> Result<String>;
}

/// Resolver backed by the system's stub resolver.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        use std::net::ToSocketAddrs;
        let addrs = (hostname, 0u16)
            .to_socket_addrs()
            .map_err(|e| VeilError::ResolveFailed(e.to_string()))?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(VeilError::ResolveFailed(format!("no answers for {hostname}")));
        }
        Ok(ips)
    }

    fn reverse(&self, addr: IpAddr) -> Result<String> {
        // The stub resolver gives no PTR interface; answer with an error
        // the engine maps to RESOLVED(nontransient).
        Err(VeilError::ResolveFailed(format!("no reverse record for {addr}")))
    }
}

/// Which targets this exit will open connections to.
pub trait ExitPolicy: Send {
    fn allow(&self, addr: IpAddr, port: u16) -> bool;
}

/// A policy that admits everything; tests and non-exit nodes use it.
pub struct OpenExitPolicy;

impl ExitPolicy for OpenExitPolicy {
    fn allow(&self, _addr: IpAddr, _port: u16) -> bool {
        true
    }
}

/// A policy refusing everything, for relays that never exit.
pub struct RejectAllPolicy;

impl ExitPolicy for RejectAllPolicy {
    fn allow(&self, _addr: IpAddr, _port: u16) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystore_sign_verify() {
        let keystore = LocalKeystore::from_seed([5; 32]);
        let msg = b"transcript digest";
        let sig = keystore.sign_with_identity(msg);
        verify_identity_signature(&keystore.identity_public(), msg, &sig).unwrap();
    }

    #[test]
    fn test_bad_signature_rejected() {
        let keystore = LocalKeystore::from_seed([5; 32]);
        let mut sig = keystore.sign_with_identity(b"msg");
        sig[10] ^= 1;
        assert!(verify_identity_signature(&keystore.identity_public(), b"msg", &sig).is_err());
    }

    #[test]
    fn test_identity_digest_stable() {
        let keystore = LocalKeystore::from_seed([6; 32]);
        assert_eq!(
            keystore.my_identity_digest(),
            identity_digest_of(&keystore.identity_public())
        );
    }
}
