//! The link handshake run on every new peer connection.
//!
//! Both sides open with VERSIONS. After the highest common version (at
//! least 3) is fixed, the responder sends CERTS, AUTH_CHALLENGE and
//! NETINFO; the initiator verifies the certificate chain, optionally
//! answers with AUTHENTICATE, and closes with its own NETINFO. Every
//! deviation moves the machine to BROKEN and the transport is torn down.
//!
//! Identity binding: the responder's CERTS carries its ed25519 key and a
//! signature over the VERSIONS transcript; AUTHENTICATE carries the
//! initiator's key and a signature over the transcript plus the challenge.
//! A peer's identity is recorded only after its signature verifies.

use std::net::IpAddr;

use rand::{CryptoRng, RngCore};
use tracing::{debug, info, warn};

use crate::cell::msg::{
    AuthChallengeMsg, AuthenticateMsg, CertsMsg, LinkCert, NetinfoMsg, VersionsMsg,
    AUTH_METHOD_ED25519_TRANSCRIPT, CERT_TYPE_IDENTITY, CERT_TYPE_LINK_AUTH,
};
use crate::cell::{Cell, CellBody};
use crate::provider::{identity_digest_of, verify_identity_signature, IdentityKeystore};
use veil_common::link::{MIN_LINK_VERSION, SUPPORTED_LINK_VERSIONS};
use veil_common::{Result, VeilError};

const RESPONDER_SIGN_PREFIX: &[u8] = b"veil-link-v1 responder";
const INITIATOR_SIGN_PREFIX: &[u8] = b"veil-link-v1 initiator";

/// Clock skew beyond which NETINFO timestamps are worth a warning.
const SKEW_WARN_SECS: i64 = 3600;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Observable state of the link handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// VERSIONS sent, waiting for the peer's.
    VersionsWait,
    /// Initiator only: versions agreed, waiting for CERTS.
    CertsWait,
    /// Initiator only: CERTS verified, waiting for AUTH_CHALLENGE.
    ChallengeWait,
    /// Waiting for the peer's NETINFO (responder may get AUTHENTICATE first).
    NetinfoWait,
    /// Terminal: the channel may carry circuits.
    Open,
    /// Terminal: a protocol violation occurred.
    Broken,
}

/// Everything the handshake needs from its environment.
pub struct LinkContext<'a> {
    pub keystore: &'a dyn IdentityKeystore,
    /// Wall clock for NETINFO, Unix seconds truncated to 32 bits.
    pub now_unix: u32,
    /// Address we see the peer at.
    pub peer_addr: Option<IpAddr>,
    /// Addresses we claim for ourselves.
    pub my_addrs: Vec<IpAddr>,
}

/// Outcome of the completed handshake, consumed when building the Channel.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub link_version: u16,
    /// Verified identity digest; `None` for an unauthenticated initiator.
    pub peer_identity: Option<[u8; 32]>,
    /// Peer clock minus ours at NETINFO time.
    pub clock_skew_secs: i64,
}

/// The link handshake state machine. Feed it decoded inbound cells; it
/// returns the cells to transmit.
pub struct LinkHandshake {
    role: HandshakeRole,
    state: HandshakeState,
    link_version: Option<u16>,
    transcript: blake3::Hasher,
    /// Transcript digest over both VERSIONS bodies, fixed when they are in.
    versions_digest: Option<[u8; 32]>,
    /// Challenge we issued (responder) or received (initiator).
    challenge: Option<[u8; 32]>,
    peer_identity: Option<[u8; 32]>,
    clock_skew_secs: i64,
    our_versions_body: Vec<u8>,
}

impl LinkHandshake {
    /// Start a handshake; the returned cells open the conversation.
    pub fn start(role: HandshakeRole) -> (Self, Vec<Cell>) {
        let versions = VersionsMsg::supported();
        let body = versions.encode();
        let hs = Self {
            role,
            state: HandshakeState::VersionsWait,
            link_version: None,
            transcript: blake3::Hasher::new(),
            versions_digest: None,
            challenge: None,
            peer_identity: None,
            clock_skew_secs: 0,
            our_versions_body: body,
        };
        (hs, vec![Cell::control(CellBody::Versions(versions))])
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == HandshakeState::Open
    }

    pub fn is_broken(&self) -> bool {
        self.state == HandshakeState::Broken
    }

    /// Negotiated version, available once VERSIONS completes. The codec
    /// must be switched to it before decoding the next cell.
    pub fn link_version(&self) -> Option<u16> {
        self.link_version
    }

    /// The verified result; only once OPEN.
    pub fn link_info(&self) -> Option<LinkInfo> {
        if self.state != HandshakeState::Open {
            return None;
        }
        Some(LinkInfo {
            link_version: self.link_version.unwrap_or(MIN_LINK_VERSION),
            peer_identity: self.peer_identity,
            clock_skew_secs: self.clock_skew_secs,
        })
    }

    /// Process one inbound cell, returning cells to send. Any error leaves
    /// the machine BROKEN.
    pub fn feed<R: RngCore + CryptoRng>(
        &mut self,
        cell: Cell,
        ctx: &LinkContext<'_>,
        rng: &mut R,
    ) -> Result<Vec<Cell>> {
        match self.feed_inner(cell, ctx, rng) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.state = HandshakeState::Broken;
                info!(error = %e, "link handshake failed");
                Err(e)
            }
        }
    }

    fn feed_inner<R: RngCore + CryptoRng>(
        &mut self,
        cell: Cell,
        ctx: &LinkContext<'_>,
        rng: &mut R,
    ) -> Result<Vec<Cell>> {
        if !cell.circ_id.is_control() {
            return Err(VeilError::protocol("handshake cell with non-zero circuit id"));
        }
        match (self.state, cell.body) {
            (HandshakeState::VersionsWait, CellBody::Versions(msg)) => {
                self.on_versions(msg, ctx, rng)
            }
            (HandshakeState::CertsWait, CellBody::Certs(msg)) => self.on_certs(msg),
            (HandshakeState::ChallengeWait, CellBody::AuthChallenge(msg)) => {
                self.on_challenge(msg, ctx)
            }
            (HandshakeState::NetinfoWait, CellBody::Authenticate(msg)) => self.on_authenticate(msg),
            (HandshakeState::NetinfoWait, CellBody::Netinfo(msg)) => self.on_netinfo(msg, ctx),
            // Padding is tolerated at any point and carries no state
            (_, CellBody::Padding) | (_, CellBody::Vpadding(_)) => Ok(Vec::new()),
            (state, body) => Err(VeilError::protocol(format!(
                "unexpected {} cell in handshake state {:?}",
                body.command(),
                state
            ))),
        }
    }

    fn on_versions<R: RngCore + CryptoRng>(
        &mut self,
        msg: VersionsMsg,
        ctx: &LinkContext<'_>,
        rng: &mut R,
    ) -> Result<Vec<Cell>> {
        let common = msg
            .common_version(SUPPORTED_LINK_VERSIONS)
            .filter(|v| *v >= MIN_LINK_VERSION)
            .ok_or_else(|| {
                VeilError::protocol(format!("no common link version in {:?}", msg.versions))
            })?;
        self.link_version = Some(common);
        debug!(version = common, role = ?self.role, "link version negotiated");

        // Transcript order is fixed: initiator's VERSIONS, then responder's.
        let theirs = msg.encode();
        match self.role {
            HandshakeRole::Initiator => {
                self.transcript.update(&self.our_versions_body);
                self.transcript.update(&theirs);
            }
            HandshakeRole::Responder => {
                self.transcript.update(&theirs);
                self.transcript.update(&self.our_versions_body);
            }
        }
        self.versions_digest = Some(*self.transcript.clone().finalize().as_bytes());

        match self.role {
            HandshakeRole::Initiator => {
                self.state = HandshakeState::CertsWait;
                Ok(Vec::new())
            }
            HandshakeRole::Responder => {
                // CERTS: our identity key plus a signature binding it to
                // this conversation.
                let digest = self
                    .versions_digest
                    .ok_or_else(|| VeilError::internal("versions digest missing"))?;
                let mut to_sign = RESPONDER_SIGN_PREFIX.to_vec();
                to_sign.extend_from_slice(&digest);
                let signature = ctx.keystore.sign_with_identity(&to_sign);
                let certs = CertsMsg::new(vec![
                    LinkCert {
                        cert_type: CERT_TYPE_IDENTITY,
                        body: ctx.keystore.identity_public().to_vec(),
                    },
                    LinkCert {
                        cert_type: CERT_TYPE_LINK_AUTH,
                        body: signature.to_vec(),
                    },
                ]);
                self.transcript.update(&certs.encode());

                let mut challenge = [0u8; 32];
                rng.fill_bytes(&mut challenge);
                self.challenge = Some(challenge);
                let auth_challenge = AuthChallengeMsg::new(challenge);
                self.transcript.update(&auth_challenge.encode());

                let netinfo = self.make_netinfo(ctx);
                self.state = HandshakeState::NetinfoWait;
                Ok(vec![
                    Cell::control(CellBody::Certs(certs)),
                    Cell::control(CellBody::AuthChallenge(auth_challenge)),
                    Cell::control(CellBody::Netinfo(netinfo)),
                ])
            }
        }
    }

    fn on_certs(&mut self, msg: CertsMsg) -> Result<Vec<Cell>> {
        let identity = msg
            .cert_of_type(CERT_TYPE_IDENTITY)
            .ok_or_else(|| VeilError::handshake("CERTS without identity"))?;
        let auth = msg
            .cert_of_type(CERT_TYPE_LINK_AUTH)
            .ok_or_else(|| VeilError::handshake("CERTS without link signature"))?;

        let public: [u8; 32] = identity
            .body
            .as_slice()
            .try_into()
            .map_err(|_| VeilError::handshake("bad identity key length"))?;
        let signature: [u8; 64] = auth
            .body
            .as_slice()
            .try_into()
            .map_err(|_| VeilError::handshake("bad link signature length"))?;

        let digest = self
            .versions_digest
            .ok_or_else(|| VeilError::internal("CERTS before VERSIONS"))?;
        let mut signed = RESPONDER_SIGN_PREFIX.to_vec();
        signed.extend_from_slice(&digest);
        verify_identity_signature(&public, &signed, &signature)?;

        // Identity is bound to the transport only now.
        self.peer_identity = Some(identity_digest_of(&public));
        self.transcript.update(&msg.encode());
        self.state = HandshakeState::ChallengeWait;
        Ok(Vec::new())
    }

    fn on_challenge(&mut self, msg: AuthChallengeMsg, ctx: &LinkContext<'_>) -> Result<Vec<Cell>> {
        self.challenge = Some(msg.challenge);
        self.transcript.update(&msg.encode());
        let auth_digest = *self.transcript.clone().finalize().as_bytes();

        let mut out = Vec::new();
        if msg.methods.contains(&AUTH_METHOD_ED25519_TRANSCRIPT) {
            let mut to_sign = INITIATOR_SIGN_PREFIX.to_vec();
            to_sign.extend_from_slice(&msg.challenge);
            to_sign.extend_from_slice(&auth_digest);
            let signature = ctx.keystore.sign_with_identity(&to_sign);

            let mut body = Vec::with_capacity(96);
            body.extend_from_slice(&ctx.keystore.identity_public());
            body.extend_from_slice(&signature);
            out.push(Cell::control(CellBody::Authenticate(AuthenticateMsg::new(
                AUTH_METHOD_ED25519_TRANSCRIPT,
                body,
            ))));
        }
        out.push(Cell::control(CellBody::Netinfo(self.make_netinfo(ctx))));
        self.state = HandshakeState::NetinfoWait;
        Ok(out)
    }

    fn on_authenticate(&mut self, msg: AuthenticateMsg) -> Result<Vec<Cell>> {
        if self.role != HandshakeRole::Responder {
            return Err(VeilError::protocol("AUTHENTICATE sent to initiator"));
        }
        if msg.auth_type != AUTH_METHOD_ED25519_TRANSCRIPT {
            return Err(VeilError::handshake(format!(
                "unsupported auth method {}",
                msg.auth_type
            )));
        }
        if msg.body.len() != 96 {
            return Err(VeilError::handshake("bad AUTHENTICATE body length"));
        }
        let public: [u8; 32] = msg.body[..32].try_into().expect("length checked");
        let signature: [u8; 64] = msg.body[32..96].try_into().expect("length checked");

        let challenge = self
            .challenge
            .ok_or_else(|| VeilError::internal("AUTHENTICATE before challenge"))?;
        let auth_digest = *self.transcript.clone().finalize().as_bytes();
        let mut signed = INITIATOR_SIGN_PREFIX.to_vec();
        signed.extend_from_slice(&challenge);
        signed.extend_from_slice(&auth_digest);
        verify_identity_signature(&public, &signed, &signature)?;

        self.peer_identity = Some(identity_digest_of(&public));
        debug!("initiator authenticated");
        Ok(Vec::new())
    }

    fn on_netinfo(&mut self, msg: NetinfoMsg, ctx: &LinkContext<'_>) -> Result<Vec<Cell>> {
        self.clock_skew_secs = i64::from(msg.timestamp) - i64::from(ctx.now_unix);
        if self.clock_skew_secs.abs() > SKEW_WARN_SECS {
            warn!(skew = self.clock_skew_secs, "large clock skew on link");
        }
        self.state = HandshakeState::Open;
        Ok(Vec::new())
    }

    fn make_netinfo(&self, ctx: &LinkContext<'_>) -> NetinfoMsg {
        NetinfoMsg::new(ctx.now_unix, ctx.peer_addr, ctx.my_addrs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalKeystore;

    fn ctx<'a>(keystore: &'a LocalKeystore) -> LinkContext<'a> {
        LinkContext {
            keystore,
            now_unix: 1_700_000_000,
            peer_addr: Some("192.0.2.5".parse().unwrap()),
            my_addrs: vec!["198.51.100.1".parse().unwrap()],
        }
    }

    /// Run both sides to completion, returning their final states.
    fn run_full_handshake() -> (LinkHandshake, LinkHandshake, LocalKeystore, LocalKeystore) {
        let mut rng = rand::thread_rng();
        let client_keys = LocalKeystore::from_seed([1; 32]);
        let server_keys = LocalKeystore::from_seed([2; 32]);

        let (mut client, client_out) = LinkHandshake::start(HandshakeRole::Initiator);
        let (mut server, server_out) = LinkHandshake::start(HandshakeRole::Responder);

        // Exchange the opening VERSIONS
        let mut to_client: Vec<Cell> = Vec::new();
        for cell in client_out {
            to_client.extend(server.feed(cell, &ctx(&server_keys), &mut rng).unwrap());
        }
        let mut to_server: Vec<Cell> = Vec::new();
        for cell in server_out.into_iter().chain(to_client) {
            to_server.extend(client.feed(cell, &ctx(&client_keys), &mut rng).unwrap());
        }
        for cell in to_server {
            let extra = server.feed(cell, &ctx(&server_keys), &mut rng).unwrap();
            assert!(extra.is_empty());
        }

        (client, server, client_keys, server_keys)
    }

    #[test]
    fn test_full_handshake_opens_both_sides() {
        let (client, server, client_keys, server_keys) = run_full_handshake();
        assert!(client.is_open());
        assert!(server.is_open());

        let client_info = client.link_info().unwrap();
        let server_info = server.link_info().unwrap();
        assert_eq!(client_info.link_version, server_info.link_version);
        assert!(client_info.link_version >= MIN_LINK_VERSION);

        // Each side has verified the other's identity
        assert_eq!(
            client_info.peer_identity,
            Some(identity_digest_of(&server_keys.identity_public()))
        );
        assert_eq!(
            server_info.peer_identity,
            Some(identity_digest_of(&client_keys.identity_public()))
        );
        assert_eq!(client_info.clock_skew_secs, 0);
    }

    #[test]
    fn test_no_common_version_breaks() {
        let mut rng = rand::thread_rng();
        let keys = LocalKeystore::from_seed([3; 32]);
        let (mut server, _) = LinkHandshake::start(HandshakeRole::Responder);

        let cell = Cell::control(CellBody::Versions(VersionsMsg::new(vec![1, 2])));
        assert!(server.feed(cell, &ctx(&keys), &mut rng).is_err());
        assert!(server.is_broken());
    }

    #[test]
    fn test_unexpected_cell_breaks() {
        let mut rng = rand::thread_rng();
        let keys = LocalKeystore::from_seed([3; 32]);
        let (mut server, _) = LinkHandshake::start(HandshakeRole::Responder);

        let cell = Cell::control(CellBody::Netinfo(NetinfoMsg::new(0, None, vec![])));
        assert!(server.feed(cell, &ctx(&keys), &mut rng).is_err());
        assert!(server.is_broken());
    }

    #[test]
    fn test_forged_certs_rejected() {
        let mut rng = rand::thread_rng();
        let client_keys = LocalKeystore::from_seed([1; 32]);
        let server_keys = LocalKeystore::from_seed([2; 32]);
        let rogue_keys = LocalKeystore::from_seed([9; 32]);

        let (mut client, client_out) = LinkHandshake::start(HandshakeRole::Initiator);
        let (mut server, server_out) = LinkHandshake::start(HandshakeRole::Responder);

        let server_cells: Vec<Cell> = client_out
            .into_iter()
            .flat_map(|c| server.feed(c, &ctx(&server_keys), &mut rng).unwrap())
            .collect();

        // Feed the server's VERSIONS, then replace its CERTS body with one
        // signed by a different key.
        let mut fed_versions = false;
        for cell in server_out.into_iter().chain(server_cells) {
            match &cell.body {
                CellBody::Versions(_) => {
                    client.feed(cell, &ctx(&client_keys), &mut rng).unwrap();
                    fed_versions = true;
                }
                CellBody::Certs(orig) => {
                    assert!(fed_versions);
                    let mut forged = orig.clone();
                    let sig = rogue_keys.sign_with_identity(b"unrelated");
                    forged.certs[1].body = sig.to_vec();
                    let result = client.feed(
                        Cell::control(CellBody::Certs(forged)),
                        &ctx(&client_keys),
                        &mut rng,
                    );
                    assert!(result.is_err());
                    assert!(client.is_broken());
                    return;
                }
                _ => {}
            }
        }
        panic!("server never sent CERTS");
    }

    #[test]
    fn test_handshake_cell_with_circ_id_breaks() {
        let mut rng = rand::thread_rng();
        let keys = LocalKeystore::from_seed([3; 32]);
        let (mut server, _) = LinkHandshake::start(HandshakeRole::Responder);

        let cell = Cell::new(
            crate::cell::CircId(4),
            CellBody::Versions(VersionsMsg::supported()),
        );
        assert!(server.feed(cell, &ctx(&keys), &mut rng).is_err());
    }

    #[test]
    fn test_link_info_unavailable_until_open() {
        let (hs, _) = LinkHandshake::start(HandshakeRole::Initiator);
        assert!(hs.link_info().is_none());
        assert_eq!(hs.state(), HandshakeState::VersionsWait);
    }
}
