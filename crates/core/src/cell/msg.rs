//! Payloads of channel-level control cells.
//!
//! Each message knows how to encode itself onto a byte vector and parse
//! itself from a received body. Framing (ids, lengths, padding) belongs to
//! the codec.

use std::net::IpAddr;
use veil_common::{Result, VeilError};

/// VERSIONS: the link versions the sender speaks, two bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsMsg {
    pub versions: Vec<u16>,
}

impl VersionsMsg {
    pub fn new(versions: Vec<u16>) -> Self {
        Self { versions }
    }

    /// Our own advertisement.
    pub fn supported() -> Self {
        Self::new(veil_common::link::SUPPORTED_LINK_VERSIONS.to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.versions.len() * 2);
        for v in &self.versions {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() % 2 != 0 {
            return Err(VeilError::malformed_cell("odd VERSIONS body length"));
        }
        let versions = data
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { versions })
    }

    /// Highest version present in both lists, if any.
    pub fn common_version(&self, ours: &[u16]) -> Option<u16> {
        self.versions
            .iter()
            .filter(|v| ours.contains(v))
            .max()
            .copied()
    }
}

/// One certificate inside a CERTS cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCert {
    pub cert_type: u8,
    pub body: Vec<u8>,
}

/// Certificate type: the long-term identity key itself.
pub const CERT_TYPE_IDENTITY: u8 = 1;
/// Certificate type: signature of the link transcript key by the identity.
pub const CERT_TYPE_LINK_AUTH: u8 = 2;

/// CERTS: the certificates binding the peer's identity to this link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertsMsg {
    pub certs: Vec<LinkCert>,
}

impl CertsMsg {
    pub fn new(certs: Vec<LinkCert>) -> Self {
        Self { certs }
    }

    pub fn cert_of_type(&self, cert_type: u8) -> Option<&LinkCert> {
        self.certs.iter().find(|c| c.cert_type == cert_type)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.certs.len() as u8);
        for cert in &self.certs {
            out.push(cert.cert_type);
            out.extend_from_slice(&(cert.body.len() as u16).to_be_bytes());
            out.extend_from_slice(&cert.body);
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let err = || VeilError::malformed_cell("truncated CERTS body");
        let ncerts = *data.first().ok_or_else(err)? as usize;
        let mut pos = 1usize;
        let mut certs = Vec::with_capacity(ncerts);
        for _ in 0..ncerts {
            if data.len() < pos + 3 {
                return Err(err());
            }
            let cert_type = data[pos];
            let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
            pos += 3;
            if data.len() < pos + len {
                return Err(err());
            }
            certs.push(LinkCert {
                cert_type,
                body: data[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        Ok(Self { certs })
    }
}

/// AUTH_CHALLENGE: random challenge plus accepted authentication methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallengeMsg {
    pub challenge: [u8; 32],
    pub methods: Vec<u16>,
}

/// The only authentication method this implementation accepts: an ed25519
/// signature over the link transcript.
pub const AUTH_METHOD_ED25519_TRANSCRIPT: u16 = 3;

impl AuthChallengeMsg {
    pub fn new(challenge: [u8; 32]) -> Self {
        Self {
            challenge,
            methods: vec![AUTH_METHOD_ED25519_TRANSCRIPT],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 2 + self.methods.len() * 2);
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend_from_slice(&m.to_be_bytes());
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 34 {
            return Err(VeilError::malformed_cell("truncated AUTH_CHALLENGE body"));
        }
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&data[..32]);
        let nmethods = u16::from_be_bytes([data[32], data[33]]) as usize;
        if data.len() < 34 + nmethods * 2 {
            return Err(VeilError::malformed_cell("truncated AUTH_CHALLENGE body"));
        }
        let methods = data[34..34 + nmethods * 2]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { challenge, methods })
    }
}

/// AUTHENTICATE: the initiator's signature over the link transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateMsg {
    pub auth_type: u16,
    pub body: Vec<u8>,
}

impl AuthenticateMsg {
    pub fn new(auth_type: u16, body: Vec<u8>) -> Self {
        Self { auth_type, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.body.len());
        out.extend_from_slice(&self.auth_type.to_be_bytes());
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(VeilError::malformed_cell("truncated AUTHENTICATE body"));
        }
        let auth_type = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Err(VeilError::malformed_cell("truncated AUTHENTICATE body"));
        }
        Ok(Self {
            auth_type,
            body: data[4..4 + len].to_vec(),
        })
    }
}

/// NETINFO: timestamp plus each side's view of the addresses in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetinfoMsg {
    /// Sender's wall clock, Unix seconds truncated to 32 bits
    pub timestamp: u32,
    /// The address the sender believes it is talking to
    pub other_addr: Option<IpAddr>,
    /// Addresses the sender claims for itself
    pub my_addrs: Vec<IpAddr>,
}

fn encode_addr(out: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            out.push(4);
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
}

fn parse_addr(data: &[u8], pos: &mut usize) -> Result<Option<IpAddr>> {
    let err = || VeilError::malformed_cell("truncated NETINFO address");
    if data.len() < *pos + 2 {
        return Err(err());
    }
    let kind = data[*pos];
    let len = data[*pos + 1] as usize;
    *pos += 2;
    if data.len() < *pos + len {
        return Err(err());
    }
    let body = &data[*pos..*pos + len];
    *pos += len;
    let addr = match (kind, len) {
        (4, 4) => {
            let mut oct = [0u8; 4];
            oct.copy_from_slice(body);
            Some(IpAddr::from(oct))
        }
        (6, 16) => {
            let mut oct = [0u8; 16];
            oct.copy_from_slice(body);
            Some(IpAddr::from(oct))
        }
        // Unknown address types are skipped, not fatal
        _ => None,
    };
    Ok(addr)
}

impl NetinfoMsg {
    pub fn new(timestamp: u32, other_addr: Option<IpAddr>, my_addrs: Vec<IpAddr>) -> Self {
        Self {
            timestamp,
            other_addr,
            my_addrs,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        match &self.other_addr {
            Some(addr) => encode_addr(&mut out, addr),
            // "no address": type 0, length 0
            None => {
                out.push(0);
                out.push(0);
            }
        }
        out.push(self.my_addrs.len() as u8);
        for addr in &self.my_addrs {
            encode_addr(&mut out, addr);
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(VeilError::malformed_cell("truncated NETINFO body"));
        }
        let timestamp = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut pos = 4usize;
        let other_addr = parse_addr(data, &mut pos)?;
        if data.len() < pos + 1 {
            return Err(VeilError::malformed_cell("truncated NETINFO body"));
        }
        let naddrs = data[pos] as usize;
        pos += 1;
        let mut my_addrs = Vec::with_capacity(naddrs);
        for _ in 0..naddrs {
            if let Some(addr) = parse_addr(data, &mut pos)? {
                my_addrs.push(addr);
            }
        }
        Ok(Self {
            timestamp,
            other_addr,
            my_addrs,
        })
    }
}

/// CREATE2: handshake type plus the initiator's onionskin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Msg {
    pub handshake_type: u16,
    pub handshake: Vec<u8>,
}

impl Create2Msg {
    pub fn new(handshake_type: u16, handshake: Vec<u8>) -> Self {
        Self {
            handshake_type,
            handshake,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.handshake.len());
        out.extend_from_slice(&self.handshake_type.to_be_bytes());
        out.extend_from_slice(&(self.handshake.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.handshake);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(VeilError::malformed_cell("truncated CREATE2 body"));
        }
        let handshake_type = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Err(VeilError::malformed_cell("truncated CREATE2 body"));
        }
        Ok(Self {
            handshake_type,
            handshake: data[4..4 + len].to_vec(),
        })
    }
}

/// CREATED2: the responder's handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created2Msg {
    pub handshake: Vec<u8>,
}

impl Created2Msg {
    pub fn new(handshake: Vec<u8>) -> Self {
        Self { handshake }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.handshake.len());
        out.extend_from_slice(&(self.handshake.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.handshake);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(VeilError::malformed_cell("truncated CREATED2 body"));
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() < 2 + len {
            return Err(VeilError::malformed_cell("truncated CREATED2 body"));
        }
        Ok(Self {
            handshake: data[2..2 + len].to_vec(),
        })
    }
}

/// CREATE_FAST: first-hop creation without asymmetric work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFastMsg {
    pub x: [u8; 32],
}

impl CreateFastMsg {
    pub fn encode(&self) -> Vec<u8> {
        self.x.to_vec()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(VeilError::malformed_cell("truncated CREATE_FAST body"));
        }
        let mut x = [0u8; 32];
        x.copy_from_slice(&data[..32]);
        Ok(Self { x })
    }
}

/// CREATED_FAST: responder material plus a key-derivation check value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedFastMsg {
    pub y: [u8; 32],
    pub derivative: [u8; 32],
}

impl CreatedFastMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.y);
        out.extend_from_slice(&self.derivative);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 64 {
            return Err(VeilError::malformed_cell("truncated CREATED_FAST body"));
        }
        let mut y = [0u8; 32];
        let mut derivative = [0u8; 32];
        y.copy_from_slice(&data[..32]);
        derivative.copy_from_slice(&data[32..64]);
        Ok(Self { y, derivative })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_roundtrip() {
        let msg = VersionsMsg::new(vec![3, 4, 5]);
        let parsed = VersionsMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_versions_odd_length_rejected() {
        assert!(VersionsMsg::parse(&[0, 3, 0]).is_err());
    }

    #[test]
    fn test_common_version() {
        let theirs = VersionsMsg::new(vec![2, 3, 4]);
        assert_eq!(theirs.common_version(&[3, 4, 5]), Some(4));

        let theirs = VersionsMsg::new(vec![1, 2]);
        assert_eq!(theirs.common_version(&[3, 4, 5]), None);
    }

    #[test]
    fn test_certs_roundtrip() {
        let msg = CertsMsg::new(vec![
            LinkCert {
                cert_type: CERT_TYPE_IDENTITY,
                body: vec![1; 32],
            },
            LinkCert {
                cert_type: CERT_TYPE_LINK_AUTH,
                body: vec![2; 64],
            },
        ]);
        let parsed = CertsMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.cert_of_type(CERT_TYPE_IDENTITY).is_some());
        assert!(parsed.cert_of_type(99).is_none());
    }

    #[test]
    fn test_auth_challenge_roundtrip() {
        let msg = AuthChallengeMsg::new([9; 32]);
        let parsed = AuthChallengeMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_netinfo_roundtrip() {
        let msg = NetinfoMsg::new(
            1_700_000_000,
            Some("198.51.100.7".parse().unwrap()),
            vec!["192.0.2.1".parse().unwrap(), "2001:db8::2".parse().unwrap()],
        );
        let parsed = NetinfoMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_netinfo_no_other_addr() {
        let msg = NetinfoMsg::new(0, None, vec![]);
        let parsed = NetinfoMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_create2_roundtrip() {
        let msg = Create2Msg::new(2, vec![0xAB; 96]);
        let parsed = Create2Msg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_created_fast_roundtrip() {
        let msg = CreatedFastMsg {
            y: [1; 32],
            derivative: [2; 32],
        };
        let parsed = CreatedFastMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
    }
}
