//! Plaintext layout of relay cells.
//!
//! The 509-byte body is `command(1) | recognized(2) | stream_id(2) |
//! digest(4) | length(2) | data[...]`, zero-padded to the full width. The
//! recognized and digest fields are owned by the onion-crypto layer; this
//! module only knows where they live.

use std::net::IpAddr;
use veil_common::cell::{CELL_BODY_LEN, MAX_RELAY_DATA_LEN, RELAY_HEADER_LEN};
use veil_common::{Result, VeilError};

/// Stream id inside a circuit. Zero means the cell addresses the circuit
/// itself (circuit-level SENDME, EXTEND2, TRUNCATE...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u16);

impl StreamId {
    pub const CIRCUIT: StreamId = StreamId(0);

    pub fn is_circuit_level(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command byte of the inner relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCommand {
    Begin,
    Data,
    End,
    Connected,
    Sendme,
    /// Legacy v1 extend; recognized so it can be refused.
    ExtendLegacy,
    ExtendedLegacy,
    Truncate,
    Truncated,
    Drop,
    Resolve,
    Resolved,
    BeginDir,
    Extend2,
    Extended2,
    Unknown(u8),
}

impl RelayCommand {
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => Self::Begin,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Connected,
            5 => Self::Sendme,
            6 => Self::ExtendLegacy,
            7 => Self::ExtendedLegacy,
            8 => Self::Truncate,
            9 => Self::Truncated,
            10 => Self::Drop,
            11 => Self::Resolve,
            12 => Self::Resolved,
            13 => Self::BeginDir,
            14 => Self::Extend2,
            15 => Self::Extended2,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Begin => 1,
            Self::Data => 2,
            Self::End => 3,
            Self::Connected => 4,
            Self::Sendme => 5,
            Self::ExtendLegacy => 6,
            Self::ExtendedLegacy => 7,
            Self::Truncate => 8,
            Self::Truncated => 9,
            Self::Drop => 10,
            Self::Resolve => 11,
            Self::Resolved => 12,
            Self::BeginDir => 13,
            Self::Extend2 => 14,
            Self::Extended2 => 15,
            Self::Unknown(b) => *b,
        }
    }

    /// Commands that must be sent with stream id zero.
    pub fn is_circuit_level(&self) -> bool {
        matches!(
            self,
            Self::Extend2
                | Self::Extended2
                | Self::ExtendLegacy
                | Self::ExtendedLegacy
                | Self::Truncate
                | Self::Truncated
                | Self::Drop
        )
    }

    /// Commands that count against flow-control windows.
    pub fn counts_toward_windows(&self) -> bool {
        matches!(self, Self::Data)
    }
}

impl std::fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(b) => write!(f, "UNKNOWN({})", b),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Reason byte on a relay END cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    Misc,
    ResolveFailed,
    ConnectRefused,
    ExitPolicy,
    Destroy,
    Done,
    Timeout,
    NoRoute,
    Hibernating,
    Internal,
    ResourceLimit,
    ConnReset,
    Protocol,
    NotDirectory,
    Unknown(u8),
}

impl EndReason {
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => Self::Misc,
            2 => Self::ResolveFailed,
            3 => Self::ConnectRefused,
            4 => Self::ExitPolicy,
            5 => Self::Destroy,
            6 => Self::Done,
            7 => Self::Timeout,
            8 => Self::NoRoute,
            9 => Self::Hibernating,
            10 => Self::Internal,
            11 => Self::ResourceLimit,
            12 => Self::ConnReset,
            13 => Self::Protocol,
            14 => Self::NotDirectory,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Misc => 1,
            Self::ResolveFailed => 2,
            Self::ConnectRefused => 3,
            Self::ExitPolicy => 4,
            Self::Destroy => 5,
            Self::Done => 6,
            Self::Timeout => 7,
            Self::NoRoute => 8,
            Self::Hibernating => 9,
            Self::Internal => 10,
            Self::ResourceLimit => 11,
            Self::ConnReset => 12,
            Self::Protocol => 13,
            Self::NotDirectory => 14,
            Self::Unknown(b) => *b,
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The raw 509-byte body of a relay cell.
///
/// Opaque while onion-encrypted; once a hop recognizes it, [`RelayMsg::parse`]
/// gives the structured view.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayCellBody(pub Box<[u8; CELL_BODY_LEN]>);

/// Byte range of the recognized field.
pub const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;
/// Byte range of the digest field.
pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

impl RelayCellBody {
    pub fn zeroed() -> Self {
        Self(Box::new([0u8; CELL_BODY_LEN]))
    }

    pub fn from_bytes(bytes: [u8; CELL_BODY_LEN]) -> Self {
        Self(Box::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }

    pub fn recognized_field(&self) -> &[u8] {
        &self.0[RECOGNIZED_RANGE]
    }

    pub fn digest_field(&self) -> [u8; 4] {
        let mut d = [0u8; 4];
        d.copy_from_slice(&self.0[DIGEST_RANGE]);
        d
    }

    pub fn zero_recognized_and_digest(&mut self) {
        self.0[RECOGNIZED_RANGE].fill(0);
        self.0[DIGEST_RANGE].fill(0);
    }

    pub fn set_digest_field(&mut self, digest: &[u8; 4]) {
        self.0[DIGEST_RANGE].copy_from_slice(digest);
    }
}

impl std::fmt::Debug for RelayCellBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RelayCellBody({}...)", hex::encode(&self.0[..12]))
    }
}

/// Structured view of a recognized (plaintext) relay cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMsg {
    pub command: RelayCommand,
    pub stream_id: StreamId,
    pub data: Vec<u8>,
}

impl RelayMsg {
    pub fn new(command: RelayCommand, stream_id: StreamId, data: Vec<u8>) -> Self {
        Self {
            command,
            stream_id,
            data,
        }
    }

    /// Encode into a zero-padded body with recognized and digest zeroed.
    ///
    /// The onion layer fills the digest before encryption.
    pub fn encode(&self) -> Result<RelayCellBody> {
        if self.data.len() > MAX_RELAY_DATA_LEN {
            return Err(VeilError::malformed_cell(format!(
                "relay data length {} exceeds {}",
                self.data.len(),
                MAX_RELAY_DATA_LEN
            )));
        }
        let mut body = RelayCellBody::zeroed();
        let buf = body.as_mut_bytes();
        buf[0] = self.command.as_u8();
        // recognized (1..3) stays zero
        buf[3..5].copy_from_slice(&self.stream_id.0.to_be_bytes());
        // digest (5..9) stays zero
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.data.len()].copy_from_slice(&self.data);
        Ok(body)
    }

    /// Parse a recognized body. Rejects a length field past the capacity.
    pub fn parse(body: &RelayCellBody) -> Result<Self> {
        let buf = body.as_bytes();
        let command = RelayCommand::from_u8(buf[0]);
        let stream_id = StreamId(u16::from_be_bytes([buf[3], buf[4]]));
        let len = u16::from_be_bytes([buf[9], buf[10]]) as usize;
        if len > MAX_RELAY_DATA_LEN {
            return Err(VeilError::malformed_cell(format!(
                "relay length field {} exceeds {}",
                len, MAX_RELAY_DATA_LEN
            )));
        }
        let data = buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len].to_vec();
        Ok(Self {
            command,
            stream_id,
            data,
        })
    }
}

/// Payload of a BEGIN cell: `host:port` in ASCII, NUL, then 4 flag bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginPayload {
    pub target: String,
    pub flags: u32,
}

impl BeginPayload {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            flags: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.target.len() + 5);
        out.extend_from_slice(self.target.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.flags.to_be_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| VeilError::malformed_cell("BEGIN target not NUL-terminated"))?;
        let target = std::str::from_utf8(&data[..nul])
            .map_err(|_| VeilError::malformed_cell("BEGIN target not ASCII"))?
            .to_string();
        let rest = &data[nul + 1..];
        let flags = if rest.len() >= 4 {
            u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]])
        } else {
            0
        };
        Ok(Self { target, flags })
    }
}

/// Payload of a CONNECTED cell: the address the exit reached, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPayload {
    pub addr: Option<IpAddr>,
    pub ttl: u32,
}

impl ConnectedPayload {
    pub fn empty() -> Self {
        Self { addr: None, ttl: 0 }
    }

    pub fn new(addr: IpAddr, ttl: u32) -> Self {
        Self {
            addr: Some(addr),
            ttl,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self.addr {
            None => {}
            Some(IpAddr::V4(v4)) => {
                out.extend_from_slice(&v4.octets());
                out.extend_from_slice(&self.ttl.to_be_bytes());
            }
            Some(IpAddr::V6(v6)) => {
                // IPv6 form: four zero bytes, type 6, 16 address bytes
                out.extend_from_slice(&[0, 0, 0, 0, 6]);
                out.extend_from_slice(&v6.octets());
                out.extend_from_slice(&self.ttl.to_be_bytes());
            }
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::empty());
        }
        if data.len() >= 8 && data[..4] != [0, 0, 0, 0] {
            let mut oct = [0u8; 4];
            oct.copy_from_slice(&data[..4]);
            let ttl = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            return Ok(Self::new(IpAddr::from(oct), ttl));
        }
        if data.len() >= 25 && data[4] == 6 {
            let mut oct = [0u8; 16];
            oct.copy_from_slice(&data[5..21]);
            let ttl = u32::from_be_bytes([data[21], data[22], data[23], data[24]]);
            return Ok(Self::new(IpAddr::from(oct), ttl));
        }
        Err(VeilError::malformed_cell("bad CONNECTED payload"))
    }
}

/// Payload of a SENDME cell.
///
/// Version 1 carries the running-digest tag of the cell being acknowledged;
/// version 0 is the legacy unauthenticated form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendmePayload {
    pub version: u8,
    pub tag: Option<[u8; 20]>,
}

impl SendmePayload {
    pub fn authenticated(tag: [u8; 20]) -> Self {
        Self {
            version: 1,
            tag: Some(tag),
        }
    }

    pub fn legacy() -> Self {
        Self {
            version: 0,
            tag: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self.tag {
            None => Vec::new(),
            Some(tag) => {
                let mut out = Vec::with_capacity(3 + tag.len());
                out.push(self.version);
                out.extend_from_slice(&(tag.len() as u16).to_be_bytes());
                out.extend_from_slice(&tag);
                out
            }
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::legacy());
        }
        if data.len() < 3 {
            return Err(VeilError::malformed_cell("truncated SENDME payload"));
        }
        let version = data[0];
        let len = u16::from_be_bytes([data[1], data[2]]) as usize;
        if version != 1 {
            return Err(VeilError::protocol(format!(
                "unsupported SENDME version {}",
                version
            )));
        }
        if len != 20 || data.len() < 3 + 20 {
            return Err(VeilError::malformed_cell("bad SENDME tag length"));
        }
        let mut tag = [0u8; 20];
        tag.copy_from_slice(&data[3..23]);
        Ok(Self {
            version,
            tag: Some(tag),
        })
    }
}

/// One link specifier inside an EXTEND2 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// IPv4 address and port (type 0, 6 bytes)
    Ipv4(std::net::SocketAddrV4),
    /// Identity digest of the next relay (type 2, 32 bytes)
    Identity([u8; 32]),
    /// Unrecognized specifier, carried through untouched
    Other { kind: u8, body: Vec<u8> },
}

/// Payload of an EXTEND2 cell: link specifiers plus a handshake blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2Payload {
    pub specs: Vec<LinkSpec>,
    pub handshake_type: u16,
    pub handshake: Vec<u8>,
}

impl Extend2Payload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.specs.len() as u8);
        for spec in &self.specs {
            match spec {
                LinkSpec::Ipv4(sa) => {
                    out.push(0);
                    out.push(6);
                    out.extend_from_slice(&sa.ip().octets());
                    out.extend_from_slice(&sa.port().to_be_bytes());
                }
                LinkSpec::Identity(id) => {
                    out.push(2);
                    out.push(32);
                    out.extend_from_slice(id);
                }
                LinkSpec::Other { kind, body } => {
                    out.push(*kind);
                    out.push(body.len() as u8);
                    out.extend_from_slice(body);
                }
            }
        }
        out.extend_from_slice(&self.handshake_type.to_be_bytes());
        out.extend_from_slice(&(self.handshake.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.handshake);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let err = || VeilError::malformed_cell("truncated EXTEND2 payload");
        let mut pos = 0usize;
        let nspec = *data.first().ok_or_else(err)? as usize;
        pos += 1;
        let mut specs = Vec::with_capacity(nspec);
        for _ in 0..nspec {
            if data.len() < pos + 2 {
                return Err(err());
            }
            let kind = data[pos];
            let len = data[pos + 1] as usize;
            pos += 2;
            if data.len() < pos + len {
                return Err(err());
            }
            let body = &data[pos..pos + len];
            pos += len;
            let spec = match (kind, len) {
                (0, 6) => {
                    let ip = std::net::Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                    let port = u16::from_be_bytes([body[4], body[5]]);
                    LinkSpec::Ipv4(std::net::SocketAddrV4::new(ip, port))
                }
                (2, 32) => {
                    let mut id = [0u8; 32];
                    id.copy_from_slice(body);
                    LinkSpec::Identity(id)
                }
                _ => LinkSpec::Other {
                    kind,
                    body: body.to_vec(),
                },
            };
            specs.push(spec);
        }
        if data.len() < pos + 4 {
            return Err(err());
        }
        let handshake_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let hlen = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if data.len() < pos + hlen {
            return Err(err());
        }
        let handshake = data[pos..pos + hlen].to_vec();
        Ok(Self {
            specs,
            handshake_type,
            handshake,
        })
    }

    /// The identity specifier, if present.
    pub fn identity(&self) -> Option<[u8; 32]> {
        self.specs.iter().find_map(|s| match s {
            LinkSpec::Identity(id) => Some(*id),
            _ => None,
        })
    }

    /// The IPv4 target, if present.
    pub fn ipv4(&self) -> Option<std::net::SocketAddrV4> {
        self.specs.iter().find_map(|s| match s {
            LinkSpec::Ipv4(sa) => Some(*sa),
            _ => None,
        })
    }
}

/// Payload of an EXTENDED2 cell: the responder's handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extended2Payload {
    pub handshake: Vec<u8>,
}

impl Extended2Payload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.handshake.len());
        out.extend_from_slice(&(self.handshake.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.handshake);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(VeilError::malformed_cell("truncated EXTENDED2 payload"));
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() < 2 + len {
            return Err(VeilError::malformed_cell("truncated EXTENDED2 payload"));
        }
        Ok(Self {
            handshake: data[2..2 + len].to_vec(),
        })
    }
}

/// One answer inside a RESOLVED cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAnswer {
    Ip(IpAddr),
    Hostname(String),
    TransientError,
    NontransientError,
}

/// Payload of a RESOLVED cell: a list of answers with TTLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPayload {
    pub answers: Vec<(ResolvedAnswer, u32)>,
}

impl ResolvedPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (answer, ttl) in &self.answers {
            match answer {
                ResolvedAnswer::Ip(IpAddr::V4(v4)) => {
                    out.push(4);
                    out.push(4);
                    out.extend_from_slice(&v4.octets());
                }
                ResolvedAnswer::Ip(IpAddr::V6(v6)) => {
                    out.push(6);
                    out.push(16);
                    out.extend_from_slice(&v6.octets());
                }
                ResolvedAnswer::Hostname(name) => {
                    out.push(0);
                    out.push(name.len() as u8);
                    out.extend_from_slice(name.as_bytes());
                }
                ResolvedAnswer::TransientError => {
                    out.push(0xF0);
                    out.push(0);
                }
                ResolvedAnswer::NontransientError => {
                    out.push(0xF1);
                    out.push(0);
                }
            }
            out.extend_from_slice(&ttl.to_be_bytes());
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let err = || VeilError::malformed_cell("truncated RESOLVED payload");
        let mut pos = 0usize;
        let mut answers = Vec::new();
        while pos < data.len() {
            if data.len() < pos + 2 {
                return Err(err());
            }
            let kind = data[pos];
            let len = data[pos + 1] as usize;
            pos += 2;
            if data.len() < pos + len + 4 {
                return Err(err());
            }
            let body = &data[pos..pos + len];
            pos += len;
            let ttl = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
            let answer = match (kind, len) {
                (4, 4) => {
                    let mut oct = [0u8; 4];
                    oct.copy_from_slice(body);
                    ResolvedAnswer::Ip(IpAddr::from(oct))
                }
                (6, 16) => {
                    let mut oct = [0u8; 16];
                    oct.copy_from_slice(body);
                    ResolvedAnswer::Ip(IpAddr::from(oct))
                }
                (0, _) => ResolvedAnswer::Hostname(
                    std::str::from_utf8(body)
                        .map_err(|_| VeilError::malformed_cell("RESOLVED hostname not ASCII"))?
                        .to_string(),
                ),
                (0xF0, _) => ResolvedAnswer::TransientError,
                (0xF1, _) => ResolvedAnswer::NontransientError,
                _ => return Err(VeilError::malformed_cell("bad RESOLVED answer type")),
            };
            answers.push((answer, ttl));
        }
        Ok(Self { answers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_msg_roundtrip() {
        let msg = RelayMsg::new(
            RelayCommand::Data,
            StreamId(7),
            b"GET / HTTP/1.0\r\n".to_vec(),
        );
        let body = msg.encode().unwrap();
        assert_eq!(body.recognized_field(), &[0, 0]);
        assert_eq!(body.digest_field(), [0; 4]);
        let parsed = RelayMsg::parse(&body).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_relay_msg_max_len() {
        let msg = RelayMsg::new(
            RelayCommand::Data,
            StreamId(1),
            vec![0xAA; MAX_RELAY_DATA_LEN],
        );
        assert!(msg.encode().is_ok());

        let too_big = RelayMsg::new(
            RelayCommand::Data,
            StreamId(1),
            vec![0xAA; MAX_RELAY_DATA_LEN + 1],
        );
        assert!(too_big.encode().is_err());
    }

    #[test]
    fn test_relay_parse_rejects_oversized_length_field() {
        let msg = RelayMsg::new(RelayCommand::Data, StreamId(1), vec![1, 2, 3]);
        let mut body = msg.encode().unwrap();
        // Corrupt the length field to 499
        let bytes = body.as_mut_bytes();
        bytes[9..11].copy_from_slice(&499u16.to_be_bytes());
        assert!(RelayMsg::parse(&body).is_err());
    }

    #[test]
    fn test_begin_payload_roundtrip() {
        let begin = BeginPayload::new("198.51.100.7:80");
        let parsed = BeginPayload::parse(&begin.encode()).unwrap();
        assert_eq!(parsed, begin);
    }

    #[test]
    fn test_begin_payload_missing_nul() {
        assert!(BeginPayload::parse(b"example.com:80").is_err());
    }

    #[test]
    fn test_connected_payload_v4() {
        let conn = ConnectedPayload::new("198.51.100.7".parse().unwrap(), 600);
        let parsed = ConnectedPayload::parse(&conn.encode()).unwrap();
        assert_eq!(parsed, conn);
    }

    #[test]
    fn test_connected_payload_v6() {
        let conn = ConnectedPayload::new("2001:db8::1".parse().unwrap(), 60);
        let parsed = ConnectedPayload::parse(&conn.encode()).unwrap();
        assert_eq!(parsed, conn);
    }

    #[test]
    fn test_connected_payload_empty() {
        let parsed = ConnectedPayload::parse(&[]).unwrap();
        assert_eq!(parsed, ConnectedPayload::empty());
    }

    #[test]
    fn test_sendme_payload_roundtrip() {
        let sendme = SendmePayload::authenticated([0x42; 20]);
        let parsed = SendmePayload::parse(&sendme.encode()).unwrap();
        assert_eq!(parsed, sendme);
    }

    #[test]
    fn test_sendme_rejects_bad_version() {
        let mut bytes = SendmePayload::authenticated([0x42; 20]).encode();
        bytes[0] = 2;
        assert!(SendmePayload::parse(&bytes).is_err());
    }

    #[test]
    fn test_extend2_roundtrip() {
        let payload = Extend2Payload {
            specs: vec![
                LinkSpec::Ipv4("192.0.2.9:9001".parse().unwrap()),
                LinkSpec::Identity([7; 32]),
            ],
            handshake_type: 2,
            handshake: vec![9; 96],
        };
        let parsed = Extend2Payload::parse(&payload.encode()).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(parsed.identity(), Some([7; 32]));
        assert!(parsed.ipv4().is_some());
    }

    #[test]
    fn test_resolved_roundtrip() {
        let payload = ResolvedPayload {
            answers: vec![
                (ResolvedAnswer::Ip("198.51.100.7".parse().unwrap()), 300),
                (ResolvedAnswer::Hostname("example.com".to_string()), 60),
            ],
        };
        let parsed = ResolvedPayload::parse(&payload.encode()).unwrap();
        assert_eq!(parsed, payload);
    }
}
