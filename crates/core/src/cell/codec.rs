//! Encoding and decoding of cells against a channel's link version.
//!
//! Before VERSIONS negotiation completes the codec accepts only the legacy
//! 2-byte-circuit-id form, and only VERSIONS itself. After negotiation,
//! circuit ids are 2 bytes (link version 3) or 4 bytes (version 4+).
//! VERSIONS is always encoded in the legacy form; a VERSIONS arriving after
//! negotiation is decoded normally and rejected by the channel.

use bytes::{BufMut, BytesMut};
use veil_common::cell::{CELL_BODY_LEN, MAX_VAR_CELL_LEN};
use veil_common::link::WIDE_CIRC_ID_VERSION;
use veil_common::{Result, VeilError};

use super::msg::{
    AuthChallengeMsg, AuthenticateMsg, CertsMsg, Create2Msg, CreateFastMsg, Created2Msg,
    CreatedFastMsg, NetinfoMsg, VersionsMsg,
};
use super::relay::RelayCellBody;
use super::{Cell, CellBody, CellCommand, CircId, DestroyReason};

/// Encoder/decoder for one channel's cell stream.
pub struct CellCodec {
    /// Negotiated link version; `None` until VERSIONS completes.
    link_version: Option<u16>,
}

impl CellCodec {
    /// A codec in the pre-negotiation state.
    pub fn new() -> Self {
        Self { link_version: None }
    }

    /// A codec for an already-negotiated link version (used in tests and by
    /// forwarding harnesses).
    pub fn with_link_version(version: u16) -> Self {
        Self {
            link_version: Some(version),
        }
    }

    pub fn set_link_version(&mut self, version: u16) {
        self.link_version = Some(version);
    }

    pub fn link_version(&self) -> Option<u16> {
        self.link_version
    }

    fn wide_ids(&self) -> bool {
        self.link_version
            .map_or(false, |v| v >= WIDE_CIRC_ID_VERSION)
    }

    /// Decode one full cell from `src`, advancing it past the consumed
    /// bytes. Returns `Ok(None)` when more bytes are needed.
    pub fn decode_next(&mut self, src: &mut BytesMut) -> Result<Option<Cell>> {
        if self.link_version.is_none() {
            return self.decode_pre_negotiation(src);
        }

        let id_len = if self.wide_ids() { 4 } else { 2 };
        if src.len() < id_len + 1 {
            return Ok(None);
        }
        let cmd = CellCommand::from_u8(src[id_len]);

        let total = if cmd.is_var_len() {
            if src.len() < id_len + 3 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[id_len + 1], src[id_len + 2]]) as usize;
            if len > MAX_VAR_CELL_LEN {
                return Err(VeilError::malformed_cell(format!(
                    "variable cell length {} exceeds bound",
                    len
                )));
            }
            id_len + 3 + len
        } else {
            id_len + 1 + CELL_BODY_LEN
        };
        if src.len() < total {
            return Ok(None);
        }

        let frame = src.split_to(total);
        let circ_id = if id_len == 4 {
            CircId(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]))
        } else {
            CircId(u16::from_be_bytes([frame[0], frame[1]]) as u32)
        };
        let body_start = if cmd.is_var_len() { id_len + 3 } else { id_len + 1 };
        let body = decode_body(cmd, &frame[body_start..])?;
        Ok(Some(Cell::new(circ_id, body)))
    }

    /// Only the legacy VERSIONS form is legal before negotiation.
    fn decode_pre_negotiation(&mut self, src: &mut BytesMut) -> Result<Option<Cell>> {
        if src.len() < 3 {
            return Ok(None);
        }
        let cmd = CellCommand::from_u8(src[2]);
        if cmd != CellCommand::Versions {
            return Err(VeilError::protocol(format!(
                "{} cell before version negotiation",
                cmd
            )));
        }
        if src.len() < 5 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[3], src[4]]) as usize;
        if src.len() < 5 + len {
            return Ok(None);
        }
        let frame = src.split_to(5 + len);
        let circ_id = CircId(u16::from_be_bytes([frame[0], frame[1]]) as u32);
        let msg = VersionsMsg::parse(&frame[5..])?;
        Ok(Some(Cell::new(circ_id, CellBody::Versions(msg))))
    }

    /// Write exactly one cell onto `dst`.
    pub fn encode(&self, cell: &Cell, dst: &mut BytesMut) -> Result<()> {
        let cmd = cell.command();

        // VERSIONS keeps the 2-byte id form on every link version.
        if cmd == CellCommand::Versions {
            let body = body_bytes(&cell.body)?;
            dst.put_u16(cell.circ_id.0 as u16);
            dst.put_u8(cmd.as_u8());
            dst.put_u16(body.len() as u16);
            dst.put_slice(&body);
            return Ok(());
        }

        if self.link_version.is_none() {
            return Err(VeilError::internal(format!(
                "encoding {} before version negotiation",
                cmd
            )));
        }

        let body = body_bytes(&cell.body)?;
        if self.wide_ids() {
            dst.put_u32(cell.circ_id.0);
        } else {
            dst.put_u16(cell.circ_id.0 as u16);
        }
        dst.put_u8(cmd.as_u8());

        if cmd.is_var_len() {
            if body.len() > MAX_VAR_CELL_LEN {
                return Err(VeilError::internal("variable cell body too long"));
            }
            dst.put_u16(body.len() as u16);
            dst.put_slice(&body);
        } else {
            if body.len() > CELL_BODY_LEN {
                return Err(VeilError::internal("fixed cell body too long"));
            }
            dst.put_slice(&body);
            // Zero-pad to the full fixed width
            dst.put_bytes(0, CELL_BODY_LEN - body.len());
        }
        Ok(())
    }
}

impl Default for CellCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(cmd: CellCommand, data: &[u8]) -> Result<CellBody> {
    let body = match cmd {
        CellCommand::Padding => CellBody::Padding,
        CellCommand::Vpadding => CellBody::Vpadding(data.len()),
        CellCommand::Versions => CellBody::Versions(VersionsMsg::parse(data)?),
        CellCommand::Certs => CellBody::Certs(CertsMsg::parse(data)?),
        CellCommand::AuthChallenge => CellBody::AuthChallenge(AuthChallengeMsg::parse(data)?),
        CellCommand::Authenticate => CellBody::Authenticate(AuthenticateMsg::parse(data)?),
        CellCommand::Netinfo => CellBody::Netinfo(NetinfoMsg::parse(data)?),
        CellCommand::Create2 => CellBody::Create2(Create2Msg::parse(data)?),
        CellCommand::Created2 => CellBody::Created2(Created2Msg::parse(data)?),
        CellCommand::CreateFast => CellBody::CreateFast(CreateFastMsg::parse(data)?),
        CellCommand::CreatedFast => CellBody::CreatedFast(CreatedFastMsg::parse(data)?),
        CellCommand::Relay | CellCommand::RelayEarly => {
            if data.len() != CELL_BODY_LEN {
                return Err(VeilError::malformed_cell("relay body with bad length"));
            }
            let mut bytes = [0u8; CELL_BODY_LEN];
            bytes.copy_from_slice(data);
            let body = RelayCellBody::from_bytes(bytes);
            if cmd == CellCommand::Relay {
                CellBody::Relay(body)
            } else {
                CellBody::RelayEarly(body)
            }
        }
        CellCommand::Destroy => {
            let reason = data
                .first()
                .map(|b| DestroyReason::from_u8(*b))
                .unwrap_or(DestroyReason::None);
            CellBody::Destroy(reason)
        }
        CellCommand::CreateLegacy | CellCommand::CreatedLegacy => CellBody::CreateLegacy,
        CellCommand::Unknown(b) => CellBody::Unknown { cmd: b },
    };
    Ok(body)
}

fn body_bytes(body: &CellBody) -> Result<Vec<u8>> {
    let bytes = match body {
        CellBody::Padding => Vec::new(),
        CellBody::Vpadding(n) => vec![0u8; *n],
        CellBody::Versions(m) => m.encode(),
        CellBody::Certs(m) => m.encode(),
        CellBody::AuthChallenge(m) => m.encode(),
        CellBody::Authenticate(m) => m.encode(),
        CellBody::Netinfo(m) => m.encode(),
        CellBody::Create2(m) => m.encode(),
        CellBody::Created2(m) => m.encode(),
        CellBody::CreateFast(m) => m.encode(),
        CellBody::CreatedFast(m) => m.encode(),
        CellBody::Relay(b) | CellBody::RelayEarly(b) => b.as_bytes().to_vec(),
        CellBody::Destroy(reason) => vec![reason.as_u8()],
        CellBody::CreateLegacy | CellBody::Unknown { .. } => {
            return Err(VeilError::internal("encoding an unsendable cell body"))
        }
    };
    Ok(bytes)
}
