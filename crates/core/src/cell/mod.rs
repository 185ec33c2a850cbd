//! Cells: the fixed quantum of transmission on a channel.
//!
//! A cell is either fixed-width (509-byte body after the circuit id and
//! command) or variable-width (16-bit length prefix). Relay cells carry the
//! onion-encrypted inner protocol and are treated as opaque bodies here;
//! their plaintext layout lives in [`relay`].

pub mod codec;
pub mod msg;
pub mod relay;

pub use codec::CellCodec;
pub use msg::{
    AuthChallengeMsg, AuthenticateMsg, CertsMsg, Create2Msg, CreateFastMsg, Created2Msg,
    CreatedFastMsg, LinkCert, NetinfoMsg, VersionsMsg, AUTH_METHOD_ED25519_TRANSCRIPT,
    CERT_TYPE_IDENTITY, CERT_TYPE_LINK_AUTH,
};
pub use relay::{
    BeginPayload, ConnectedPayload, EndReason, Extend2Payload, Extended2Payload, LinkSpec,
    RelayCellBody, RelayCommand, RelayMsg, ResolvedAnswer, ResolvedPayload, SendmePayload,
    StreamId,
};

use veil_common::{Result, VeilError};

/// Circuit id scoped to one channel.
///
/// Id zero addresses the channel itself and never names a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircId(pub u32);

impl CircId {
    /// The id used by channel-level control cells.
    pub const CONTROL: CircId = CircId(0);

    pub fn is_control(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command byte of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellCommand {
    Padding,
    /// Legacy v1 circuit creation; recognized so it can be refused.
    CreateLegacy,
    /// Legacy v1 circuit-created reply; recognized so it can be refused.
    CreatedLegacy,
    Relay,
    Destroy,
    CreateFast,
    CreatedFast,
    Versions,
    Netinfo,
    RelayEarly,
    Create2,
    Created2,
    Vpadding,
    Certs,
    AuthChallenge,
    Authenticate,
    Unknown(u8),
}

impl CellCommand {
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => Self::Padding,
            1 => Self::CreateLegacy,
            2 => Self::CreatedLegacy,
            3 => Self::Relay,
            4 => Self::Destroy,
            5 => Self::CreateFast,
            6 => Self::CreatedFast,
            7 => Self::Versions,
            8 => Self::Netinfo,
            9 => Self::RelayEarly,
            10 => Self::Create2,
            11 => Self::Created2,
            128 => Self::Vpadding,
            129 => Self::Certs,
            130 => Self::AuthChallenge,
            131 => Self::Authenticate,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Padding => 0,
            Self::CreateLegacy => 1,
            Self::CreatedLegacy => 2,
            Self::Relay => 3,
            Self::Destroy => 4,
            Self::CreateFast => 5,
            Self::CreatedFast => 6,
            Self::Versions => 7,
            Self::Netinfo => 8,
            Self::RelayEarly => 9,
            Self::Create2 => 10,
            Self::Created2 => 11,
            Self::Vpadding => 128,
            Self::Certs => 129,
            Self::AuthChallenge => 130,
            Self::Authenticate => 131,
            Self::Unknown(b) => *b,
        }
    }

    /// True for commands carried in variable-width cells.
    pub fn is_var_len(&self) -> bool {
        matches!(self, Self::Versions) || self.as_u8() >= 128
    }

    /// True for the two relay-cell commands.
    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay | Self::RelayEarly)
    }

    /// True for commands that must carry a non-zero circuit id.
    pub fn requires_circ_id(&self) -> bool {
        matches!(
            self,
            Self::CreateLegacy
                | Self::CreatedLegacy
                | Self::Relay
                | Self::RelayEarly
                | Self::Destroy
                | Self::CreateFast
                | Self::CreatedFast
                | Self::Create2
                | Self::Created2
        )
    }
}

impl std::fmt::Display for CellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(b) => write!(f, "UNKNOWN({})", b),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Reason byte on a DESTROY cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    None,
    Protocol,
    Internal,
    Requested,
    Hibernating,
    ResourceLimit,
    ConnectFailed,
    Timeout,
    Destroyed,
    NoSuchService,
    Finished,
    ChannelClosed,
    Unknown(u8),
}

impl DestroyReason {
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => Self::None,
            1 => Self::Protocol,
            2 => Self::Internal,
            3 => Self::Requested,
            4 => Self::Hibernating,
            5 => Self::ResourceLimit,
            6 => Self::ConnectFailed,
            7 => Self::Timeout,
            8 => Self::Destroyed,
            9 => Self::NoSuchService,
            10 => Self::Finished,
            11 => Self::ChannelClosed,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Protocol => 1,
            Self::Internal => 2,
            Self::Requested => 3,
            Self::Hibernating => 4,
            Self::ResourceLimit => 5,
            Self::ConnectFailed => 6,
            Self::Timeout => 7,
            Self::Destroyed => 8,
            Self::NoSuchService => 9,
            Self::Finished => 10,
            Self::ChannelClosed => 11,
            Self::Unknown(b) => *b,
        }
    }
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decoded body of a cell, one variant per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellBody {
    Padding,
    Vpadding(usize),
    Versions(VersionsMsg),
    Certs(CertsMsg),
    AuthChallenge(AuthChallengeMsg),
    Authenticate(AuthenticateMsg),
    Netinfo(NetinfoMsg),
    Create2(Create2Msg),
    Created2(Created2Msg),
    CreateFast(CreateFastMsg),
    CreatedFast(CreatedFastMsg),
    Relay(RelayCellBody),
    RelayEarly(RelayCellBody),
    Destroy(DestroyReason),
    /// Legacy v1 CREATE/CREATED; always refused, body discarded.
    CreateLegacy,
    /// A command outside the known set; dropped by the channel.
    Unknown { cmd: u8 },
}

impl CellBody {
    pub fn command(&self) -> CellCommand {
        match self {
            Self::Padding => CellCommand::Padding,
            Self::Vpadding(_) => CellCommand::Vpadding,
            Self::Versions(_) => CellCommand::Versions,
            Self::Certs(_) => CellCommand::Certs,
            Self::AuthChallenge(_) => CellCommand::AuthChallenge,
            Self::Authenticate(_) => CellCommand::Authenticate,
            Self::Netinfo(_) => CellCommand::Netinfo,
            Self::Create2(_) => CellCommand::Create2,
            Self::Created2(_) => CellCommand::Created2,
            Self::CreateFast(_) => CellCommand::CreateFast,
            Self::CreatedFast(_) => CellCommand::CreatedFast,
            Self::Relay(_) => CellCommand::Relay,
            Self::RelayEarly(_) => CellCommand::RelayEarly,
            Self::Destroy(_) => CellCommand::Destroy,
            Self::CreateLegacy => CellCommand::CreateLegacy,
            Self::Unknown { cmd } => CellCommand::from_u8(*cmd),
        }
    }
}

/// One cell: a circuit id plus a decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: CircId,
    pub body: CellBody,
}

impl Cell {
    pub fn new(circ_id: CircId, body: CellBody) -> Self {
        Self { circ_id, body }
    }

    /// A channel-level control cell (circuit id zero).
    pub fn control(body: CellBody) -> Self {
        Self {
            circ_id: CircId::CONTROL,
            body,
        }
    }

    pub fn command(&self) -> CellCommand {
        self.body.command()
    }

    /// Reject id/command combinations the protocol forbids.
    pub fn check_circ_id(&self) -> Result<()> {
        let cmd = self.command();
        if cmd.requires_circ_id() && self.circ_id.is_control() {
            return Err(VeilError::protocol(format!(
                "{} cell with zero circuit id",
                cmd
            )));
        }
        if !cmd.requires_circ_id() && !self.circ_id.is_control() && !matches!(cmd, CellCommand::Unknown(_)) {
            return Err(VeilError::protocol(format!(
                "{} cell with circuit id {}",
                cmd, self.circ_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_byte_roundtrip() {
        for b in 0..=255u8 {
            let cmd = CellCommand::from_u8(b);
            assert_eq!(cmd.as_u8(), b);
        }
    }

    #[test]
    fn test_var_len_commands() {
        assert!(CellCommand::Versions.is_var_len());
        assert!(CellCommand::Certs.is_var_len());
        assert!(CellCommand::AuthChallenge.is_var_len());
        assert!(CellCommand::Authenticate.is_var_len());
        assert!(CellCommand::Vpadding.is_var_len());
        assert!(!CellCommand::Relay.is_var_len());
        assert!(!CellCommand::Padding.is_var_len());
        assert!(!CellCommand::Destroy.is_var_len());
    }

    #[test]
    fn test_circ_id_rules() {
        let ok = Cell::new(CircId(5), CellBody::Destroy(DestroyReason::None));
        assert!(ok.check_circ_id().is_ok());

        let bad = Cell::control(CellBody::Destroy(DestroyReason::None));
        assert!(bad.check_circ_id().is_err());

        let bad = Cell::new(CircId(5), CellBody::Padding);
        assert!(bad.check_circ_id().is_err());
    }

    #[test]
    fn test_destroy_reason_roundtrip() {
        for b in 0..=20u8 {
            assert_eq!(DestroyReason::from_u8(b).as_u8(), b);
        }
    }
}
