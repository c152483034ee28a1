//! Message definitions
//!
//! Framing for the fixed-format CANopen messages (NMT command, heartbeat,
//! boot-up) and the [`CanMessage`] struct carried across the network trait.

use snafu::Snafu;

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame with an 11-bit identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The 11-bit COB-ID
    pub cob_id: u16,
    /// The data payload; only the first `dlc` bytes are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
}

impl CanMessage {
    /// Create a new CAN message
    ///
    /// Panics if `data` exceeds 8 bytes; callers build payloads from fixed
    /// arrays.
    pub fn new(cob_id: u16, data: &[u8]) -> Self {
        assert!(
            data.len() <= MAX_DATA_LENGTH,
            "Data length exceeds maximum size of {} bytes",
            MAX_DATA_LENGTH
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[..data.len()].copy_from_slice(data);
        Self {
            cob_id,
            data: buf,
            dlc: data.len() as u8,
        }
    }

    /// Get a slice containing the valid data payload
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// The NMT state transition command specifier
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Transition to the Operational state
    Start = 0x01,
    /// Transition to the Stopped state
    Stop = 0x02,
    /// Transition to the Pre-Operational state
    EnterPreOp = 0x80,
    /// Perform an application reset
    ResetNode = 0x81,
    /// Perform a communications reset
    ResetComm = 0x82,
}

impl NmtCommandSpecifier {
    /// Create from the byte value transmitted in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::Stop),
            0x80 => Ok(Self::EnterPreOp),
            0x81 => Ok(Self::ResetNode),
            0x82 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command message
///
/// Sent on COB-ID 0 by the network master. A node id of 0 addresses every
/// node on the bus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NmtCommand {
    /// Specifies the requested transition
    pub cs: NmtCommandSpecifier,
    /// The addressed node, 0 for broadcast
    pub node: u8,
}

impl NmtCommand {
    /// Parse an NMT command from a received payload
    pub fn from_bytes(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() < 2 {
            return Err(MessageError::MessageTooShort);
        }
        let cs = NmtCommandSpecifier::from_byte(payload[0])?;
        Ok(NmtCommand {
            cs,
            node: payload[1],
        })
    }

    /// Convert to the message payload bytes
    pub fn to_bytes(self) -> [u8; 2] {
        [self.cs as u8, self.node]
    }
}

/// Possible NMT states for a node
///
/// The discriminants are the state codes carried in heartbeat messages; a
/// node in Initialisation announces itself with the boot-up value 0 and
/// transitions on automatically.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Transient startup state; entered on reset, left automatically
    Initialisation = 0,
    /// Node has been stopped; only NMT, heartbeat, and LSS remain active
    Stopped = 4,
    /// Normal operational state; PDO traffic is enabled
    Operational = 5,
    /// Node is configured and awaiting the start command
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initialisation => write!(f, "Initialisation"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

impl TryFrom<u8> for NmtState {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NmtState::Initialisation),
            4 => Ok(NmtState::Stopped),
            5 => Ok(NmtState::Operational),
            127 => Ok(NmtState::PreOperational),
            _ => Err(MessageError::InvalidNmtState { value }),
        }
    }
}

/// A heartbeat message, also used for the boot-up announcement
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// The id of the node transmitting the heartbeat
    pub node: u8,
    /// The current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        CanMessage::new(
            crate::constants::cob_ids::HEARTBEAT_BASE + value.node as u16,
            &[value.state as u8],
        )
    }
}

/// An error for problems converting payloads to message types
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message length does not match the expected length for its command
    #[snafu(display("Unexpected message length {len}, expected {expected}"))]
    UnexpectedLength {
        /// Received length
        len: usize,
        /// Expected length
        expected: usize,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
    /// An invalid LSS command specifier was found in the message
    #[snafu(display("Unexpected LSS command: {value:#04X}"))]
    UnexpectedLssCommand {
        /// The invalid byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_round_trip() {
        let cmd = NmtCommand::from_bytes(&[0x01, 0x05]).unwrap();
        assert_eq!(NmtCommandSpecifier::Start, cmd.cs);
        assert_eq!(5, cmd.node);
        assert_eq!([0x01, 0x05], cmd.to_bytes());
    }

    #[test]
    fn test_nmt_command_rejects_unknown_specifier() {
        assert_eq!(
            Err(MessageError::InvalidField),
            NmtCommand::from_bytes(&[0x55, 0x00])
        );
    }

    #[test]
    fn test_heartbeat_message() {
        let msg: CanMessage = Heartbeat {
            node: 2,
            state: NmtState::PreOperational,
        }
        .into();
        assert_eq!(0x702, msg.cob_id);
        assert_eq!(&[127], msg.data());
    }
}
