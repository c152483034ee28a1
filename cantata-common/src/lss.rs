//! LSS protocol definitions
//!
//! Constants and message serialization for the Layer Setting Services (LSS)
//! protocol, used to assign node ids and bit rates to responders before the
//! CANopen services proper are available, and to discover the identity of
//! unconfigured responders.
use crate::messages::MessageError;

/// Defines all possible values for the LSS command specifier field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LssCommandSpecifier {
    /// Used to change the LSS mode for all nodes on the bus
    SwitchModeGlobal = 0x04,
    /// Used to set the node id of the node(s) currently in *Configuration* mode
    ConfigureNodeId = 0x11,
    /// Used to set the bit timing (baud rate) of the node(s) currently in *Configuration* mode
    ConfigureBitTiming = 0x13,
    /// Used to command nodes to activate a new bit rate setting
    ActivateBitTiming = 0x15,
    /// Used to command nodes to store their config (node id and bit rate) persistently
    StoreConfiguration = 0x17,
    /// Sends the vendor id for activating an LSS node via its identity
    SwitchStateVendor = 0x40,
    /// Sends the product code for activating an LSS node via its identity
    SwitchStateProduct = 0x41,
    /// Sends the revision number for activating an LSS node via its identity
    SwitchStateRev = 0x42,
    /// Sends the serial number for activating an LSS node via its identity
    ///
    /// This command comes last (after vendor, product, rev); a node which
    /// recognizes its own identity responds on receipt of this message.
    SwitchStateSerial = 0x43,
    /// Response by a node to indicate it has recognized its identity and is
    /// entering *Configuration* mode
    SwitchStateResponse = 0x44,
    /// Sends the vendor id of an identify-remote-responders query
    IdentifyRemoteVendor = 0x46,
    /// Sends the product code of an identify-remote-responders query
    IdentifyRemoteProduct = 0x47,
    /// Sends the low bound of the revision range to identify
    IdentifyRemoteRevLow = 0x48,
    /// Sends the high bound of the revision range to identify
    IdentifyRemoteRevHigh = 0x49,
    /// Sends the low bound of the serial range to identify
    IdentifyRemoteSerialLow = 0x4A,
    /// Sends the high bound of the serial range to identify; triggers the match
    IdentifyRemoteSerialHigh = 0x4B,
    /// Asks all unconfigured responders to identify themselves
    IdentifyNonConfigured = 0x4C,
    /// Response to a FastScan or identify query
    IdentifySlave = 0x4F,
    /// Response of unconfigured responders to [`Self::IdentifyNonConfigured`]
    IdentifyNonConfiguredSlave = 0x50,
    /// FastScan query, used to discover unconfigured nodes bit by bit
    FastScan = 0x51,
    /// Used to inquire the vendor id of a node in *Configuration* mode
    InquireVendor = 0x5A,
    /// Used to inquire the product code of a node in *Configuration* mode
    InquireProduct = 0x5B,
    /// Used to inquire the revision number of a node in *Configuration* mode
    InquireRev = 0x5C,
    /// Used to inquire the serial number of a node in *Configuration* mode
    InquireSerial = 0x5D,
    /// Used to inquire the node id of a node in *Configuration* mode
    InquireNodeId = 0x5E,
}

impl LssCommandSpecifier {
    /// Attempt to create an [`LssCommandSpecifier`] from a byte code
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x04 => Ok(Self::SwitchModeGlobal),
            0x11 => Ok(Self::ConfigureNodeId),
            0x13 => Ok(Self::ConfigureBitTiming),
            0x15 => Ok(Self::ActivateBitTiming),
            0x17 => Ok(Self::StoreConfiguration),
            0x40 => Ok(Self::SwitchStateVendor),
            0x41 => Ok(Self::SwitchStateProduct),
            0x42 => Ok(Self::SwitchStateRev),
            0x43 => Ok(Self::SwitchStateSerial),
            0x44 => Ok(Self::SwitchStateResponse),
            0x46 => Ok(Self::IdentifyRemoteVendor),
            0x47 => Ok(Self::IdentifyRemoteProduct),
            0x48 => Ok(Self::IdentifyRemoteRevLow),
            0x49 => Ok(Self::IdentifyRemoteRevHigh),
            0x4A => Ok(Self::IdentifyRemoteSerialLow),
            0x4B => Ok(Self::IdentifyRemoteSerialHigh),
            0x4C => Ok(Self::IdentifyNonConfigured),
            0x4F => Ok(Self::IdentifySlave),
            0x50 => Ok(Self::IdentifyNonConfiguredSlave),
            0x51 => Ok(Self::FastScan),
            0x5A => Ok(Self::InquireVendor),
            0x5B => Ok(Self::InquireProduct),
            0x5C => Ok(Self::InquireRev),
            0x5D => Ok(Self::InquireSerial),
            0x5E => Ok(Self::InquireNodeId),
            _ => Err(MessageError::UnexpectedLssCommand { value: b }),
        }
    }
}

/// Special value of the fastscan bit_check field requesting confirmation
pub const LSS_FASTSCAN_CONFIRM: u8 = 0x80;

/// The possible LSS modes of a responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LssMode {
    /// The default mode of a node
    Waiting = 0,
    /// The mode of a node which has been selected and can be configured or
    /// queried via LSS
    Configuration = 1,
}

impl LssMode {
    /// Create an LSS mode from a mode byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x00 => Ok(Self::Waiting),
            0x01 => Ok(Self::Configuration),
            _ => Err(MessageError::InvalidField),
        }
    }
}

fn require_len(value: &[u8], expected: usize) -> Result<(), MessageError> {
    if value.len() < expected {
        Err(MessageError::UnexpectedLength {
            len: value.len(),
            expected,
        })
    } else {
        Ok(())
    }
}

fn le_u32(value: &[u8]) -> u32 {
    u32::from_le_bytes(value[..4].try_into().unwrap())
}

/// An LSS request sent by the master to the responders
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LssRequest {
    /// Switch the mode of all LSS responders
    SwitchModeGlobal {
        /// The requested mode: 0 = *Waiting*, 1 = *Configuration*
        mode: u8,
    },
    /// Send the vendor id to activate by identity
    SwitchStateVendor {
        /// The vendor id to match against
        vendor_id: u32,
    },
    /// Send the product code to activate by identity
    SwitchStateProduct {
        /// The product code to match against
        product_code: u32,
    },
    /// Send the revision number to activate by identity
    SwitchStateRevision {
        /// The revision number to match against
        revision: u32,
    },
    /// Send the serial number to activate by identity
    SwitchStateSerial {
        /// The serial number to match against
        serial: u32,
    },
    /// One field of an identify-remote-responders query
    ///
    /// The six slots are vendor, product, revision low/high bound, serial
    /// low/high bound; the final slot triggers the match.
    IdentifyRemote {
        /// The slot, 0..=5, derived from the command specifier
        slot: u8,
        /// The field value or range bound
        value: u32,
    },
    /// Ask unconfigured responders to identify themselves
    IdentifyNonConfigured,
    /// Send a FastScan query
    FastScan {
        /// The id under test
        id: u32,
        /// The number of unchecked bits, or [`LSS_FASTSCAN_CONFIRM`]
        bit_check: u8,
        /// The identity field under test (0 vendor, 1 product, 2 revision, 3 serial)
        sub: u8,
        /// The identity field to check on the next FastScan request
        next: u8,
    },
    /// Set the node id of the responder currently in *Configuration* mode
    ConfigureNodeId {
        /// The new node id to set
        node_id: u8,
    },
    /// Select the bit timing (baud rate) of the responder currently in
    /// *Configuration* mode
    ConfigureBitTiming {
        /// The baud rate table: 0 is the standard table, 128..=255 user defined
        table: u8,
        /// The index into the baud rate table
        index: u8,
    },
    /// Command the previously configured bit timing to be activated
    ActivateBitTiming {
        /// Duration in ms to wait before (and again after) switching
        delay_ms: u16,
    },
    /// Command responders to persist their current node id and bit rate
    StoreConfiguration,
    /// Request the vendor id of the responder in *Configuration* mode
    InquireVendor,
    /// Request the product code of the responder in *Configuration* mode
    InquireProduct,
    /// Request the revision number of the responder in *Configuration* mode
    InquireRev,
    /// Request the serial number of the responder in *Configuration* mode
    InquireSerial,
    /// Request the node id of the responder in *Configuration* mode
    InquireNodeId,
}

impl TryFrom<&[u8]> for LssRequest {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        match cs {
            LssCommandSpecifier::SwitchModeGlobal => {
                require_len(value, 2)?;
                Ok(Self::SwitchModeGlobal { mode: value[1] })
            }
            LssCommandSpecifier::SwitchStateVendor => {
                require_len(value, 5)?;
                Ok(Self::SwitchStateVendor {
                    vendor_id: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::SwitchStateProduct => {
                require_len(value, 5)?;
                Ok(Self::SwitchStateProduct {
                    product_code: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::SwitchStateRev => {
                require_len(value, 5)?;
                Ok(Self::SwitchStateRevision {
                    revision: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::SwitchStateSerial => {
                require_len(value, 5)?;
                Ok(Self::SwitchStateSerial {
                    serial: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::IdentifyRemoteVendor
            | LssCommandSpecifier::IdentifyRemoteProduct
            | LssCommandSpecifier::IdentifyRemoteRevLow
            | LssCommandSpecifier::IdentifyRemoteRevHigh
            | LssCommandSpecifier::IdentifyRemoteSerialLow
            | LssCommandSpecifier::IdentifyRemoteSerialHigh => {
                require_len(value, 5)?;
                Ok(Self::IdentifyRemote {
                    slot: value[0] - LssCommandSpecifier::IdentifyRemoteVendor as u8,
                    value: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::IdentifyNonConfigured => Ok(Self::IdentifyNonConfigured),
            LssCommandSpecifier::FastScan => {
                require_len(value, 8)?;
                Ok(Self::FastScan {
                    id: le_u32(&value[1..]),
                    bit_check: value[5],
                    sub: value[6],
                    next: value[7],
                })
            }
            LssCommandSpecifier::ConfigureNodeId => {
                require_len(value, 2)?;
                Ok(Self::ConfigureNodeId { node_id: value[1] })
            }
            LssCommandSpecifier::ConfigureBitTiming => {
                require_len(value, 3)?;
                Ok(Self::ConfigureBitTiming {
                    table: value[1],
                    index: value[2],
                })
            }
            LssCommandSpecifier::ActivateBitTiming => {
                require_len(value, 3)?;
                Ok(Self::ActivateBitTiming {
                    delay_ms: u16::from_le_bytes([value[1], value[2]]),
                })
            }
            LssCommandSpecifier::StoreConfiguration => Ok(Self::StoreConfiguration),
            LssCommandSpecifier::InquireVendor => Ok(Self::InquireVendor),
            LssCommandSpecifier::InquireProduct => Ok(Self::InquireProduct),
            LssCommandSpecifier::InquireRev => Ok(Self::InquireRev),
            LssCommandSpecifier::InquireSerial => Ok(Self::InquireSerial),
            LssCommandSpecifier::InquireNodeId => Ok(Self::InquireNodeId),
            // Only ever sent by responders
            LssCommandSpecifier::SwitchStateResponse
            | LssCommandSpecifier::IdentifySlave
            | LssCommandSpecifier::IdentifyNonConfiguredSlave => {
                Err(MessageError::UnexpectedLssCommand { value: value[0] })
            }
        }
    }
}

impl LssRequest {
    /// Convert the request to the 8-byte message payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut data = [0u8; 8];
        match self {
            LssRequest::SwitchModeGlobal { mode } => {
                data[0] = LssCommandSpecifier::SwitchModeGlobal as u8;
                data[1] = mode;
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                data[0] = LssCommandSpecifier::SwitchStateVendor as u8;
                data[1..5].copy_from_slice(&vendor_id.to_le_bytes());
            }
            LssRequest::SwitchStateProduct { product_code } => {
                data[0] = LssCommandSpecifier::SwitchStateProduct as u8;
                data[1..5].copy_from_slice(&product_code.to_le_bytes());
            }
            LssRequest::SwitchStateRevision { revision } => {
                data[0] = LssCommandSpecifier::SwitchStateRev as u8;
                data[1..5].copy_from_slice(&revision.to_le_bytes());
            }
            LssRequest::SwitchStateSerial { serial } => {
                data[0] = LssCommandSpecifier::SwitchStateSerial as u8;
                data[1..5].copy_from_slice(&serial.to_le_bytes());
            }
            LssRequest::IdentifyRemote { slot, value } => {
                data[0] = LssCommandSpecifier::IdentifyRemoteVendor as u8 + slot;
                data[1..5].copy_from_slice(&value.to_le_bytes());
            }
            LssRequest::IdentifyNonConfigured => {
                data[0] = LssCommandSpecifier::IdentifyNonConfigured as u8;
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                data[0] = LssCommandSpecifier::FastScan as u8;
                data[1..5].copy_from_slice(&id.to_le_bytes());
                data[5] = bit_check;
                data[6] = sub;
                data[7] = next;
            }
            LssRequest::ConfigureNodeId { node_id } => {
                data[0] = LssCommandSpecifier::ConfigureNodeId as u8;
                data[1] = node_id;
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                data[0] = LssCommandSpecifier::ConfigureBitTiming as u8;
                data[1] = table;
                data[2] = index;
            }
            LssRequest::ActivateBitTiming { delay_ms } => {
                data[0] = LssCommandSpecifier::ActivateBitTiming as u8;
                data[1..3].copy_from_slice(&delay_ms.to_le_bytes());
            }
            LssRequest::StoreConfiguration => {
                data[0] = LssCommandSpecifier::StoreConfiguration as u8;
            }
            LssRequest::InquireVendor => {
                data[0] = LssCommandSpecifier::InquireVendor as u8;
            }
            LssRequest::InquireProduct => {
                data[0] = LssCommandSpecifier::InquireProduct as u8;
            }
            LssRequest::InquireRev => {
                data[0] = LssCommandSpecifier::InquireRev as u8;
            }
            LssRequest::InquireSerial => {
                data[0] = LssCommandSpecifier::InquireSerial as u8;
            }
            LssRequest::InquireNodeId => {
                data[0] = LssCommandSpecifier::InquireNodeId as u8;
            }
        }
        data
    }
}

/// An LSS response message sent from the responder to the master
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LssResponse {
    /// Sent when a responder's identity matches a FastScan or
    /// identify-remote-responders query
    IdentifySlave,
    /// Sent by unconfigured responders in reply to
    /// [`LssRequest::IdentifyNonConfigured`]
    IdentifyNonConfiguredSlave,
    /// Sent in response to [`LssRequest::SwitchStateSerial`] when the
    /// responder recognizes its identity
    SwitchStateResponse,
    /// Sent in response to a [`LssRequest::ConfigureNodeId`]
    ConfigureNodeIdAck {
        /// 0 on success, 1 for an out-of-range id
        error: u8,
        /// The manufacturer specific error code, valid when error is 255
        spec_error: u8,
    },
    /// Sent in response to a [`LssRequest::ConfigureBitTiming`]
    ConfigureBitTimingAck {
        /// 0 on success, 1 for an unsupported bit timing
        error: u8,
        /// The manufacturer specific error code, valid when error is 255
        spec_error: u8,
    },
    /// Sent in response to a [`LssRequest::StoreConfiguration`]
    StoreConfigurationAck {
        /// 0 on success, 1 when storing is not supported, 2 on access error
        error: u8,
        /// The manufacturer specific error code, valid when error is 255
        spec_error: u8,
    },
    /// Sent in response to a [`LssRequest::InquireVendor`]
    InquireVendorAck {
        /// The vendor id of the responding node
        vendor_id: u32,
    },
    /// Sent in response to a [`LssRequest::InquireProduct`]
    InquireProductAck {
        /// The product code of the responding node
        product_code: u32,
    },
    /// Sent in response to a [`LssRequest::InquireRev`]
    InquireRevAck {
        /// The revision number of the responding node
        revision: u32,
    },
    /// Sent in response to a [`LssRequest::InquireSerial`]
    InquireSerialAck {
        /// The serial number of the responding node
        serial: u32,
    },
    /// Sent in response to a [`LssRequest::InquireNodeId`]
    InquireNodeIdAck {
        /// The node id of the responding node
        node_id: u8,
    },
}

impl TryFrom<&[u8]> for LssResponse {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        match cs {
            LssCommandSpecifier::IdentifySlave => Ok(Self::IdentifySlave),
            LssCommandSpecifier::IdentifyNonConfiguredSlave => Ok(Self::IdentifyNonConfiguredSlave),
            LssCommandSpecifier::SwitchStateResponse => Ok(Self::SwitchStateResponse),
            LssCommandSpecifier::ConfigureNodeId => {
                require_len(value, 3)?;
                Ok(Self::ConfigureNodeIdAck {
                    error: value[1],
                    spec_error: value[2],
                })
            }
            LssCommandSpecifier::ConfigureBitTiming => {
                require_len(value, 3)?;
                Ok(Self::ConfigureBitTimingAck {
                    error: value[1],
                    spec_error: value[2],
                })
            }
            LssCommandSpecifier::StoreConfiguration => {
                require_len(value, 3)?;
                Ok(Self::StoreConfigurationAck {
                    error: value[1],
                    spec_error: value[2],
                })
            }
            LssCommandSpecifier::InquireVendor => {
                require_len(value, 5)?;
                Ok(Self::InquireVendorAck {
                    vendor_id: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::InquireProduct => {
                require_len(value, 5)?;
                Ok(Self::InquireProductAck {
                    product_code: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::InquireRev => {
                require_len(value, 5)?;
                Ok(Self::InquireRevAck {
                    revision: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::InquireSerial => {
                require_len(value, 5)?;
                Ok(Self::InquireSerialAck {
                    serial: le_u32(&value[1..]),
                })
            }
            LssCommandSpecifier::InquireNodeId => {
                require_len(value, 2)?;
                Ok(Self::InquireNodeIdAck { node_id: value[1] })
            }
            _ => Err(MessageError::UnexpectedLssCommand { value: value[0] }),
        }
    }
}

impl LssResponse {
    /// Convert the response to the 8-byte message payload
    ///
    /// LSS messages are always padded out to 8 bytes.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut data = [0u8; 8];
        match self {
            LssResponse::IdentifySlave => {
                data[0] = LssCommandSpecifier::IdentifySlave as u8;
            }
            LssResponse::IdentifyNonConfiguredSlave => {
                data[0] = LssCommandSpecifier::IdentifyNonConfiguredSlave as u8;
            }
            LssResponse::SwitchStateResponse => {
                data[0] = LssCommandSpecifier::SwitchStateResponse as u8;
            }
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                data[0] = LssCommandSpecifier::ConfigureNodeId as u8;
                data[1] = error;
                data[2] = spec_error;
            }
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                data[0] = LssCommandSpecifier::ConfigureBitTiming as u8;
                data[1] = error;
                data[2] = spec_error;
            }
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                data[0] = LssCommandSpecifier::StoreConfiguration as u8;
                data[1] = error;
                data[2] = spec_error;
            }
            LssResponse::InquireVendorAck { vendor_id } => {
                data[0] = LssCommandSpecifier::InquireVendor as u8;
                data[1..5].copy_from_slice(&vendor_id.to_le_bytes());
            }
            LssResponse::InquireProductAck { product_code } => {
                data[0] = LssCommandSpecifier::InquireProduct as u8;
                data[1..5].copy_from_slice(&product_code.to_le_bytes());
            }
            LssResponse::InquireRevAck { revision } => {
                data[0] = LssCommandSpecifier::InquireRev as u8;
                data[1..5].copy_from_slice(&revision.to_le_bytes());
            }
            LssResponse::InquireSerialAck { serial } => {
                data[0] = LssCommandSpecifier::InquireSerial as u8;
                data[1..5].copy_from_slice(&serial.to_le_bytes());
            }
            LssResponse::InquireNodeIdAck { node_id } => {
                data[0] = LssCommandSpecifier::InquireNodeId as u8;
                data[1] = node_id;
            }
        }
        data
    }
}

/// The 128-bit LSS identity in its four 32-bit fields
///
/// Read out of the 0x1018 identity record and matched against by the
/// selective-switch, identify, and fastscan procedures, which address the
/// fields by slot number (0 vendor .. 3 serial). Every device on a bus
/// must carry a unique identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LssIdentity {
    /// A number indicating the vendor of the device
    pub vendor_id: u32,
    /// A number indicating a product / model of the device
    pub product_code: u32,
    /// A number indicating the revision of the product
    pub revision: u32,
    /// A serial number unique among devices sharing the other three fields
    pub serial: u32,
}

impl LssIdentity {
    /// Create a new LssIdentity
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// Read a field by its LSS slot number
    ///
    /// Panics on slots above 3; callers validate the wire field first.
    pub fn field(&self, slot: u8) -> u32 {
        match slot {
            0 => self.vendor_id,
            1 => self.product_code,
            2 => self.revision,
            3 => self.serial,
            _ => panic!("LSS identity has no slot {slot}"),
        }
    }
}
