//! Process Data Objects
//!
//! PDOs broadcast dictionary values without confirmation. A TPDO packs up
//! to 8 mapped slots into one frame and emits it according to its
//! transmission type; an RPDO unpacks received frames into its mapped
//! slots. Mapping and communication parameters live in the dictionary
//! (0x1400/0x1600 for RPDO, 0x1800/0x1A00 for TPDO) and take effect
//! through download callbacks, so a remote configuration via SDO and a
//! local call through the service API behave identically.
//!
//! A PDO is active only while all of the following hold: the node is
//! Operational, bit 31 of the COB-ID is clear, and the mapping is
//! non-empty.

mod rpdo;
mod tpdo;

pub use rpdo::Rpdo;
pub use tpdo::Tpdo;

use snafu::Snafu;

use crate::object_dict::{Multiplexor, ObjectDictionary, OdError, Variable};

/// Without CAN-FD or sub-byte mapping, no more than 8 objects fit a PDO
pub(crate) const MAX_MAPPINGS: usize = 8;

/// A PDO payload never exceeds one classic CAN frame
pub(crate) const MAX_PDO_SIZE: usize = 8;

/// Errors returned by the PDO mapping API
#[derive(Debug, Snafu)]
pub enum PdoError {
    /// More than [`MAX_MAPPINGS`] multiplexors were given
    #[snafu(display("a PDO maps at most {MAX_MAPPINGS} objects"))]
    TooManyMappings,
    /// The mapped slots together exceed 8 bytes
    #[snafu(display("mapped objects exceed the {MAX_PDO_SIZE} byte PDO payload"))]
    PayloadTooLarge,
    /// The slot has no fixed size and cannot be mapped
    #[snafu(display("{index:#06X}:{sub} has no fixed size and cannot be mapped"))]
    Unmappable {
        /// The index
        index: u16,
        /// The sub-index
        sub: u8,
    },
    /// A dictionary operation failed
    #[snafu(display("{source}"), context(false))]
    Dictionary {
        /// The dictionary error
        source: OdError,
    },
}

/// Pack a mapping-array entry value from a multiplexor and its bit length
pub(crate) fn mapping_entry(mux: Multiplexor, bits: u8) -> u32 {
    ((mux.0 as u32) << 16) | ((mux.1 as u32) << 8) | bits as u32
}

/// Extract the multiplexor from a mapping-array entry value
pub(crate) fn parse_mapping_entry(value: u32) -> Multiplexor {
    ((value >> 16) as u16, (value >> 8) as u8)
}

/// Read the first `count` multiplexors out of a mapping array
pub(crate) fn read_mapping(
    od: &ObjectDictionary,
    map_index: u16,
    count: u8,
) -> Result<Vec<Multiplexor>, OdError> {
    let mut multiplexors = Vec::with_capacity(count as usize);
    for sub in 1..=count {
        let value = od.read(map_index, sub)?.as_u32().unwrap_or(0);
        multiplexors.push(parse_mapping_entry(value));
    }
    Ok(multiplexors)
}

/// Resolve the mapped variables, enforcing the count and size limits
pub(crate) fn resolve_mapping(
    od: &ObjectDictionary,
    multiplexors: &[Multiplexor],
) -> Result<Vec<Variable>, PdoError> {
    if multiplexors.len() > MAX_MAPPINGS {
        return Err(PdoError::TooManyMappings);
    }
    let mut variables = Vec::with_capacity(multiplexors.len());
    let mut total = 0;
    for &(index, sub) in multiplexors {
        let variable = od.lookup(index, sub)?;
        let size = variable.size().ok_or(PdoError::Unmappable { index, sub })?;
        total += size;
        variables.push(variable);
    }
    if total > MAX_PDO_SIZE {
        return Err(PdoError::PayloadTooLarge);
    }
    Ok(variables)
}
