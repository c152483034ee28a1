//! CANopen datatypes and the value codec
//!
//! Defines the closed set of CiA 301 datatypes supported by the stack, the
//! typed run-time [`Value`] representation, and the pure pack/unpack codec
//! between values and their little-endian wire encoding.

use snafu::Snafu;

/// The CANopen datatypes supported by the stack
///
/// The discriminants are the CiA 301 datatype codes, as referenced e.g. by
/// the `DataType` field of an EDS file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    /// Single byte boolean
    Boolean = 0x01,
    /// Signed 8-bit integer
    Integer8 = 0x02,
    /// Signed 16-bit integer
    Integer16 = 0x03,
    /// Signed 32-bit integer
    Integer32 = 0x04,
    /// Unsigned 8-bit integer
    Unsigned8 = 0x05,
    /// Unsigned 16-bit integer
    Unsigned16 = 0x06,
    /// Unsigned 32-bit integer
    Unsigned32 = 0x07,
    /// IEEE-754 single precision float
    Real32 = 0x08,
    /// Printable string of bytes
    VisibleString = 0x09,
    /// Arbitrary string of bytes
    OctetString = 0x0A,
    /// Arbitrary application data of unbounded length
    Domain = 0x0F,
    /// IEEE-754 double precision float
    Real64 = 0x11,
    /// Signed 64-bit integer
    Integer64 = 0x15,
    /// Unsigned 64-bit integer
    Unsigned64 = 0x1B,
}

impl DataType {
    /// Returns true for every type except the string/domain types
    pub fn is_numeric(self) -> bool {
        !matches!(
            self,
            DataType::VisibleString | DataType::OctetString | DataType::Domain
        )
    }

    /// Returns true for the floating point types
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Real32 | DataType::Real64)
    }

    /// The fixed encoded size in bytes, or None for variable-length types
    pub fn size(self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::Integer8 | DataType::Unsigned8 => Some(1),
            DataType::Integer16 | DataType::Unsigned16 => Some(2),
            DataType::Integer32 | DataType::Unsigned32 | DataType::Real32 => Some(4),
            DataType::Integer64 | DataType::Unsigned64 | DataType::Real64 => Some(8),
            DataType::VisibleString | DataType::OctetString | DataType::Domain => None,
        }
    }
}

/// Access type of a dictionary variable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and never changed even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if the object may be written by a peer
    pub fn is_writable(self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }

    /// Returns true if the object may be read by a peer
    pub fn is_readable(self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Ro | AccessType::Const)
    }
}

impl core::fmt::Display for AccessType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AccessType::Ro => write!(f, "ro"),
            AccessType::Wo => write!(f, "wo"),
            AccessType::Rw => write!(f, "rw"),
            AccessType::Const => write!(f, "const"),
        }
    }
}

/// A typed run-time value stored in, or exchanged with, the dictionary
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// BOOLEAN value
    Boolean(bool),
    /// INTEGER8 value
    Integer8(i8),
    /// INTEGER16 value
    Integer16(i16),
    /// INTEGER32 value
    Integer32(i32),
    /// INTEGER64 value
    Integer64(i64),
    /// UNSIGNED8 value
    Unsigned8(u8),
    /// UNSIGNED16 value
    Unsigned16(u16),
    /// UNSIGNED32 value
    Unsigned32(u32),
    /// UNSIGNED64 value
    Unsigned64(u64),
    /// REAL32 value
    Real32(f32),
    /// REAL64 value
    Real64(f64),
    /// Backing for VISIBLE_STRING, OCTET_STRING and DOMAIN
    Bytes(Vec<u8>),
}

impl Value {
    /// The default value materialized for a never-written slot
    pub fn zero(datatype: DataType) -> Value {
        match datatype {
            DataType::Boolean => Value::Boolean(false),
            DataType::Integer8 => Value::Integer8(0),
            DataType::Integer16 => Value::Integer16(0),
            DataType::Integer32 => Value::Integer32(0),
            DataType::Integer64 => Value::Integer64(0),
            DataType::Unsigned8 => Value::Unsigned8(0),
            DataType::Unsigned16 => Value::Unsigned16(0),
            DataType::Unsigned32 => Value::Unsigned32(0),
            DataType::Unsigned64 => Value::Unsigned64(0),
            DataType::Real32 => Value::Real32(0.0),
            DataType::Real64 => Value::Real64(0.0),
            DataType::VisibleString | DataType::OctetString | DataType::Domain => {
                Value::Bytes(Vec::new())
            }
        }
    }

    /// Returns true if this value can be stored in a slot of the given type
    pub fn matches(&self, datatype: DataType) -> bool {
        matches!(
            (self, datatype),
            (Value::Boolean(_), DataType::Boolean)
                | (Value::Integer8(_), DataType::Integer8)
                | (Value::Integer16(_), DataType::Integer16)
                | (Value::Integer32(_), DataType::Integer32)
                | (Value::Integer64(_), DataType::Integer64)
                | (Value::Unsigned8(_), DataType::Unsigned8)
                | (Value::Unsigned16(_), DataType::Unsigned16)
                | (Value::Unsigned32(_), DataType::Unsigned32)
                | (Value::Unsigned64(_), DataType::Unsigned64)
                | (Value::Real32(_), DataType::Real32)
                | (Value::Real64(_), DataType::Real64)
                | (Value::Bytes(_), DataType::VisibleString)
                | (Value::Bytes(_), DataType::OctetString)
                | (Value::Bytes(_), DataType::Domain)
        )
    }

    /// Numeric view of the value, for range checks and scaling
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Boolean(v) => Some(*v as u8 as f64),
            Value::Integer8(v) => Some(*v as f64),
            Value::Integer16(v) => Some(*v as f64),
            Value::Integer32(v) => Some(*v as f64),
            Value::Integer64(v) => Some(*v as f64),
            Value::Unsigned8(v) => Some(*v as f64),
            Value::Unsigned16(v) => Some(*v as f64),
            Value::Unsigned32(v) => Some(*v as f64),
            Value::Unsigned64(v) => Some(*v as f64),
            Value::Real32(v) => Some(*v as f64),
            Value::Real64(v) => Some(*v),
            Value::Bytes(_) => None,
        }
    }

    /// Fetch as u8, if this is an Unsigned8
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Unsigned8(v) => Some(*v),
            _ => None,
        }
    }

    /// Fetch as u16, if this is an Unsigned16
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Unsigned16(v) => Some(*v),
            _ => None,
        }
    }

    /// Fetch as u32, if this is an Unsigned32
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Unsigned32(v) => Some(*v),
            _ => None,
        }
    }

    /// Fetch the byte content, if this is a Bytes value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", *v as u8),
            Value::Integer8(v) => write!(f, "{v}"),
            Value::Integer16(v) => write!(f, "{v}"),
            Value::Integer32(v) => write!(f, "{v}"),
            Value::Integer64(v) => write!(f, "{v}"),
            Value::Unsigned8(v) => write!(f, "{v}"),
            Value::Unsigned16(v) => write!(f, "{v}"),
            Value::Unsigned32(v) => write!(f, "{v}"),
            Value::Unsigned64(v) => write!(f, "{v}"),
            Value::Real32(v) => write!(f, "{v}"),
            Value::Real64(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Integer8(v)
    }
}
impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Integer16(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer64(v)
    }
}
impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Unsigned8(v)
    }
}
impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Unsigned16(v)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Unsigned32(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned64(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real32(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real64(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

/// Errors raised by the value codec
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum CodecError {
    /// The byte length does not match the datatype's encoded size
    #[snafu(display("{len} bytes do not encode a {datatype:?}"))]
    SizeMismatch {
        /// The target datatype
        datatype: DataType,
        /// The offending length
        len: usize,
    },
    /// The value's variant does not correspond to the datatype
    #[snafu(display("value does not match datatype {datatype:?}"))]
    WrongType {
        /// The target datatype
        datatype: DataType,
    },
}

fn scale_down(value: f64, factor: f64) -> f64 {
    if factor == 1.0 {
        value
    } else {
        value / factor
    }
}

/// Encode a value to its little-endian wire representation
///
/// A non-unit `factor` divides the value before encoding; integer types
/// round to nearest. String and domain values pass through untouched.
pub fn pack(datatype: DataType, value: &Value, factor: f64) -> Result<Vec<u8>, CodecError> {
    if !value.matches(datatype) {
        return Err(CodecError::WrongType { datatype });
    }
    let scaled = |v: f64| scale_down(v, factor);
    let bytes = match value {
        Value::Boolean(v) => vec![*v as u8],
        Value::Integer8(v) => (scaled(*v as f64).round() as i8).to_le_bytes().to_vec(),
        Value::Integer16(v) => (scaled(*v as f64).round() as i16).to_le_bytes().to_vec(),
        Value::Integer32(v) => (scaled(*v as f64).round() as i32).to_le_bytes().to_vec(),
        Value::Integer64(v) => (scaled(*v as f64).round() as i64).to_le_bytes().to_vec(),
        Value::Unsigned8(v) => (scaled(*v as f64).round() as u8).to_le_bytes().to_vec(),
        Value::Unsigned16(v) => (scaled(*v as f64).round() as u16).to_le_bytes().to_vec(),
        Value::Unsigned32(v) => (scaled(*v as f64).round() as u32).to_le_bytes().to_vec(),
        Value::Unsigned64(v) => (scaled(*v as f64).round() as u64).to_le_bytes().to_vec(),
        Value::Real32(v) => (scaled(*v as f64) as f32).to_le_bytes().to_vec(),
        Value::Real64(v) => scaled(*v).to_le_bytes().to_vec(),
        Value::Bytes(v) => v.clone(),
    };
    Ok(bytes)
}

fn scale_up(value: f64, factor: f64) -> f64 {
    if factor == 1.0 {
        value
    } else {
        value * factor
    }
}

/// Decode a value from its little-endian wire representation
///
/// Numeric types require the exact encoded size. A non-unit `factor`
/// multiplies the decoded value.
pub fn unpack(datatype: DataType, data: &[u8], factor: f64) -> Result<Value, CodecError> {
    if let Some(size) = datatype.size() {
        if data.len() != size {
            return Err(CodecError::SizeMismatch {
                datatype,
                len: data.len(),
            });
        }
    }
    let scaled = |v: f64| scale_up(v, factor);
    let value = match datatype {
        DataType::Boolean => Value::Boolean(data[0] != 0),
        DataType::Integer8 => {
            Value::Integer8(scaled(i8::from_le_bytes([data[0]]) as f64).round() as i8)
        }
        DataType::Integer16 => Value::Integer16(
            scaled(i16::from_le_bytes(data.try_into().unwrap()) as f64).round() as i16,
        ),
        DataType::Integer32 => Value::Integer32(
            scaled(i32::from_le_bytes(data.try_into().unwrap()) as f64).round() as i32,
        ),
        DataType::Integer64 => Value::Integer64(
            scaled(i64::from_le_bytes(data.try_into().unwrap()) as f64).round() as i64,
        ),
        DataType::Unsigned8 => {
            Value::Unsigned8(scaled(data[0] as f64).round() as u8)
        }
        DataType::Unsigned16 => Value::Unsigned16(
            scaled(u16::from_le_bytes(data.try_into().unwrap()) as f64).round() as u16,
        ),
        DataType::Unsigned32 => Value::Unsigned32(
            scaled(u32::from_le_bytes(data.try_into().unwrap()) as f64).round() as u32,
        ),
        DataType::Unsigned64 => Value::Unsigned64(
            scaled(u64::from_le_bytes(data.try_into().unwrap()) as f64).round() as u64,
        ),
        DataType::Real32 => {
            Value::Real32(scaled(f32::from_le_bytes(data.try_into().unwrap()) as f64) as f32)
        }
        DataType::Real64 => {
            Value::Real64(scaled(f64::from_le_bytes(data.try_into().unwrap())))
        }
        DataType::VisibleString | DataType::OctetString | DataType::Domain => {
            Value::Bytes(data.to_vec())
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_sizes() {
        assert_eq!(Some(1), DataType::Boolean.size());
        assert_eq!(Some(2), DataType::Integer16.size());
        assert_eq!(Some(4), DataType::Real32.size());
        assert_eq!(Some(8), DataType::Unsigned64.size());
        assert_eq!(None, DataType::Domain.size());
    }

    #[test]
    fn test_pack_little_endian() {
        let bytes = pack(DataType::Unsigned16, &Value::Unsigned16(0x1234), 1.0).unwrap();
        assert_eq!(vec![0x34, 0x12], bytes);

        let bytes = pack(DataType::Integer32, &Value::Integer32(-2), 1.0).unwrap();
        assert_eq!(vec![0xFE, 0xFF, 0xFF, 0xFF], bytes);
    }

    #[test]
    fn test_unpack_requires_exact_size() {
        let err = unpack(DataType::Unsigned16, &[0x01], 1.0).unwrap_err();
        assert_eq!(
            CodecError::SizeMismatch {
                datatype: DataType::Unsigned16,
                len: 1
            },
            err
        );
    }

    #[test]
    fn test_factor_scaling() {
        // Stored value 100 with factor 0.1 encodes as raw 1000
        let bytes = pack(DataType::Unsigned16, &Value::Unsigned16(100), 0.1).unwrap();
        assert_eq!(vec![0xE8, 0x03], bytes);
        let value = unpack(DataType::Unsigned16, &bytes, 0.1).unwrap();
        assert_eq!(Value::Unsigned16(100), value);
    }

    #[test]
    fn test_type_mismatch() {
        let err = pack(DataType::Unsigned8, &Value::Unsigned16(1), 1.0).unwrap_err();
        assert_eq!(
            CodecError::WrongType {
                datatype: DataType::Unsigned8
            },
            err
        );
    }

    #[test]
    fn test_bytes_pass_through() {
        let bytes = pack(DataType::Domain, &Value::Bytes(b"abc".to_vec()), 1.0).unwrap();
        assert_eq!(b"abc".to_vec(), bytes);
        assert_eq!(
            Value::Bytes(b"abc".to_vec()),
            unpack(DataType::VisibleString, b"abc", 1.0).unwrap()
        );
    }
}
