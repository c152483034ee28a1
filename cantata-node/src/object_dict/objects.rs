//! Dictionary entry descriptors
//!
//! An entry in the dictionary is a [`Variable`], a [`Record`] of
//! heterogeneous variables, or an [`Array`] replicating one variable over a
//! range of sub-indices. Descriptors are immutable once the entry is
//! inserted; only the values stored behind them change.

use std::collections::BTreeMap;

use cantata_common::datatypes::{self, AccessType, CodecError, DataType, Value};

/// Describes a single typed slot
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    /// The datatype of values stored in this slot
    pub datatype: DataType,
    /// How peers may access the slot
    pub access: AccessType,
    /// The value materialized on first read if the slot was never written
    pub default: Option<Value>,
    /// Scale factor applied by the codec (wire value = stored value / factor)
    pub factor: f64,
    /// Lower bound enforced by the SDO server on downloads
    pub minimum: Option<f64>,
    /// Upper bound enforced by the SDO server on downloads
    pub maximum: Option<f64>,
    /// Human readable name, used by the EDS generator
    pub name: Option<String>,
}

impl Variable {
    /// Create a new variable descriptor
    pub fn new(datatype: DataType, access: AccessType) -> Self {
        Self {
            datatype,
            access,
            default: None,
            factor: 1.0,
            minimum: None,
            maximum: None,
            name: None,
        }
    }

    /// Set the default value
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the scale factor
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the lower bound
    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    /// Set the upper bound
    pub fn with_maximum(mut self, maximum: f64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    /// Set the human readable name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns true if peers may write this slot
    pub fn writable(&self) -> bool {
        self.access.is_writable()
    }

    /// Returns true if peers may read this slot
    pub fn readable(&self) -> bool {
        self.access.is_readable()
    }

    /// The encoded size in bytes, or None for variable-length datatypes
    pub fn size(&self) -> Option<usize> {
        self.datatype.size()
    }

    /// Encode a value of this variable's type for the wire
    pub fn pack(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        datatypes::pack(self.datatype, value, self.factor)
    }

    /// Decode a wire representation into a value of this variable's type
    pub fn unpack(&self, data: &[u8]) -> Result<Value, CodecError> {
        datatypes::unpack(self.datatype, data, self.factor)
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if !self.datatype.is_numeric() && (self.minimum.is_some() || self.maximum.is_some()) {
            return Err(format!(
                "minimum/maximum not available with datatype {:?}",
                self.datatype
            ));
        }
        if let Some(default) = &self.default {
            if !default.matches(self.datatype) {
                return Err(format!(
                    "default value does not match datatype {:?}",
                    self.datatype
                ));
            }
        }
        Ok(())
    }
}

/// An ordered mapping from sub-index to heterogeneous variables
///
/// Sub-index 0 is implicit: it reports the highest populated sub-index as a
/// read-only UNSIGNED8.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// Human readable name, used by the EDS generator
    pub name: Option<String>,
    variables: BTreeMap<u8, Variable>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty named record
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            variables: BTreeMap::new(),
        }
    }

    /// Add a variable at a sub-index in 1..=255
    pub fn insert(&mut self, sub: u8, variable: Variable) -> &mut Self {
        assert!(sub != 0, "Sub-index 0 of a record is implicit");
        self.variables.insert(sub, variable);
        self
    }

    /// The highest populated sub-index
    pub fn largest_subindex(&self) -> u8 {
        self.variables.keys().next_back().copied().unwrap_or(0)
    }

    /// Get the variable at a sub-index; sub 0 is synthesized
    pub fn get(&self, sub: u8) -> Option<Variable> {
        if sub == 0 {
            Some(
                Variable::new(DataType::Unsigned8, AccessType::Const)
                    .with_default(self.largest_subindex())
                    .named("Highest sub-index supported"),
            )
        } else {
            self.variables.get(&sub).cloned()
        }
    }

    /// Iterate the explicitly populated sub-indices in order
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Variable)> {
        self.variables.iter().map(|(sub, var)| (*sub, var))
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        for variable in self.variables.values() {
            variable.check()?;
        }
        Ok(())
    }
}

/// One variable replicated over sub-indices 1..=N
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    /// Human readable name, used by the EDS generator
    pub name: Option<String>,
    template: Variable,
    length: u8,
    mutable_length: bool,
}

impl Array {
    /// Create an array of `length` slots described by `template`
    pub fn new(template: Variable, length: u8) -> Self {
        Self {
            name: None,
            template,
            length,
            mutable_length: false,
        }
    }

    /// Make sub-index 0 (the element count) writable
    pub fn mutable_length(mut self, mutable: bool) -> Self {
        self.mutable_length = mutable;
        self
    }

    /// Set the human readable name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The number of element slots
    pub fn length(&self) -> u8 {
        self.length
    }

    /// The template variable describing each element
    pub fn template(&self) -> &Variable {
        &self.template
    }

    /// Get the variable at a sub-index; sub 0 is the element count
    pub fn get(&self, sub: u8) -> Option<Variable> {
        if sub == 0 {
            let access = if self.mutable_length {
                AccessType::Rw
            } else {
                AccessType::Const
            };
            Some(
                Variable::new(DataType::Unsigned8, access)
                    .with_default(self.length)
                    .named("Number of entries"),
            )
        } else if sub <= self.length {
            Some(self.template.clone())
        } else {
            None
        }
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        self.template.check()
    }
}

/// A dictionary entry
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    /// A single variable, accessed at sub-index 0
    Variable(Variable),
    /// A record of heterogeneous variables
    Record(Record),
    /// An array of homogeneous variables
    Array(Array),
}

impl Object {
    /// The CiA 301 object code, as used in EDS files
    pub fn object_code(&self) -> u8 {
        match self {
            Object::Variable(_) => 0x7,
            Object::Array(_) => 0x8,
            Object::Record(_) => 0x9,
        }
    }

    /// The human readable name of the entry
    pub fn name(&self) -> Option<&str> {
        match self {
            Object::Variable(v) => v.name.as_deref(),
            Object::Record(r) => r.name.as_deref(),
            Object::Array(a) => a.name.as_deref(),
        }
    }

    /// Get the variable at a sub-index
    ///
    /// For a Variable entry only sub 0 exists.
    pub fn get(&self, sub: u8) -> Option<Variable> {
        match self {
            Object::Variable(v) => {
                if sub == 0 {
                    Some(v.clone())
                } else {
                    None
                }
            }
            Object::Record(r) => r.get(sub),
            Object::Array(a) => a.get(sub),
        }
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        match self {
            Object::Variable(v) => v.check(),
            Object::Record(r) => r.check(),
            Object::Array(a) => a.check(),
        }
    }
}

impl From<Variable> for Object {
    fn from(value: Variable) -> Self {
        Object::Variable(value)
    }
}

impl From<Record> for Object {
    fn from(value: Record) -> Self {
        Object::Record(value)
    }
}

impl From<Array> for Object {
    fn from(value: Array) -> Self {
        Object::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sub0_reports_largest() {
        let mut record = Record::new();
        record.insert(1, Variable::new(DataType::Unsigned32, AccessType::Ro));
        record.insert(4, Variable::new(DataType::Unsigned32, AccessType::Ro));
        let sub0 = record.get(0).unwrap();
        assert_eq!(Some(Value::Unsigned8(4)), sub0.default);
        assert_eq!(AccessType::Const, sub0.access);
    }

    #[test]
    fn test_array_bounds() {
        let array = Array::new(Variable::new(DataType::Unsigned32, AccessType::Rw), 8);
        assert!(array.get(8).is_some());
        assert!(array.get(9).is_none());
        assert_eq!(Some(Value::Unsigned8(8)), array.get(0).unwrap().default);
    }

    #[test]
    fn test_limits_rejected_on_strings() {
        let var = Variable::new(DataType::VisibleString, AccessType::Rw).with_minimum(0.0);
        assert!(var.check().is_err());
    }
}
