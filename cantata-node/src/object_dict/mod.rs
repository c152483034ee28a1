//! Object Dictionary
//!
//! The dictionary is the main mechanism of configuration and communication
//! for a node: a sparse store of typed values addressed by a 16-bit index
//! and an 8-bit sub-index (together, a *multiplexor*). Entries come in
//! three varieties:
//!
//! - VAR: a single variable, accessed at sub-index 0
//! - ARRAY: one variable replicated over sub-indices 1..=N, with the count
//!   at sub-index 0
//! - RECORD: heterogeneous variables, with the highest populated sub-index
//!   reported at sub-index 0
//!
//! # The callback fabric
//!
//! Every slot carries three independent callback lists and an optional read
//! override. On [`ObjectDictionary::write`] the order is: `validate`
//! (first-fail; a failure aborts the write), value replacement, `update`
//! (ignore), and — only for writes arriving from a remote SDO transfer —
//! `download` (ignore). Services couple themselves to the dictionary
//! through these lists; e.g. an active TPDO re-packs its cache from an
//! `update` callback on every mapped slot.
//!
//! Entries are inserted before the node starts serving and are immutable
//! afterwards; only their values change.

mod objects;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use cantata_common::datatypes::Value;
use snafu::{ResultExt, Snafu};

use crate::callbacks::{CallbackError, CallbackHandler, FailMode};

pub use objects::{Array, Object, Record, Variable};

/// The (index, sub-index) pair addressing a slot
pub type Multiplexor = (u16, u8);

type ReadOverride = Arc<dyn Fn() -> Result<Value, CallbackError> + Send + Sync>;

/// Errors returned by dictionary operations
#[derive(Debug, Snafu)]
pub enum OdError {
    /// No entry is registered at the index
    #[snafu(display("no object at index {index:#06X}"))]
    NoObject {
        /// The index
        index: u16,
    },
    /// The entry exists but has no such sub-index
    #[snafu(display("no sub-index {sub} at index {index:#06X}"))]
    NoSubIndex {
        /// The index
        index: u16,
        /// The sub-index
        sub: u8,
    },
    /// The value's type does not match the slot's datatype
    #[snafu(display("value does not match the datatype of {index:#06X}:{sub}"))]
    TypeMismatch {
        /// The index
        index: u16,
        /// The sub-index
        sub: u8,
    },
    /// A validate callback rejected the write
    #[snafu(display("write to {index:#06X}:{sub} rejected: {source}"))]
    Rejected {
        /// The index
        index: u16,
        /// The sub-index
        sub: u8,
        /// The callback's error
        source: CallbackError,
    },
    /// The read override failed to produce a value
    #[snafu(display("read of {index:#06X}:{sub} failed: {source}"))]
    ReadFailed {
        /// The index
        index: u16,
        /// The sub-index
        sub: u8,
        /// The callback's error
        source: CallbackError,
    },
    /// The entry descriptor violates an invariant
    #[snafu(display("invalid entry at {index:#06X}: {reason}"))]
    InvalidEntry {
        /// The index
        index: u16,
        /// What is wrong with it
        reason: String,
    },
}

#[derive(Default)]
struct OdState {
    objects: BTreeMap<u16, Object>,
    values: HashMap<Multiplexor, Value>,
    validate: HashMap<Multiplexor, Arc<CallbackHandler<Value>>>,
    update: HashMap<Multiplexor, Arc<CallbackHandler<Value>>>,
    download: HashMap<Multiplexor, Arc<CallbackHandler<Value>>>,
    read_overrides: HashMap<Multiplexor, ReadOverride>,
}

/// The object dictionary of a node
#[derive(Default)]
pub struct ObjectDictionary {
    inner: Mutex<OdState>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry
    ///
    /// Must precede any access to the index. Re-inserting an index replaces
    /// the descriptor but not the stored values.
    pub fn insert(&self, index: u16, object: impl Into<Object>) -> Result<(), OdError> {
        let object = object.into();
        object
            .check()
            .map_err(|reason| OdError::InvalidEntry { index, reason })?;
        self.inner.lock().unwrap().objects.insert(index, object);
        Ok(())
    }

    /// Returns true if an entry is registered at the index
    pub fn contains(&self, index: u16) -> bool {
        self.inner.lock().unwrap().objects.contains_key(&index)
    }

    /// Look up the variable descriptor of a slot
    ///
    /// For Variable entries the sub-index must be 0.
    pub fn lookup(&self, index: u16, sub: u8) -> Result<Variable, OdError> {
        let inner = self.inner.lock().unwrap();
        let object = inner.objects.get(&index).ok_or(OdError::NoObject { index })?;
        object.get(sub).ok_or(OdError::NoSubIndex { index, sub })
    }

    /// Read the value of a slot
    ///
    /// A read override takes precedence; otherwise the stored value is
    /// returned, materializing the descriptor default (or zero / an empty
    /// byte string) if the slot was never written.
    pub fn read(&self, index: u16, sub: u8) -> Result<Value, OdError> {
        let variable = self.lookup(index, sub)?;

        let read_override = {
            let inner = self.inner.lock().unwrap();
            inner.read_overrides.get(&(index, sub)).cloned()
        };
        if let Some(read_override) = read_override {
            return read_override().context(ReadFailedSnafu { index, sub });
        }

        if let Some(value) = self.inner.lock().unwrap().values.get(&(index, sub)) {
            return Ok(value.clone());
        }

        Ok(variable
            .default
            .clone()
            .unwrap_or_else(|| Value::zero(variable.datatype)))
    }

    /// Write the value of a slot
    ///
    /// `downloaded` marks writes originating from a remote SDO transfer;
    /// local programmatic writes pass false. Validate callbacks run first
    /// and a failure aborts the write; update callbacks fire after the
    /// value is replaced; download callbacks fire last, and only when
    /// `downloaded` is set.
    ///
    /// The write is schema-aware but policy-free: the value's type must
    /// match the slot's datatype, but `minimum`/`maximum` are *not*
    /// enforced here — the SDO server enforces them at the protocol edge,
    /// and applications wanting the same check on local writes register a
    /// validate callback.
    pub fn write(
        &self,
        index: u16,
        sub: u8,
        value: Value,
        downloaded: bool,
    ) -> Result<(), OdError> {
        let variable = self.lookup(index, sub)?;
        if !value.matches(variable.datatype) {
            return Err(OdError::TypeMismatch { index, sub });
        }

        let (validate, update, download) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.validate.get(&(index, sub)).cloned(),
                inner.update.get(&(index, sub)).cloned(),
                inner.download.get(&(index, sub)).cloned(),
            )
        };

        if let Some(validate) = validate {
            validate
                .call(&value)
                .context(RejectedSnafu { index, sub })?;
        }

        self.inner
            .lock()
            .unwrap()
            .values
            .insert((index, sub), value.clone());

        if let Some(update) = update {
            let _ = update.call(&value);
        }
        if downloaded {
            if let Some(download) = download {
                let _ = download.call(&value);
            }
        }
        Ok(())
    }

    /// Returns true if the slot has been written at least once
    pub fn has_value(&self, index: u16, sub: u8) -> bool {
        self.inner
            .lock()
            .unwrap()
            .values
            .contains_key(&(index, sub))
    }

    /// Install the read override for a slot, replacing any previous one
    pub fn set_read_override(
        &self,
        index: u16,
        sub: u8,
        read: impl Fn() -> Result<Value, CallbackError> + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .unwrap()
            .read_overrides
            .insert((index, sub), Arc::new(read));
    }

    /// The validate callbacks of a slot (first-fail)
    pub fn validate_callbacks(&self, index: u16, sub: u8) -> Arc<CallbackHandler<Value>> {
        self.inner
            .lock()
            .unwrap()
            .validate
            .entry((index, sub))
            .or_insert_with(|| Arc::new(CallbackHandler::new(FailMode::FirstFail)))
            .clone()
    }

    /// The update callbacks of a slot (ignore)
    pub fn update_callbacks(&self, index: u16, sub: u8) -> Arc<CallbackHandler<Value>> {
        self.inner
            .lock()
            .unwrap()
            .update
            .entry((index, sub))
            .or_insert_with(|| Arc::new(CallbackHandler::new(FailMode::Ignore)))
            .clone()
    }

    /// The download callbacks of a slot (ignore)
    pub fn download_callbacks(&self, index: u16, sub: u8) -> Arc<CallbackHandler<Value>> {
        self.inner
            .lock()
            .unwrap()
            .download
            .entry((index, sub))
            .or_insert_with(|| Arc::new(CallbackHandler::new(FailMode::Ignore)))
            .clone()
    }

    /// The registered indices, in ascending order
    pub fn indices(&self) -> Vec<u16> {
        self.inner.lock().unwrap().objects.keys().copied().collect()
    }

    /// Clone the entry descriptor at an index
    pub fn object(&self, index: u16) -> Option<Object> {
        self.inner.lock().unwrap().objects.get(&index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantata_common::datatypes::{AccessType, DataType};

    fn dict_with_u16(index: u16) -> ObjectDictionary {
        let od = ObjectDictionary::new();
        od.insert(
            index,
            Variable::new(DataType::Unsigned16, AccessType::Rw).with_default(5u16),
        )
        .unwrap();
        od
    }

    #[test]
    fn test_lookup_missing_object() {
        let od = ObjectDictionary::new();
        assert!(matches!(
            od.lookup(0x2000, 0),
            Err(OdError::NoObject { index: 0x2000 })
        ));
    }

    #[test]
    fn test_lookup_missing_sub_index() {
        let od = ObjectDictionary::new();
        let mut record = Record::new();
        record.insert(1, Variable::new(DataType::Unsigned32, AccessType::Ro));
        od.insert(0x2000, record).unwrap();
        assert!(od.lookup(0x2000, 1).is_ok());
        assert!(od.lookup(0x2000, 0).is_ok());
        assert!(matches!(
            od.lookup(0x2000, 2),
            Err(OdError::NoSubIndex {
                index: 0x2000,
                sub: 2
            })
        ));
    }

    #[test]
    fn test_variable_sub_must_be_zero() {
        let od = dict_with_u16(0x2000);
        assert!(matches!(
            od.lookup(0x2000, 1),
            Err(OdError::NoSubIndex { .. })
        ));
    }

    #[test]
    fn test_default_materialization() {
        let od = dict_with_u16(0x2000);
        assert_eq!(Value::Unsigned16(5), od.read(0x2000, 0).unwrap());
        assert!(!od.has_value(0x2000, 0));

        // An undefaulted numeric reads as zero, strings as empty
        od.insert(0x2001, Variable::new(DataType::Integer32, AccessType::Rw))
            .unwrap();
        od.insert(
            0x2002,
            Variable::new(DataType::Domain, AccessType::Rw),
        )
        .unwrap();
        assert_eq!(Value::Integer32(0), od.read(0x2001, 0).unwrap());
        assert_eq!(Value::Bytes(vec![]), od.read(0x2002, 0).unwrap());
    }

    #[test]
    fn test_write_replaces_value() {
        let od = dict_with_u16(0x2000);
        od.write(0x2000, 0, Value::Unsigned16(99), false).unwrap();
        assert_eq!(Value::Unsigned16(99), od.read(0x2000, 0).unwrap());
        assert!(od.has_value(0x2000, 0));
    }

    #[test]
    fn test_write_type_mismatch() {
        let od = dict_with_u16(0x2000);
        assert!(matches!(
            od.write(0x2000, 0, Value::Unsigned8(1), false),
            Err(OdError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_callback_order_and_gating() {
        let od = Arc::new(dict_with_u16(0x2000));
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let t = trace.clone();
        od.validate_callbacks(0x2000, 0).add(move |_| {
            t.lock().unwrap().push("validate");
            Ok(())
        });
        let t = trace.clone();
        od.update_callbacks(0x2000, 0).add(move |_| {
            t.lock().unwrap().push("update");
            Ok(())
        });
        let t = trace.clone();
        od.download_callbacks(0x2000, 0).add(move |_| {
            t.lock().unwrap().push("download");
            Ok(())
        });

        od.write(0x2000, 0, Value::Unsigned16(1), false).unwrap();
        assert_eq!(vec!["validate", "update"], *trace.lock().unwrap());

        trace.lock().unwrap().clear();
        od.write(0x2000, 0, Value::Unsigned16(2), true).unwrap();
        assert_eq!(
            vec!["validate", "update", "download"],
            *trace.lock().unwrap()
        );
    }

    #[test]
    fn test_validate_failure_aborts_write() {
        let od = dict_with_u16(0x2000);
        od.validate_callbacks(0x2000, 0)
            .add(|_| Err(CallbackError::new("nope")));
        let update_fired = Arc::new(Mutex::new(false));
        let flag = update_fired.clone();
        od.update_callbacks(0x2000, 0).add(move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        assert!(matches!(
            od.write(0x2000, 0, Value::Unsigned16(1), true),
            Err(OdError::Rejected { .. })
        ));
        // Value untouched, update never fired
        assert_eq!(Value::Unsigned16(5), od.read(0x2000, 0).unwrap());
        assert!(!*update_fired.lock().unwrap());
    }

    #[test]
    fn test_read_override() {
        let od = dict_with_u16(0x2000);
        od.set_read_override(0x2000, 0, || Ok(Value::Unsigned16(1234)));
        assert_eq!(Value::Unsigned16(1234), od.read(0x2000, 0).unwrap());

        od.set_read_override(0x2000, 0, || Err(CallbackError::new("gone")));
        assert!(matches!(
            od.read(0x2000, 0),
            Err(OdError::ReadFailed { .. })
        ));
    }

    #[test]
    fn test_callbacks_can_write_reentrantly() {
        // An update callback writing a different slot must not deadlock
        let od = Arc::new(ObjectDictionary::new());
        od.insert(0x2000, Variable::new(DataType::Unsigned16, AccessType::Rw))
            .unwrap();
        od.insert(0x2001, Variable::new(DataType::Unsigned16, AccessType::Rw))
            .unwrap();

        let od2 = od.clone();
        od.update_callbacks(0x2000, 0).add(move |value| {
            od2.write(0x2001, 0, value.clone(), false)
                .map_err(|e| CallbackError::new(e.to_string()))
        });

        od.write(0x2000, 0, Value::Unsigned16(7), false).unwrap();
        assert_eq!(Value::Unsigned16(7), od.read(0x2001, 0).unwrap());
    }

    #[test]
    fn test_insert_rejects_invalid_descriptor() {
        let od = ObjectDictionary::new();
        assert!(matches!(
            od.insert(
                0x2000,
                Variable::new(DataType::VisibleString, AccessType::Rw).with_maximum(10.0),
            ),
            Err(OdError::InvalidEntry { .. })
        ));
    }
}
