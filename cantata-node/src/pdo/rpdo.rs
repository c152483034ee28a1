//! Receive PDO

use std::sync::{Arc, Mutex, Weak};

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::messages::NmtState;
use cantata_common::traits::CanNetwork;

use crate::callbacks::CallbackId;
use crate::emcy::EmcyService;
use crate::nmt::NmtShared;
use crate::object_dict::{Array, Multiplexor, ObjectDictionary, Record, Variable};
use crate::pdo::{mapping_entry, read_mapping, resolve_mapping, PdoError};
use crate::sync::SyncShared;

/// EMCY error code raised for a received PDO whose length does not match
/// the mapping
const EMCY_PDO_LENGTH_ERROR: u16 = 0x8210;

struct ActiveMapping {
    variables: Vec<Variable>,
    expected_size: usize,
    subscribed_cob: u16,
    sync_cb: Option<CallbackId>,
}

struct RpdoState {
    cob_id: u32,
    transmission_type: u8,
    multiplexors: Vec<Multiplexor>,
    active: Option<ActiveMapping>,
    // Frame awaiting the next SYNC (transmission types 0..=240)
    buffered: Option<Vec<u8>>,
}

pub(crate) struct RpdoShared {
    weak: Weak<RpdoShared>,
    number: usize,
    comm_index: u16,
    map_index: u16,
    network: Arc<dyn CanNetwork>,
    od: Arc<ObjectDictionary>,
    nmt: Arc<NmtShared>,
    sync: Arc<SyncShared>,
    emcy: EmcyService,
    state: Mutex<RpdoState>,
}

impl RpdoShared {
    fn activate(&self) {
        let (multiplexors, transmission_type, cob_id) = {
            let state = self.state.lock().unwrap();
            if state.active.is_some() {
                return;
            }
            if state.cob_id & (1 << 31) != 0 || state.multiplexors.is_empty() {
                return;
            }
            (
                state.multiplexors.clone(),
                state.transmission_type,
                state.cob_id,
            )
        };
        if self.nmt.state() != NmtState::Operational {
            return;
        }

        let variables = match resolve_mapping(&self.od, &multiplexors) {
            Ok(variables) => variables,
            Err(e) => {
                log::warn!("RPDO {} mapping cannot be activated: {e}", self.number + 1);
                return;
            }
        };
        let expected_size = variables.iter().map(|v| v.size().unwrap_or(0)).sum();

        let sync_cb = if transmission_type <= 240 {
            let weak = self.weak.clone();
            Some(self.sync.callbacks.add(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_sync();
                }
                Ok(())
            }))
        } else {
            None
        };

        let subscribed_cob = (cob_id & 0x7FF) as u16;
        let weak = self.weak.clone();
        self.network.add_subscription(
            subscribed_cob,
            Arc::new(move |_cob_id, data| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_frame(data);
                }
            }),
        );

        let mut state = self.state.lock().unwrap();
        state.buffered = None;
        state.active = Some(ActiveMapping {
            variables,
            expected_size,
            subscribed_cob,
            sync_cb,
        });
    }

    fn deactivate(&self) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.buffered = None;
            match state.active.take() {
                Some(active) => active,
                None => return,
            }
        };
        self.network.remove_subscription(removed.subscribed_cob);
        if let Some(id) = removed.sync_cb {
            self.sync.callbacks.remove(id);
        }
    }

    fn remap(&self, multiplexors: Vec<Multiplexor>) {
        self.deactivate();
        self.state.lock().unwrap().multiplexors = multiplexors;
        self.activate();
    }

    fn handle_frame(&self, data: &[u8]) {
        let deferred = {
            let mut state = self.state.lock().unwrap();
            if state.active.is_none() {
                return;
            }
            if state.transmission_type <= 240 {
                state.buffered = Some(data.to_vec());
                true
            } else {
                false
            }
        };
        if !deferred {
            self.apply(data);
        }
    }

    fn on_sync(&self) {
        let buffered = self.state.lock().unwrap().buffered.take();
        if let Some(data) = buffered {
            self.apply(&data);
        }
    }

    /// Unpack a frame and write the mapped slots
    ///
    /// Per-slot write failures are swallowed: the producer cannot be
    /// answered. A length mismatch raises EMCY 0x8210 and drops the frame.
    fn apply(&self, data: &[u8]) {
        let (multiplexors, variables, expected_size) = {
            let state = self.state.lock().unwrap();
            let Some(active) = state.active.as_ref() else {
                return;
            };
            (
                state.multiplexors.clone(),
                active.variables.clone(),
                active.expected_size,
            )
        };

        if data.len() != expected_size {
            log::debug!(
                "RPDO {} received {} bytes, expected {expected_size}",
                self.number + 1,
                data.len()
            );
            let _ = self.emcy.set(EMCY_PDO_LENGTH_ERROR, 0, &[]);
            return;
        }

        let mut offset = 0;
        for (mux, variable) in multiplexors.iter().zip(variables) {
            let size = variable.size().unwrap_or(0);
            if let Ok(value) = variable.unpack(&data[offset..offset + size]) {
                let _ = self.od.write(mux.0, mux.1, value, true);
            }
            offset += size;
        }
    }

    fn on_nmt_state(&self, nmt_state: NmtState) {
        if nmt_state == NmtState::Operational {
            if self.number < 4 {
                let mut state = self.state.lock().unwrap();
                state.cob_id = (state.cob_id & 0xE000_0000)
                    + cob_ids::RPDO_BASE as u32
                    + (self.number as u32 * 0x100)
                    + self.nmt.node_id().raw() as u32;
            }
            self.activate();
        } else {
            self.deactivate();
        }
    }

    fn downloaded_cob_id(&self, value: u32) {
        self.state.lock().unwrap().cob_id = value;
        if value & (1 << 31) != 0 {
            self.deactivate();
        } else {
            self.activate();
        }
    }

    fn set_transmission_type(&self, value: u8) {
        self.deactivate();
        self.state.lock().unwrap().transmission_type = value;
        self.activate();
    }

    fn downloaded_map_length(&self, count: u8) {
        match read_mapping(&self.od, self.map_index, count) {
            Ok(multiplexors) => self.remap(multiplexors),
            Err(e) => log::warn!("RPDO {} mapping not applied: {e}", self.number + 1),
        }
    }
}

/// A receive PDO
pub struct Rpdo {
    shared: Arc<RpdoShared>,
}

impl Rpdo {
    pub(crate) fn new(
        number: usize,
        network: Arc<dyn CanNetwork>,
        od: Arc<ObjectDictionary>,
        nmt: Arc<NmtShared>,
        sync: Arc<SyncShared>,
        emcy: EmcyService,
    ) -> Self {
        let comm_index = object_ids::RPDO_COMM_BASE + number as u16;
        let map_index = object_ids::RPDO_MAPPING_BASE + number as u16;

        let cob_id = if number < 4 {
            cob_ids::RPDO_BASE as u32 + number as u32 * 0x100 + nmt.node_id().raw() as u32
        } else {
            0x8000_0000
        };

        let mut comm = Record::named(format!("RPDO {} Communication Parameter", number + 1));
        comm.insert(
            1,
            Variable::new(DataType::Unsigned32, AccessType::Rw)
                .with_default(cob_id)
                .named("COB-ID used by RPDO"),
        );
        comm.insert(
            2,
            Variable::new(DataType::Unsigned8, AccessType::Rw)
                .with_default(255u8)
                .named("Transmission Type"),
        );
        od.insert(comm_index, comm).expect("RPDO comm record is valid");

        od.insert(
            map_index,
            Array::new(
                Variable::new(DataType::Unsigned32, AccessType::Rw).named("Mapped Object"),
                super::MAX_MAPPINGS as u8,
            )
            .mutable_length(true)
            .named(format!("RPDO {} Mapping Parameter", number + 1)),
        )
        .expect("RPDO mapping array is valid");
        od.write(map_index, 0, Value::Unsigned8(0), false)
            .expect("mapping count slot exists");

        let shared = Arc::new_cyclic(|weak| RpdoShared {
            weak: weak.clone(),
            number,
            comm_index,
            map_index,
            network,
            od: od.clone(),
            nmt: nmt.clone(),
            sync,
            emcy,
            state: Mutex::new(RpdoState {
                cob_id,
                transmission_type: 255,
                multiplexors: Vec::new(),
                active: None,
                buffered: None,
            }),
        });

        let weak = Arc::downgrade(&shared);
        od.download_callbacks(comm_index, 1).add(move |value: &Value| {
            if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u32()) {
                shared.downloaded_cob_id(value);
            }
            Ok(())
        });
        let weak = Arc::downgrade(&shared);
        od.download_callbacks(comm_index, 2).add(move |value: &Value| {
            if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u8()) {
                shared.set_transmission_type(value);
            }
            Ok(())
        });
        let weak = Arc::downgrade(&shared);
        od.download_callbacks(map_index, 0).add(move |value: &Value| {
            if let (Some(shared), Some(count)) = (weak.upgrade(), value.as_u8()) {
                shared.downloaded_map_length(count);
            }
            Ok(())
        });

        let weak = Arc::downgrade(&shared);
        nmt.state_callbacks.add(move |state: &NmtState| {
            if let Some(shared) = weak.upgrade() {
                shared.on_nmt_state(*state);
            }
            Ok(())
        });

        Self { shared }
    }

    /// Map dictionary slots into this PDO, replacing the current mapping
    pub fn set_mapping(&self, multiplexors: &[Multiplexor]) -> Result<(), PdoError> {
        let shared = &self.shared;
        let variables = resolve_mapping(&shared.od, multiplexors)?;

        shared.remap(multiplexors.to_vec());

        for (i, (mux, variable)) in multiplexors.iter().zip(variables).enumerate() {
            let bits = (variable.size().unwrap() * 8) as u8;
            shared.od.write(
                shared.map_index,
                i as u8 + 1,
                Value::Unsigned32(mapping_entry(*mux, bits)),
                false,
            )?;
        }
        shared.od.write(
            shared.map_index,
            0,
            Value::Unsigned8(multiplexors.len() as u8),
            false,
        )?;
        Ok(())
    }

    /// Set the transmission type
    ///
    /// 0..=240 buffer received frames and apply them on the next SYNC; 254
    /// and 255 apply immediately.
    pub fn set_transmission_type(&self, value: u8) {
        self.shared.set_transmission_type(value);
        let _ = self
            .shared
            .od
            .write(self.shared.comm_index, 2, Value::Unsigned8(value), false);
    }

    /// Enable or disable the PDO (bit 31 of the COB-ID)
    pub fn set_enabled(&self, enabled: bool) {
        let cob_id = {
            let mut state = self.shared.state.lock().unwrap();
            if enabled {
                state.cob_id &= !(1 << 31);
            } else {
                state.cob_id |= 1 << 31;
            }
            state.cob_id
        };
        if enabled {
            self.shared.activate();
        } else {
            self.shared.deactivate();
        }
        let _ = self
            .shared
            .od
            .write(self.shared.comm_index, 1, Value::Unsigned32(cob_id), false);
    }

    /// The COB-ID the PDO listens on, including the flag bits
    pub fn cob_id(&self) -> u32 {
        self.shared.state.lock().unwrap().cob_id
    }
}
