//! Transmit PDO

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::messages::NmtState;
use cantata_common::traits::CanNetwork;

use crate::callbacks::CallbackId;
use crate::nmt::NmtShared;
use crate::object_dict::{Array, Multiplexor, ObjectDictionary, Record, Variable};
use crate::pdo::{mapping_entry, read_mapping, resolve_mapping, PdoError};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::sync::SyncShared;

struct ActiveMapping {
    // Packed bytes per mapped slot; concatenated at emission
    cache: Vec<Vec<u8>>,
    update_cbs: Vec<(Multiplexor, CallbackId)>,
    sync_cb: Option<CallbackId>,
}

#[derive(Default)]
struct InhibitState {
    timer: Option<TimerHandle>,
    epoch: u64,
    retrigger: bool,
}

struct TpdoState {
    cob_id: u32,
    transmission_type: u8,
    inhibit_100us: u16,
    multiplexors: Vec<Multiplexor>,
    active: Option<ActiveMapping>,
    sync_counter: u8,
    // Transmission type 0: a mapped value changed since the last SYNC
    sync_pending: bool,
    inhibit: InhibitState,
}

pub(crate) struct TpdoShared {
    weak: Weak<TpdoShared>,
    number: usize,
    comm_index: u16,
    map_index: u16,
    network: Arc<dyn CanNetwork>,
    scheduler: Arc<dyn Scheduler>,
    od: Arc<ObjectDictionary>,
    nmt: Arc<NmtShared>,
    sync: Arc<SyncShared>,
    state: Mutex<TpdoState>,
}

impl TpdoShared {
    fn activate(&self) {
        let (multiplexors, transmission_type) = {
            let state = self.state.lock().unwrap();
            if state.active.is_some() {
                return;
            }
            if state.cob_id & (1 << 31) != 0 || state.multiplexors.is_empty() {
                return;
            }
            (state.multiplexors.clone(), state.transmission_type)
        };
        if self.nmt.state() != NmtState::Operational {
            return;
        }

        let variables = match resolve_mapping(&self.od, &multiplexors) {
            Ok(variables) => variables,
            Err(e) => {
                log::warn!("TPDO {} mapping cannot be activated: {e}", self.number + 1);
                return;
            }
        };

        // Pre-pack the current values
        let mut cache = Vec::with_capacity(multiplexors.len());
        for (mux, variable) in multiplexors.iter().zip(&variables) {
            let value = match self.od.read(mux.0, mux.1) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("TPDO {} cannot read {:#06X}:{}: {e}", self.number + 1, mux.0, mux.1);
                    return;
                }
            };
            match variable.pack(&value) {
                Ok(bytes) => cache.push(bytes),
                Err(e) => {
                    log::warn!("TPDO {} cannot pack {:#06X}:{}: {e}", self.number + 1, mux.0, mux.1);
                    return;
                }
            }
        }

        let mut update_cbs = Vec::with_capacity(multiplexors.len());
        for (slot, (mux, variable)) in multiplexors.iter().zip(variables).enumerate() {
            let weak = self.weak.clone();
            let id = self.od.update_callbacks(mux.0, mux.1).add(move |value| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_mapped_update(slot, &variable, value);
                }
                Ok(())
            });
            update_cbs.push((*mux, id));
        }

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

        {
            let mut state = self.state.lock().unwrap();
            state.sync_counter = 0;
            state.sync_pending = false;
            state.active = Some(ActiveMapping {
                cache,
                update_cbs,
                sync_cb,
            });
        }

        // Publish the initial state
        match transmission_type {
            254..=255 => self.transmit(),
            0 => self.state.lock().unwrap().sync_pending = true,
            _ => {}
        }
    }

    fn deactivate(&self) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let Some(active) = state.active.take() else {
                return;
            };
            state.inhibit.epoch += 1;
            state.inhibit.retrigger = false;
            if let Some(timer) = state.inhibit.timer.take() {
                self.scheduler.cancel(timer);
            }
            active
        };
        for (mux, id) in removed.update_cbs {
            self.od.update_callbacks(mux.0, mux.1).remove(id);
        }
        if let Some(id) = removed.sync_cb {
            self.sync.callbacks.remove(id);
        }
    }

    fn remap(&self, multiplexors: Vec<Multiplexor>) {
        self.deactivate();
        self.state.lock().unwrap().multiplexors = multiplexors;
        self.activate();
    }

    fn on_mapped_update(&self, slot: usize, variable: &Variable, value: &Value) {
        let transmit_now = {
            let mut state = self.state.lock().unwrap();
            let transmission_type = state.transmission_type;
            let Some(active) = state.active.as_mut() else {
                return;
            };
            match variable.pack(value) {
                Ok(bytes) => active.cache[slot] = bytes,
                Err(e) => {
                    log::warn!("TPDO {} dropped unpackable update: {e}", self.number + 1);
                    return;
                }
            }
            match transmission_type {
                254..=255 => true,
                0 => {
                    state.sync_pending = true;
                    false
                }
                _ => false,
            }
        };
        if transmit_now {
            self.transmit();
        }
    }

    fn on_sync(&self) {
        let emit = {
            let mut state = self.state.lock().unwrap();
            if state.active.is_none() {
                return;
            }
            let transmission_type = state.transmission_type;
            if transmission_type == 0 {
                std::mem::take(&mut state.sync_pending)
            } else if transmission_type <= 240 {
                state.sync_counter += 1;
                if state.sync_counter >= transmission_type {
                    state.sync_counter = 0;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if emit {
            self.transmit();
        }
    }

    fn transmit(&self) {
        let frame = {
            let mut state = self.state.lock().unwrap();
            if state.active.is_none() {
                return;
            }
            let inhibit_100us = state.inhibit_100us;
            if inhibit_100us != 0 {
                if state.inhibit.timer.is_some() {
                    // Remember to publish the latest value at window expiry
                    state.inhibit.retrigger = true;
                    return;
                }
                state.inhibit.epoch += 1;
                let epoch = state.inhibit.epoch;
                let weak = self.weak.clone();
                state.inhibit.timer = Some(self.scheduler.add(
                    Duration::from_micros(inhibit_100us as u64 * 100),
                    Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.inhibit_expired(epoch);
                        }
                    }),
                ));
            }
            let active = state.active.as_ref().unwrap();
            ((state.cob_id & 0x7FF) as u16, active.cache.concat())
        };
        self.network.send(frame.0, &frame.1);
    }

    fn inhibit_expired(&self, epoch: u64) {
        let retrigger = {
            let mut state = self.state.lock().unwrap();
            if state.inhibit.epoch != epoch {
                return;
            }
            state.inhibit.timer = None;
            std::mem::take(&mut state.inhibit.retrigger)
        };
        if retrigger {
            self.transmit();
        }
    }

    fn on_nmt_state(&self, nmt_state: NmtState) {
        if nmt_state == NmtState::Operational {
            if self.number < 4 {
                let mut state = self.state.lock().unwrap();
                state.cob_id = (state.cob_id & 0xE000_0000)
                    + cob_ids::TPDO_BASE as u32
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

    fn update_inhibit(&self, value: u16) {
        let mut state = self.state.lock().unwrap();
        state.inhibit.epoch += 1;
        state.inhibit.retrigger = false;
        if let Some(timer) = state.inhibit.timer.take() {
            self.scheduler.cancel(timer);
        }
        state.inhibit_100us = value;
    }

    fn downloaded_map_length(&self, count: u8) {
        match read_mapping(&self.od, self.map_index, count) {
            Ok(multiplexors) => self.remap(multiplexors),
            Err(e) => log::warn!("TPDO {} mapping not applied: {e}", self.number + 1),
        }
    }
}

/// A transmit PDO
pub struct Tpdo {
    shared: Arc<TpdoShared>,
}

impl Tpdo {
    pub(crate) fn new(
        number: usize,
        network: Arc<dyn CanNetwork>,
        scheduler: Arc<dyn Scheduler>,
        od: Arc<ObjectDictionary>,
        nmt: Arc<NmtShared>,
        sync: Arc<SyncShared>,
    ) -> Self {
        let comm_index = object_ids::TPDO_COMM_BASE + number as u16;
        let map_index = object_ids::TPDO_MAPPING_BASE + number as u16;

        // The first four TPDOs get pre-assigned COB-IDs; the rest start
        // disabled until configured
        let cob_id = if number < 4 {
            0x4000_0000
                | (cob_ids::TPDO_BASE as u32
                    + number as u32 * 0x100
                    + nmt.node_id().raw() as u32)
        } else {
            0xC000_0000
        };

        let mut comm = Record::named(format!("TPDO {} Communication Parameter", number + 1));
        comm.insert(
            1,
            Variable::new(DataType::Unsigned32, AccessType::Rw)
                .with_default(cob_id)
                .named("COB-ID used by TPDO"),
        );
        comm.insert(
            2,
            Variable::new(DataType::Unsigned8, AccessType::Rw)
                .with_default(255u8)
                .named("Transmission Type"),
        );
        comm.insert(
            3,
            Variable::new(DataType::Unsigned16, AccessType::Rw)
                .with_default(0u16)
                .named("Inhibit Time"),
        );
        od.insert(comm_index, comm).expect("TPDO comm record is valid");

        od.insert(
            map_index,
            Array::new(
                Variable::new(DataType::Unsigned32, AccessType::Rw).named("Application Object"),
                super::MAX_MAPPINGS as u8,
            )
            .mutable_length(true)
            .named(format!("TPDO {} Mapping Parameter", number + 1)),
        )
        .expect("TPDO mapping array is valid");
        od.write(map_index, 0, Value::Unsigned8(0), false)
            .expect("mapping count slot exists");

        let shared = Arc::new_cyclic(|weak| TpdoShared {
            weak: weak.clone(),
            number,
            comm_index,
            map_index,
            network,
            scheduler,
            od: od.clone(),
            nmt: nmt.clone(),
            sync,
            state: Mutex::new(TpdoState {
                cob_id,
                transmission_type: 255,
                inhibit_100us: 0,
                multiplexors: Vec::new(),
                active: None,
                sync_counter: 0,
                sync_pending: false,
                inhibit: InhibitState::default(),
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
        od.update_callbacks(comm_index, 3).add(move |value: &Value| {
            if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u16()) {
                shared.update_inhibit(value);
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
    ///
    /// At most 8 slots with a combined size of 8 bytes; every slot must
    /// have a fixed-size datatype. The mapping array in the dictionary is
    /// updated to match.
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
    /// 0 emits on SYNC when a mapped value changed; 1..=240 emit on every
    /// Nth SYNC; 254 and 255 emit on every update of a mapped value.
    pub fn set_transmission_type(&self, value: u8) {
        self.shared.set_transmission_type(value);
        let _ = self
            .shared
            .od
            .write(self.shared.comm_index, 2, Value::Unsigned8(value), false);
    }

    /// Set the inhibit time in multiples of 100 us (0 disables)
    pub fn set_inhibit_time(&self, value_100us: u16) {
        // The update callback carries this into the service state
        let _ = self.shared.od.write(
            self.shared.comm_index,
            3,
            Value::Unsigned16(value_100us),
            false,
        );
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

    /// The COB-ID the PDO is emitted on, including the flag bits
    pub fn cob_id(&self) -> u32 {
        self.shared.state.lock().unwrap().cob_id
    }
}
