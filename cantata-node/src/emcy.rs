//! EMCY producer
//!
//! Emits error events on the COB-ID stored at 0x1014, throttled by the
//! inhibit time at 0x1015 (100 us units). The error register at 0x1001 is
//! written unconditionally. While an inhibit window is open only the most
//! recent event is kept and emitted at expiry; intermediate events are
//! dropped.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::messages::NmtState;
use cantata_common::traits::CanNetwork;
use cantata_common::NodeId;

use crate::nmt::NmtShared;
use crate::object_dict::{ObjectDictionary, OdError, Variable};
use crate::scheduler::{Scheduler, TimerHandle};

struct EmcyState {
    cob_id: u32,
    inhibit_100us: u16,
    // Cleared while NMT-stopped
    active: bool,
    // Set once a peer downloads 0x1014; suppresses the node-id based
    // recomputation on reset
    cob_overridden: bool,
    timer: Option<TimerHandle>,
    epoch: u64,
    deferred: Option<(u16, u8, Vec<u8>)>,
}

pub(crate) struct EmcyShared {
    weak: Weak<EmcyShared>,
    network: Arc<dyn CanNetwork>,
    scheduler: Arc<dyn Scheduler>,
    od: Arc<ObjectDictionary>,
    state: Mutex<EmcyState>,
}

impl EmcyShared {
    fn send_locked(&self, state: &mut EmcyState, code: u16, register: u8, data: &[u8]) {
        if state.inhibit_100us != 0 {
            state.epoch += 1;
            let epoch = state.epoch;
            let weak = self.weak.clone();
            state.timer = Some(self.scheduler.add(
                Duration::from_micros(state.inhibit_100us as u64 * 100),
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.time_up(epoch);
                    }
                }),
            ));
        }

        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&code.to_le_bytes());
        payload[2] = register;
        payload[3..3 + data.len()].copy_from_slice(data);
        self.network.send((state.cob_id & 0x7FF) as u16, &payload);
    }

    fn time_up(&self, epoch: u64) {
        let mut state = self.state.lock().unwrap();
        if state.epoch != epoch {
            return;
        }
        state.timer = None;
        if let Some((code, register, data)) = state.deferred.take() {
            self.send_locked(&mut state, code, register, &data);
        }
    }

    fn update_inhibit(&self, value: u16) {
        let mut state = self.state.lock().unwrap();
        state.epoch += 1;
        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel(timer);
        }
        state.deferred = None;
        state.inhibit_100us = value;
    }

    fn on_nmt_state(&self, nmt_state: NmtState, node_id: NodeId) {
        let mut state = self.state.lock().unwrap();
        match nmt_state {
            NmtState::Stopped => state.active = false,
            NmtState::PreOperational | NmtState::Operational => state.active = true,
            NmtState::Initialisation => {
                if !state.cob_overridden {
                    if let NodeId::Configured(id) = node_id {
                        state.cob_id = (cob_ids::EMCY_BASE + id.raw() as u16) as u32;
                        let cob_id = state.cob_id;
                        drop(state);
                        let _ = self.od.write(
                            object_ids::EMCY_COB_ID,
                            0,
                            Value::Unsigned32(cob_id),
                            false,
                        );
                    }
                }
            }
        }
    }
}

/// The EMCY producer service
///
/// Cloning yields another handle to the same producer; the RPDOs hold one
/// to report malformed frames.
#[derive(Clone)]
pub struct EmcyService {
    shared: Arc<EmcyShared>,
}

impl EmcyService {
    pub(crate) fn new(
        network: Arc<dyn CanNetwork>,
        scheduler: Arc<dyn Scheduler>,
        od: Arc<ObjectDictionary>,
        nmt: Arc<NmtShared>,
    ) -> Self {
        let cob_id = (cob_ids::EMCY_BASE + nmt.node_id().raw() as u16) as u32;

        od.insert(
            object_ids::ERROR_REGISTER,
            Variable::new(DataType::Unsigned8, AccessType::Ro)
                .with_default(0u8)
                .named("Error Register"),
        )
        .expect("error register entry is valid");
        od.insert(
            object_ids::EMCY_COB_ID,
            Variable::new(DataType::Unsigned32, AccessType::Rw)
                .with_default(cob_id)
                .named("COB-ID EMCY"),
        )
        .expect("EMCY COB-ID entry is valid");
        od.insert(
            object_ids::EMCY_INHIBIT_TIME,
            Variable::new(DataType::Unsigned16, AccessType::Rw)
                .with_default(0u16)
                .named("Inhibit Time EMCY"),
        )
        .expect("EMCY inhibit entry is valid");

        let shared = Arc::new_cyclic(|weak| EmcyShared {
            weak: weak.clone(),
            network,
            scheduler,
            od: od.clone(),
            state: Mutex::new(EmcyState {
                cob_id,
                inhibit_100us: 0,
                active: true,
                cob_overridden: false,
                timer: None,
                epoch: 0,
                deferred: None,
            }),
        });

        let weak = Arc::downgrade(&shared);
        od.download_callbacks(object_ids::EMCY_COB_ID, 0)
            .add(move |value: &Value| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u32()) {
                    let mut state = shared.state.lock().unwrap();
                    state.cob_id = value;
                    state.cob_overridden = true;
                }
                Ok(())
            });

        let weak = Arc::downgrade(&shared);
        od.update_callbacks(object_ids::EMCY_INHIBIT_TIME, 0)
            .add(move |value: &Value| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u16()) {
                    shared.update_inhibit(value);
                }
                Ok(())
            });

        let weak = Arc::downgrade(&shared);
        let nmt_weak = Arc::downgrade(&nmt);
        nmt.state_callbacks.add(move |state: &NmtState| {
            if let (Some(shared), Some(nmt)) = (weak.upgrade(), nmt_weak.upgrade()) {
                shared.on_nmt_state(*state, nmt.node_id());
            }
            Ok(())
        });

        Self { shared }
    }

    /// Raise an error event
    ///
    /// Writes `error_register` to 0x1001 unconditionally. The event frame
    /// `{error_code, error_register, data}` is emitted unless the EMCY
    /// COB-ID is disabled (bit 31) or the node is stopped; during an open
    /// inhibit window it is deferred, replacing any earlier deferred event.
    ///
    /// At most 5 bytes of manufacturer data fit the frame; extra bytes are
    /// truncated.
    pub fn set(&self, error_code: u16, error_register: u8, data: &[u8]) -> Result<(), OdError> {
        self.shared.od.write(
            object_ids::ERROR_REGISTER,
            0,
            Value::Unsigned8(error_register),
            false,
        )?;

        let data = &data[..data.len().min(5)];
        let mut state = self.shared.state.lock().unwrap();
        if !state.active || state.cob_id & (1 << 31) != 0 {
            return Ok(());
        }
        if state.timer.is_some() {
            state.deferred = Some((error_code, error_register, data.to_vec()));
            return Ok(());
        }
        self.shared
            .send_locked(&mut state, error_code, error_register, data);
        Ok(())
    }

    /// Returns true if EMCY emission is enabled (COB-ID bit 31 clear)
    pub fn enabled(&self) -> bool {
        self.shared.state.lock().unwrap().cob_id & (1 << 31) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmt::NmtService;
    use crate::scheduler::VirtualScheduler;
    use cantata_common::test_utils::MockNetwork;

    fn setup() -> (
        Arc<MockNetwork>,
        Arc<VirtualScheduler>,
        Arc<ObjectDictionary>,
        EmcyService,
        NmtService,
    ) {
        let network = MockNetwork::new();
        let scheduler = Arc::new(VirtualScheduler::new());
        let od = Arc::new(ObjectDictionary::new());
        let nmt = NmtService::new(network.clone(), NodeId::new(2).unwrap());
        let emcy = EmcyService::new(
            network.clone(),
            scheduler.clone(),
            od.clone(),
            nmt.shared().clone(),
        );
        nmt.set_state(NmtState::PreOperational);
        network.take_sent();
        (network, scheduler, od, emcy, nmt)
    }

    #[test]
    fn test_set_emits_frame_and_register() {
        let (network, _scheduler, od, emcy, _nmt) = setup();

        emcy.set(0x8210, 0x01, &[0xAA]).unwrap();
        let msg = network.take_single_sent();
        assert_eq!(0x082, msg.cob_id);
        assert_eq!(&[0x10, 0x82, 0x01, 0xAA, 0, 0, 0, 0], msg.data());
        assert_eq!(Value::Unsigned8(0x01), od.read(0x1001, 0).unwrap());
    }

    #[test]
    fn test_disabled_by_bit31() {
        let (network, _scheduler, od, emcy, _nmt) = setup();

        od.write(0x1014, 0, Value::Unsigned32(0x8000_0082), true)
            .unwrap();
        emcy.set(0x1000, 0x01, &[]).unwrap();
        assert!(network.take_sent().is_empty());
        // Register still written
        assert_eq!(Value::Unsigned8(0x01), od.read(0x1001, 0).unwrap());
    }

    #[test]
    fn test_inhibit_keeps_latest_only() {
        let (network, scheduler, od, emcy, _nmt) = setup();

        // 100 ms inhibit window
        od.write(0x1015, 0, Value::Unsigned16(1000), false).unwrap();

        emcy.set(0x1000, 0x01, &[]).unwrap();
        assert_eq!(1, network.take_sent().len());

        emcy.set(0x2000, 0x02, &[]).unwrap();
        emcy.set(0x3000, 0x03, &[]).unwrap();
        assert!(network.take_sent().is_empty());

        scheduler.run(Duration::from_millis(100));
        let msg = network.take_single_sent();
        assert_eq!(&[0x00, 0x30, 0x03, 0, 0, 0, 0, 0], msg.data());

        // The deferred emission opened a fresh window
        scheduler.run(Duration::from_millis(100));
        assert!(network.take_sent().is_empty());
        emcy.set(0x4000, 0x04, &[]).unwrap();
        assert_eq!(1, network.take_sent().len());
    }

    #[test]
    fn test_stopped_suppresses_emission() {
        let (network, _scheduler, _od, emcy, nmt) = setup();

        nmt.set_state(NmtState::Stopped);
        emcy.set(0x1000, 0x01, &[]).unwrap();
        assert!(network.take_sent().is_empty());

        nmt.set_state(NmtState::Operational);
        emcy.set(0x1000, 0x01, &[]).unwrap();
        assert_eq!(1, network.take_sent().len());
    }
}
