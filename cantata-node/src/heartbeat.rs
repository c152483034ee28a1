//! Heartbeat producer
//!
//! Emits the node's NMT state on `0x700 + node id` with the period stored
//! at 0x1017 (milliseconds). Writing the period cancels any pending
//! emission; a non-zero period emits immediately and then re-schedules
//! itself.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::traits::CanNetwork;
use cantata_common::NodeId;

use crate::nmt::NmtShared;
use crate::object_dict::{ObjectDictionary, Variable};
use crate::scheduler::{Scheduler, TimerHandle};

struct HeartbeatState {
    handle: Option<TimerHandle>,
    // Bumped on every period change so a stale timer callback that already
    // left the scheduler queue does not double-fire
    epoch: u64,
}

pub(crate) struct HeartbeatShared {
    weak: Weak<HeartbeatShared>,
    network: Arc<dyn CanNetwork>,
    scheduler: Arc<dyn Scheduler>,
    nmt: Arc<NmtShared>,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatShared {
    fn update_interval(&self, period_ms: u16) {
        let epoch = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            if let Some(handle) = state.handle.take() {
                self.scheduler.cancel(handle);
            }
            state.epoch
        };
        if period_ms != 0 {
            self.emit(period_ms, epoch);
        }
    }

    fn emit(&self, period_ms: u16, epoch: u64) {
        if self.state.lock().unwrap().epoch != epoch {
            return;
        }

        if let NodeId::Configured(id) = self.nmt.node_id() {
            self.network.send(
                cob_ids::HEARTBEAT_BASE + id.raw() as u16,
                &[self.nmt.state() as u8],
            );
        }

        let weak = self.weak.clone();
        let handle = self.scheduler.add(
            Duration::from_millis(period_ms as u64),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.emit(period_ms, epoch);
                }
            }),
        );

        let mut state = self.state.lock().unwrap();
        if state.epoch == epoch {
            state.handle = Some(handle);
        } else {
            self.scheduler.cancel(handle);
        }
    }
}

/// The heartbeat producer service
pub struct HeartbeatProducer {
    shared: Arc<HeartbeatShared>,
    od: Arc<ObjectDictionary>,
}

impl HeartbeatProducer {
    pub(crate) fn new(
        network: Arc<dyn CanNetwork>,
        scheduler: Arc<dyn Scheduler>,
        od: Arc<ObjectDictionary>,
        nmt: Arc<NmtShared>,
    ) -> Self {
        od.insert(
            object_ids::HEARTBEAT_PRODUCER_TIME,
            Variable::new(DataType::Unsigned16, AccessType::Rw)
                .named("Producer Heartbeat Time"),
        )
        .expect("heartbeat entry is valid");

        let shared = Arc::new_cyclic(|weak| HeartbeatShared {
            weak: weak.clone(),
            network,
            scheduler,
            nmt,
            state: Mutex::new(HeartbeatState {
                handle: None,
                epoch: 0,
            }),
        });

        let weak = Arc::downgrade(&shared);
        od.update_callbacks(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .add(move |value: &Value| {
                if let (Some(shared), Some(period)) = (weak.upgrade(), value.as_u16()) {
                    shared.update_interval(period);
                }
                Ok(())
            });

        Self { shared, od }
    }

    /// Set the heartbeat period, in milliseconds, through the dictionary
    pub fn set_period(&self, period_ms: u16) {
        let _ = self.od.write(
            object_ids::HEARTBEAT_PRODUCER_TIME,
            0,
            Value::Unsigned16(period_ms),
            false,
        );
    }

    /// The configured heartbeat period in milliseconds
    pub fn period(&self) -> u16 {
        self.od
            .read(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .ok()
            .and_then(|v| v.as_u16())
            .unwrap_or(0)
    }

    /// Returns true while an emission is scheduled
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmt::NmtService;
    use crate::scheduler::VirtualScheduler;
    use cantata_common::messages::NmtState;
    use cantata_common::test_utils::MockNetwork;

    fn setup() -> (
        Arc<MockNetwork>,
        Arc<VirtualScheduler>,
        Arc<ObjectDictionary>,
        HeartbeatProducer,
        NmtService,
    ) {
        let network = MockNetwork::new();
        let scheduler = Arc::new(VirtualScheduler::new());
        let od = Arc::new(ObjectDictionary::new());
        let nmt = NmtService::new(network.clone(), NodeId::new(2).unwrap());
        nmt.set_state(NmtState::PreOperational);
        let heartbeat = HeartbeatProducer::new(
            network.clone(),
            scheduler.clone(),
            od.clone(),
            nmt.shared().clone(),
        );
        network.take_sent();
        (network, scheduler, od, heartbeat, nmt)
    }

    #[test]
    fn test_periodic_emission() {
        let (network, scheduler, od, _heartbeat, _nmt) = setup();

        od.write(0x1017, 0, Value::Unsigned16(100), false).unwrap();
        // One frame immediately on enable
        let msg = network.take_single_sent();
        assert_eq!(0x702, msg.cob_id);
        assert_eq!(&[127], msg.data());

        scheduler.run(Duration::from_millis(350));
        assert_eq!(3, network.take_sent().len());
    }

    #[test]
    fn test_zero_period_cancels() {
        let (network, scheduler, od, _heartbeat, _nmt) = setup();

        od.write(0x1017, 0, Value::Unsigned16(100), false).unwrap();
        network.take_sent();
        od.write(0x1017, 0, Value::Unsigned16(0), false).unwrap();
        scheduler.run(Duration::from_millis(500));
        assert!(network.take_sent().is_empty());
    }

    #[test]
    fn test_period_change_does_not_double_fire() {
        let (network, scheduler, od, _heartbeat, _nmt) = setup();

        od.write(0x1017, 0, Value::Unsigned16(100), false).unwrap();
        od.write(0x1017, 0, Value::Unsigned16(400), false).unwrap();
        network.take_sent();

        // Only the 400ms cadence survives
        scheduler.run(Duration::from_millis(800));
        assert_eq!(2, network.take_sent().len());
    }

    #[test]
    fn test_state_reflected_in_payload() {
        let (network, scheduler, od, _heartbeat, nmt) = setup();

        od.write(0x1017, 0, Value::Unsigned16(100), false).unwrap();
        network.take_sent();
        nmt.set_state(NmtState::Operational);
        scheduler.run(Duration::from_millis(100));
        let msg = network.take_single_sent();
        assert_eq!(&[5], msg.data());
    }
}
