//! SYNC consumer
//!
//! Receives SYNC frames on the configurable COB-ID stored at 0x1005 and
//! fans them out to registered callbacks in order. The payload is not
//! inspected.

use std::sync::{Arc, Mutex, Weak};

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::traits::CanNetwork;

use crate::callbacks::CallbackHandler;
use crate::object_dict::{ObjectDictionary, Variable};

pub(crate) struct SyncShared {
    weak: Weak<SyncShared>,
    network: Arc<dyn CanNetwork>,
    cob_id: Mutex<u32>,
    pub(crate) callbacks: CallbackHandler<()>,
}

impl SyncShared {
    fn subscribe(&self, cob_id: u32) {
        let weak = self.weak.clone();
        self.network.add_subscription(
            (cob_id & 0x7FF) as u16,
            Arc::new(move |_cob_id, _data| {
                if let Some(shared) = weak.upgrade() {
                    let _ = shared.callbacks.call(&());
                }
            }),
        );
    }

    fn update_cob_id(&self, value: u32) {
        let mut cob_id = self.cob_id.lock().unwrap();
        self.network.remove_subscription((*cob_id & 0x7FF) as u16);
        *cob_id = value & 0x1FFF_FFFF;
        let new = *cob_id;
        drop(cob_id);
        self.subscribe(new);
    }
}

/// The SYNC consumer service
pub struct SyncService {
    shared: Arc<SyncShared>,
}

impl SyncService {
    pub(crate) fn new(network: Arc<dyn CanNetwork>, od: &ObjectDictionary) -> Self {
        od.insert(
            object_ids::SYNC_COB_ID,
            Variable::new(DataType::Unsigned32, AccessType::Rw)
                .with_default(cob_ids::SYNC as u32)
                .named("COB-ID SYNC"),
        )
        .expect("SYNC COB-ID entry is valid");

        let shared = Arc::new_cyclic(|weak| SyncShared {
            weak: weak.clone(),
            network,
            cob_id: Mutex::new(cob_ids::SYNC as u32),
            callbacks: CallbackHandler::default(),
        });

        let weak = Arc::downgrade(&shared);
        od.update_callbacks(object_ids::SYNC_COB_ID, 0)
            .add(move |value: &Value| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u32()) {
                    shared.update_cob_id(value);
                }
                Ok(())
            });

        shared.subscribe(cob_ids::SYNC as u32);
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SyncShared> {
        &self.shared
    }

    /// Callbacks invoked, in order, on every received SYNC
    pub fn callbacks(&self) -> &CallbackHandler<()> {
        &self.shared.callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantata_common::test_utils::MockNetwork;

    #[test]
    fn test_sync_fan_out() {
        let network = MockNetwork::new();
        let od = ObjectDictionary::new();
        let sync = SyncService::new(network.clone(), &od);

        let count = Arc::new(Mutex::new(0));
        let inner = count.clone();
        sync.callbacks().add(move |_| {
            *inner.lock().unwrap() += 1;
            Ok(())
        });

        network.receive(0x080, &[]);
        network.receive(0x080, &[]);
        assert_eq!(2, *count.lock().unwrap());
    }

    #[test]
    fn test_cob_id_reassignment() {
        let network = MockNetwork::new();
        let od = ObjectDictionary::new();
        let sync = SyncService::new(network.clone(), &od);

        let count = Arc::new(Mutex::new(0));
        let inner = count.clone();
        sync.callbacks().add(move |_| {
            *inner.lock().unwrap() += 1;
            Ok(())
        });

        od.write(0x1005, 0, Value::Unsigned32(0x81), false).unwrap();
        network.receive(0x080, &[]);
        assert_eq!(0, *count.lock().unwrap());
        network.receive(0x081, &[]);
        assert_eq!(1, *count.lock().unwrap());
    }
}
