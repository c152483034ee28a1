//! LSS responder
//!
//! Implements the responder side of the Layer Setting Services: selective
//! and fastscan identification against the 0x1018 identity, node-id
//! pre-assignment, bit-timing changes with the two-phase activation delay,
//! configuration storage, and identity inquiry. Wrong-length or otherwise
//! malformed frames are logged and dropped.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::lss::{LssIdentity, LssMode, LssRequest, LssResponse, LSS_FASTSCAN_CONFIRM};
use cantata_common::messages::NmtState;
use cantata_common::traits::CanNetwork;
use cantata_common::NodeId;

use crate::callbacks::CallbackError;
use crate::nmt::NmtShared;
use crate::object_dict::ObjectDictionary;
use crate::scheduler::Scheduler;

/// Callback applying a new bit rate, given an index into the standard
/// baud rate table
pub type ChangeBitrateCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Callback persisting the node id; its failure is reported to the master
pub type StoreConfigurationCallback =
    Arc<dyn Fn(NodeId) -> Result<(), CallbackError> + Send + Sync>;

// Indices into the standard baud rate table which name an actual rate
// (5 is reserved)
const VALID_BITRATE_INDICES: [u8; 8] = [0, 1, 2, 3, 4, 6, 7, 8];

struct LssState {
    mode: LssMode,
    selective: [Option<u32>; 4],
    remote: [Option<u32>; 6],
    fastscan_sub: u8,
    pending_bitrate: Option<u8>,
}

#[derive(Default)]
struct LssCallbacks {
    change_bitrate: Option<ChangeBitrateCallback>,
    store_configuration: Option<StoreConfigurationCallback>,
}

pub(crate) struct LssShared {
    weak: Weak<LssShared>,
    network: Arc<dyn CanNetwork>,
    scheduler: Arc<dyn Scheduler>,
    od: Arc<ObjectDictionary>,
    nmt: Arc<NmtShared>,
    state: Mutex<LssState>,
    callbacks: Mutex<LssCallbacks>,
}

impl LssShared {
    fn respond(&self, response: LssResponse) {
        self.network.send(cob_ids::LSS_RESP, &response.to_bytes());
    }

    /// The identity out of the 0x1018 record
    fn identity(&self) -> LssIdentity {
        let read = |sub: u8| {
            self.od
                .read(object_ids::IDENTITY, sub)
                .ok()
                .and_then(|v| v.as_u32())
                .unwrap_or(0)
        };
        LssIdentity::new(read(1), read(2), read(3), read(4))
    }

    fn mode(&self) -> LssMode {
        self.state.lock().unwrap().mode
    }

    fn handle_msg(&self, data: &[u8]) {
        let request = match LssRequest::try_from(data) {
            Ok(request) => request,
            Err(e) => {
                log::info!("Dropping LSS frame {data:02X?}: {e}");
                return;
            }
        };

        let mode = self.mode();
        match request {
            LssRequest::SwitchModeGlobal { mode: target } => self.switch_mode_global(target),
            LssRequest::SwitchStateVendor { vendor_id } => self.switch_selective(0, vendor_id),
            LssRequest::SwitchStateProduct { product_code } => {
                self.switch_selective(1, product_code)
            }
            LssRequest::SwitchStateRevision { revision } => self.switch_selective(2, revision),
            LssRequest::SwitchStateSerial { serial } => self.switch_selective(3, serial),
            LssRequest::IdentifyRemote { slot, value } => self.identify_remote(slot, value),
            LssRequest::IdentifyNonConfigured => {
                if self.nmt.node_id() == NodeId::Unconfigured {
                    self.respond(LssResponse::IdentifyNonConfiguredSlave);
                }
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => self.fastscan(id, bit_check, sub, next),
            LssRequest::ConfigureNodeId { node_id } => {
                if mode == LssMode::Configuration {
                    self.configure_node_id(node_id);
                }
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                if mode == LssMode::Configuration {
                    self.configure_bit_timing(table, index);
                }
            }
            LssRequest::ActivateBitTiming { delay_ms } => {
                if mode == LssMode::Configuration {
                    self.activate_bit_timing(delay_ms);
                }
            }
            LssRequest::StoreConfiguration => {
                if mode == LssMode::Configuration {
                    self.store_configuration();
                }
            }
            LssRequest::InquireVendor => {
                if mode == LssMode::Configuration {
                    self.respond(LssResponse::InquireVendorAck {
                        vendor_id: self.identity().vendor_id,
                    });
                }
            }
            LssRequest::InquireProduct => {
                if mode == LssMode::Configuration {
                    self.respond(LssResponse::InquireProductAck {
                        product_code: self.identity().product_code,
                    });
                }
            }
            LssRequest::InquireRev => {
                if mode == LssMode::Configuration {
                    self.respond(LssResponse::InquireRevAck {
                        revision: self.identity().revision,
                    });
                }
            }
            LssRequest::InquireSerial => {
                if mode == LssMode::Configuration {
                    self.respond(LssResponse::InquireSerialAck {
                        serial: self.identity().serial,
                    });
                }
            }
            LssRequest::InquireNodeId => {
                if mode == LssMode::Configuration {
                    self.respond(LssResponse::InquireNodeIdAck {
                        node_id: self.nmt.node_id().raw(),
                    });
                }
            }
        }
    }

    fn switch_mode_global(&self, target: u8) {
        let target = match LssMode::from_byte(target) {
            Ok(target) => target,
            Err(_) => return,
        };
        let mode = self.mode();
        match (mode, target) {
            (LssMode::Waiting, LssMode::Configuration) => {
                self.state.lock().unwrap().mode = LssMode::Configuration;
            }
            (LssMode::Configuration, LssMode::Waiting) => {
                // A node id assigned during configuration takes effect now
                if self.nmt.node_id() == NodeId::Unconfigured
                    && self.nmt.pending_node_id() != NodeId::Unconfigured
                {
                    self.nmt.reset();
                }
                self.state.lock().unwrap().mode = LssMode::Waiting;
            }
            _ => {}
        }
    }

    fn switch_selective(&self, slot: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        if state.mode != LssMode::Waiting {
            return;
        }
        state.selective[slot] = Some(value);
        if state.selective.iter().any(Option::is_none) {
            return;
        }
        let received: Vec<u32> = state.selective.iter().map(|v| v.unwrap()).collect();
        state.selective = [None; 4];
        drop(state);

        let identity = self.identity();
        let matched = received
            .iter()
            .enumerate()
            .all(|(slot, value)| *value == identity.field(slot as u8));
        if matched {
            self.state.lock().unwrap().mode = LssMode::Configuration;
            self.respond(LssResponse::SwitchStateResponse);
        }
    }

    fn identify_remote(&self, slot: u8, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.remote[slot as usize] = Some(value);
        if state.remote.iter().any(Option::is_none) {
            return;
        }
        let bounds: Vec<u32> = state.remote.iter().map(|v| v.unwrap()).collect();
        state.remote = [None; 6];
        drop(state);

        let identity = self.identity();
        if identity.vendor_id == bounds[0]
            && identity.product_code == bounds[1]
            && (bounds[2]..=bounds[3]).contains(&identity.revision)
            && (bounds[4]..=bounds[5]).contains(&identity.serial)
        {
            self.respond(LssResponse::IdentifySlave);
        }
    }

    fn fastscan(&self, id: u32, bit_check: u8, sub: u8, next: u8) {
        if self.nmt.node_id() != NodeId::Unconfigured {
            return;
        }

        if bit_check == LSS_FASTSCAN_CONFIRM {
            self.state.lock().unwrap().fastscan_sub = 0;
            self.respond(LssResponse::IdentifySlave);
            return;
        }
        if bit_check > 31 || sub > 3 {
            log::debug!("Dropping fastscan with bad fields: bit_check={bit_check} sub={sub}");
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            if sub != state.fastscan_sub {
                return;
            }
            let mask = !((1u32 << bit_check) - 1);
            if self.identity().field(sub) & mask != id & mask {
                return;
            }
            state.fastscan_sub = next;
            if bit_check == 0 && sub == 3 {
                state.mode = LssMode::Configuration;
            }
        }
        self.respond(LssResponse::IdentifySlave);
    }

    fn configure_node_id(&self, node_id: u8) {
        let error = match NodeId::new(node_id) {
            Ok(id) => {
                self.nmt.set_pending_node_id(id);
                0
            }
            Err(_) => 1,
        };
        self.respond(LssResponse::ConfigureNodeIdAck {
            error,
            spec_error: 0,
        });
    }

    fn configure_bit_timing(&self, table: u8, index: u8) {
        let supported = self.callbacks.lock().unwrap().change_bitrate.is_some();
        if table != 0 || !VALID_BITRATE_INDICES.contains(&index) || !supported {
            self.respond(LssResponse::ConfigureBitTimingAck {
                error: 1,
                spec_error: 0,
            });
            return;
        }
        self.state.lock().unwrap().pending_bitrate = Some(index);
        self.respond(LssResponse::ConfigureBitTimingAck {
            error: 0,
            spec_error: 0,
        });
    }

    fn activate_bit_timing(&self, delay_ms: u16) {
        if self.state.lock().unwrap().pending_bitrate.is_none() {
            return;
        }
        let delay = Duration::from_millis(delay_ms as u64);
        let weak = self.weak.clone();
        self.scheduler.add(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_bitrate(delay);
                }
            }),
        );
    }

    /// First phase of the bit rate switch: apply the new rate, then reset
    /// the node after the same delay again
    fn apply_bitrate(&self, delay: Duration) {
        let pending = self.state.lock().unwrap().pending_bitrate.take();
        let callback = self.callbacks.lock().unwrap().change_bitrate.clone();
        if let (Some(callback), Some(index)) = (callback, pending) {
            callback(index);
        }
        let weak = self.weak.clone();
        self.scheduler.add(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.nmt.reset();
                }
            }),
        );
    }

    fn store_configuration(&self) {
        let callback = self.callbacks.lock().unwrap().store_configuration.clone();
        let error = match callback {
            None => 1, // storing is not supported
            Some(callback) => match callback(self.nmt.node_id()) {
                Ok(()) => 0,
                Err(_) => 2,
            },
        };
        self.respond(LssResponse::StoreConfigurationAck {
            error,
            spec_error: 0,
        });
    }
}

/// The LSS responder service
pub struct LssResponder {
    shared: Arc<LssShared>,
}

impl LssResponder {
    pub(crate) fn new(
        network: Arc<dyn CanNetwork>,
        scheduler: Arc<dyn Scheduler>,
        od: Arc<ObjectDictionary>,
        nmt: Arc<NmtShared>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak| LssShared {
            weak: weak.clone(),
            network: network.clone(),
            scheduler,
            od,
            nmt: nmt.clone(),
            state: Mutex::new(LssState {
                mode: LssMode::Waiting,
                selective: [None; 4],
                remote: [None; 6],
                fastscan_sub: 0,
                pending_bitrate: None,
            }),
            callbacks: Mutex::new(LssCallbacks::default()),
        });

        let weak: Weak<LssShared> = Arc::downgrade(&shared);
        network.add_subscription(
            cob_ids::LSS_REQ,
            Arc::new(move |_cob_id, data| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_msg(data);
                }
            }),
        );

        let weak = Arc::downgrade(&shared);
        nmt.state_callbacks.add(move |state: &NmtState| {
            if *state == NmtState::Initialisation {
                if let Some(shared) = weak.upgrade() {
                    let mut lss = shared.state.lock().unwrap();
                    lss.mode = LssMode::Waiting;
                    lss.selective = [None; 4];
                }
            }
            Ok(())
        });

        Self { shared }
    }

    /// The current LSS mode
    pub fn mode(&self) -> LssMode {
        self.shared.mode()
    }

    /// Install the callback applying a new bit rate
    ///
    /// Without one, ConfigureBitTiming requests are answered with an error.
    pub fn set_change_bitrate_callback(&self, callback: impl Fn(u8) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().change_bitrate = Some(Arc::new(callback));
    }

    /// Install the callback persisting the node id
    ///
    /// Without one, StoreConfiguration requests are answered as
    /// unsupported.
    pub fn set_store_configuration_callback(
        &self,
        callback: impl Fn(NodeId) -> Result<(), CallbackError> + Send + Sync + 'static,
    ) {
        self.shared.callbacks.lock().unwrap().store_configuration = Some(Arc::new(callback));
    }
}
