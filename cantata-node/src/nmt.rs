//! NMT responder state machine
//!
//! Tracks the node lifecycle (Initialisation, Pre-Operational, Operational,
//! Stopped) and reacts to NMT commands received on COB-ID 0. All other
//! services gate themselves on the state through the late-fail state
//! callback list.

use std::sync::{Arc, Mutex, Weak};

use cantata_common::constants::cob_ids;
use cantata_common::messages::{NmtCommand, NmtCommandSpecifier, NmtState};
use cantata_common::traits::CanNetwork;
use cantata_common::NodeId;

use crate::callbacks::{CallbackHandler, FailMode};

pub(crate) struct NmtShared {
    network: Arc<dyn CanNetwork>,
    state: Mutex<Option<NmtState>>,
    node_id: Mutex<NodeId>,
    pending_node_id: Mutex<NodeId>,
    pub(crate) state_callbacks: CallbackHandler<NmtState>,
}

impl NmtShared {
    /// The current NMT state
    pub fn state(&self) -> NmtState {
        self.state.lock().unwrap().unwrap_or(NmtState::Initialisation)
    }

    /// The active node id, latched on the last Initialisation entry
    pub fn node_id(&self) -> NodeId {
        *self.node_id.lock().unwrap()
    }

    /// The node id that will be latched on the next Initialisation entry
    pub fn pending_node_id(&self) -> NodeId {
        *self.pending_node_id.lock().unwrap()
    }

    pub fn set_pending_node_id(&self, node_id: NodeId) {
        *self.pending_node_id.lock().unwrap() = node_id;
    }

    /// Transition the state machine
    ///
    /// On entry to Initialisation the pending node id is latched and the
    /// boot-up frame is emitted (before any other frame) unless the node is
    /// unconfigured. State callbacks fire after the transition completes.
    pub fn set_state(&self, state: NmtState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == Some(state) {
                return;
            }
            if state == NmtState::Initialisation {
                let pending = self.pending_node_id();
                *self.node_id.lock().unwrap() = pending;
            }
            log::debug!("NMT state changed from {:?} to {}", *current, state);
            *current = Some(state);
        }

        if state == NmtState::Initialisation {
            if let NodeId::Configured(id) = self.node_id() {
                self.network
                    .send(cob_ids::HEARTBEAT_BASE + id.raw() as u16, &[0x00]);
            }
        }

        if let Err(e) = self.state_callbacks.call(&state) {
            log::error!("NMT state callback failed: {e}");
        }
    }

    /// Perform a node reset: Initialisation, then on to Pre-Operational
    pub fn reset(&self) {
        self.set_state(NmtState::Initialisation);
        self.set_state(NmtState::PreOperational);
    }

    fn handle_msg(&self, data: &[u8]) {
        let cmd = match NmtCommand::from_bytes(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::error!("Dropping bad NMT command {data:02X?}: {e}");
                return;
            }
        };

        // 0 addresses every node on the bus
        if cmd.node != 0 && cmd.node != self.node_id().raw() {
            return;
        }

        match cmd.cs {
            NmtCommandSpecifier::Start => self.set_state(NmtState::Operational),
            NmtCommandSpecifier::Stop => self.set_state(NmtState::Stopped),
            NmtCommandSpecifier::EnterPreOp => self.set_state(NmtState::PreOperational),
            NmtCommandSpecifier::ResetNode | NmtCommandSpecifier::ResetComm => self.reset(),
        }
    }
}

/// The NMT lifecycle service
pub struct NmtService {
    shared: Arc<NmtShared>,
}

impl NmtService {
    pub(crate) fn new(network: Arc<dyn CanNetwork>, node_id: NodeId) -> Self {
        let shared = Arc::new(NmtShared {
            network: network.clone(),
            state: Mutex::new(None),
            node_id: Mutex::new(node_id),
            pending_node_id: Mutex::new(node_id),
            state_callbacks: CallbackHandler::new(FailMode::LateFail),
        });

        let weak: Weak<NmtShared> = Arc::downgrade(&shared);
        network.add_subscription(
            cob_ids::NMT_CMD,
            Arc::new(move |_cob_id, data| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_msg(data);
                }
            }),
        );

        shared.set_state(NmtState::Initialisation);
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<NmtShared> {
        &self.shared
    }

    /// The current NMT state
    pub fn state(&self) -> NmtState {
        self.shared.state()
    }

    /// The active node id
    pub fn node_id(&self) -> NodeId {
        self.shared.node_id()
    }

    /// The node id that will be latched on the next Initialisation entry
    ///
    /// This is what LSS node-id assignment sets; it takes effect on the
    /// next reset.
    pub fn pending_node_id(&self) -> NodeId {
        self.shared.pending_node_id()
    }

    /// Set the node id to latch on the next Initialisation entry
    pub fn set_pending_node_id(&self, node_id: NodeId) {
        self.shared.set_pending_node_id(node_id);
    }

    /// Transition the state machine locally
    pub fn set_state(&self, state: NmtState) {
        self.shared.set_state(state);
    }

    /// Perform a node reset: Initialisation, then on to Pre-Operational
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Callbacks invoked (late-fail) after every state change
    pub fn state_callbacks(&self) -> &CallbackHandler<NmtState> {
        &self.shared.state_callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantata_common::test_utils::MockNetwork;

    #[test]
    fn test_boot_up_frame_on_construction() {
        let network = MockNetwork::new();
        let nmt = NmtService::new(network.clone(), NodeId::new(2).unwrap());
        let msg = network.take_single_sent();
        assert_eq!(0x702, msg.cob_id);
        assert_eq!(&[0x00], msg.data());
        assert_eq!(NmtState::Initialisation, nmt.state());
    }

    #[test]
    fn test_no_boot_up_when_unconfigured() {
        let network = MockNetwork::new();
        let _nmt = NmtService::new(network.clone(), NodeId::Unconfigured);
        assert!(network.take_sent().is_empty());
    }

    #[test]
    fn test_command_transitions() {
        let network = MockNetwork::new();
        let nmt = NmtService::new(network.clone(), NodeId::new(2).unwrap());
        nmt.set_state(NmtState::PreOperational);
        network.take_sent();

        network.receive(0x000, &[0x01, 0x02]);
        assert_eq!(NmtState::Operational, nmt.state());

        network.receive(0x000, &[0x02, 0x00]); // broadcast stop
        assert_eq!(NmtState::Stopped, nmt.state());

        network.receive(0x000, &[0x80, 0x02]);
        assert_eq!(NmtState::PreOperational, nmt.state());

        // Addressed to another node: ignored
        network.receive(0x000, &[0x01, 0x03]);
        assert_eq!(NmtState::PreOperational, nmt.state());
    }

    #[test]
    fn test_reset_emits_boot_up_and_returns_to_preop() {
        let network = MockNetwork::new();
        let nmt = NmtService::new(network.clone(), NodeId::new(2).unwrap());
        nmt.set_state(NmtState::Operational);
        network.take_sent();

        network.receive(0x000, &[0x81, 0x02]);
        let msg = network.take_single_sent();
        assert_eq!(0x702, msg.cob_id);
        assert_eq!(&[0x00], msg.data());
        assert_eq!(NmtState::PreOperational, nmt.state());
    }

    #[test]
    fn test_pending_node_id_latched_on_reset() {
        let network = MockNetwork::new();
        let nmt = NmtService::new(network.clone(), NodeId::Unconfigured);
        nmt.set_state(NmtState::PreOperational);

        nmt.set_pending_node_id(NodeId::new(7).unwrap());
        assert_eq!(NodeId::Unconfigured, nmt.node_id());
        nmt.reset();
        assert_eq!(7, nmt.node_id().raw());
        let msg = network.take_single_sent();
        assert_eq!(0x707, msg.cob_id);
    }
}
