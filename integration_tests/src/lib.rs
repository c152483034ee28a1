//! Shared fixtures for the end-to-end tests
//!
//! Each test drives a full [`Node`] through a [`MockNetwork`] (injecting
//! literal frames, asserting on the literal replies) and a
//! [`VirtualScheduler`] (advancing time deterministically).

use std::sync::Arc;

use cantata_common::messages::CanMessage;
use cantata_common::test_utils::MockNetwork;
use cantata_common::NodeId;
use cantata_node::{Node, NodeCapabilities, VirtualScheduler};

/// A node under test with its bus and clock
pub struct TestBench {
    pub network: Arc<MockNetwork>,
    pub scheduler: Arc<VirtualScheduler>,
    pub node: Node,
}

impl TestBench {
    /// Create a node with the given id, discarding its boot-up frame
    pub fn new(node_id: u8) -> Self {
        Self::with_capabilities(NodeId::new(node_id).unwrap(), NodeCapabilities::MINIMAL)
    }

    /// Create a node without a node id (LSS territory)
    pub fn new_unconfigured() -> Self {
        Self::with_capabilities(NodeId::Unconfigured, NodeCapabilities::MINIMAL)
    }

    /// Create a node with explicit capabilities
    pub fn with_capabilities(node_id: NodeId, capabilities: NodeCapabilities) -> Self {
        let network = MockNetwork::new();
        let scheduler = Arc::new(VirtualScheduler::new());
        let node = Node::with_capabilities(
            network.clone(),
            scheduler.clone(),
            node_id,
            capabilities,
        );
        network.take_sent();
        Self {
            network,
            scheduler,
            node,
        }
    }

    /// Inject a frame and return everything the node sent in response
    pub fn exchange(&self, cob_id: u16, data: &[u8]) -> Vec<CanMessage> {
        self.network.receive(cob_id, data);
        self.network.take_sent()
    }

    /// Inject a frame and assert the single reply matches exactly
    pub fn expect_reply(&self, cob_id: u16, data: &[u8], reply_cob: u16, reply: &[u8]) {
        self.network.receive(cob_id, data);
        let msg = self.network.take_single_sent();
        assert_eq!(
            (reply_cob, reply),
            (msg.cob_id, msg.data()),
            "unexpected reply to {cob_id:#05X}: {data:02X?}"
        );
    }

    /// Inject a frame and assert the node stays silent
    pub fn expect_silence(&self, cob_id: u16, data: &[u8]) {
        self.network.receive(cob_id, data);
        let sent = self.network.take_sent();
        assert!(sent.is_empty(), "expected no reply, got {sent:?}");
    }
}
