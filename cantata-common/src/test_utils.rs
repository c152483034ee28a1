//! Test utilities
//!
//! A [`MockNetwork`] implementing the [`CanNetwork`] trait for exercising
//! the stack without a bus: tests inject received frames with
//! [`MockNetwork::receive`] and assert on the frames collected by
//! [`MockNetwork::take_sent`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::messages::CanMessage;
use crate::traits::{CanNetwork, FrameCallback};

/// An in-memory CAN "bus" for tests
#[derive(Default)]
pub struct MockNetwork {
    subscriptions: Mutex<HashMap<u16, FrameCallback>>,
    sent: Mutex<Vec<CanMessage>>,
}

impl MockNetwork {
    /// Create a new mock network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a frame to the node under test, as if received from the bus
    pub fn receive(&self, cob_id: u16, data: &[u8]) {
        let callback = self.subscriptions.lock().unwrap().get(&cob_id).cloned();
        if let Some(callback) = callback {
            callback(cob_id, data);
        }
    }

    /// Take all frames sent by the node since the last call
    pub fn take_sent(&self) -> Vec<CanMessage> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    /// Take the single frame sent since the last call
    ///
    /// Panics when zero or more than one frame is pending; use
    /// [`Self::take_sent`] for multi-frame exchanges.
    pub fn take_single_sent(&self) -> CanMessage {
        let mut sent = self.take_sent();
        assert_eq!(1, sent.len(), "expected exactly one sent frame: {sent:?}");
        sent.pop().unwrap()
    }

    /// Returns true if a subscription exists for the COB-ID
    pub fn is_subscribed(&self, cob_id: u16) -> bool {
        self.subscriptions.lock().unwrap().contains_key(&cob_id)
    }
}

impl CanNetwork for MockNetwork {
    fn add_subscription(&self, cob_id: u16, callback: FrameCallback) {
        self.subscriptions.lock().unwrap().insert(cob_id, callback);
    }

    fn remove_subscription(&self, cob_id: u16) {
        self.subscriptions.lock().unwrap().remove(&cob_id);
    }

    fn send(&self, cob_id: u16, data: &[u8]) {
        self.sent.lock().unwrap().push(CanMessage::new(cob_id, data));
    }
}
