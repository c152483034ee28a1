//! Common traits

use std::sync::Arc;

/// A subscriber callback, invoked with the COB-ID and payload of a received
/// frame
pub type FrameCallback = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Binding between the stack and a CAN bus driver
///
/// Services own the COB-IDs they advertise: each inbound frame is routed to
/// at most one subscriber, keyed by its 11-bit identifier. Registering a
/// callback for an already-subscribed COB-ID replaces the previous one.
///
/// Implementations which dispatch received frames from an I/O thread must
/// serialize with the rest of the stack by holding the scheduler's dispatch
/// lock around each subscriber invocation; no code below the adapter takes
/// any other lock across a callback.
pub trait CanNetwork: Send + Sync {
    /// Route frames received with `cob_id` to `callback`
    fn add_subscription(&self, cob_id: u16, callback: FrameCallback);

    /// Stop routing frames received with `cob_id`
    fn remove_subscription(&self, cob_id: u16);

    /// Send a frame to the bus
    fn send(&self, cob_id: u16, data: &[u8]);
}
