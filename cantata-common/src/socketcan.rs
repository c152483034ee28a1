//! socketcan adapter
//!
//! Binds the stack to a Linux socketcan interface. A dedicated reader
//! thread dispatches inbound frames to subscribers; each dispatch holds the
//! process-wide dispatch lock so subscriber callbacks are serialized with
//! scheduler callbacks and user writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use socketcan::{CanFilter, CanFrame, CanSocket, EmbeddedFrame, Id, Socket, SocketOptions};

use crate::traits::{CanNetwork, FrameCallback};

/// A [`CanNetwork`] implementation over a Linux socketcan interface
pub struct SocketCanNetwork {
    tx: Mutex<CanSocket>,
    rx: Arc<CanSocket>,
    subscriptions: Arc<Mutex<HashMap<u16, FrameCallback>>>,
}

impl SocketCanNetwork {
    /// Open an interface (e.g. "can0" or "vcan0") and start the reader
    /// thread
    ///
    /// `dispatch_lock` is the scheduler's process-wide lock; it is held
    /// around every subscriber invocation.
    pub fn open(
        interface: &str,
        dispatch_lock: Arc<Mutex<()>>,
    ) -> Result<Arc<Self>, std::io::Error> {
        let tx = CanSocket::open(interface)?;
        let rx = Arc::new(CanSocket::open(interface)?);
        // Nothing subscribed yet
        rx.set_filters(&[] as &[CanFilter])?;

        let network = Arc::new(Self {
            tx: Mutex::new(tx),
            rx: rx.clone(),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        });

        let subscriptions = network.subscriptions.clone();
        std::thread::Builder::new()
            .name("cantata-can-rx".into())
            .spawn(move || loop {
                let frame = match rx.read_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Error reading CAN frame, stopping receiver: {e}");
                        break;
                    }
                };
                let data_frame = match frame {
                    CanFrame::Data(f) => f,
                    // RTR is not supported, error frames are dropped
                    CanFrame::Remote(_) | CanFrame::Error(_) => continue,
                };
                let cob_id = match data_frame.id() {
                    Id::Standard(sid) => sid.as_raw(),
                    Id::Extended(_) => continue,
                };
                let callback = subscriptions.lock().unwrap().get(&cob_id).cloned();
                if let Some(callback) = callback {
                    let _guard = dispatch_lock.lock().unwrap();
                    callback(cob_id, data_frame.data());
                }
            })?;

        Ok(network)
    }

    fn update_filters(&self) {
        let filters: Vec<CanFilter> = self
            .subscriptions
            .lock()
            .unwrap()
            .keys()
            .map(|id| CanFilter::new(*id as u32, 0x7FF))
            .collect();
        if let Err(e) = self.rx.set_filters(&filters) {
            log::error!("Failed to update CAN filters: {e}");
        }
    }
}

impl CanNetwork for SocketCanNetwork {
    fn add_subscription(&self, cob_id: u16, callback: FrameCallback) {
        self.subscriptions.lock().unwrap().insert(cob_id, callback);
        self.update_filters();
    }

    fn remove_subscription(&self, cob_id: u16) {
        self.subscriptions.lock().unwrap().remove(&cob_id);
        self.update_filters();
    }

    fn send(&self, cob_id: u16, data: &[u8]) {
        let id = match socketcan::StandardId::new(cob_id & 0x7FF) {
            Some(id) => id,
            None => return,
        };
        let frame = CanFrame::new(id, data).expect("CAN payloads never exceed 8 bytes");
        if let Err(e) = self.tx.lock().unwrap().write_frame(&frame) {
            log::error!("Failed to send CAN frame: {e}");
        }
    }
}
