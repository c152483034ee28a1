//! Shared types for the cantata CANopen responder stack
//!
//! This crate holds everything both the node implementation and external
//! tooling need to agree on: the CAN message struct, the CANopen datatype
//! and value codec, SDO and LSS wire messages, standard COB-ID and object
//! index constants, and the [`CanNetwork`](traits::CanNetwork) trait which
//! binds the stack to a bus driver.

pub mod constants;
pub mod datatypes;
#[cfg(feature = "config")]
pub mod device_config;
pub mod lss;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod test_utils;
pub mod traits;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub use socketcan::SocketCanNetwork;

pub use messages::CanMessage;
pub use node_id::NodeId;
