//! A CANopen responder node
//!
//! cantata-node implements the responder (slave) half of the CANopen
//! application layer over classic CAN: an [`ObjectDictionary`] with a
//! callback fabric, an SDO server with expedited, segmented, and block
//! transfers, event- and SYNC-driven PDOs, and the NMT, heartbeat, EMCY,
//! SYNC, and LSS services, composed by [`Node`].
//!
//! # Operation
//!
//! A node is wired to a bus through the
//! [`CanNetwork`](cantata_common::traits::CanNetwork) trait and to time
//! through the [`Scheduler`] trait. All protocol activity runs on a single
//! dispatch context: inbound frames are delivered by the network adapter,
//! timed work is fired by the scheduler, and both serialize on the
//! scheduler's dispatch lock. Applications mutating the dictionary from
//! another thread must hold that lock.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cantata_common::{test_utils::MockNetwork, NodeId};
//! use cantata_node::{Node, StdScheduler};
//!
//! let network = MockNetwork::new();
//! let scheduler = Arc::new(StdScheduler::new());
//! let node = Node::new(network, scheduler, NodeId::new(2).unwrap());
//! node.od().insert(
//!     0x2000,
//!     cantata_node::object_dict::Variable::new(
//!         cantata_common::datatypes::DataType::Unsigned16,
//!         cantata_common::datatypes::AccessType::Rw,
//!     ),
//! ).unwrap();
//! ```

pub mod callbacks;
mod emcy;
mod heartbeat;
mod lss;
mod nmt;
mod node;
pub mod object_dict;
pub mod pdo;
pub mod scheduler;
pub mod sdo_server;
mod sync;

pub use cantata_common as common;

pub use emcy::EmcyService;
pub use heartbeat::HeartbeatProducer;
pub use lss::LssResponder;
pub use nmt::NmtService;
pub use node::{Node, NodeCapabilities};
pub use object_dict::ObjectDictionary;
pub use pdo::{Rpdo, Tpdo};
pub use scheduler::{Scheduler, StdScheduler, TimerHandle, VirtualScheduler};
pub use sdo_server::SdoServer;
pub use sync::SyncService;
