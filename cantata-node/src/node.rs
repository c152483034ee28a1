//! The node composition root

use std::sync::Arc;

use cantata_common::constants::object_ids;
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::messages::NmtState;
use cantata_common::traits::CanNetwork;
use cantata_common::NodeId;

#[cfg(feature = "config")]
use cantata_common::device_config::DeviceConfig;

use crate::emcy::EmcyService;
use crate::heartbeat::HeartbeatProducer;
use crate::lss::LssResponder;
use crate::nmt::NmtService;
use crate::object_dict::{ObjectDictionary, OdError, Record, Variable};
use crate::pdo::{Rpdo, Tpdo};
use crate::scheduler::Scheduler;
use crate::sdo_server::SdoServer;
use crate::sync::SyncService;

/// How many of each multi-instance service a node hosts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeCapabilities {
    /// Number of SDO servers (1..=128)
    pub sdo_servers: usize,
    /// Number of receive PDOs
    pub rpdos: usize,
    /// Number of transmit PDOs
    pub tpdos: usize,
}

impl NodeCapabilities {
    /// The smallest useful node: one SDO server and the four pre-assigned
    /// PDOs each way
    pub const MINIMAL: NodeCapabilities = NodeCapabilities {
        sdo_servers: 1,
        rpdos: 4,
        tpdos: 4,
    };

    /// Everything the protocol allows
    pub const FULL: NodeCapabilities = NodeCapabilities {
        sdo_servers: 128,
        rpdos: 512,
        tpdos: 512,
    };
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self::MINIMAL
    }
}

/// A CANopen responder node
///
/// The node owns its object dictionary and all protocol services. It is
/// constructed against a [`CanNetwork`] and a [`Scheduler`]; creation
/// drives the NMT state machine through Initialisation (emitting the
/// boot-up frame when a node id is configured) into Pre-Operational, after
/// which the node serves SDO requests. Entries for application data are
/// inserted through [`Node::od`] before the node is started with an NMT
/// start command (or [`NmtService::set_state`]).
pub struct Node {
    od: Arc<ObjectDictionary>,
    nmt: NmtService,
    sync: SyncService,
    emcy: EmcyService,
    heartbeat: HeartbeatProducer,
    lss: LssResponder,
    sdo_servers: Vec<SdoServer>,
    tpdos: Vec<Tpdo>,
    rpdos: Vec<Rpdo>,
}

impl Node {
    /// Create a node with [`NodeCapabilities::MINIMAL`]
    pub fn new(
        network: Arc<dyn CanNetwork>,
        scheduler: Arc<dyn Scheduler>,
        node_id: NodeId,
    ) -> Self {
        Self::with_capabilities(network, scheduler, node_id, NodeCapabilities::MINIMAL)
    }

    /// Create a node hosting the given number of service instances
    pub fn with_capabilities(
        network: Arc<dyn CanNetwork>,
        scheduler: Arc<dyn Scheduler>,
        node_id: NodeId,
        capabilities: NodeCapabilities,
    ) -> Self {
        assert!(
            (1..=128).contains(&capabilities.sdo_servers),
            "Number of SDO servers has to be between 1 and 128"
        );

        let od = Arc::new(ObjectDictionary::new());

        od.insert(
            object_ids::DEVICE_TYPE,
            Variable::new(DataType::Unsigned32, AccessType::Ro)
                .with_default(0u32)
                .named("Device Type"),
        )
        .expect("device type entry is valid");
        od.insert(
            object_ids::DEVICE_NAME,
            Variable::new(DataType::VisibleString, AccessType::Ro)
                .named("Manufacturer Device Name"),
        )
        .expect("device name entry is valid");
        od.insert(
            object_ids::HARDWARE_VERSION,
            Variable::new(DataType::VisibleString, AccessType::Ro)
                .named("Manufacturer Hardware Version"),
        )
        .expect("hardware version entry is valid");
        od.insert(
            object_ids::SOFTWARE_VERSION,
            Variable::new(DataType::VisibleString, AccessType::Ro)
                .named("Manufacturer Software Version"),
        )
        .expect("software version entry is valid");

        let mut identity = Record::named("Identity Object");
        for sub in 1..=4u8 {
            let name = match sub {
                1 => "Vendor-ID",
                2 => "Product Code",
                3 => "Revision Number",
                _ => "Serial Number",
            };
            identity.insert(
                sub,
                Variable::new(DataType::Unsigned32, AccessType::Ro)
                    .with_default(0u32)
                    .named(name),
            );
        }
        od.insert(object_ids::IDENTITY, identity)
            .expect("identity entry is valid");

        // Emits the boot-up frame for a configured node id
        let nmt = NmtService::new(network.clone(), node_id);
        let sync = SyncService::new(network.clone(), &od);
        let emcy = EmcyService::new(
            network.clone(),
            scheduler.clone(),
            od.clone(),
            nmt.shared().clone(),
        );
        let heartbeat = HeartbeatProducer::new(
            network.clone(),
            scheduler.clone(),
            od.clone(),
            nmt.shared().clone(),
        );

        let sdo_servers = (0..capabilities.sdo_servers)
            .map(|number| {
                SdoServer::new(number, network.clone(), od.clone(), nmt.shared().clone())
            })
            .collect();

        let tpdos = (0..capabilities.tpdos)
            .map(|number| {
                Tpdo::new(
                    number,
                    network.clone(),
                    scheduler.clone(),
                    od.clone(),
                    nmt.shared().clone(),
                    sync.shared().clone(),
                )
            })
            .collect();
        let rpdos = (0..capabilities.rpdos)
            .map(|number| {
                Rpdo::new(
                    number,
                    network.clone(),
                    od.clone(),
                    nmt.shared().clone(),
                    sync.shared().clone(),
                    emcy.clone(),
                )
            })
            .collect();

        let lss = LssResponder::new(
            network.clone(),
            scheduler.clone(),
            od.clone(),
            nmt.shared().clone(),
        );

        let node = Self {
            od,
            nmt,
            sync,
            emcy,
            heartbeat,
            lss,
            sdo_servers,
            tpdos,
            rpdos,
        };
        // All services have registered their state callbacks; bring the
        // node up
        node.nmt.set_state(NmtState::PreOperational);
        node
    }

    /// The object dictionary
    pub fn od(&self) -> &Arc<ObjectDictionary> {
        &self.od
    }

    /// The NMT lifecycle service
    pub fn nmt(&self) -> &NmtService {
        &self.nmt
    }

    /// The SYNC consumer
    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    /// The EMCY producer
    pub fn emcy(&self) -> &EmcyService {
        &self.emcy
    }

    /// The heartbeat producer
    pub fn heartbeat(&self) -> &HeartbeatProducer {
        &self.heartbeat
    }

    /// The LSS responder
    pub fn lss(&self) -> &LssResponder {
        &self.lss
    }

    /// SDO server `number`
    pub fn sdo_server(&self, number: usize) -> &SdoServer {
        &self.sdo_servers[number]
    }

    /// Transmit PDO `number`
    pub fn tpdo(&self, number: usize) -> &Tpdo {
        &self.tpdos[number]
    }

    /// Receive PDO `number`
    pub fn rpdo(&self, number: usize) -> &Rpdo {
        &self.rpdos[number]
    }

    /// The active node id
    pub fn node_id(&self) -> NodeId {
        self.nmt.node_id()
    }

    /// Seed the dictionary from a device config
    #[cfg(feature = "config")]
    pub fn apply_device_config(&self, config: &DeviceConfig) -> Result<(), OdError> {
        let od = &self.od;
        od.write(
            object_ids::DEVICE_NAME,
            0,
            Value::from(config.device_name.as_str()),
            false,
        )?;
        if let Some(hardware_version) = &config.hardware_version {
            od.write(
                object_ids::HARDWARE_VERSION,
                0,
                Value::from(hardware_version.as_str()),
                false,
            )?;
        }
        if let Some(software_version) = &config.software_version {
            od.write(
                object_ids::SOFTWARE_VERSION,
                0,
                Value::from(software_version.as_str()),
                false,
            )?;
        }
        if let Some(heartbeat_period) = config.heartbeat_period {
            od.write(
                object_ids::HEARTBEAT_PRODUCER_TIME,
                0,
                Value::Unsigned16(heartbeat_period),
                false,
            )?;
        }

        od.write(
            object_ids::IDENTITY,
            1,
            Value::Unsigned32(config.identity.vendor_id),
            false,
        )?;
        od.write(
            object_ids::IDENTITY,
            2,
            Value::Unsigned32(config.identity.product_code),
            false,
        )?;
        od.write(
            object_ids::IDENTITY,
            3,
            Value::Unsigned32(config.identity.revision_number),
            false,
        )?;
        if let Some(serial_number) = config.identity.serial_number {
            od.write(
                object_ids::IDENTITY,
                4,
                Value::Unsigned32(serial_number),
                false,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use cantata_common::test_utils::MockNetwork;

    #[test]
    fn test_node_boots_to_preoperational() {
        let network = MockNetwork::new();
        let scheduler = Arc::new(VirtualScheduler::new());
        let node = Node::new(network.clone(), scheduler, NodeId::new(2).unwrap());

        assert_eq!(NmtState::PreOperational, node.nmt().state());
        let sent = network.take_sent();
        assert_eq!(1, sent.len());
        assert_eq!(0x702, sent[0].cob_id);
        assert_eq!(&[0x00], sent[0].data());

        // Standard entries exist
        for index in [0x1000, 0x1001, 0x1005, 0x1014, 0x1015, 0x1017, 0x1018, 0x1200] {
            assert!(node.od().contains(index), "missing entry {index:#06X}");
        }
        assert_eq!(Some(0x602), node.sdo_server(0).cob_rx());
        assert_eq!(Some(0x582), node.sdo_server(0).cob_tx());
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_apply_device_config() {
        let network = MockNetwork::new();
        let scheduler = Arc::new(VirtualScheduler::new());
        let node = Node::new(network, scheduler, NodeId::new(2).unwrap());

        let config = DeviceConfig::load_from_str(
            r#"
            device_name = "unit"
            software_version = "v1.2"

            [identity]
            vendor_id = 7
            product_code = 8
            revision_number = 9
            serial_number = 10
        "#,
        )
        .unwrap();
        node.apply_device_config(&config).unwrap();

        assert_eq!(
            Value::from("unit"),
            node.od().read(0x1008, 0).unwrap()
        );
        assert_eq!(Value::Unsigned32(7), node.od().read(0x1018, 1).unwrap());
        assert_eq!(Value::Unsigned32(10), node.od().read(0x1018, 4).unwrap());
    }
}
