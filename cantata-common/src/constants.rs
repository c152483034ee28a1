//! Standard object indices and COB-ID pre-assignments

/// Object indices for the standard communication-profile objects
pub mod object_ids {
    /// Device type
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Error register, written by the EMCY service
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// COB-ID of the SYNC object
    pub const SYNC_COB_ID: u16 = 0x1005;
    /// Manufacturer device name
    pub const DEVICE_NAME: u16 = 0x1008;
    /// Manufacturer hardware version
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// Manufacturer software version
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// COB-ID of the EMCY object
    pub const EMCY_COB_ID: u16 = 0x1014;
    /// EMCY inhibit time in multiples of 100 us
    pub const EMCY_INHIBIT_TIME: u16 = 0x1015;
    /// Heartbeat producer time in milliseconds
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity record (vendor/product/revision/serial)
    pub const IDENTITY: u16 = 0x1018;
    /// EDS storage (DOMAIN object serving the generated EDS)
    pub const EDS_STORAGE: u16 = 0x1021;
    /// First SDO server parameter record; server N lives at base + N
    pub const SDO_SERVER_BASE: u16 = 0x1200;
    /// First RPDO communication parameter record
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping array
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter record
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping array
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
}

/// COB-ID pre-assignments from the CiA 301 predefined connection set
pub mod cob_ids {
    /// NMT command COB-ID
    pub const NMT_CMD: u16 = 0x000;
    /// Default SYNC COB-ID
    pub const SYNC: u16 = 0x080;
    /// Base for EMCY (node id is added)
    pub const EMCY_BASE: u16 = 0x080;
    /// Base for TPDO 1..4 (node id is added; each PDO is 0x100 further)
    pub const TPDO_BASE: u16 = 0x180;
    /// Base for RPDO 1..4 (node id is added; each PDO is 0x100 further)
    pub const RPDO_BASE: u16 = 0x200;
    /// Base for SDO client->server requests (server node id is added)
    pub const SDO_REQ_BASE: u16 = 0x600;
    /// Base for SDO server->client responses (server node id is added)
    pub const SDO_RESP_BASE: u16 = 0x580;
    /// Base for heartbeat and boot-up (node id is added)
    pub const HEARTBEAT_BASE: u16 = 0x700;
    /// LSS master request COB-ID
    pub const LSS_REQ: u16 = 0x7E5;
    /// LSS responder reply COB-ID
    pub const LSS_RESP: u16 = 0x7E4;
}
