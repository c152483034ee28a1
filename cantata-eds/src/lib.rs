//! EDS generation
//!
//! Renders a live [`ObjectDictionary`] into an INI-style Electronic Data
//! Sheet: `[FileInfo]` and `[DeviceInfo]` headers, optional `[Comments]`,
//! and the object catalog split into `[MandatoryObjects]` (0x1000, 0x1001,
//! 0x1018), `[OptionalObjects]` (below 0x2000 or at/above 0x6000), and
//! `[ManufacturerObjects]`. Pre-assigned node-id dependent COB values are
//! emitted symbolically as `$NodeID+0xNN`.
//!
//! [`Eds::install`] additionally exposes the document through the
//! dictionary itself, as the read-only DOMAIN entry 0x1021:0, rendered on
//! demand by a read override — an SDO upload of 0x1021 always returns the
//! current dictionary state.

use std::fmt::Write as _;
use std::sync::Arc;

use cantata_common::constants::object_ids;
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_node::callbacks::CallbackError;
use cantata_node::object_dict::{Object, OdError, Variable};
use cantata_node::{Node, ObjectDictionary};
use snafu::Snafu;

/// Errors raised when rendering an EDS
#[derive(Debug, Snafu)]
pub enum EdsError {
    /// A FileInfo field has an invalid value
    #[snafu(display("invalid FileInfo: {reason}"))]
    InvalidFileInfo {
        /// What is wrong with it
        reason: String,
    },
}

/// The `[FileInfo]` section
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// The EDS file name
    pub file_name: String,
    /// File version (Unsigned8)
    pub file_version: u8,
    /// File revision (Unsigned8)
    pub file_revision: u8,
    /// EDS specification version, e.g. "4.0"
    pub eds_version: String,
    /// Free-text description
    pub description: Option<String>,
    /// Creator
    pub created_by: Option<String>,
    /// Last modifier
    pub modified_by: Option<String>,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            file_name: "cantata_device.eds".into(),
            file_version: 0,
            file_revision: 0,
            eds_version: "4.0".into(),
            description: None,
            created_by: None,
            modified_by: None,
        }
    }
}

impl FileInfo {
    fn validate(&self) -> Result<(), EdsError> {
        let version = self.eds_version.as_bytes();
        if version.len() != 3
            || !version[0].is_ascii_digit()
            || version[1] != b'.'
            || !version[2].is_ascii_digit()
        {
            return Err(EdsError::InvalidFileInfo {
                reason: format!("EDSVersion {:?} is not of the form d.d", self.eds_version),
            });
        }
        Ok(())
    }

    fn render(&self) -> Result<String, EdsError> {
        self.validate()?;
        let mut out = String::from("[FileInfo]\n");
        let _ = writeln!(out, "FileName={}", self.file_name);
        let _ = writeln!(out, "FileVersion={}", self.file_version);
        let _ = writeln!(out, "FileRevision={}", self.file_revision);
        let _ = writeln!(out, "EDSVersion={}", self.eds_version);
        if let Some(description) = &self.description {
            let _ = writeln!(out, "Description={description}");
        }
        if let Some(created_by) = &self.created_by {
            let _ = writeln!(out, "CreatedBy={created_by}");
        }
        if let Some(modified_by) = &self.modified_by {
            let _ = writeln!(out, "ModifiedBy={modified_by}");
        }
        out.push('\n');
        Ok(out)
    }
}

/// The `[DeviceInfo]` section
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Vendor name
    pub vendor_name: Option<String>,
    /// Vendor number (matches 0x1018:1)
    pub vendor_number: Option<u32>,
    /// Product name
    pub product_name: Option<String>,
    /// Supported baud rates in kbit/s
    pub baud_rates: Vec<u16>,
    /// Number of receive PDOs
    pub nr_of_rx_pdo: Option<u16>,
    /// Number of transmit PDOs
    pub nr_of_tx_pdo: Option<u16>,
    /// Whether the device implements LSS
    pub lss_supported: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            vendor_name: None,
            vendor_number: None,
            product_name: None,
            baud_rates: Vec::new(),
            nr_of_rx_pdo: None,
            nr_of_tx_pdo: None,
            lss_supported: true,
        }
    }
}

impl DeviceInfo {
    fn render(&self) -> String {
        let mut out = String::from("[DeviceInfo]\n");
        if let Some(vendor_name) = &self.vendor_name {
            let _ = writeln!(out, "VendorName={vendor_name}");
        }
        if let Some(vendor_number) = self.vendor_number {
            let _ = writeln!(out, "VendorNumber={vendor_number}");
        }
        if let Some(product_name) = &self.product_name {
            let _ = writeln!(out, "ProductName={product_name}");
        }
        for rate in [10u16, 20, 50, 125, 250, 500, 800, 1000] {
            let supported = self.baud_rates.contains(&rate) as u8;
            let _ = writeln!(out, "BaudRate_{rate}={supported}");
        }
        out.push_str("SimpleBootUpMaster=0\n");
        out.push_str("SimpleBootUpSlave=1\n");
        out.push_str("Granularity=8\n");
        if let Some(n) = self.nr_of_rx_pdo {
            let _ = writeln!(out, "NrOfRXPDO={n}");
        }
        if let Some(n) = self.nr_of_tx_pdo {
            let _ = writeln!(out, "NrOfTXPDO={n}");
        }
        let _ = writeln!(out, "LSS_Supported={}", self.lss_supported as u8);
        out.push('\n');
        out
    }
}

/// COB slots whose default values are emitted as `$NodeID+0xNN`
const NODE_ID_SLOTS: [((u16, u8), u16); 11] = [
    ((0x1014, 0), 0x080),
    ((0x1200, 1), 0x600),
    ((0x1200, 2), 0x580),
    ((0x1400, 1), 0x200),
    ((0x1401, 1), 0x300),
    ((0x1402, 1), 0x400),
    ((0x1403, 1), 0x500),
    ((0x1800, 1), 0x180),
    ((0x1801, 1), 0x280),
    ((0x1802, 1), 0x380),
    ((0x1803, 1), 0x480),
];

/// An EDS document generator
#[derive(Debug, Clone, Default)]
pub struct Eds {
    /// The `[FileInfo]` header
    pub file_info: FileInfo,
    /// The `[DeviceInfo]` header
    pub device_info: DeviceInfo,
    /// Free-text `[Comments]` lines; empty for no section
    pub comments: String,
}

impl Eds {
    /// Create a generator with default headers
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the dictionary into an EDS document
    pub fn generate(&self, od: &ObjectDictionary) -> Result<String, EdsError> {
        let mut out = String::new();

        if !self.comments.is_empty() {
            let lines: Vec<&str> = self.comments.trim().lines().collect();
            let _ = writeln!(out, "[Comments]\nLines={}", lines.len());
            for (i, line) in lines.iter().enumerate() {
                let _ = writeln!(out, "Line{}={line}", i + 1);
            }
            out.push('\n');
        }

        out.push_str(&self.file_info.render()?);
        out.push_str(&self.device_info.render());

        let mut remaining = od.indices();
        let mandatory: Vec<u16> = remaining
            .iter()
            .copied()
            .filter(|i| matches!(*i, 0x1000 | 0x1001 | 0x1018))
            .collect();
        remaining.retain(|i| !mandatory.contains(i));
        let optional: Vec<u16> = remaining
            .iter()
            .copied()
            .filter(|i| *i < 0x2000 || *i >= 0x6000)
            .collect();
        remaining.retain(|i| !optional.contains(i));

        out.push_str(&self.render_section(od, "MandatoryObjects", &mandatory));
        out.push_str(&self.render_section(od, "OptionalObjects", &optional));
        out.push_str(&self.render_section(od, "ManufacturerObjects", &remaining));

        Ok(out)
    }

    fn render_section(&self, od: &ObjectDictionary, name: &str, indices: &[u16]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[{name}]\nSupportedObjects={}", indices.len());
        for (i, index) in indices.iter().enumerate() {
            let _ = writeln!(out, "{}=0x{index:04X}", i + 1);
        }
        out.push('\n');

        for index in indices {
            if let Some(object) = od.object(*index) {
                out.push_str(&self.render_object(od, *index, &object));
            }
        }
        out
    }

    fn render_object(&self, od: &ObjectDictionary, index: u16, object: &Object) -> String {
        match object {
            Object::Variable(variable) => self.render_variable(od, index, None, variable),
            Object::Record(record) => {
                let mut subs: Vec<u8> = vec![0];
                subs.extend(record.iter().map(|(sub, _)| sub));
                self.render_composite(od, index, object, &subs)
            }
            Object::Array(array) => {
                let subs: Vec<u8> = (0..=array.length()).collect();
                self.render_composite(od, index, object, &subs)
            }
        }
    }

    fn render_composite(
        &self,
        od: &ObjectDictionary,
        index: u16,
        object: &Object,
        subs: &[u8],
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[{index:04X}]");
        let _ = writeln!(out, "SubNumber={}", subs.len());
        let name = object
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Object{index:04X}"));
        let _ = writeln!(out, "ParameterName={name}");
        let _ = writeln!(out, "ObjectType=0x{:X}\n", object.object_code());

        for sub in subs {
            if let Some(variable) = object.get(*sub) {
                out.push_str(&self.render_variable(od, index, Some(*sub), &variable));
            }
        }
        out
    }

    fn render_variable(
        &self,
        od: &ObjectDictionary,
        index: u16,
        sub: Option<u8>,
        variable: &Variable,
    ) -> String {
        let mut out = String::new();
        let section = match sub {
            None => format!("{index:04X}"),
            Some(sub) => format!("{index:04X}sub{sub}"),
        };
        let _ = writeln!(out, "[{section}]");
        let name = variable
            .name
            .clone()
            .unwrap_or_else(|| format!("Variable{section}"));
        let _ = writeln!(out, "ParameterName={name}");
        out.push_str("ObjectType=0x7\n");
        let _ = writeln!(out, "DataType=0x{:X}", variable.datatype as u16);
        let _ = writeln!(out, "AccessType={}", variable.access);

        let slot = (index, sub.unwrap_or(0));
        if let Some((_, offset)) = NODE_ID_SLOTS.iter().find(|(s, _)| *s == slot) {
            let _ = writeln!(out, "DefaultValue=$NodeID+0x{offset:x}");
        } else {
            let value = if od.has_value(slot.0, slot.1) {
                od.read(slot.0, slot.1).ok()
            } else {
                variable.default.clone()
            };
            if let Some(value) = value {
                let _ = writeln!(out, "DefaultValue={value}");
            }
        }

        if let Some(minimum) = variable.minimum {
            let _ = writeln!(out, "LowLimit={minimum}");
        }
        if let Some(maximum) = variable.maximum {
            let _ = writeln!(out, "HighLimit={maximum}");
        }
        let _ = writeln!(
            out,
            "PDOMapping={}\n",
            if index < 0x2000 { 0 } else { 1 }
        );
        out
    }

    /// Expose the document as dictionary entry 0x1021:0 (DOMAIN, ro)
    ///
    /// The entry renders on demand through a read override, so SDO uploads
    /// always see the current dictionary.
    pub fn install(self, node: &Node) -> Result<(), OdError> {
        let od = node.od().clone();
        od.insert(
            object_ids::EDS_STORAGE,
            Variable::new(DataType::Domain, AccessType::Ro).named("Store EDS"),
        )?;

        let eds = Arc::new(self);
        let weak = Arc::downgrade(&od);
        od.set_read_override(object_ids::EDS_STORAGE, 0, move || {
            let od = weak
                .upgrade()
                .ok_or_else(|| CallbackError::new("dictionary dropped"))?;
            let text = eds
                .generate(&od)
                .map_err(|e| CallbackError::new(e.to_string()))?;
            Ok(Value::Bytes(text.into_bytes()))
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantata_common::test_utils::MockNetwork;
    use cantata_common::NodeId;
    use cantata_node::VirtualScheduler;

    fn test_node() -> Node {
        let network = MockNetwork::new();
        let scheduler = Arc::new(VirtualScheduler::new());
        let node = Node::new(network, scheduler, NodeId::new(2).unwrap());
        node.od()
            .insert(
                0x2000,
                Variable::new(DataType::Integer16, AccessType::Rw)
                    .with_default(5i16)
                    .with_minimum(0.0)
                    .with_maximum(10.0)
                    .named("Demo Value"),
            )
            .unwrap();
        node
    }

    #[test]
    fn test_section_assignment() {
        let node = test_node();
        let content = Eds::new().generate(node.od()).unwrap();

        let mandatory = content.split("[MandatoryObjects]").nth(1).unwrap();
        let mandatory_header: Vec<&str> = mandatory.lines().skip(1).take(4).collect();
        assert_eq!(
            vec!["SupportedObjects=3", "1=0x1000", "2=0x1001", "3=0x1018"],
            mandatory_header
        );

        let manufacturer = content.split("[ManufacturerObjects]").nth(1).unwrap();
        assert!(manufacturer.contains("1=0x2000"));
        assert!(manufacturer.contains("[2000]\nParameterName=Demo Value"));
    }

    #[test]
    fn test_variable_description() {
        let node = test_node();
        let content = Eds::new().generate(node.od()).unwrap();

        let section = content.split("[2000]").nth(1).unwrap();
        assert!(section.contains("ObjectType=0x7"));
        assert!(section.contains("DataType=0x3"));
        assert!(section.contains("AccessType=rw"));
        assert!(section.contains("DefaultValue=5"));
        assert!(section.contains("LowLimit=0"));
        assert!(section.contains("HighLimit=10"));
        assert!(section.contains("PDOMapping=1"));

        // A written value supersedes the descriptor default
        node.od()
            .write(0x2000, 0, Value::Integer16(9), false)
            .unwrap();
        let content = Eds::new().generate(node.od()).unwrap();
        assert!(content.split("[2000]").nth(1).unwrap().contains("DefaultValue=9"));
    }

    #[test]
    fn test_node_id_symbolics() {
        let node = test_node();
        let content = Eds::new().generate(node.od()).unwrap();

        assert!(content
            .split("[1014]")
            .nth(1)
            .unwrap()
            .starts_with("\nParameterName"));
        let emcy = content.split("[1014]").nth(1).unwrap();
        assert!(emcy.contains("DefaultValue=$NodeID+0x80"));

        let sdo_rx = content.split("[1200sub1]").nth(1).unwrap();
        assert!(sdo_rx.contains("DefaultValue=$NodeID+0x600"));
        let rpdo = content.split("[1400sub1]").nth(1).unwrap();
        assert!(rpdo.contains("DefaultValue=$NodeID+0x200"));
        let tpdo = content.split("[1800sub1]").nth(1).unwrap();
        assert!(tpdo.contains("DefaultValue=$NodeID+0x180"));
    }

    #[test]
    fn test_record_sub_number() {
        let node = test_node();
        let content = Eds::new().generate(node.od()).unwrap();

        let identity = content.split("[1018]").nth(1).unwrap();
        // Sub 0 plus four identity fields
        assert!(identity.contains("SubNumber=5"));
        assert!(identity.contains("ObjectType=0x9"));
        assert!(content.contains("[1018sub0]"));
        assert!(content.contains("[1018sub4]"));

        // Mapping entries are arrays
        let mapping = content.split("[1600]").nth(1).unwrap();
        assert!(mapping.contains("ObjectType=0x8"));
        assert!(mapping.contains("SubNumber=9"));
    }

    #[test]
    fn test_comments_section() {
        let node = test_node();
        let mut eds = Eds::new();
        eds.comments = "line one\nline two".into();
        let content = eds.generate(node.od()).unwrap();
        assert!(content.starts_with("[Comments]\nLines=2\nLine1=line one\nLine2=line two\n"));
    }

    #[test]
    fn test_invalid_eds_version() {
        let node = test_node();
        let mut eds = Eds::new();
        eds.file_info.eds_version = "4".into();
        assert!(eds.generate(node.od()).is_err());
    }

    #[test]
    fn test_install_serves_document() {
        let node = test_node();
        Eds::new().install(&node).unwrap();

        let value = node.od().read(0x1021, 0).unwrap();
        let text = String::from_utf8(value.as_bytes().unwrap().to_vec()).unwrap();
        assert!(text.contains("[FileInfo]"));
        assert!(text.contains("[1021]"));
    }
}
