//! Device config file
//!
//! A [`DeviceConfig`] is loaded from a TOML file and describes the fixed
//! properties of a device: its name and version strings, its default
//! heartbeat period, and the 0x1018 identity used by LSS. The node seeds
//! its object dictionary from it at startup.
//!
//! # An example TOML file
//!
//! ```toml
//! device_name = "can-io"
//! software_version = "v0.0.1"
//! hardware_version = "rev1"
//! heartbeat_period = 1000
//!
//! # Three of the four identity fields define the application/device. The
//! # fourth is the serial number, which should be provided at run time by
//! # the application from a unique source.
//! [identity]
//! vendor_id = 0xCAFE
//! product_code = 1032
//! revision_number = 1
//! ```

use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// The identity fields stored in the 0x1018 record
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// A number indicating the vendor of the device
    pub vendor_id: u32,
    /// A number indicating a product / model of the device
    pub product_code: u32,
    /// A number indicating the revision of the product
    pub revision_number: u32,
    /// A serial number; usually set at run time rather than in the file
    #[serde(default)]
    pub serial_number: Option<u32>,
}

/// Fixed device properties loaded from a TOML file
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Human readable device name, stored to 0x1008
    pub device_name: String,
    /// Human readable hardware version, stored to 0x1009
    #[serde(default)]
    pub hardware_version: Option<String>,
    /// Human readable software version, stored to 0x100A
    #[serde(default)]
    pub software_version: Option<String>,
    /// Default heartbeat producer period in milliseconds, stored to 0x1017
    #[serde(default)]
    pub heartbeat_period: Option<u16>,
    /// The LSS identity, stored to 0x1018
    pub identity: IdentityConfig,
}

/// Error type for loading a device config
#[derive(Debug, Snafu)]
pub enum LoadConfigError {
    /// Error reading the file
    #[snafu(display("Error reading config file: {source}"))]
    ReadFile {
        /// Source error
        source: std::io::Error,
    },
    /// Error parsing the TOML
    #[snafu(display("Error parsing config file: {source}"))]
    Parse {
        /// Source error
        source: toml::de::Error,
    },
}

impl DeviceConfig {
    /// Load a device config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadConfigError> {
        let text = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::load_from_str(&text)
    }

    /// Load a device config from a TOML string
    pub fn load_from_str(text: &str) -> Result<Self, LoadConfigError> {
        toml::from_str(text).context(ParseSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_example() {
        let text = r#"
            device_name = "can-io"
            software_version = "v0.0.1"
            heartbeat_period = 1000

            [identity]
            vendor_id = 0xCAFE
            product_code = 1032
            revision_number = 1
        "#;
        let config = DeviceConfig::load_from_str(text).unwrap();
        assert_eq!("can-io", config.device_name);
        assert_eq!(None, config.hardware_version);
        assert_eq!(Some(1000), config.heartbeat_period);
        assert_eq!(0xCAFE, config.identity.vendor_id);
        assert_eq!(None, config.identity.serial_number);
    }

    #[test]
    fn test_missing_identity_is_an_error() {
        assert!(DeviceConfig::load_from_str("device_name = \"x\"").is_err());
    }
}
