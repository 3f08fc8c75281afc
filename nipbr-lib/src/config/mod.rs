use thiserror::Error;

use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

use crate::device::DeviceNetworkStatus;
use crate::network_instance::NetworkInstance;

mod v1;

pub const DEFAULT_PATH: &str = "/etc/nipbr/config.toml";
pub const ENV_VAR: &str = "NIPBR_CONFIG_PATH";

// Tables are numbered from here plus the interface index
pub const DEFAULT_BASE_TABLE_INDEX: u32 = 500;
// Tables up to 255 include the kernel's own (0, default, main, local)
pub const MIN_BASE_TABLE_INDEX: u32 = 256;
pub const DEFAULT_DUMMY_INTERFACE: &str = "pbr-dummy";
// Mark set by the firewall on packets matching a drop ACE
pub const DEFAULT_DROP_MARK: u32 = 0x0080_0000;
pub const DEFAULT_DROP_MASK: u32 = 0x0080_0000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub routing: RoutingConfig,
    pub device: DeviceNetworkStatus,
    pub network_instances: BTreeMap<String, NetworkInstance>,
}

/// Settings of the policy router; fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    pub base_table_index: u32,
    /// Sink interface receiving packets that must be dropped
    pub dummy_interface: String,
    pub drop_mark: FwMark,
}

/// Firewall mark value and the mask it is compared under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwMark {
    pub mark: u32,
    pub mask: u32,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(i64),
    #[error("Bridge {bridge} is used by more than one network instance")]
    DuplicateBridge { bridge: String },
    #[error("Network instance {instance} uses unknown uplink port {uplink}")]
    UnknownUplink { instance: String, uplink: String },
    #[error("Base table index {0} is below {min} and overlaps kernel tables", min = MIN_BASE_TABLE_INDEX)]
    ReservedBaseTableIndex(u32),
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_table_index: DEFAULT_BASE_TABLE_INDEX,
            dummy_interface: DEFAULT_DUMMY_INTERFACE.to_string(),
            drop_mark: FwMark {
                mark: DEFAULT_DROP_MARK,
                mask: DEFAULT_DROP_MASK,
            },
        }
    }
}

impl RoutingConfig {
    /// Routing table id derived from an interface index.
    ///
    /// `None` when the id does not fit or would be one of the kernel's tables.
    pub fn table_for(&self, if_index: u32) -> Option<u32> {
        self.base_table_index
            .checked_add(if_index)
            .filter(|table| *table >= MIN_BASE_TABLE_INDEX)
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<v1::Config>(content)?;
            let wrong_keys = v1::wrong_keys(&table);
            for key in wrong_keys.iter() {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            res.try_into()
        }
        _ => Err(Error::VersionMismatch(version)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_offset_from_base_index() {
        let routing = RoutingConfig::default();
        assert_eq!(routing.table_for(7), Some(507));
    }

    #[test]
    fn table_beyond_u32_is_rejected() {
        let routing = RoutingConfig {
            base_table_index: u32::MAX - 2,
            ..RoutingConfig::default()
        };
        assert_eq!(routing.table_for(2), Some(u32::MAX));
        assert_eq!(routing.table_for(3), None);
    }

    #[test]
    fn kernel_tables_are_never_derived() {
        let routing = RoutingConfig {
            base_table_index: 250,
            ..RoutingConfig::default()
        };
        assert_eq!(routing.table_for(4), None);
        assert_eq!(routing.table_for(6), Some(256));
    }

    #[test]
    fn parse_rejects_reserved_base_table_index() {
        let res = parse("version = 1\n[routing]\nbase_table_index = 250\n");
        assert!(matches!(res, Err(Error::ReservedBaseTableIndex(250))));
    }

    #[test]
    fn parse_rejects_missing_version() {
        let res = parse("[routing]\nbase_table_index = 400\n");
        assert!(matches!(res, Err(Error::VersionNotFound)));
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let res = parse("version = 9\n");
        assert!(matches!(res, Err(Error::VersionMismatch(9))));
    }

    #[tokio::test]
    async fn read_reports_missing_file() {
        let res = read(Path::new("/nonexistent/nipbr/config.toml")).await;
        assert!(matches!(res, Err(Error::NoFile)));
    }
}
