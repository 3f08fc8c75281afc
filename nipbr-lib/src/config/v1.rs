use cidr::IpCidr;
use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashSet};

use crate::config::{self, FwMark, RoutingConfig};
use crate::device::{DeviceNetworkStatus, NetworkPort};
use crate::network_instance::NetworkInstance as NiConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u8,
    pub(super) routing: Option<Routing>,
    pub(super) ports: Option<Vec<Port>>,
    pub(super) network_instances: Option<BTreeMap<String, NetworkInstance>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct Routing {
    base_table_index: Option<u32>,
    dummy_interface: Option<String>,
    drop_mark: Option<u32>,
    drop_mask: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct Port {
    name: String,
    l3: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct NetworkInstance {
    bridge: String,
    uplink: Option<String>,
    subnet: Option<IpCidr>,
}

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let mut wrong_keys = Vec::new();
    for (key, value) in table.iter() {
        if key == "version" {
            continue;
        }
        if key == "routing" {
            if let Some(routing) = value.as_table() {
                for (k, _v) in routing.iter() {
                    if k == "base_table_index" || k == "dummy_interface" || k == "drop_mark" || k == "drop_mask" {
                        continue;
                    }
                    wrong_keys.push(format!("routing.{k}"));
                }
            }
            continue;
        }
        if key == "ports" {
            if let Some(ports) = value.as_array() {
                for (idx, port) in ports.iter().enumerate() {
                    if let Some(port) = port.as_table() {
                        for (k, _v) in port.iter() {
                            if k == "name" || k == "l3" {
                                continue;
                            }
                            wrong_keys.push(format!("ports[{idx}].{k}"));
                        }
                    }
                }
            }
            continue;
        }
        if key == "network_instances" {
            if let Some(instances) = value.as_table() {
                for (name, ni) in instances.iter() {
                    if let Some(ni) = ni.as_table() {
                        for (k, _v) in ni.iter() {
                            if k == "bridge" || k == "uplink" || k == "subnet" {
                                continue;
                            }
                            wrong_keys.push(format!("network_instances.{name}.{k}"));
                        }
                    }
                }
            }
            continue;
        }
        wrong_keys.push(key.clone());
    }
    wrong_keys
}

impl TryFrom<Option<Routing>> for RoutingConfig {
    type Error = config::Error;

    fn try_from(value: Option<Routing>) -> Result<Self, Self::Error> {
        let defaults = RoutingConfig::default();
        let Some(routing) = value else {
            return Ok(defaults);
        };
        let base_table_index = routing.base_table_index.unwrap_or(defaults.base_table_index);
        if base_table_index < config::MIN_BASE_TABLE_INDEX {
            return Err(config::Error::ReservedBaseTableIndex(base_table_index));
        }
        Ok(RoutingConfig {
            base_table_index,
            dummy_interface: routing.dummy_interface.unwrap_or(defaults.dummy_interface),
            drop_mark: FwMark {
                mark: routing.drop_mark.unwrap_or(defaults.drop_mark.mark),
                mask: routing.drop_mask.unwrap_or(defaults.drop_mark.mask),
            },
        })
    }
}

impl From<Option<Vec<Port>>> for DeviceNetworkStatus {
    fn from(value: Option<Vec<Port>>) -> Self {
        let ports = value
            .unwrap_or_default()
            .into_iter()
            .map(|p| NetworkPort {
                if_name: p.name,
                is_l3: p.l3.unwrap_or(true),
            })
            .collect();
        DeviceNetworkStatus::new(ports)
    }
}

impl TryFrom<Config> for config::Config {
    type Error = config::Error;

    fn try_from(value: Config) -> Result<Self, Self::Error> {
        let routing: RoutingConfig = value.routing.try_into()?;
        let device: DeviceNetworkStatus = value.ports.into();
        let network_instances = convert_network_instances(value.network_instances, &device)?;
        Ok(config::Config {
            routing,
            device,
            network_instances,
        })
    }
}

fn convert_network_instances(
    value: Option<BTreeMap<String, NetworkInstance>>,
    device: &DeviceNetworkStatus,
) -> Result<BTreeMap<String, NiConfig>, config::Error> {
    let mut bridges = HashSet::new();
    let mut result = BTreeMap::new();
    for (name, ni) in value.unwrap_or_default() {
        if !bridges.insert(ni.bridge.clone()) {
            return Err(config::Error::DuplicateBridge { bridge: ni.bridge });
        }
        // an empty uplink is an air-gapped instance
        let uplink = ni.uplink.filter(|u| !u.is_empty());
        if let Some(ref uplink) = uplink
            && device.port(uplink).is_none()
        {
            return Err(config::Error::UnknownUplink {
                instance: name,
                uplink: uplink.clone(),
            });
        }
        result.insert(
            name,
            NiConfig {
                bridge: ni.bridge,
                uplink,
                subnet: ni.subnet,
            },
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = r#####"
version = 1
"#####;
        let res = toml::from_str::<Config>(config).expect("Failed to parse minimal config");
        let res: config::Config = res.try_into().expect("Failed to convert minimal config");
        assert_eq!(res.routing, RoutingConfig::default());
        assert!(res.network_instances.is_empty());
    }

    #[test]
    fn test_full_config() -> anyhow::Result<()> {
        let config = r#####"
version = 1

[routing]
base_table_index = 400
dummy_interface = "drop0"
drop_mark = 0x01000000
drop_mask = 0xff000000

[[ports]]
name = "eth0"

[[ports]]
name = "wwan0"
l3 = false

[network_instances.local1]
bridge = "bn1"
uplink = "eth0"
subnet = "10.1.0.0/24"

[network_instances.switch1]
bridge = "bn2"
"#####;
        let res: config::Config = toml::from_str::<Config>(config)?.try_into()?;

        assert_eq!(res.routing.base_table_index, 400);
        assert_eq!(res.routing.dummy_interface, "drop0");
        assert_eq!(res.routing.drop_mark.mark, 0x0100_0000);
        assert_eq!(res.routing.drop_mark.mask, 0xff00_0000);
        assert!(res.device.is_l3_port("eth0"));
        assert!(!res.device.is_l3_port("wwan0"));

        let local = &res.network_instances["local1"];
        assert_eq!(local.bridge, "bn1");
        assert_eq!(local.uplink.as_deref(), Some("eth0"));
        assert_eq!(local.subnet.map(|s| s.to_string()), Some("10.1.0.0/24".to_string()));

        let switch = &res.network_instances["switch1"];
        assert_eq!(switch.uplink, None);
        assert_eq!(switch.uplink_name(), "");
        Ok(())
    }

    #[test]
    fn test_main_table_as_base_rejected() -> anyhow::Result<()> {
        let config = r#####"
version = 1
[routing]
base_table_index = 254
"#####;
        let res: Result<config::Config, _> = toml::from_str::<Config>(config)?.try_into();
        assert!(matches!(res, Err(config::Error::ReservedBaseTableIndex(254))));
        Ok(())
    }

    #[test]
    fn test_lowest_free_base_accepted() -> anyhow::Result<()> {
        let config = r#####"
version = 1
[routing]
base_table_index = 256
"#####;
        let res: config::Config = toml::from_str::<Config>(config)?.try_into()?;
        assert_eq!(res.routing.base_table_index, config::MIN_BASE_TABLE_INDEX);
        Ok(())
    }

    #[test]
    fn test_empty_uplink_is_air_gapped() -> anyhow::Result<()> {
        let config = r#####"
version = 1
[network_instances.switch1]
bridge = "bn2"
uplink = ""
"#####;
        let res: config::Config = toml::from_str::<Config>(config)?.try_into()?;
        assert_eq!(res.network_instances["switch1"].uplink, None);
        Ok(())
    }

    #[test]
    fn test_duplicate_bridge_rejected() -> anyhow::Result<()> {
        let config = r#####"
version = 1
[network_instances.a]
bridge = "bn1"
[network_instances.b]
bridge = "bn1"
"#####;
        let res: Result<config::Config, _> = toml::from_str::<Config>(config)?.try_into();
        assert!(matches!(res, Err(config::Error::DuplicateBridge { bridge }) if bridge == "bn1"));
        Ok(())
    }

    #[test]
    fn test_unknown_uplink_rejected() -> anyhow::Result<()> {
        let config = r#####"
version = 1
[[ports]]
name = "eth0"
[network_instances.a]
bridge = "bn1"
uplink = "eth1"
"#####;
        let res: Result<config::Config, _> = toml::from_str::<Config>(config)?.try_into();
        assert!(matches!(res, Err(config::Error::UnknownUplink { uplink, .. }) if uplink == "eth1"));
        Ok(())
    }

    #[test]
    fn test_wrong_keys_are_reported() -> anyhow::Result<()> {
        let config = r#####"
version = 1
colour = "blue"
[routing]
base_table = 3
[[ports]]
name = "eth0"
speed = 100
[network_instances.a]
bridge = "bn1"
vlan = 4
"#####;
        let table = config.parse::<toml::Table>()?;
        let mut keys = wrong_keys(&table);
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "colour".to_string(),
                "network_instances.a.vlan".to_string(),
                "ports[0].speed".to_string(),
                "routing.base_table".to_string(),
            ]
        );
        Ok(())
    }
}
