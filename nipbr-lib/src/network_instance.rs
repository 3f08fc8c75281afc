use cidr::IpCidr;

use std::collections::HashMap;

/// A network instance as configured: its bridge and the port it reaches the outside through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInstance {
    pub bridge: String,
    /// `None` for air-gapped instances (internal switch)
    pub uplink: Option<String>,
    /// Subnet served on the bridge
    pub subnet: Option<IpCidr>,
}

impl NetworkInstance {
    /// Uplink name with air-gapped instances mapped to the empty string.
    pub fn uplink_name(&self) -> &str {
        self.uplink.as_deref().unwrap_or("")
    }
}

/// Lookup of the bridges currently routed through a given uplink port.
pub trait UplinkDirectory {
    /// Interface indices of every bridge using `uplink` as its uplink.
    fn bridges_using_uplink(&self, uplink: &str) -> Vec<u32>;
}

/// Bridge index to uplink name.
impl UplinkDirectory for HashMap<u32, String> {
    fn bridges_using_uplink(&self, uplink: &str) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .iter()
            .filter(|(_, u)| u.as_str() == uplink)
            .map(|(idx, _)| *idx)
            .collect();
        indices.sort_unstable();
        indices
    }
}
