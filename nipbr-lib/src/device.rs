/// A network port of the device as known from its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPort {
    pub if_name: String,
    /// Port carries routed (L3) traffic, e.g. a management or uplink port
    pub is_l3: bool,
}

/// Snapshot of the device's network ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceNetworkStatus {
    ports: Vec<NetworkPort>,
}

impl DeviceNetworkStatus {
    pub fn new(ports: Vec<NetworkPort>) -> Self {
        Self { ports }
    }

    pub fn port(&self, if_name: &str) -> Option<&NetworkPort> {
        self.ports.iter().find(|p| p.if_name == if_name)
    }

    /// Returns true if `if_name` is a known port carrying L3 traffic.
    pub fn is_l3_port(&self, if_name: &str) -> bool {
        self.port(if_name).is_some_and(|p| p.is_l3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> DeviceNetworkStatus {
        DeviceNetworkStatus::new(vec![
            NetworkPort {
                if_name: "eth0".into(),
                is_l3: true,
            },
            NetworkPort {
                if_name: "eth1".into(),
                is_l3: false,
            },
        ])
    }

    #[test]
    fn l3_port_is_recognized() {
        assert!(status().is_l3_port("eth0"));
    }

    #[test]
    fn non_l3_and_unknown_ports_are_rejected() {
        let status = status();
        assert!(!status.is_l3_port("eth1"));
        assert!(!status.is_l3_port("bn1"));
        assert!(!status.is_l3_port(""));
    }
}
