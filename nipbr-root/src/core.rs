//! Network instance lifecycle.
//!
//! [`Core`] owns the policy router and keeps the kernel in line with the
//! configured network instances: attaching them on start and reload,
//! detaching them when they disappear, and forwarding route changes.

use std::collections::HashMap;

use cidr::IpCidr;

use nipbr_lib::config::Config;
use nipbr_lib::network_instance::{NetworkInstance, UplinkDirectory};

use crate::routing::{self, KernelRouter, PolicyRouter, RouteChange};

/// Kernel state installed for one network instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bridge: String,
    pub bridge_index: u32,
    pub uplink: Option<String>,
    pub subnet: Option<IpCidr>,
}

/// Attached network instances by name.
#[derive(Debug, Default)]
pub struct Attachments(HashMap<String, Attachment>);

impl Attachments {
    pub fn get(&self, name: &str) -> Option<&Attachment> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl UplinkDirectory for Attachments {
    fn bridges_using_uplink(&self, uplink: &str) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .0
            .values()
            .filter(|a| a.uplink.as_deref() == Some(uplink))
            .map(|a| a.bridge_index)
            .collect();
        indices.sort_unstable();
        indices
    }
}

pub struct Core<K: KernelRouter> {
    router: PolicyRouter<K>,
    config: Config,
    attachments: Attachments,
    dummy_index: u32,
}

impl<K: KernelRouter> Core<K> {
    /// Installs the drop infrastructure and attaches every configured instance.
    ///
    /// Only a failing drop setup is fatal; instances that cannot be attached
    /// are logged and retried on the next reload.
    pub async fn start(kernel: K, config: Config) -> Result<Self, routing::Error> {
        let router = PolicyRouter::new(kernel, config.routing.clone());
        router.initialize_routing();

        let dummy = router.resolve_link(&config.routing.dummy_interface).await?;
        router.add_fwmark_rule_to_dummy(dummy.index).await?;
        tracing::info!(dummy_interface = %dummy.name, "drop infrastructure is ready");

        let mut core = Self {
            router,
            config: config.clone(),
            attachments: Attachments::default(),
            dummy_index: dummy.index,
        };
        for (name, ni) in config.network_instances.iter() {
            core.attach(name, ni).await;
        }
        Ok(core)
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub async fn handle_route_change(&self, change: &RouteChange) {
        self.router
            .on_route_change(change, &self.config.device, &self.attachments)
            .await;
    }

    /// Applies a new configuration.
    ///
    /// Instances that vanished or changed are detached, new or changed ones
    /// attached. The routing section is fixed for the lifetime of the process.
    pub async fn reload(&mut self, config: Config) {
        if config.routing != self.config.routing {
            tracing::warn!("routing settings changed, keeping current ones until restart");
        }

        let stale: Vec<String> = self
            .config
            .network_instances
            .iter()
            .filter(|(name, ni)| config.network_instances.get(*name) != Some(*ni))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale.iter() {
            self.detach(name).await;
        }

        self.config.device = config.device;
        self.config.network_instances = config.network_instances;
        let instances = self.config.network_instances.clone();
        for (name, ni) in instances.iter() {
            if self.attachments.get(name).is_none() {
                self.attach(name, ni).await;
            }
        }
        tracing::info!(instances = self.attachments.len(), "configuration reloaded");
    }

    /// Detaches every instance and removes the drop infrastructure.
    pub async fn shutdown(mut self) {
        let names: Vec<String> = self.attachments.0.keys().cloned().collect();
        for name in names.iter() {
            self.detach(name).await;
        }
        self.router.del_fwmark_rule_to_dummy(self.dummy_index).await;
        tracing::info!("routing teardown complete");
    }

    async fn attach(&mut self, name: &str, ni: &NetworkInstance) {
        match self.try_attach(ni).await {
            Ok(attachment) => {
                tracing::info!(instance = %name, bridge = %ni.bridge, uplink = %ni.uplink_name(), "network instance attached");
                self.attachments.0.insert(name.to_string(), attachment);
            }
            Err(error) if error.is_lookup() => {
                tracing::warn!(%error, instance = %name, "interface not present, retrying on next reload");
            }
            Err(error) => {
                tracing::error!(%error, instance = %name, "failed to attach network instance");
            }
        }
    }

    async fn try_attach(&self, ni: &NetworkInstance) -> Result<Attachment, routing::Error> {
        let bridge = self.router.resolve_link(&ni.bridge).await?;
        let uplink = ni.uplink_name();

        match self.router.sync_bridge_routes(&ni.bridge, uplink).await {
            Err(error) if error.is_already_exists() => {
                tracing::info!(%error, bridge = %ni.bridge, "stale bridge routes found, resyncing");
                self.router.unsync_bridge_routes(&ni.bridge, uplink).await?;
                self.router.sync_bridge_routes(&ni.bridge, uplink).await?;
            }
            res => res?,
        }

        if let Some(subnet) = ni.subnet
            && let Err(error) = self
                .router
                .add_overlay_rule_and_route(&ni.bridge, bridge.index, bridge.index, subnet)
                .await
        {
            // do not leave a half attached instance behind
            if let Err(unsync_error) = self.router.unsync_bridge_routes(&ni.bridge, uplink).await {
                tracing::warn!(%unsync_error, "rollback failed: could not remove bridge routes");
            }
            return Err(error);
        }

        Ok(Attachment {
            bridge: ni.bridge.clone(),
            bridge_index: bridge.index,
            uplink: ni.uplink.clone(),
            subnet: ni.subnet,
        })
    }

    async fn detach(&mut self, name: &str) {
        let Some(attachment) = self.attachments.0.remove(name) else {
            return;
        };
        if let Some(subnet) = attachment.subnet {
            self.router
                .del_overlay_rule_and_route(
                    &attachment.bridge,
                    attachment.bridge_index,
                    attachment.bridge_index,
                    subnet,
                )
                .await;
        }
        let uplink = attachment.uplink.as_deref().unwrap_or("");
        if let Err(error) = self.router.unsync_bridge_routes(&attachment.bridge, uplink).await {
            tracing::warn!(%error, instance = %name, "failed to remove bridge routes, continuing anyway");
        }
        tracing::info!(instance = %name, bridge = %attachment.bridge, "network instance detached");
    }
}
