//! Policy-based routing for network-instance bridges.
//!
//! Every bridge owns a private routing table numbered
//! `base_table_index + ifindex`. The table holds copies of the uplink's
//! main-table routes, kept current from kernel route change notifications,
//! and a lowest-priority unreachable default route so traffic never falls
//! through to the main table. Ingress traffic is steered into the table by
//! ip rules on the bridge; packets carrying the drop mark are steered into
//! a table whose only route points at a dummy sink interface.

use cidr::IpCidr;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use nipbr_lib::config::RoutingConfig;
use nipbr_lib::device::DeviceNetworkStatus;
use nipbr_lib::network_instance::UplinkDirectory;

use super::netlink_ops::{
    IpFamily, KernelRouter, LinkInfo, LinkKind, MAIN_TABLE, RouteChange, RouteChangeKind, RouteKind, RouteScope,
    RouteSpec, RuleSpec,
};
use super::{Error, Op};

/// Priority of the fw-mark drop rule, consulted before any overlay rule.
pub const FWMARK_RULE_PRIORITY: u32 = 1000;
/// Priority of the per-bridge ingress rules.
pub const OVERLAY_RULE_PRIORITY: u32 = 10000;

const _: () = assert!(FWMARK_RULE_PRIORITY < OVERLAY_RULE_PRIORITY);

/// Lowest possible priority for the default-drop route so that it never
/// shadows a mirrored default route.
const DEFAULT_DROP_PRIORITY: u32 = u32::MAX;

pub struct PolicyRouter<K: KernelRouter> {
    kernel: K,
    config: RoutingConfig,
}

impl<K: KernelRouter> PolicyRouter<K> {
    pub fn new(kernel: K, config: RoutingConfig) -> Self {
        Self { kernel, config }
    }

    /// Routing table owned by the interface with `if_index`.
    pub fn table_for(&self, if_index: u32) -> Result<u32, Error> {
        self.config.table_for(if_index).ok_or(Error::TableId {
            index: if_index,
            base: self.config.base_table_index,
        })
    }

    /// Records the routing settings. Touches no kernel state.
    pub fn initialize_routing(&self) {
        tracing::info!(
            base_table_index = self.config.base_table_index,
            dummy_interface = %self.config.dummy_interface,
            "policy based routing initialized"
        );
    }

    /// Resolves an interface by name.
    ///
    /// All name based lookups go through here so that table ids computed
    /// from the returned index agree with the ones seen in route changes.
    pub async fn resolve_link(&self, name: &str) -> Result<LinkInfo, Error> {
        self.kernel.link_by_name(name).await.map_err(|source| Error::Lookup {
            name: name.to_string(),
            source,
        })
    }

    /// Installs the bridge table: the default-drop route plus a copy of every
    /// IPv4 main-table route leaving through `uplink`.
    ///
    /// An empty `uplink` marks an internal switch and installs nothing.
    /// Mirroring stops at the first failing route.
    pub async fn sync_bridge_routes(&self, bridge: &str, uplink: &str) -> Result<(), Error> {
        if uplink.is_empty() {
            tracing::debug!(%bridge, "no uplink, skipping bridge table setup");
            return Ok(());
        }
        let uplink_link = self.resolve_link(uplink).await?;
        let bridge_link = self.resolve_link(bridge).await?;
        let table = self.table_for(bridge_link.index)?;

        match self.add_default_drop_route(bridge_link.index, true).await {
            Err(error) if error.is_already_exists() => {
                tracing::debug!(%bridge, table, "default drop route already present");
            }
            res => res?,
        }

        let routes = self.uplink_routes(&uplink_link).await?;
        if routes.is_empty() {
            tracing::warn!(%bridge, %uplink, "uplink has no routes in the main table");
            return Ok(());
        }
        let count = routes.len();
        for route in routes {
            self.apply_route(Op::Add, &route.mirrored_into(table)).await?;
        }
        tracing::info!(%bridge, %uplink, table, count, "bridge routes synced");
        Ok(())
    }

    /// Removes what [`Self::sync_bridge_routes`] installed.
    ///
    /// Individual delete failures are logged and skipped; the default-drop
    /// route removal is always attempted.
    pub async fn unsync_bridge_routes(&self, bridge: &str, uplink: &str) -> Result<(), Error> {
        if uplink.is_empty() {
            tracing::debug!(%bridge, "no uplink, nothing to remove");
            return Ok(());
        }
        let uplink_link = self.resolve_link(uplink).await?;
        let bridge_link = self.resolve_link(bridge).await?;
        let table = self.table_for(bridge_link.index)?;

        let routes = match self.uplink_routes(&uplink_link).await {
            Ok(routes) => routes,
            Err(error) => {
                tracing::warn!(%error, %bridge, "unable to list uplink routes, continuing anyway");
                Vec::new()
            }
        };
        for route in routes {
            let mirrored = route.mirrored_into(table);
            teardown_op("delete mirrored route", self.apply_route(Op::Delete, &mirrored)).await;
        }
        teardown_op(
            "delete default drop route",
            self.del_default_drop_route(bridge_link.index, true),
        )
        .await;
        tracing::info!(%bridge, %uplink, table, "bridge routes removed");
        Ok(())
    }

    /// Propagates a main-table route change into the affected bridge tables.
    ///
    /// Never fails: problems are logged and the change is dropped.
    pub async fn on_route_change<D>(&self, change: &RouteChange, status: &DeviceNetworkStatus, directory: &D)
    where
        D: UplinkDirectory + ?Sized,
    {
        let route = &change.route;
        if route.table_id != MAIN_TABLE {
            tracing::trace!(%route, "ignoring route change outside the main table");
            return;
        }
        let Some(if_index) = route.if_index else {
            tracing::trace!(%route, "ignoring route change without output interface");
            return;
        };
        let link = match self.kernel.link_by_index(if_index).await {
            Ok(link) => link,
            Err(source) => {
                let error = Error::IndexLookup { index: if_index, source };
                tracing::error!(%error, %route, "unable to resolve interface of changed route");
                return;
            }
        };

        let is_bridge = link.kind == LinkKind::Bridge;
        if !is_bridge && !status.is_l3_port(&link.name) {
            tracing::trace!(if_name = %link.name, %route, "ignoring route change on unmanaged interface");
            return;
        }

        let mut indices = Vec::new();
        if is_bridge {
            indices.push(link.index);
        }
        let bridges = directory.bridges_using_uplink(&link.name);
        if !bridges.is_empty() {
            tracing::debug!(uplink = %link.name, ?bridges, "propagating route change to bridges");
        }
        indices.extend(bridges);

        for index in indices {
            let table = match self.table_for(index) {
                Ok(table) => table,
                Err(error) => {
                    tracing::error!(%error, %route, "skipping bridge without routing table");
                    continue;
                }
            };
            let mirrored = route.mirrored_into(table);
            match change.kind {
                RouteChangeKind::New => match self.apply_route(Op::Add, &mirrored).await {
                    Ok(()) => {}
                    Err(error) if error.is_already_exists() => {
                        tracing::debug!(%error, "route already mirrored");
                    }
                    Err(error) => tracing::error!(%error, "failed to mirror new route"),
                },
                RouteChangeKind::Deleted => {
                    if let Err(error) = self.apply_route(Op::Delete, &mirrored).await {
                        tracing::warn!(%error, "failed to remove mirrored route");
                    }
                }
            }
        }
    }

    /// Steers traffic entering `bridge` into the table of `iif_index` and
    /// routes `prefix` out of `oif_index` from that table.
    pub async fn add_overlay_rule_and_route(
        &self,
        bridge: &str,
        iif_index: u32,
        oif_index: u32,
        prefix: IpCidr,
    ) -> Result<(), Error> {
        let table = self.table_for(iif_index)?;
        let rule = overlay_rule(bridge, table, &prefix);

        // avoid duplicate rules
        let _ = self.kernel.rule_del(&rule).await;
        self.apply_rule(Op::Add, &rule).await?;

        let route = overlay_route(&prefix, oif_index, table);
        match self.apply_route(Op::Add, &route).await {
            Err(error) if error.is_already_exists() => {
                tracing::debug!(%error, "overlay route already present");
                Ok(())
            }
            res => res,
        }
    }

    /// Removes what [`Self::add_overlay_rule_and_route`] installed, best effort.
    pub async fn del_overlay_rule_and_route(&self, bridge: &str, iif_index: u32, oif_index: u32, prefix: IpCidr) {
        let table = match self.table_for(iif_index) {
            Ok(table) => table,
            Err(error) => {
                tracing::warn!(%error, %bridge, "failed to delete overlay rule and route");
                return;
            }
        };
        let route = overlay_route(&prefix, oif_index, table);
        teardown_op("delete overlay route", self.apply_route(Op::Delete, &route)).await;
        let rule = overlay_rule(bridge, table, &prefix);
        teardown_op("delete overlay rule", self.apply_rule(Op::Delete, &rule)).await;
    }

    /// Sends packets carrying the drop mark into the table of `iif_index`,
    /// whose default route points at the dummy interface.
    pub async fn add_fwmark_rule_to_dummy(&self, iif_index: u32) -> Result<(), Error> {
        let rule = self.fwmark_rule(iif_index)?;

        // avoid duplicate rules
        let _ = self.kernel.rule_del(&rule).await;
        self.apply_rule(Op::Add, &rule).await?;

        match self.add_default_drop_route(iif_index, false).await {
            Err(error) if error.is_already_exists() => {
                tracing::debug!(%error, "dummy default route already present");
                Ok(())
            }
            res => res,
        }
    }

    /// Removes what [`Self::add_fwmark_rule_to_dummy`] installed, best effort.
    pub async fn del_fwmark_rule_to_dummy(&self, iif_index: u32) {
        match self.fwmark_rule(iif_index) {
            Ok(rule) => teardown_op("delete fwmark rule", self.apply_rule(Op::Delete, &rule)).await,
            Err(error) => tracing::warn!(%error, "failed to delete fwmark rule, continuing anyway"),
        }
        teardown_op("delete dummy default route", self.del_default_drop_route(iif_index, false)).await;
    }

    /// Adds the default route of the table of `if_index` that discards traffic.
    ///
    /// With `unreachable` the route rejects packets at the lowest priority,
    /// otherwise it sends them to the dummy interface.
    pub async fn add_default_drop_route(&self, if_index: u32, unreachable: bool) -> Result<(), Error> {
        let route = self.default_drop_route(if_index, unreachable).await?;
        self.apply_route(Op::Add, &route).await
    }

    /// Removes the default route added by [`Self::add_default_drop_route`].
    pub async fn del_default_drop_route(&self, if_index: u32, unreachable: bool) -> Result<(), Error> {
        let route = self.default_drop_route(if_index, unreachable).await?;
        self.apply_route(Op::Delete, &route).await
    }

    async fn default_drop_route(&self, if_index: u32, unreachable: bool) -> Result<RouteSpec, Error> {
        let mut route = RouteSpec::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, self.table_for(if_index)?);
        if unreachable {
            route.kind = RouteKind::Unreachable;
            route.priority = DEFAULT_DROP_PRIORITY;
        } else {
            let dummy = self.resolve_link(&self.config.dummy_interface).await?;
            route.if_index = Some(dummy.index);
        }
        Ok(route)
    }

    fn fwmark_rule(&self, iif_index: u32) -> Result<RuleSpec, Error> {
        Ok(RuleSpec {
            fw_mark: Some(self.config.drop_mark),
            ..RuleSpec::new(IpFamily::V4, self.table_for(iif_index)?, FWMARK_RULE_PRIORITY)
        })
    }

    async fn uplink_routes(&self, uplink: &LinkInfo) -> Result<Vec<RouteSpec>, Error> {
        let routes = self
            .kernel
            .route_list(MAIN_TABLE)
            .await
            .map_err(|source| Error::RouteList {
                table: MAIN_TABLE,
                source,
            })?;
        Ok(routes
            .into_iter()
            .filter(|r| r.is_ipv4() && r.if_index == Some(uplink.index))
            .collect())
    }

    async fn apply_route(&self, op: Op, route: &RouteSpec) -> Result<(), Error> {
        let res = match op {
            Op::Add => self.kernel.route_add(route).await,
            Op::Delete => self.kernel.route_del(route).await,
        };
        res.map_err(|source| Error::RouteApply {
            op,
            route: route.clone(),
            source,
        })?;
        tracing::debug!("ip route {op} {route}");
        Ok(())
    }

    async fn apply_rule(&self, op: Op, rule: &RuleSpec) -> Result<(), Error> {
        let res = match op {
            Op::Add => self.kernel.rule_add(rule).await,
            Op::Delete => self.kernel.rule_del(rule).await,
        };
        res.map_err(|source| Error::RuleApply {
            op,
            rule: rule.clone(),
            source,
        })?;
        tracing::debug!("ip rule {op} {rule}");
        Ok(())
    }
}

fn overlay_rule(bridge: &str, table: u32, prefix: &IpCidr) -> RuleSpec {
    let family = match prefix {
        IpCidr::V4(_) => IpFamily::V4,
        IpCidr::V6(_) => IpFamily::V6,
    };
    RuleSpec {
        iif_name: Some(bridge.to_string()),
        ..RuleSpec::new(family, table, OVERLAY_RULE_PRIORITY)
    }
}

fn overlay_route(prefix: &IpCidr, oif_index: u32, table: u32) -> RouteSpec {
    RouteSpec {
        if_index: Some(oif_index),
        scope: RouteScope::Universe,
        ..RouteSpec::new(prefix.first_address(), prefix.network_length(), table)
    }
}

/// Executes a teardown step, logging instead of propagating failure.
async fn teardown_op<Fut>(op_name: &str, op: Fut)
where
    Fut: Future<Output = Result<(), Error>>,
{
    if let Err(error) = op.await {
        tracing::warn!(%error, "failed to {}, continuing anyway", op_name);
    }
}
