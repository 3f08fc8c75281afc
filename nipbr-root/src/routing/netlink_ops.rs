//! Abstraction over the kernel routing interface.
//!
//! Defines the [`KernelRouter`] trait together with the domain types
//! ([`RouteSpec`], [`RuleSpec`], [`LinkInfo`], [`RouteChange`]) the policy
//! router works with, decoupled from the raw netlink wire format.
//!
//! Production code uses [`NetlinkRouter`] which wraps an `rtnetlink::Handle`.
//! Tests use the stateful mock in the `mocks` module.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::link::{InfoKind, LinkAttribute, LinkInfo as NlLinkInfo, LinkMessage};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteFlags, RouteMessage, RouteScope as NlRouteScope, RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use tokio::sync::mpsc;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use nipbr_lib::config::FwMark;

use super::KernelError;

/// Kernel main routing table (`RT_TABLE_MAIN`).
pub const MAIN_TABLE: u32 = 254;

// ============================================================================
// Domain Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
    Host,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouteKind {
    #[default]
    Unicast,
    /// Packets matching the route are rejected with ICMP unreachable.
    Unreachable,
}

/// Route specification decoupled from rtnetlink wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub pref_source: Option<IpAddr>,
    /// Output interface, `None` for routes without a device
    pub if_index: Option<u32>,
    pub table_id: u32,
    pub priority: u32,
    pub scope: RouteScope,
    pub kind: RouteKind,
    /// Raw `rtm_flags` as reported by the kernel
    pub flags: u32,
}

/// Policy routing rule specification.
///
/// Every rule jumps to `table_id`; selectors left as `None` match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub family: IpFamily,
    pub priority: u32,
    pub table_id: u32,
    pub iif_name: Option<String>,
    pub fw_mark: Option<FwMark>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Other,
}

/// Network link (interface) information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeKind {
    New,
    Deleted,
}

/// Route added to or removed from any kernel routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub kind: RouteChangeKind,
    pub route: RouteSpec,
}

pub type RouteChanges = mpsc::UnboundedReceiver<RouteChange>;

impl From<IpFamily> for AddressFamily {
    fn from(value: IpFamily) -> Self {
        match value {
            IpFamily::V4 => AddressFamily::Inet,
            IpFamily::V6 => AddressFamily::Inet6,
        }
    }
}

impl From<IpFamily> for rtnetlink::IpVersion {
    fn from(value: IpFamily) -> Self {
        match value {
            IpFamily::V4 => rtnetlink::IpVersion::V4,
            IpFamily::V6 => rtnetlink::IpVersion::V6,
        }
    }
}

impl RouteSpec {
    /// Unicast route to `destination/prefix_len` in `table_id` with no further attributes.
    pub fn new(destination: IpAddr, prefix_len: u8, table_id: u32) -> Self {
        Self {
            destination,
            prefix_len,
            gateway: None,
            pref_source: None,
            if_index: None,
            table_id,
            priority: 0,
            scope: RouteScope::Universe,
            kind: RouteKind::Unicast,
            flags: 0,
        }
    }

    /// Copy of this route placed into `table_id`.
    ///
    /// Kernel state flags (e.g. `RTNH_F_LINKDOWN`) are cleared as they must
    /// not be passed back on insertion.
    pub fn mirrored_into(&self, table_id: u32) -> Self {
        Self {
            table_id,
            flags: 0,
            ..self.clone()
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.destination.is_ipv4()
    }

    /// Two routes with the same key occupy the same kernel slot.
    pub fn same_key(&self, other: &RouteSpec) -> bool {
        self.destination == other.destination
            && self.prefix_len == other.prefix_len
            && self.table_id == other.table_id
            && self.priority == other.priority
    }
}

impl RuleSpec {
    /// Rule sending everything of `family` to `table_id`.
    pub fn new(family: IpFamily, table_id: u32, priority: u32) -> Self {
        Self {
            family,
            priority,
            table_id,
            iif_name: None,
            fw_mark: None,
        }
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == RouteKind::Unreachable {
            write!(f, "unreachable ")?;
        }
        write!(f, "{}/{}", self.destination, self.prefix_len)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if let Some(idx) = self.if_index {
            write!(f, " dev {idx}")?;
        }
        if let Some(src) = self.pref_source {
            write!(f, " src {src}")?;
        }
        write!(f, " table {}", self.table_id)?;
        match self.scope {
            RouteScope::Universe => {}
            RouteScope::Link => write!(f, " scope link")?,
            RouteScope::Host => write!(f, " scope host")?,
        }
        if self.priority != 0 {
            write!(f, " metric {}", self.priority)?;
        }
        Ok(())
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from all")?;
        if let Some(iif) = &self.iif_name {
            write!(f, " iif {iif}")?;
        }
        if let Some(m) = self.fw_mark {
            write!(f, " fwmark {:#x}/{:#x}", m.mark, m.mask)?;
        }
        write!(f, " lookup {} pref {}", self.table_id, self.priority)
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Kernel routing operations needed by the policy router.
///
/// Implementors must be cheaply cloneable (e.g. because the underlying
/// handle is already reference-counted).
#[async_trait]
pub trait KernelRouter: Send + Sync + Clone {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), KernelError>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), KernelError>;
    /// IPv4 routes of table `table_id`.
    async fn route_list(&self, table_id: u32) -> Result<Vec<RouteSpec>, KernelError>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), KernelError>;
    /// Deletes one rule identical to `rule`.
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), KernelError>;

    async fn link_by_name(&self, name: &str) -> Result<LinkInfo, KernelError>;
    async fn link_by_index(&self, index: u32) -> Result<LinkInfo, KernelError>;

    /// Subscribes to IPv4 route changes of all tables.
    async fn route_changes(&self) -> Result<RouteChanges, KernelError>;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`KernelRouter`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct NetlinkRouter {
    handle: rtnetlink::Handle,
}

impl From<rtnetlink::Error> for KernelError {
    fn from(e: rtnetlink::Error) -> Self {
        if let rtnetlink::Error::NetlinkError(ref msg) = e
            && let Some(code) = msg.code
        {
            let errno = -code.get();
            if errno == libc::EEXIST {
                return KernelError::AlreadyExists;
            }
            if errno == libc::ENOENT || errno == libc::ESRCH || errno == libc::ENODEV {
                return KernelError::NotFound;
            }
        }
        KernelError::Netlink(e.to_string())
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::Netlink(e.to_string())
    }
}

impl NetlinkRouter {
    /// Opens a netlink connection. Must be called from Tokio context.
    pub fn connect() -> Result<Self, std::io::Error> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::task::spawn(conn);
        Ok(Self { handle })
    }
}

#[async_trait]
impl KernelRouter for NetlinkRouter {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), KernelError> {
        let msg = build_route_message(route);
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), KernelError> {
        let msg = build_route_message(route);
        self.handle.route().del(msg).execute().await?;
        Ok(())
    }

    async fn route_list(&self, table_id: u32) -> Result<Vec<RouteSpec>, KernelError> {
        let filter = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .table_id(table_id)
            .build();
        let routes: Vec<_> = self.handle.route().get(filter).execute().try_collect().await?;

        // dumps are not filtered by table on every kernel
        Ok(routes
            .iter()
            .filter_map(route_message_to_spec)
            .filter(|r| r.table_id == table_id)
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), KernelError> {
        let mut req = self
            .handle
            .rule()
            .add()
            .table_id(rule.table_id)
            .priority(rule.priority)
            .action(RuleAction::ToTable);
        if let Some(iif) = &rule.iif_name {
            req = req.input_interface(iif.clone());
        }
        req.message_mut().header.family = rule.family.into();
        if let Some(m) = rule.fw_mark {
            req.message_mut().attributes.push(RuleAttribute::FwMark(m.mark));
            req.message_mut().attributes.push(RuleAttribute::FwMask(m.mask));
        }
        req.execute().await?;
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), KernelError> {
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(rule.family.into())
            .execute()
            .try_collect()
            .await?;

        match rules.into_iter().find(|msg| rule_message_matches(msg, rule)) {
            Some(msg) => {
                self.handle.rule().del(msg).execute().await?;
                Ok(())
            }
            None => Err(KernelError::NotFound),
        }
    }

    async fn link_by_name(&self, name: &str) -> Result<LinkInfo, KernelError> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await? {
            Some(msg) => link_message_to_info(&msg).ok_or(KernelError::NotFound),
            None => Err(KernelError::NotFound),
        }
    }

    async fn link_by_index(&self, index: u32) -> Result<LinkInfo, KernelError> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await? {
            Some(msg) => link_message_to_info(&msg).ok_or(KernelError::NotFound),
            None => Err(KernelError::NotFound),
        }
    }

    async fn route_changes(&self) -> Result<RouteChanges, KernelError> {
        let (mut conn, _, mut messages) = rtnetlink::new_connection()?;
        let groups = libc::RTMGRP_IPV4_ROUTE as u32;
        conn.socket_mut().socket_mut().bind(&SocketAddr::new(0, groups))?;
        let conn_task = tokio::task::spawn(conn);

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::task::spawn(async move {
            while let Some((msg, _)) = messages.next().await {
                let NetlinkPayload::InnerMessage(msg) = msg.payload else {
                    continue;
                };
                if let Some(change) = route_change_from_message(msg)
                    && sender.send(change).is_err()
                {
                    tracing::debug!("route change receiver dropped, stopping monitor");
                    break;
                }
            }
            conn_task.abort();
        });

        Ok(receiver)
    }
}

// ============================================================================
// Wire conversion
// ============================================================================

fn build_route_message(spec: &RouteSpec) -> RouteMessage {
    let mut msg = match spec.destination {
        IpAddr::V4(dst) => rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(dst, spec.prefix_len)
            .table_id(spec.table_id)
            .build(),
        IpAddr::V6(dst) => rtnetlink::RouteMessageBuilder::<Ipv6Addr>::default()
            .destination_prefix(dst, spec.prefix_len)
            .table_id(spec.table_id)
            .build(),
    };
    if let Some(idx) = spec.if_index {
        msg.attributes.push(RouteAttribute::Oif(idx));
    }
    if let Some(gw) = spec.gateway {
        msg.attributes.push(RouteAttribute::Gateway(route_address(gw)));
    }
    if let Some(src) = spec.pref_source {
        msg.attributes.push(RouteAttribute::PrefSource(route_address(src)));
    }
    if spec.priority != 0 {
        msg.attributes.push(RouteAttribute::Priority(spec.priority));
    }
    msg.header.scope = match spec.scope {
        RouteScope::Universe => NlRouteScope::Universe,
        RouteScope::Link => NlRouteScope::Link,
        RouteScope::Host => NlRouteScope::Host,
    };
    msg.header.kind = match spec.kind {
        RouteKind::Unicast => RouteType::Unicast,
        RouteKind::Unreachable => RouteType::Unreachable,
    };
    msg.header.flags = RouteFlags::from_bits_retain(spec.flags);
    msg
}

fn route_address(ip: IpAddr) -> RouteAddress {
    match ip {
        IpAddr::V4(ip) => RouteAddress::Inet(ip),
        IpAddr::V6(ip) => RouteAddress::Inet6(ip),
    }
}

fn route_address_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
        RouteAddress::Inet6(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

/// Converts a kernel route message, skipping route types the router never mirrors.
pub(super) fn route_message_to_spec(msg: &RouteMessage) -> Option<RouteSpec> {
    let kind = match msg.header.kind {
        RouteType::Unicast => RouteKind::Unicast,
        RouteType::Unreachable => RouteKind::Unreachable,
        _ => return None,
    };

    let destination = msg
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Destination(addr) => route_address_ip(addr),
            _ => None,
        })
        .or(match msg.header.address_family {
            AddressFamily::Inet => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            AddressFamily::Inet6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            _ => None,
        })?;

    let gateway = msg.attributes.iter().find_map(|a| match a {
        RouteAttribute::Gateway(addr) => route_address_ip(addr),
        _ => None,
    });

    let pref_source = msg.attributes.iter().find_map(|a| match a {
        RouteAttribute::PrefSource(addr) => route_address_ip(addr),
        _ => None,
    });

    let if_index = msg.attributes.iter().find_map(|a| match a {
        RouteAttribute::Oif(idx) => Some(*idx),
        _ => None,
    });

    // tables above 255 are only carried in the attribute
    let table_id = msg
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Table(id) => Some(*id),
            _ => None,
        })
        .unwrap_or(msg.header.table as u32);

    let priority = msg
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Priority(p) => Some(*p),
            _ => None,
        })
        .unwrap_or(0);

    let scope = match msg.header.scope {
        NlRouteScope::Link => RouteScope::Link,
        NlRouteScope::Host => RouteScope::Host,
        _ => RouteScope::Universe,
    };

    Some(RouteSpec {
        destination,
        prefix_len: msg.header.destination_prefix_length,
        gateway,
        pref_source,
        if_index,
        table_id,
        priority,
        scope,
        kind,
        flags: msg.header.flags.bits(),
    })
}

pub(super) fn route_change_from_message(msg: RouteNetlinkMessage) -> Option<RouteChange> {
    let (kind, route) = match msg {
        RouteNetlinkMessage::NewRoute(route) => (RouteChangeKind::New, route),
        RouteNetlinkMessage::DelRoute(route) => (RouteChangeKind::Deleted, route),
        _ => return None,
    };
    route_message_to_spec(&route).map(|route| RouteChange { kind, route })
}

fn link_message_to_info(msg: &LinkMessage) -> Option<LinkInfo> {
    let name = msg.attributes.iter().find_map(|a| match a {
        LinkAttribute::IfName(n) => Some(n.clone()),
        _ => None,
    })?;
    let is_bridge = msg.attributes.iter().any(|a| match a {
        LinkAttribute::LinkInfo(infos) => infos
            .iter()
            .any(|i| matches!(i, NlLinkInfo::Kind(InfoKind::Bridge))),
        _ => false,
    });
    Some(LinkInfo {
        index: msg.header.index,
        name,
        kind: if is_bridge { LinkKind::Bridge } else { LinkKind::Other },
    })
}

fn rule_message_matches(msg: &RuleMessage, rule: &RuleSpec) -> bool {
    let table = msg
        .attributes
        .iter()
        .find_map(|a| match a {
            RuleAttribute::Table(t) => Some(*t),
            _ => None,
        })
        .unwrap_or(msg.header.table as u32);
    let priority = msg
        .attributes
        .iter()
        .find_map(|a| match a {
            RuleAttribute::Priority(p) => Some(*p),
            _ => None,
        })
        .unwrap_or(0);
    let iif = msg.attributes.iter().find_map(|a| match a {
        RuleAttribute::Iifname(n) => Some(n.as_str()),
        _ => None,
    });
    let mark = msg.attributes.iter().find_map(|a| match a {
        RuleAttribute::FwMark(m) => Some(*m),
        _ => None,
    });
    let mask = msg.attributes.iter().find_map(|a| match a {
        RuleAttribute::FwMask(m) => Some(*m),
        _ => None,
    });

    let mark_matches = match rule.fw_mark {
        Some(m) => mark == Some(m.mark) && mask.is_none_or(|mask| mask == m.mask),
        None => mark.is_none(),
    };

    table == rule.table_id && priority == rule.priority && iif == rule.iif_name.as_deref() && mark_matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink_route() -> RouteSpec {
        RouteSpec {
            gateway: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))),
            pref_source: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
            if_index: Some(3),
            priority: 100,
            ..RouteSpec::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, MAIN_TABLE)
        }
    }

    #[test]
    fn route_message_conversion_keeps_all_attributes() {
        let spec = uplink_route();
        let msg = build_route_message(&spec);
        assert_eq!(route_message_to_spec(&msg), Some(spec));
    }

    #[test]
    fn route_message_conversion_handles_high_table_ids() {
        let mut spec = RouteSpec::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 505);
        spec.kind = RouteKind::Unreachable;
        spec.priority = u32::MAX;

        let msg = build_route_message(&spec);
        assert_eq!(route_message_to_spec(&msg), Some(spec));
    }

    #[test]
    fn route_message_with_unsupported_type_is_skipped() {
        let mut msg = build_route_message(&uplink_route());
        msg.header.kind = RouteType::Local;
        assert_eq!(route_message_to_spec(&msg), None);
    }

    #[test]
    fn route_change_maps_new_and_deleted_routes() {
        let msg = build_route_message(&uplink_route());

        let change = route_change_from_message(RouteNetlinkMessage::NewRoute(msg.clone()));
        assert_eq!(change.map(|c| c.kind), Some(RouteChangeKind::New));

        let change = route_change_from_message(RouteNetlinkMessage::DelRoute(msg));
        assert_eq!(change.map(|c| c.kind), Some(RouteChangeKind::Deleted));
    }

    #[test]
    fn route_change_ignores_non_route_messages() {
        let msg = RouteNetlinkMessage::NewLink(LinkMessage::default());
        assert_eq!(route_change_from_message(msg), None);
    }

    #[test]
    fn link_message_detects_bridges() {
        let mut msg = LinkMessage::default();
        msg.header.index = 7;
        msg.attributes.push(LinkAttribute::IfName("bn1".into()));
        msg.attributes
            .push(LinkAttribute::LinkInfo(vec![NlLinkInfo::Kind(InfoKind::Bridge)]));

        assert_eq!(
            link_message_to_info(&msg),
            Some(LinkInfo {
                index: 7,
                name: "bn1".into(),
                kind: LinkKind::Bridge,
            })
        );
    }

    #[test]
    fn link_message_without_name_is_skipped() {
        let msg = LinkMessage::default();
        assert_eq!(link_message_to_info(&msg), None);
    }

    #[test]
    fn rule_message_matching_requires_same_selectors() {
        let mut rule = RuleSpec::new(IpFamily::V4, 503, 1000);
        rule.fw_mark = Some(FwMark {
            mark: 0x0080_0000,
            mask: 0x0080_0000,
        });

        let mut msg = RuleMessage::default();
        msg.attributes.push(RuleAttribute::Table(503));
        msg.attributes.push(RuleAttribute::Priority(1000));
        msg.attributes.push(RuleAttribute::FwMark(0x0080_0000));
        msg.attributes.push(RuleAttribute::FwMask(0x0080_0000));
        assert!(rule_message_matches(&msg, &rule));

        let mut other = rule.clone();
        other.iif_name = Some("bn1".into());
        assert!(!rule_message_matches(&msg, &other));

        let mut other = rule.clone();
        other.priority = 10000;
        assert!(!rule_message_matches(&msg, &other));
    }

    #[test]
    fn mirrored_route_moves_table_and_clears_flags() {
        let mut route = uplink_route();
        route.flags = 0x10;

        let mirrored = route.mirrored_into(505);

        assert_eq!(mirrored.table_id, 505);
        assert_eq!(mirrored.flags, 0);
        assert_eq!(mirrored.gateway, route.gateway);
        assert_eq!(mirrored.if_index, route.if_index);
    }

    #[test]
    fn display_reads_like_ip_route() {
        assert_eq!(
            uplink_route().mirrored_into(505).to_string(),
            "0.0.0.0/0 via 192.168.1.1 dev 3 src 192.168.1.20 table 505 metric 100"
        );

        let mut rule = RuleSpec::new(IpFamily::V4, 505, 10000);
        rule.iif_name = Some("bn1".into());
        assert_eq!(rule.to_string(), "from all iif bn1 lookup 505 pref 10000");
    }

    #[test]
    fn kernel_errors_map_from_errno() {
        let mut msg = rtnetlink::packet_core::ErrorMessage::default();
        msg.code = std::num::NonZeroI32::new(-libc::EEXIST);
        assert_eq!(
            KernelError::from(rtnetlink::Error::NetlinkError(msg.clone())),
            KernelError::AlreadyExists
        );

        msg.code = std::num::NonZeroI32::new(-libc::ENODEV);
        assert_eq!(
            KernelError::from(rtnetlink::Error::NetlinkError(msg)),
            KernelError::NotFound
        );
    }
}
