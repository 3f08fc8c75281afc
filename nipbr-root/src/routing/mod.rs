use thiserror::Error;

use std::fmt;

pub(crate) mod mocks;
pub mod netlink_ops;
pub mod pbr;

use netlink_ops::{RouteSpec, RuleSpec};

pub use netlink_ops::{KernelRouter, NetlinkRouter, RouteChange};
pub use pbr::PolicyRouter;

/// Failure reported by the kernel for a single netlink request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("already exists")]
    AlreadyExists,
    #[error("no such entry")]
    NotFound,
    #[error("netlink error: {0}")]
    Netlink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Delete,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to resolve interface {name}: {source}")]
    Lookup { name: String, source: KernelError },
    #[error("unable to resolve interface index {index}: {source}")]
    IndexLookup { index: u32, source: KernelError },
    #[error("no usable routing table for interface index {index} above base {base}")]
    TableId { index: u32, base: u32 },
    #[error("unable to list routes of table {table}: {source}")]
    RouteList { table: u32, source: KernelError },
    #[error("failed to {op} route {route}: {source}")]
    RouteApply {
        op: Op,
        route: RouteSpec,
        source: KernelError,
    },
    #[error("failed to {op} rule {rule}: {source}")]
    RuleApply { op: Op, rule: RuleSpec, source: KernelError },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Add => write!(f, "add"),
            Op::Delete => write!(f, "del"),
        }
    }
}

impl Error {
    /// The kernel refused a mutation because the route or rule is already present.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::RouteApply {
                source: KernelError::AlreadyExists,
                ..
            } | Error::RuleApply {
                source: KernelError::AlreadyExists,
                ..
            }
        )
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, Error::Lookup { .. } | Error::IndexLookup { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::netlink_ops::IpFamily;
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    fn route() -> RouteSpec {
        RouteSpec::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24, 505)
    }

    #[test]
    fn already_exists_is_detected_on_route_and_rule_errors() {
        let err = Error::RouteApply {
            op: Op::Add,
            route: route(),
            source: KernelError::AlreadyExists,
        };
        assert!(err.is_already_exists());
        assert!(!err.is_lookup());

        let err = Error::RuleApply {
            op: Op::Add,
            rule: RuleSpec::new(IpFamily::V4, 505, 10000),
            source: KernelError::AlreadyExists,
        };
        assert!(err.is_already_exists());
    }

    #[test]
    fn other_kernel_errors_are_not_already_exists() {
        let err = Error::RouteApply {
            op: Op::Delete,
            route: route(),
            source: KernelError::NotFound,
        };
        assert!(!err.is_already_exists());
    }

    #[test]
    fn error_message_names_offending_route() {
        let err = Error::RouteApply {
            op: Op::Add,
            route: route(),
            source: KernelError::Netlink("Invalid argument".into()),
        };
        assert_eq!(
            err.to_string(),
            "failed to add route 10.0.0.0/24 table 505: netlink error: Invalid argument"
        );
    }

    #[test]
    fn lookup_errors_are_classified() {
        let err = Error::Lookup {
            name: "bn1".into(),
            source: KernelError::NotFound,
        };
        assert!(err.is_lookup());
        assert_eq!(err.to_string(), "unable to resolve interface bn1: no such entry");
    }

    #[test]
    fn table_id_error_is_neither_lookup_nor_already_exists() {
        let err = Error::TableId {
            index: 3,
            base: u32::MAX - 1,
        };
        assert!(!err.is_lookup());
        assert!(!err.is_already_exists());
    }
}
