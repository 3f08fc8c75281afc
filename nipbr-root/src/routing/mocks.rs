//! Stateful mock of the kernel routing interface.
//!
//! The mock tracks the routes, rules and links that exist rather than just
//! verifying call sequences, so tests can assert on the resulting kernel
//! _state_ after a policy router operation.

#![cfg(test)]

use async_trait::async_trait;
use tokio::sync::mpsc;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::KernelError;
use super::netlink_ops::{KernelRouter, LinkInfo, LinkKind, RouteChange, RouteChanges, RouteSpec, RuleSpec};

#[derive(Debug, Default)]
pub struct KernelState {
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
    pub links: Vec<LinkInfo>,
    /// Successful mutations in call order, e.g. `route_add 0.0.0.0/0 table 505`.
    pub mutations: Vec<String>,
    /// Operation -> error. Keys are the bare operation (`route_add`), the
    /// operation followed by a route destination (`route_add 10.0.1.0/24`) or
    /// additionally narrowed to a table (`route_add 10.0.1.0/24 table 505`).
    pub fail_on: HashMap<String, KernelError>,
    pub subscribers: Vec<mpsc::UnboundedSender<RouteChange>>,
}

impl KernelState {
    fn check_fail(&self, op: &str) -> Result<(), KernelError> {
        match self.fail_on.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_route_fail(&self, op: &str, route: &RouteSpec) -> Result<(), KernelError> {
        self.check_fail(op)?;
        let key = format!("{op} {}/{}", route.destination, route.prefix_len);
        self.check_fail(&key)?;
        self.check_fail(&format!("{key} table {}", route.table_id))
    }

    pub fn routes_in_table(&self, table_id: u32) -> Vec<RouteSpec> {
        self.routes.iter().filter(|r| r.table_id == table_id).cloned().collect()
    }
}

#[derive(Clone)]
pub struct MockKernelRouter {
    pub state: Arc<Mutex<KernelState>>,
}

impl MockKernelRouter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState::default())),
        }
    }

    pub fn with_link(self, index: u32, name: &str, kind: LinkKind) -> Self {
        self.state.lock().unwrap().links.push(LinkInfo {
            index,
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn with_route(self, route: RouteSpec) -> Self {
        self.state.lock().unwrap().routes.push(route);
        self
    }

    pub fn fail_on(&self, op: &str, err: KernelError) {
        self.state.lock().unwrap().fail_on.insert(op.to_string(), err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_on.clear();
    }

    pub fn routes_in_table(&self, table_id: u32) -> Vec<RouteSpec> {
        self.state.lock().unwrap().routes_in_table(table_id)
    }

    pub fn rules(&self) -> Vec<RuleSpec> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    /// Delivers `change` to every subscriber as the kernel would.
    pub fn emit(&self, change: RouteChange) {
        let s = self.state.lock().unwrap();
        for sender in s.subscribers.iter() {
            let _ = sender.send(change.clone());
        }
    }

    /// Ends every subscription as a closed netlink socket would.
    pub fn close_route_changes(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }
}

#[async_trait]
impl KernelRouter for MockKernelRouter {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), KernelError> {
        let mut s = self.state.lock().unwrap();
        s.check_route_fail("route_add", route)?;

        if s.routes.iter().any(|r| r.same_key(route)) {
            return Err(KernelError::AlreadyExists);
        }
        s.routes.push(route.clone());
        s.mutations.push(format!("route_add {route}"));
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), KernelError> {
        let mut s = self.state.lock().unwrap();
        s.check_route_fail("route_del", route)?;

        let before = s.routes.len();
        s.routes.retain(|r| !r.same_key(route));
        if s.routes.len() == before {
            return Err(KernelError::NotFound);
        }
        s.mutations.push(format!("route_del {route}"));
        Ok(())
    }

    async fn route_list(&self, table_id: u32) -> Result<Vec<RouteSpec>, KernelError> {
        let s = self.state.lock().unwrap();
        s.check_fail("route_list")?;
        Ok(s.routes
            .iter()
            .filter(|r| r.table_id == table_id && r.is_ipv4())
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), KernelError> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;
        // the kernel accepts identical rules
        s.rules.push(rule.clone());
        s.mutations.push(format!("rule_add {rule}"));
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), KernelError> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;

        match s.rules.iter().position(|r| r == rule) {
            Some(pos) => {
                s.rules.remove(pos);
                s.mutations.push(format!("rule_del {rule}"));
                Ok(())
            }
            None => Err(KernelError::NotFound),
        }
    }

    async fn link_by_name(&self, name: &str) -> Result<LinkInfo, KernelError> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_by_name")?;
        s.links
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    async fn link_by_index(&self, index: u32) -> Result<LinkInfo, KernelError> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_by_index")?;
        s.links
            .iter()
            .find(|l| l.index == index)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    async fn route_changes(&self) -> Result<RouteChanges, KernelError> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_changes")?;
        let (sender, receiver) = mpsc::unbounded_channel();
        s.subscribers.push(sender);
        Ok(receiver)
    }
}
