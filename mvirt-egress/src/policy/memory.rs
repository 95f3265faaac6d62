//! In-memory policy store for tests.
//!
//! Behaves like the kernel for the operations the reconcilers use:
//! duplicate adds fail with [`StoreError::Exists`], deletes of missing
//! entries fail with [`StoreError::NotFound`]. Foreign rules and routes can
//! be seeded without counting as mutations, and any operation can be made
//! to fail.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::IpNet;

use super::{
    Address, Family, Link, PolicyRule, PolicyStore, Route, SCOPE_UNIVERSE, StoreOp, TABLE_MAIN,
};
use crate::error::StoreError;

/// RTPROT_STATIC, used for seeded main table routes.
const PROTOCOL_STATIC: u8 = 4;

#[derive(Default)]
struct MemoryState {
    links: Vec<Link>,
    addresses: Vec<Address>,
    rules: Vec<PolicyRule>,
    routes: Vec<Route>,
    mutations: usize,
    failing: HashSet<StoreOp>,
}

impl MemoryState {
    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        if self.failing.contains(&op) {
            return Err(StoreError::Injected(op));
        }
        Ok(())
    }
}

/// Policy store backed by plain vectors.
#[derive(Default)]
pub struct MemoryPolicyStore {
    state: Mutex<MemoryState>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, index: u32, name: &str) {
        self.state
            .lock()
            .unwrap()
            .links
            .push(Link::new(index, name));
    }

    /// Remove a link together with its addresses.
    pub fn remove_link(&self, index: u32) {
        let mut state = self.state.lock().unwrap();
        state.links.retain(|link| link.index != index);
        state.addresses.retain(|addr| addr.link_index != index);
    }

    pub fn add_address(&self, link_index: u32, net: IpNet) {
        self.state
            .lock()
            .unwrap()
            .addresses
            .push(Address::new(link_index, net));
    }

    pub fn remove_address(&self, link_index: u32, net: IpNet) {
        self.state
            .lock()
            .unwrap()
            .addresses
            .retain(|addr| *addr != Address::new(link_index, net));
    }

    /// Install a main table default route, making `link_index` the
    /// default carrier for the family of `gateway`.
    pub fn set_default_route(&self, link_index: u32, gateway: IpAddr) {
        let family = Family::of(&gateway);
        let mut state = self.state.lock().unwrap();
        state.routes.retain(|route| {
            !(route.family == family && route.table == TABLE_MAIN && route.is_default())
        });
        state.routes.push(Route {
            family,
            table: TABLE_MAIN,
            destination: family.default_destination(),
            link_index: Some(link_index),
            gateway: Some(gateway),
            scope: SCOPE_UNIVERSE,
            protocol: PROTOCOL_STATIC,
        });
    }

    /// Seed a rule without counting it as a mutation.
    pub fn insert_rule(&self, rule: PolicyRule) {
        self.state.lock().unwrap().rules.push(rule);
    }

    /// Seed a route without counting it as a mutation.
    pub fn insert_route(&self, route: Route) {
        self.state.lock().unwrap().routes.push(route);
    }

    pub fn snapshot_rules(&self, family: Family) -> Vec<PolicyRule> {
        let state = self.state.lock().unwrap();
        state
            .rules
            .iter()
            .filter(|rule| rule.family == family)
            .cloned()
            .collect()
    }

    pub fn snapshot_routes(&self, family: Family) -> Vec<Route> {
        let state = self.state.lock().unwrap();
        state
            .routes
            .iter()
            .filter(|route| route.family == family)
            .cloned()
            .collect()
    }

    /// Number of successful add/delete calls so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Make every call of `op` fail until [`MemoryPolicyStore::clear_failures`].
    pub fn fail_on(&self, op: StoreOp) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn list_links(&self) -> Result<Vec<Link>, StoreError> {
        let state = self.state.lock().unwrap();
        state.check(StoreOp::ListLinks)?;
        Ok(state.links.clone())
    }

    async fn list_addresses(&self, family: Family) -> Result<Vec<Address>, StoreError> {
        let state = self.state.lock().unwrap();
        state.check(StoreOp::ListAddresses)?;
        Ok(state
            .addresses
            .iter()
            .filter(|addr| addr.family() == family)
            .copied()
            .collect())
    }

    async fn list_rules(&self, family: Family) -> Result<Vec<PolicyRule>, StoreError> {
        let state = self.state.lock().unwrap();
        state.check(StoreOp::ListRules)?;
        Ok(state
            .rules
            .iter()
            .filter(|rule| rule.family == family)
            .cloned()
            .collect())
    }

    async fn add_rule(&self, rule: &PolicyRule) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::AddRule)?;
        if state.rules.contains(rule) {
            return Err(StoreError::Exists);
        }
        state.rules.push(rule.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn del_rule(&self, rule: &PolicyRule) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::DelRule)?;
        let position = state
            .rules
            .iter()
            .position(|existing| existing == rule)
            .ok_or(StoreError::NotFound)?;
        state.rules.remove(position);
        state.mutations += 1;
        Ok(())
    }

    async fn list_routes(&self, family: Family) -> Result<Vec<Route>, StoreError> {
        let state = self.state.lock().unwrap();
        state.check(StoreOp::ListRoutes)?;
        Ok(state
            .routes
            .iter()
            .filter(|route| route.family == family)
            .cloned()
            .collect())
    }

    async fn add_route(&self, route: &Route) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::AddRoute)?;
        // One route per destination and table, like the kernel without metrics.
        if state.routes.iter().any(|existing| {
            existing.family == route.family
                && existing.table == route.table
                && existing.destination == route.destination
        }) {
            return Err(StoreError::Exists);
        }
        state.routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn del_route(&self, route: &Route) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::DelRoute)?;
        let position = state
            .routes
            .iter()
            .position(|existing| existing == route)
            .ok_or(StoreError::NotFound)?;
        state.routes.remove(position);
        state.mutations += 1;
        Ok(())
    }
}
