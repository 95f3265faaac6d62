//! Policy routing reconciliation.
//!
//! A pass compares the desired state (one source rule and one default route
//! per usable address on a selected interface) with the kernel and converges
//! it. Each address family is handled on its own, IPv4 first:
//!
//! 1. select interfaces ([`interface`])
//! 2. keep their valid addresses ([`crate::address`])
//! 3. converge rules and map tables to links ([`rule`])
//! 4. resolve a gateway for every mapped table ([`gateway`])
//! 5. converge default routes and sweep unmapped tables ([`route`])
//!
//! The first error aborts the pass. Gateways are resolved before any route
//! is touched, so a missing gateway leaves the family's routes as they were.

pub mod gateway;
pub mod interface;
pub mod route;
pub mod rule;
pub mod table;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::address;
use crate::config::EgressConfig;
use crate::error::{EgressError, Result};
use crate::policy::{Family, Link, PolicyStore};
use route::RouteTarget;

/// Managed table to link index, rebuilt every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMapping(BTreeMap<u32, u32>);

impl TableMapping {
    pub fn insert(&mut self, table: u32, link_index: u32) {
        self.0.insert(table, link_index);
    }

    pub fn link(&self, table: u32) -> Option<u32> {
        self.0.get(&table).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(table, link_index)` pairs in ascending table order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0.iter().map(|(table, link)| (*table, *link))
    }
}

/// Changes made by one pass, over all families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub rules_added: usize,
    pub rules_removed: usize,
    pub routes_added: usize,
    pub routes_removed: usize,
    /// Managed tables after the pass.
    pub tables: usize,
}

impl PassSummary {
    pub fn mutations(&self) -> usize {
        self.rules_added + self.rules_removed + self.routes_added + self.routes_removed
    }

    pub fn is_noop(&self) -> bool {
        self.mutations() == 0
    }
}

/// Converges kernel policy routing for the configured interfaces.
pub struct EgressReconciler<S: ?Sized> {
    store: Arc<S>,
    config: EgressConfig,
}

impl<S> EgressReconciler<S>
where
    S: PolicyStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: EgressConfig) -> Self {
        Self { store, config }
    }

    /// Run one full pass over every configured family.
    pub async fn reconcile(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        for &family in &self.config.families {
            self.reconcile_family(family, &mut summary).await?;
        }

        if summary.is_noop() {
            debug!(tables = summary.tables, "Policy routing up to date");
        } else {
            info!(
                rules_added = summary.rules_added,
                rules_removed = summary.rules_removed,
                routes_added = summary.routes_added,
                routes_removed = summary.routes_removed,
                tables = summary.tables,
                "Reconciled policy routing"
            );
        }
        Ok(summary)
    }

    async fn reconcile_family(&self, family: Family, summary: &mut PassSummary) -> Result<()> {
        let store = self.store.as_ref();
        let range = self.config.table_range;

        let links = interface::select_links(store, family, &self.config.iface_patterns)
            .await?;
        let addresses = store
            .list_addresses(family)
            .await
            .map_err(|source| EgressError::Lookup {
                family,
                what: "addresses",
                source,
            })?;

        let link_indices: Vec<u32> = links.iter().map(|link| link.index).collect();
        let valid: Vec<_> = addresses
            .iter()
            .filter(|addr| link_indices.contains(&addr.link_index))
            .filter(|addr| address::is_valid(family, addr.ip()))
            .copied()
            .collect();
        debug!(%family, links = links.len(), addresses = valid.len(), "Selected addresses");

        let rules = rule::reconcile_rules(store, family, range, &valid).await?;
        summary.rules_added += rules.added;
        summary.rules_removed += rules.removed;

        let mut targets = Vec::with_capacity(rules.mapping.len());
        for (table, link_index) in rules.mapping.iter() {
            let link = links
                .iter()
                .find(|link| link.index == link_index)
                .cloned()
                .unwrap_or_else(|| Link::new(link_index, String::new()));
            let first_address = addresses.iter().find(|addr| addr.link_index == link_index);

            let gateway = gateway::resolve(
                family,
                &link,
                first_address,
                &self.config.gateways,
                self.config.use_host_min_as_gw,
            )
            .ok_or_else(|| EgressError::NoGatewayFound {
                family,
                device: link.name.clone(),
                table,
            })?;
            debug!(%family, table, link = %link.name, %gateway, "Resolved gateway");

            targets.push(RouteTarget {
                table,
                link_index,
                gateway,
            });
        }

        let routes = route::reconcile_routes(store, family, range, &targets)
            .await?;
        summary.routes_added += routes.added;
        summary.routes_removed += routes.removed;
        summary.tables += rules.mapping.len();
        Ok(())
    }
}
