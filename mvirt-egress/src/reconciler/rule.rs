//! Source rule reconciliation.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tracing::{debug, info};

use super::TableMapping;
use super::route::list_routes;
use super::table::TableAllocator;
use crate::error::{EgressError, Result};
use crate::policy::{Address, Family, PolicyRule, PolicyStore, ROUTE_PROTOCOL, TableRange};

/// What a rule pass did.
#[derive(Debug, Default)]
pub struct RuleOutcome {
    pub mapping: TableMapping,
    pub added: usize,
    pub removed: usize,
}

/// Converge the owned rules of `family` to one rule per address in
/// `addresses`.
///
/// `addresses` must already be filtered to valid addresses on selected
/// links. Stale and duplicate owned rules are deleted before new tables are
/// allocated. A table is only allocated while no rule points at it and it
/// holds no route of another protocol.
pub async fn reconcile_rules<S>(
    store: &S,
    family: Family,
    range: TableRange,
    addresses: &[Address],
) -> Result<RuleOutcome>
where
    S: PolicyStore + ?Sized,
{
    let mut outcome = RuleOutcome::default();

    // First occurrence of an IP decides its link.
    let mut wanted: Vec<(IpAddr, u32)> = Vec::new();
    for addr in addresses {
        let ip = addr.ip().to_canonical();
        if !wanted.iter().any(|(seen, _)| *seen == ip) {
            wanted.push((ip, addr.link_index));
        }
    }

    let rules = list_rules(store, family).await?;
    let mut claimed: HashMap<IpAddr, u32> = HashMap::new();
    let mut claimed_tables: HashSet<u32> = HashSet::new();

    for rule in rules.iter().filter(|rule| rule.is_owned(&range)) {
        let table_free = !claimed_tables.contains(&rule.table);
        let current = wanted
            .iter()
            .map(|(ip, _)| *ip)
            .find(|ip| rule.is_source_rule_for(*ip))
            .filter(|ip| table_free && !claimed.contains_key(ip));

        match current {
            Some(ip) => {
                debug!(%family, table = rule.table, source = %ip, "Rule up to date");
                claimed.insert(ip, rule.table);
                claimed_tables.insert(rule.table);
            }
            None => {
                store
                    .del_rule(rule)
                    .await
                    .map_err(|source| EgressError::Mutation {
                        family,
                        op: "delete rule",
                        table: rule.table,
                        source,
                    })?;
                info!(
                    %family,
                    table = rule.table,
                    source = ?rule.source,
                    "Deleted stale rule"
                );
                outcome.removed += 1;
            }
        }
    }

    // Re-read so that ids freed above are not handed out while the kernel
    // still holds a rule for them. Tables holding routes of another protocol
    // count as used.
    let remaining = list_rules(store, family).await?;
    let routes = list_routes(store, family).await?;
    let foreign = routes
        .iter()
        .filter(|route| route.protocol != ROUTE_PROTOCOL)
        .map(|route| route.table);
    let used = remaining.iter().map(|rule| rule.table).chain(foreign);
    let mut allocator = TableAllocator::new(family, range, used);

    for (ip, link_index) in wanted {
        if let Some(&table) = claimed.get(&ip) {
            outcome.mapping.insert(table, link_index);
            continue;
        }

        let table = allocator.allocate()?;
        let rule = PolicyRule::managed(family, table, ip);
        store
            .add_rule(&rule)
            .await
            .map_err(|source| EgressError::Mutation {
                family,
                op: "add rule",
                table,
                source,
            })?;
        info!(%family, table, source = %ip, link = link_index, "Added rule");
        outcome.added += 1;
        outcome.mapping.insert(table, link_index);
    }

    Ok(outcome)
}

async fn list_rules<S>(store: &S, family: Family) -> Result<Vec<PolicyRule>>
where
    S: PolicyStore + ?Sized,
{
    store
        .list_rules(family)
        .await
        .map_err(|source| EgressError::Lookup {
            family,
            what: "rules",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MemoryPolicyStore, RULE_PRIORITY, Route};

    fn addr(link: u32, net: &str) -> Address {
        Address::new(link, net.parse().unwrap())
    }

    #[tokio::test]
    async fn test_allocates_in_order() {
        let store = MemoryPolicyStore::new();
        let addresses = [addr(2, "10.0.0.5/24"), addr(3, "10.0.1.5/24")];

        let outcome = reconcile_rules(&store, Family::V4, TableRange::default(), &addresses)
            .await
            .unwrap();

        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.mapping.link(15100), Some(2));
        assert_eq!(outcome.mapping.link(15101), Some(3));

        let rules = store.snapshot_rules(Family::V4);
        let ip = "10.0.0.5".parse().unwrap();
        assert_eq!(rules[0], PolicyRule::managed(Family::V4, 15100, ip));
        assert_eq!(rules[0].priority, RULE_PRIORITY);
    }

    #[tokio::test]
    async fn test_duplicate_address_gets_one_rule() {
        let store = MemoryPolicyStore::new();
        let addresses = [addr(2, "10.0.0.5/24"), addr(3, "10.0.0.5/32")];

        let outcome = reconcile_rules(&store, Family::V4, TableRange::default(), &addresses)
            .await
            .unwrap();

        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.mapping.len(), 1);
        assert_eq!(outcome.mapping.link(15100), Some(2));
    }

    #[tokio::test]
    async fn test_collapses_duplicate_rules() {
        let store = MemoryPolicyStore::new();
        let ip = "10.0.0.5".parse().unwrap();
        store.insert_rule(PolicyRule::managed(Family::V4, 15103, ip));
        store.insert_rule(PolicyRule::managed(Family::V4, 15107, ip));

        let outcome = reconcile_rules(
            &store,
            Family::V4,
            TableRange::default(),
            &[addr(2, "10.0.0.5/24")],
        )
        .await
        .unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.mapping.link(15103), Some(2));
        assert_eq!(store.snapshot_rules(Family::V4).len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_rule_untouched() {
        let store = MemoryPolicyStore::new();
        // Out of range, never touched.
        let foreign = PolicyRule {
            family: Family::V4,
            priority: 100,
            source: Some("192.168.0.0/16".parse().unwrap()),
            destination: None,
            table: 100,
            protocol: None,
        };
        store.insert_rule(foreign.clone());
        // Owned table held by a subnet rule: stale, deleted.
        store.insert_rule(PolicyRule {
            table: 15100,
            ..foreign.clone()
        });

        let range = TableRange::new(15100, 15101).unwrap();
        let outcome = reconcile_rules(&store, Family::V4, range, &[addr(2, "10.0.0.5/24")])
            .await
            .unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.mapping.link(15100), Some(2));
        assert!(store.snapshot_rules(Family::V4).contains(&foreign));
    }

    #[tokio::test]
    async fn test_skips_table_with_foreign_route() {
        let store = MemoryPolicyStore::new();
        let gateway = "10.0.0.1".parse().unwrap();
        // Someone else's default route in a table without a rule.
        store.insert_route(Route {
            protocol: 4,
            ..Route::managed_default(Family::V4, 15100, 2, gateway)
        });

        let outcome = reconcile_rules(
            &store,
            Family::V4,
            TableRange::default(),
            &[addr(2, "10.0.0.5/24")],
        )
        .await
        .unwrap();

        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.mapping.link(15101), Some(2));
        assert_eq!(store.snapshot_routes(Family::V4).len(), 1);
    }
}
