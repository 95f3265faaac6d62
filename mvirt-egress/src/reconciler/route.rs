//! Default route reconciliation for managed tables.

use std::net::IpAddr;

use tracing::{debug, info};

use crate::error::{EgressError, Result};
use crate::policy::{Family, PolicyStore, Route, SCOPE_UNIVERSE, TableRange};

/// Desired default route of one managed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget {
    pub table: u32,
    pub link_index: u32,
    pub gateway: IpAddr,
}

impl RouteTarget {
    fn is_satisfied_by(&self, route: &Route) -> bool {
        route.table == self.table
            && route.is_default()
            && route.link_index == Some(self.link_index)
            && route.scope == SCOPE_UNIVERSE
            && route.gateway == Some(self.gateway)
    }
}

#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub added: usize,
    pub removed: usize,
}

/// Leave exactly one owned default route per target table, then delete the
/// owned routes of every table not targeted.
pub async fn reconcile_routes<S>(
    store: &S,
    family: Family,
    range: TableRange,
    targets: &[RouteTarget],
) -> Result<RouteOutcome>
where
    S: PolicyStore + ?Sized,
{
    let mut outcome = RouteOutcome::default();

    for target in targets {
        let routes = list_routes(store, family).await?;
        let mut found = false;

        let owned = routes.iter().filter(|route| route.is_owned(&range));
        for route in owned.filter(|route| route.table == target.table) {
            if !found && target.is_satisfied_by(route) {
                found = true;
                continue;
            }
            delete_route(store, family, route).await?;
            outcome.removed += 1;
        }

        if found {
            debug!(%family, table = target.table, gateway = %target.gateway, "Route up to date");
            continue;
        }

        let route = Route::managed_default(family, target.table, target.link_index, target.gateway);
        store
            .add_route(&route)
            .await
            .map_err(|source| EgressError::Mutation {
                family,
                op: "add route",
                table: target.table,
                source,
            })?;
        info!(
            %family,
            table = target.table,
            link = target.link_index,
            gateway = %target.gateway,
            "Added default route"
        );
        outcome.added += 1;
    }

    let routes = list_routes(store, family).await?;
    for route in routes.iter().filter(|route| route.is_owned(&range)) {
        if targets.iter().any(|target| target.table == route.table) {
            continue;
        }
        delete_route(store, family, route).await?;
        outcome.removed += 1;
    }

    Ok(outcome)
}

pub(super) async fn list_routes<S>(store: &S, family: Family) -> Result<Vec<Route>>
where
    S: PolicyStore + ?Sized,
{
    store
        .list_routes(family)
        .await
        .map_err(|source| EgressError::Lookup {
            family,
            what: "routes",
            source,
        })
}

async fn delete_route<S>(store: &S, family: Family, route: &Route) -> Result<()>
where
    S: PolicyStore + ?Sized,
{
    store
        .del_route(route)
        .await
        .map_err(|source| EgressError::Mutation {
            family,
            op: "delete route",
            table: route.table,
            source,
        })?;
    info!(
        %family,
        table = route.table,
        destination = %route.destination,
        gateway = ?route.gateway,
        "Deleted route"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MemoryPolicyStore;

    fn target(table: u32, link_index: u32, gateway: &str) -> RouteTarget {
        RouteTarget {
            table,
            link_index,
            gateway: gateway.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_adds_then_keeps() {
        let store = MemoryPolicyStore::new();
        let targets = [target(15100, 2, "10.0.0.1")];

        let first = reconcile_routes(&store, Family::V4, TableRange::default(), &targets)
            .await
            .unwrap();
        assert_eq!((first.added, first.removed), (1, 0));

        let second = reconcile_routes(&store, Family::V4, TableRange::default(), &targets)
            .await
            .unwrap();
        assert_eq!((second.added, second.removed), (0, 0));
        assert_eq!(store.mutations(), 1);
    }

    #[tokio::test]
    async fn test_replaces_on_gateway_change() {
        let store = MemoryPolicyStore::new();
        let range = TableRange::default();
        let targets = [target(15100, 2, "10.0.0.1")];
        reconcile_routes(&store, Family::V4, range, &targets)
            .await
            .unwrap();

        let targets = [target(15100, 2, "10.0.0.254")];
        let outcome = reconcile_routes(&store, Family::V4, range, &targets)
            .await
            .unwrap();
        assert_eq!((outcome.added, outcome.removed), (1, 1));

        let routes = store.snapshot_routes(Family::V4);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].gateway, Some("10.0.0.254".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_sweeps_unmapped_tables_only() {
        let store = MemoryPolicyStore::new();
        let gateway = "10.0.0.1".parse().unwrap();
        let owned = Route::managed_default(Family::V4, 15105, 2, gateway);
        let foreign_protocol = Route {
            protocol: 4,
            ..owned.clone()
        };
        let foreign_table = Route::managed_default(Family::V4, 100, 2, gateway);
        store.insert_route(owned);
        store.insert_route(Route {
            table: 15106,
            ..foreign_protocol
        });
        store.insert_route(foreign_table.clone());

        let outcome = reconcile_routes(&store, Family::V4, TableRange::default(), &[])
            .await
            .unwrap();

        assert_eq!(outcome.removed, 1);
        let routes = store.snapshot_routes(Family::V4);
        assert_eq!(routes.len(), 2);
        assert!(routes.contains(&foreign_table));
    }
}
