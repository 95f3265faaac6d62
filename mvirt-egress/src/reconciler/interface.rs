//! Interface selection.

use regex::Regex;
use tracing::debug;

use crate::error::{EgressError, Result};
use crate::policy::{Family, Link, PolicyStore};

/// True if `name` matches at least one pattern.
pub fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(name))
}

/// Links whose name matches one of `patterns`, minus the link carrying the
/// main table default route of `family`.
pub async fn select_links<S>(store: &S, family: Family, patterns: &[Regex]) -> Result<Vec<Link>>
where
    S: PolicyStore + ?Sized,
{
    let carrier = store
        .default_route_link(family)
        .await
        .map_err(|source| EgressError::Lookup {
            family,
            what: "routes",
            source,
        })?;
    let links = store
        .list_links()
        .await
        .map_err(|source| EgressError::Lookup {
            family,
            what: "links",
            source,
        })?;

    Ok(links
        .into_iter()
        .filter(|link| matches_any(patterns, &link.name))
        .filter(|link| {
            let is_carrier = carrier == Some(link.index);
            if is_carrier {
                debug!(%family, link = %link.name, "Skipping default route carrier");
            }
            !is_carrier
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MemoryPolicyStore;

    fn patterns(raw: &[&str]) -> Vec<Regex> {
        raw.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    #[test]
    fn test_matches_any_is_unanchored() {
        let patterns = patterns(&["en.*", "eth.*"]);
        assert!(matches_any(&patterns, "eth0"));
        assert!(matches_any(&patterns, "enp3s0"));
        assert!(matches_any(&patterns, "veth12ab"));
        assert!(!matches_any(&patterns, "lo"));
        assert!(!matches_any(&[], "eth0"));
    }

    #[tokio::test]
    async fn test_select_excludes_default_carrier() {
        let store = MemoryPolicyStore::new();
        store.add_link(1, "lo");
        store.add_link(2, "eth0");
        store.add_link(3, "eth1");
        store.set_default_route(2, "10.0.0.1".parse().unwrap());

        let v4 = select_links(&store, Family::V4, &patterns(&["eth.*"]))
            .await
            .unwrap();
        assert_eq!(v4, vec![Link::new(3, "eth1")]);

        // eth0 only carries the IPv4 default route
        let v6 = select_links(&store, Family::V6, &patterns(&["eth.*"]))
            .await
            .unwrap();
        assert_eq!(v6.len(), 2);
    }
}
