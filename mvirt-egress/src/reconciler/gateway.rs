//! Gateway resolution.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::config::GatewaySpec;
use crate::policy::{Address, Family, Link};

/// Gateway for the default route of `link`'s table.
///
/// Specs are scanned in order. The first unqualified spec of `family` wins
/// immediately, whatever the link. Otherwise the first spec naming `link`
/// wins. Specs of the other family are skipped. Without a match, and with
/// `use_host_min` set, the host minimum of `first_address` is used.
pub fn resolve(
    family: Family,
    link: &Link,
    first_address: Option<&Address>,
    specs: &[GatewaySpec],
    use_host_min: bool,
) -> Option<IpAddr> {
    for spec in specs {
        let gateway = spec.gateway().to_canonical();
        if Family::of(&gateway) != family {
            continue;
        }
        match spec {
            GatewaySpec::Any(_) => return Some(gateway),
            GatewaySpec::Interface { name, .. } if *name == link.name => return Some(gateway),
            GatewaySpec::Interface { .. } => {}
        }
    }

    if use_host_min {
        return first_address.map(|addr| host_min(&addr.net));
    }
    None
}

/// Network address of `net` with the last octet incremented (wrapping, no
/// carry). `192.168.5.10/24` gives `192.168.5.1`.
pub fn host_min(net: &IpNet) -> IpAddr {
    match net.network() {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            octets[3] = octets[3].wrapping_add(1);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            octets[15] = octets[15].wrapping_add(1);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(raw: &[&str]) -> Vec<GatewaySpec> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_unqualified_short_circuits() {
        let specs = specs(&["10.9.9.9", "eth1,10.0.1.1"]);
        let eth1 = Link::new(3, "eth1");
        assert_eq!(
            resolve(Family::V4, &eth1, None, &specs, false),
            Some(ip("10.9.9.9"))
        );
    }

    #[test]
    fn test_interface_spec() {
        let specs = specs(&["eth0,10.0.0.1", "eth1,10.0.1.1", "eth1,10.0.1.254"]);
        assert_eq!(
            resolve(Family::V4, &Link::new(3, "eth1"), None, &specs, false),
            Some(ip("10.0.1.1"))
        );
        assert_eq!(
            resolve(Family::V4, &Link::new(4, "eth2"), None, &specs, false),
            None
        );
    }

    #[test]
    fn test_other_family_skipped() {
        let specs = specs(&["2001:db8::1", "eth0,10.0.0.1", "fd00::1"]);
        let eth0 = Link::new(2, "eth0");
        assert_eq!(
            resolve(Family::V4, &eth0, None, &specs, false),
            Some(ip("10.0.0.1"))
        );
        assert_eq!(
            resolve(Family::V6, &eth0, None, &specs, false),
            Some(ip("2001:db8::1"))
        );
    }

    #[test]
    fn test_host_min_fallback() {
        let addr = Address::new(4, "192.168.5.10/24".parse().unwrap());
        let eth2 = Link::new(4, "eth2");
        assert_eq!(
            resolve(Family::V4, &eth2, Some(&addr), &[], true),
            Some(ip("192.168.5.1"))
        );
        assert_eq!(resolve(Family::V4, &eth2, Some(&addr), &[], false), None);
        assert_eq!(resolve(Family::V4, &eth2, None, &[], true), None);
    }

    #[test]
    fn test_host_min() {
        assert_eq!(host_min(&"10.1.2.3/8".parse().unwrap()), ip("10.0.0.1"));
        assert_eq!(host_min(&"10.0.0.5/32".parse().unwrap()), ip("10.0.0.6"));
        // wraps without carrying into the third octet
        assert_eq!(host_min(&"10.0.0.255/32".parse().unwrap()), ip("10.0.0.0"));
        assert_eq!(
            host_min(&"2001:db8:1:2::42/64".parse().unwrap()),
            ip("2001:db8:1:2::1")
        );
    }
}
