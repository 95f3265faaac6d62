//! Address validity filter.

use std::net::{IpAddr, Ipv6Addr};

use crate::policy::Family;

/// Whether `ip` may be routed through a per-interface table for `family`.
///
/// IPv4 rejects loopback and multicast. IPv6 additionally rejects link-local
/// unicast and link-local multicast. IPv4-mapped IPv6 addresses are judged
/// as IPv4.
pub fn is_valid(family: Family, ip: IpAddr) -> bool {
    match (family, ip.to_canonical()) {
        (Family::V4, IpAddr::V4(v4)) => !v4.is_loopback() && !v4.is_multicast(),
        (Family::V6, IpAddr::V6(v6)) => {
            !is_link_local_unicast(&v6)
                && !is_link_local_multicast(&v6)
                && !v6.is_loopback()
                && !v6.is_multicast()
        }
        _ => false,
    }
}

// fe80::/10
fn is_link_local_unicast(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

// ff02::/16 and any other scope-2 multicast
fn is_link_local_multicast(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xff0f) == 0xff02
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4() {
        assert!(is_valid(Family::V4, ip("10.0.0.5")));
        assert!(is_valid(Family::V4, ip("169.254.1.1")));
        assert!(!is_valid(Family::V4, ip("127.0.0.1")));
        assert!(!is_valid(Family::V4, ip("224.0.0.1")));
    }

    #[test]
    fn test_ipv6() {
        assert!(is_valid(Family::V6, ip("2001:db8::5")));
        assert!(is_valid(Family::V6, ip("fd00::1")));
        assert!(!is_valid(Family::V6, ip("fe80::1")));
        assert!(!is_valid(Family::V6, ip("febf::1")));
        assert!(!is_valid(Family::V6, ip("ff02::1")));
        assert!(!is_valid(Family::V6, ip("ff0e::1")));
        assert!(!is_valid(Family::V6, ip("::1")));
    }

    #[test]
    fn test_family_mismatch() {
        assert!(!is_valid(Family::V6, ip("10.0.0.5")));
        assert!(!is_valid(Family::V4, ip("2001:db8::5")));
    }

    #[test]
    fn test_mapped_ipv4() {
        assert!(is_valid(Family::V4, ip("::ffff:10.0.0.5")));
        assert!(!is_valid(Family::V4, ip("::ffff:127.0.0.1")));
        assert!(!is_valid(Family::V6, ip("::ffff:10.0.0.5")));
    }
}
