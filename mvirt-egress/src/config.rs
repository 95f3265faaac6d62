//! Reconciler configuration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use regex::Regex;

use crate::error::ConfigError;
use crate::policy::{Family, TableRange};

/// Interface patterns used when none are given.
pub const DEFAULT_IFACE_PATTERNS: [&str; 2] = ["en.*", "eth.*"];

/// One `--gw` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewaySpec {
    /// `ip`: applies to every interface.
    Any(IpAddr),
    /// `iface,ip`: applies to the named interface only.
    Interface { name: String, gateway: IpAddr },
}

impl GatewaySpec {
    pub fn gateway(&self) -> IpAddr {
        match self {
            GatewaySpec::Any(gateway) | GatewaySpec::Interface { gateway, .. } => *gateway,
        }
    }
}

impl FromStr for GatewaySpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidGatewaySpec(s.to_string());
        match s.split_once(',') {
            None => {
                let gateway = s.trim().parse().map_err(|_| invalid())?;
                Ok(GatewaySpec::Any(gateway))
            }
            Some((name, ip)) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(invalid());
                }
                let gateway = ip.trim().parse().map_err(|_| invalid())?;
                Ok(GatewaySpec::Interface {
                    name: name.to_string(),
                    gateway,
                })
            }
        }
    }
}

impl fmt::Display for GatewaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewaySpec::Any(gateway) => write!(f, "{gateway}"),
            GatewaySpec::Interface { name, gateway } => write!(f, "{name},{gateway}"),
        }
    }
}

/// Validated settings for [`EgressReconciler`](crate::reconciler::EgressReconciler).
#[derive(Debug, Clone)]
pub struct EgressConfig {
    pub families: Vec<Family>,
    pub iface_patterns: Vec<Regex>,
    pub gateways: Vec<GatewaySpec>,
    pub use_host_min_as_gw: bool,
    pub table_range: TableRange,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            families: Family::ALL.to_vec(),
            iface_patterns: DEFAULT_IFACE_PATTERNS
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
            gateways: Vec::new(),
            use_host_min_as_gw: true,
            table_range: TableRange::default(),
        }
    }
}

impl EgressConfig {
    /// Replace the interface patterns. Patterns match anywhere in the name.
    pub fn with_patterns<I, P>(mut self, patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.iface_patterns = patterns
            .into_iter()
            .map(|pattern| parse_pattern(pattern.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Replace the gateway specs. Order matters, see
    /// [`gateway::resolve`](crate::reconciler::gateway::resolve).
    pub fn with_gateways<I, P>(mut self, specs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.gateways = specs
            .into_iter()
            .map(|spec| spec.as_ref().parse())
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn with_host_min_fallback(mut self, enabled: bool) -> Self {
        self.use_host_min_as_gw = enabled;
        self
    }

    /// Restrict reconciliation to `families`, keeping v4 before v6.
    pub fn with_families(mut self, families: impl IntoIterator<Item = Family>) -> Self {
        let mut families: Vec<Family> = families.into_iter().collect();
        families.sort();
        families.dedup();
        self.families = families;
        self
    }

    pub fn with_table_range(mut self, range: TableRange) -> Self {
        self.table_range = range;
        self
    }
}

/// Compile an interface name pattern.
pub fn parse_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway_spec() {
        assert_eq!(
            "10.9.9.9".parse::<GatewaySpec>().unwrap(),
            GatewaySpec::Any("10.9.9.9".parse().unwrap())
        );
        assert_eq!(
            "eth1,10.0.1.1".parse::<GatewaySpec>().unwrap(),
            GatewaySpec::Interface {
                name: "eth1".to_string(),
                gateway: "10.0.1.1".parse().unwrap(),
            }
        );
        assert_eq!(
            "eth1,2001:db8::1".parse::<GatewaySpec>().unwrap().gateway(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_gateway_spec() {
        let invalid = [
            "",
            "eth1",
            "eth1,",
            ",10.0.0.1",
            "eth1,10.0.0.1,x",
            "10.0.0.256",
        ];
        for spec in invalid {
            assert!(
                matches!(
                    spec.parse::<GatewaySpec>(),
                    Err(ConfigError::InvalidGatewaySpec(_))
                ),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn test_gateway_spec_display() {
        for spec in ["10.9.9.9", "eth1,10.0.1.1"] {
            assert_eq!(spec.parse::<GatewaySpec>().unwrap().to_string(), spec);
        }
    }

    #[test]
    fn test_default_config() {
        let config = EgressConfig::default();
        assert_eq!(config.families, vec![Family::V4, Family::V6]);
        assert_eq!(config.iface_patterns.len(), 2);
        assert!(config.gateways.is_empty());
        assert!(config.use_host_min_as_gw);
        assert_eq!(config.table_range, TableRange::default());
    }

    #[test]
    fn test_builder() {
        let config = EgressConfig::default()
            .with_patterns(["^wan[0-9]+$"])
            .unwrap()
            .with_gateways(["eth0,10.0.0.1"])
            .unwrap()
            .with_families([Family::V6, Family::V4, Family::V6])
            .with_host_min_fallback(false);

        assert_eq!(config.iface_patterns[0].as_str(), "^wan[0-9]+$");
        assert_eq!(config.gateways.len(), 1);
        assert_eq!(config.families, vec![Family::V4, Family::V6]);
        assert!(!config.use_host_min_as_gw);

        assert!(matches!(
            EgressConfig::default().with_patterns(["eth("]),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }
}
