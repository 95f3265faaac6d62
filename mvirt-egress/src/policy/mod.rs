//! Kernel routing policy model and the store abstraction over it.
//!
//! Every read and write of rules, routes, links and addresses goes through
//! [`PolicyStore`], so the reconcilers never talk to the kernel directly.
//!
//! # Ownership
//!
//! The kernel tables are shared with every other process on the host.
//! Entries managed here are recognised by:
//! - rules: a table id inside the reserved [`TableRange`]
//! - routes: protocol [`ROUTE_PROTOCOL`] *and* a table inside the range
//!
//! Anything else is foreign and is never modified.
//!
//! Two backends exist: [`NetlinkPolicyStore`] (rtnetlink, needs
//! `CAP_NET_ADMIN`) and [`MemoryPolicyStore`] for tests.

mod memory;
mod netlink;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{ConfigError, StoreError};

pub use memory::MemoryPolicyStore;
pub use netlink::NetlinkPolicyStore;

/// First table id of the reserved pool.
pub const TABLE_RANGE_START: u32 = 15100;
/// Last table id of the reserved pool (inclusive).
pub const TABLE_RANGE_END: u32 = 15199;
/// Priority of every managed rule.
pub const RULE_PRIORITY: u32 = 15100;
/// Routing protocol tag carried by managed routes and rules.
pub const ROUTE_PROTOCOL: u8 = 151;
/// The kernel's main table. Only read, to find the default route carrier.
pub const TABLE_MAIN: u32 = 254;
/// RT_SCOPE_UNIVERSE
pub const SCOPE_UNIVERSE: u8 = 0;

const MAX_TABLES: u32 = 100;

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    /// Family of an address. IPv4-mapped IPv6 addresses count as IPv4.
    pub fn of(ip: &IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Prefix length of a single host (/32 or /128).
    pub fn full_prefix_len(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// `0.0.0.0/0` or `::/0`.
    pub fn default_destination(self) -> IpNet {
        match self {
            Family::V4 => IpNet::V4(Ipv4Net::default()),
            Family::V6 => IpNet::V6(Ipv6Net::default()),
        }
    }

    /// Host prefix (/32 or /128) for an address of this family.
    pub fn host_prefix(self, ip: IpAddr) -> IpNet {
        match (self, ip.to_canonical()) {
            (Family::V4, IpAddr::V4(v4)) => IpNet::V4(Ipv4Net::from(v4)),
            (_, ip) => IpNet::from(ip),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

impl FromStr for Family {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "4" | "v4" | "ipv4" | "inet" => Ok(Family::V4),
            "6" | "v6" | "ipv6" | "inet6" => Ok(Family::V6),
            _ => Err(ConfigError::InvalidFamily(s.to_string())),
        }
    }
}

/// Contiguous, inclusive pool of routing table ids owned by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRange {
    start: u32,
    end: u32,
}

impl TableRange {
    /// Validate a pool. At most 100 ids, and it must not overlap the
    /// kernel's reserved tables (0 and 253-255).
    pub fn new(start: u32, end: u32) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidTableRange { start, end, reason };
        if start == 0 {
            return Err(invalid("table 0 is reserved"));
        }
        if start > end {
            return Err(invalid("start is after end"));
        }
        if end - start >= MAX_TABLES {
            return Err(invalid("pool holds more than 100 tables"));
        }
        if start <= 255 && end >= 253 {
            return Err(invalid("overlaps the default, main or local table"));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn contains(&self, table: u32) -> bool {
        (self.start..=self.end).contains(&table)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl Default for TableRange {
    fn default() -> Self {
        Self {
            start: TABLE_RANGE_START,
            end: TABLE_RANGE_END,
        }
    }
}

/// A network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

impl Link {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

/// An address assigned to a link, with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub link_index: u32,
    pub net: IpNet,
}

impl Address {
    pub fn new(link_index: u32, net: IpNet) -> Self {
        Self { link_index, net }
    }

    pub fn ip(&self) -> IpAddr {
        self.net.addr()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.net.addr())
    }
}

/// A policy routing rule (`ip rule`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub family: Family,
    pub priority: u32,
    pub source: Option<IpNet>,
    pub destination: Option<IpNet>,
    pub table: u32,
    pub protocol: Option<u8>,
}

impl PolicyRule {
    /// The managed rule sending traffic sourced from `ip` to `table`.
    pub fn managed(family: Family, table: u32, ip: IpAddr) -> Self {
        Self {
            family,
            priority: RULE_PRIORITY,
            source: Some(family.host_prefix(ip)),
            destination: None,
            table,
            protocol: Some(ROUTE_PROTOCOL),
        }
    }

    pub fn is_owned(&self, range: &TableRange) -> bool {
        range.contains(self.table)
    }

    /// True if this is a plain `from <ip>/<full> lookup <table>` rule for `ip`.
    pub fn is_source_rule_for(&self, ip: IpAddr) -> bool {
        let no_destination = self.destination.is_none_or(|dst| dst.prefix_len() == 0);
        let Some(source) = self.source else {
            return false;
        };
        no_destination
            && source.prefix_len() == self.family.full_prefix_len()
            && source.addr() == ip
    }
}

/// A route in some table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: Family,
    pub table: u32,
    pub destination: IpNet,
    pub link_index: Option<u32>,
    pub gateway: Option<IpAddr>,
    pub scope: u8,
    pub protocol: u8,
}

impl Route {
    /// The managed default route of `table` via `gateway` on `link_index`.
    pub fn managed_default(family: Family, table: u32, link_index: u32, gateway: IpAddr) -> Self {
        Self {
            family,
            table,
            destination: family.default_destination(),
            link_index: Some(link_index),
            gateway: Some(gateway),
            scope: SCOPE_UNIVERSE,
            protocol: ROUTE_PROTOCOL,
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    pub fn is_owned(&self, range: &TableRange) -> bool {
        self.protocol == ROUTE_PROTOCOL && range.contains(self.table)
    }
}

/// Store operations, used to name the failing call in injected errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListLinks,
    ListAddresses,
    ListRules,
    AddRule,
    DelRule,
    ListRoutes,
    AddRoute,
    DelRoute,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::ListLinks => "list links",
            StoreOp::ListAddresses => "list addresses",
            StoreOp::ListRules => "list rules",
            StoreOp::AddRule => "add rule",
            StoreOp::DelRule => "delete rule",
            StoreOp::ListRoutes => "list routes",
            StoreOp::AddRoute => "add route",
            StoreOp::DelRoute => "delete route",
        };
        f.write_str(name)
    }
}

/// Access to the kernel routing policy.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// All links on the host.
    async fn list_links(&self) -> Result<Vec<Link>, StoreError>;

    /// All addresses of `family`, in kernel enumeration order.
    async fn list_addresses(&self, family: Family) -> Result<Vec<Address>, StoreError>;

    /// All rules of `family`, owned or not.
    async fn list_rules(&self, family: Family) -> Result<Vec<PolicyRule>, StoreError>;

    async fn add_rule(&self, rule: &PolicyRule) -> Result<(), StoreError>;

    async fn del_rule(&self, rule: &PolicyRule) -> Result<(), StoreError>;

    /// All routes of `family` across every table.
    async fn list_routes(&self, family: Family) -> Result<Vec<Route>, StoreError>;

    async fn add_route(&self, route: &Route) -> Result<(), StoreError>;

    async fn del_route(&self, route: &Route) -> Result<(), StoreError>;

    /// Link carrying the main table default route of `family`, if any.
    async fn default_route_link(&self, family: Family) -> Result<Option<u32>, StoreError> {
        let routes = self.list_routes(family).await?;
        Ok(routes
            .iter()
            .find(|route| route.table == TABLE_MAIN && route.is_default())
            .and_then(|route| route.link_index))
    }
}
