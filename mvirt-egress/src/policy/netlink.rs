//! rtnetlink-backed policy store.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::{Handle, IpVersion};
use tracing::debug;

use super::{Address, Family, Link, PolicyRule, PolicyStore, Route};
use crate::error::StoreError;

/// Header value telling the kernel to read the table from the attribute.
const RT_TABLE_UNSPEC: u8 = 0;

/// Policy store talking to the kernel over rtnetlink.
pub struct NetlinkPolicyStore {
    handle: Handle,
}

impl NetlinkPolicyStore {
    /// Open a netlink connection. Must be called from within a tokio runtime.
    pub fn new() -> Result<Self, StoreError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        debug!("Netlink connection established");
        Ok(Self { handle })
    }
}

#[async_trait]
impl PolicyStore for NetlinkPolicyStore {
    async fn list_links(&self) -> Result<Vec<Link>, StoreError> {
        let links: Vec<LinkMessage> = self.handle.link().get().execute().try_collect().await?;
        Ok(links.iter().filter_map(link_from_message).collect())
    }

    async fn list_addresses(&self, family: Family) -> Result<Vec<Address>, StoreError> {
        let addresses: Vec<AddressMessage> =
            self.handle.address().get().execute().try_collect().await?;
        Ok(addresses
            .iter()
            .filter(|msg| msg.header.family == address_family(family))
            .filter_map(address_from_message)
            .collect())
    }

    async fn list_rules(&self, family: Family) -> Result<Vec<PolicyRule>, StoreError> {
        let rules: Vec<RuleMessage> = self
            .handle
            .rule()
            .get(ip_version(family))
            .execute()
            .try_collect()
            .await?;
        Ok(rules
            .iter()
            .filter(|msg| msg.header.family == address_family(family))
            .map(|msg| rule_from_message(family, msg))
            .collect())
    }

    async fn add_rule(&self, rule: &PolicyRule) -> Result<(), StoreError> {
        let mut request = self.handle.rule().add();
        *request.message_mut() = rule_message(rule);
        request.execute().await?;
        Ok(())
    }

    async fn del_rule(&self, rule: &PolicyRule) -> Result<(), StoreError> {
        self.handle.rule().del(rule_message(rule)).execute().await?;
        Ok(())
    }

    async fn list_routes(&self, family: Family) -> Result<Vec<Route>, StoreError> {
        // The dump is not filtered by table, every table comes back.
        let mut request = RouteMessage::default();
        request.header.address_family = address_family(family);

        let routes: Vec<RouteMessage> = self
            .handle
            .route()
            .get(request)
            .execute()
            .try_collect()
            .await?;
        Ok(routes
            .iter()
            .filter(|msg| msg.header.address_family == address_family(family))
            .map(|msg| route_from_message(family, msg))
            .collect())
    }

    async fn add_route(&self, route: &Route) -> Result<(), StoreError> {
        self.handle
            .route()
            .add(route_message(route, RouteType::Unicast))
            .execute()
            .await?;
        Ok(())
    }

    async fn del_route(&self, route: &Route) -> Result<(), StoreError> {
        // Unspec type matches whatever type the kernel holds.
        self.handle
            .route()
            .del(route_message(route, RouteType::Unspec))
            .execute()
            .await?;
        Ok(())
    }
}

fn address_family(family: Family) -> AddressFamily {
    match family {
        Family::V4 => AddressFamily::Inet,
        Family::V6 => AddressFamily::Inet6,
    }
}

fn ip_version(family: Family) -> IpVersion {
    match family {
        Family::V4 => IpVersion::V4,
        Family::V6 => IpVersion::V6,
    }
}

fn to_route_address(ip: IpAddr) -> RouteAddress {
    match ip {
        IpAddr::V4(v4) => RouteAddress::Inet(v4),
        IpAddr::V6(v6) => RouteAddress::Inet6(v6),
    }
}

fn from_route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn link_from_message(msg: &LinkMessage) -> Option<Link> {
    let name = msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })?;
    Some(Link::new(msg.header.index, name))
}

fn address_from_message(msg: &AddressMessage) -> Option<Address> {
    // IFA_LOCAL is the interface's own address on point-to-point links,
    // IFA_ADDRESS is the peer there. IPv6 only sends IFA_ADDRESS.
    let local = msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Local(ip) => Some(*ip),
        _ => None,
    });
    let address = msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(ip) => Some(*ip),
        _ => None,
    });
    let net = IpNet::new(local.or(address)?, msg.header.prefix_len).ok()?;
    Some(Address::new(msg.header.index, net))
}

fn rule_from_message(family: Family, msg: &RuleMessage) -> PolicyRule {
    let mut rule = PolicyRule {
        family,
        priority: 0,
        source: None,
        destination: None,
        table: u32::from(msg.header.table),
        protocol: None,
    };
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Priority(priority) => rule.priority = *priority,
            RuleAttribute::Table(table) => rule.table = *table,
            RuleAttribute::Source(ip) => rule.source = IpNet::new(*ip, msg.header.src_len).ok(),
            RuleAttribute::Destination(ip) => {
                rule.destination = IpNet::new(*ip, msg.header.dst_len).ok()
            }
            RuleAttribute::Protocol(protocol) => rule.protocol = Some(u8::from(*protocol)),
            _ => {}
        }
    }
    rule
}

fn rule_message(rule: &PolicyRule) -> RuleMessage {
    let mut msg = RuleMessage::default();
    msg.header.family = address_family(rule.family);
    msg.header.action = RuleAction::ToTable;
    msg.header.table = u8::try_from(rule.table).unwrap_or(RT_TABLE_UNSPEC);
    msg.attributes.push(RuleAttribute::Table(rule.table));
    msg.attributes.push(RuleAttribute::Priority(rule.priority));
    if let Some(source) = rule.source {
        msg.header.src_len = source.prefix_len();
        msg.attributes.push(RuleAttribute::Source(source.addr()));
    }
    if let Some(destination) = rule.destination {
        msg.header.dst_len = destination.prefix_len();
        msg.attributes
            .push(RuleAttribute::Destination(destination.addr()));
    }
    // The kernel matches the protocol on delete, so only send what was read.
    if let Some(protocol) = rule.protocol {
        msg.attributes
            .push(RuleAttribute::Protocol(RouteProtocol::from(protocol)));
    }
    msg
}

fn route_from_message(family: Family, msg: &RouteMessage) -> Route {
    let mut route = Route {
        family,
        table: u32::from(msg.header.table),
        destination: family.default_destination(),
        link_index: None,
        gateway: None,
        scope: u8::from(msg.header.scope),
        protocol: u8::from(msg.header.protocol),
    };
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(table) => route.table = *table,
            RouteAttribute::Oif(index) => route.link_index = Some(*index),
            RouteAttribute::Gateway(gateway) => route.gateway = from_route_address(gateway),
            RouteAttribute::Destination(destination) => {
                if let Some(ip) = from_route_address(destination) {
                    let prefix_len = msg.header.destination_prefix_length;
                    if let Ok(net) = IpNet::new(ip, prefix_len) {
                        route.destination = net;
                    }
                }
            }
            _ => {}
        }
    }
    route
}

fn route_message(route: &Route, kind: RouteType) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header.address_family = address_family(route.family);
    msg.header.destination_prefix_length = route.destination.prefix_len();
    msg.header.table = u8::try_from(route.table).unwrap_or(RT_TABLE_UNSPEC);
    msg.header.protocol = RouteProtocol::from(route.protocol);
    msg.header.scope = RouteScope::from(route.scope);
    msg.header.kind = kind;
    msg.attributes.push(RouteAttribute::Table(route.table));
    if !route.is_default() {
        let destination = to_route_address(route.destination.addr());
        msg.attributes
            .push(RouteAttribute::Destination(destination));
    }
    if let Some(index) = route.link_index {
        msg.attributes.push(RouteAttribute::Oif(index));
    }
    if let Some(gateway) = route.gateway {
        msg.attributes
            .push(RouteAttribute::Gateway(to_route_address(gateway)));
    }
    msg
}
