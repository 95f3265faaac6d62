//! Watch mode: re-run the reconciler on every kernel notification.

use futures::StreamExt;
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::error::{EgressError, Result};
use crate::policy::PolicyStore;
use crate::reconciler::EgressReconciler;

/// Multicast group bitmask for the legacy `nl_groups` bind field.
const fn nl_mgrp(group: u32) -> u32 {
    1 << (group - 1)
}

const ROUTE_GROUPS: u32 = nl_mgrp(libc::RTNLGRP_IPV4_ROUTE) | nl_mgrp(libc::RTNLGRP_IPV6_ROUTE);
const ADDRESS_GROUPS: u32 = nl_mgrp(libc::RTNLGRP_IPV4_IFADDR) | nl_mgrp(libc::RTNLGRP_IPV6_IFADDR);
const LINK_GROUPS: u32 = nl_mgrp(libc::RTNLGRP_LINK);

/// Route, address and link notification streams.
///
/// Notifications carry no payload; any of them means "state may have
/// changed".
pub struct EventStreams {
    route: UnboundedReceiver<()>,
    address: UnboundedReceiver<()>,
    link: UnboundedReceiver<()>,
}

/// Sending side of [`EventStreams::channel`].
pub struct EventSenders {
    pub route: UnboundedSender<()>,
    pub address: UnboundedSender<()>,
    pub link: UnboundedSender<()>,
}

impl EventStreams {
    /// Subscribe to kernel notifications, one netlink socket per stream.
    pub fn subscribe() -> Result<Self> {
        let (senders, streams) = Self::channel();
        forward("route", ROUTE_GROUPS, senders.route)?;
        forward("address", ADDRESS_GROUPS, senders.address)?;
        forward("link", LINK_GROUPS, senders.link)?;
        info!("Subscribed to route, address and link notifications");
        Ok(streams)
    }

    /// Streams fed by hand.
    pub fn channel() -> (EventSenders, Self) {
        let (route_tx, route) = mpsc::unbounded_channel();
        let (address_tx, address) = mpsc::unbounded_channel();
        let (link_tx, link) = mpsc::unbounded_channel();
        (
            EventSenders {
                route: route_tx,
                address: address_tx,
                link: link_tx,
            },
            Self {
                route,
                address,
                link,
            },
        )
    }

    /// Wait for the next notification and return the name of its stream.
    async fn next(&mut self) -> Result<&'static str> {
        let (name, event) = tokio::select! {
            biased;
            event = self.route.recv() => ("route", event),
            event = self.address.recv() => ("address", event),
            event = self.link.recv() => ("link", event),
        };
        match event {
            Some(()) => Ok(name),
            None => Err(EgressError::SubscriptionClosed(name)),
        }
    }
}

fn forward(name: &'static str, groups: u32, tx: UnboundedSender<()>) -> Result<()> {
    let (mut connection, handle, mut messages) = rtnetlink::new_connection()
        .map_err(EgressError::Subscription)?;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, groups))
        .map_err(EgressError::Subscription)?;
    tokio::spawn(connection);

    tokio::spawn(async move {
        // The connection shuts down once every handle is gone.
        let _handle = handle;
        while messages.next().await.is_some() {
            if tx.send(()).is_err() {
                break;
            }
        }
        debug!(stream = name, "Notification stream ended");
    });
    Ok(())
}

/// Run a pass, wait for any notification, repeat.
///
/// Returns only on error: a failed pass or a closed stream.
pub async fn run<S>(reconciler: &EgressReconciler<S>, mut events: EventStreams) -> Result<()>
where
    S: PolicyStore + ?Sized,
{
    loop {
        reconciler.reconcile().await?;
        let stream = events.next().await?;
        debug!(stream, "Notification received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_masks() {
        assert_eq!(LINK_GROUPS, 0x1);
        assert_eq!(ADDRESS_GROUPS, 0x10 | 0x100);
        assert_eq!(ROUTE_GROUPS, 0x40 | 0x400);
    }

    #[tokio::test]
    async fn test_next_reports_stream() {
        let (senders, mut streams) = EventStreams::channel();
        senders.link.send(()).unwrap();
        assert_eq!(streams.next().await.unwrap(), "link");

        drop(senders);
        assert!(matches!(
            streams.next().await,
            Err(EgressError::SubscriptionClosed("route"))
        ));
    }
}
