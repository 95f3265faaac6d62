//! Error types for mvirt-egress.

use std::io;

use thiserror::Error;

use crate::policy::{Family, StoreOp};

/// Errors raised by a [`PolicyStore`](crate::policy::PolicyStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open netlink connection: {0}")]
    Connection(#[from] io::Error),

    #[error("Netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("Entry already exists")]
    Exists,

    #[error("No such entry")]
    NotFound,

    #[error("Injected failure on {0}")]
    Injected(StoreOp),
}

/// Errors that abort a reconciliation pass or the watch loop.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("Failed to list {what} ({family}): {source}")]
    Lookup {
        family: Family,
        what: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to {op} for table {table} ({family}): {source}")]
    Mutation {
        family: Family,
        op: &'static str,
        table: u32,
        #[source]
        source: StoreError,
    },

    #[error("No free routing table in {start}-{end} ({family})")]
    ResourceExhausted {
        family: Family,
        start: u32,
        end: u32,
    },

    #[error("No gateway found for {device} (table {table}, {family})")]
    NoGatewayFound {
        family: Family,
        device: String,
        table: u32,
    },

    #[error("Failed to subscribe to netlink notifications: {0}")]
    Subscription(#[source] io::Error),

    #[error("Netlink {0} notification stream closed")]
    SubscriptionClosed(&'static str),
}

/// Invalid command line or programmatic configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid interface pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid gateway spec '{0}' (expected 'ip' or 'iface,ip')")]
    InvalidGatewaySpec(String),

    #[error("Invalid address family '{0}' (expected v4 or v6)")]
    InvalidFamily(String),

    #[error("Invalid table range {start}-{end}: {reason}")]
    InvalidTableRange {
        start: u32,
        end: u32,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, EgressError>;
