//! mvirt-egress: per-interface egress policy routing for multi-homed hosts.
//!
//! Every usable address on a selected interface gets a source rule pointing
//! into a private routing table, and that table gets a default route out of
//! the same interface. A forward proxy binding its upstream sockets to one
//! of these addresses then leaves through that interface, whatever the
//! host's main default route says.

pub mod address;
pub mod config;
pub mod error;
pub mod policy;
pub mod reconciler;
pub mod watch;

pub use config::{EgressConfig, GatewaySpec};
pub use error::{ConfigError, EgressError, Result, StoreError};
pub use policy::{Family, MemoryPolicyStore, NetlinkPolicyStore, PolicyStore, TableRange};
pub use reconciler::{EgressReconciler, PassSummary};
pub use watch::EventStreams;
