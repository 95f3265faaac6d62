//! mvirt-egress: keeps source-based policy routing in sync with the
//! host's interfaces.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use regex::Regex;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_egress::config::{DEFAULT_IFACE_PATTERNS, parse_pattern};
use mvirt_egress::policy::{TABLE_RANGE_END, TABLE_RANGE_START};
use mvirt_egress::{
    EgressConfig, EgressReconciler, EventStreams, Family, GatewaySpec, NetlinkPolicyStore,
    TableRange, watch,
};

/// mvirt egress policy routing
#[derive(Parser, Debug)]
#[command(name = "mvirt-egress", version, about)]
struct Args {
    /// Keep running and reconcile on every route, address or link change
    #[arg(long)]
    watch: bool,

    /// Interface name pattern (regex, repeatable)
    #[arg(
        long = "iface",
        value_name = "PATTERN",
        value_parser = parse_pattern,
        default_values = DEFAULT_IFACE_PATTERNS,
    )]
    iface: Vec<Regex>,

    /// Gateway as `ip` or `iface,ip` (repeatable, first match wins)
    #[arg(long = "gw", value_name = "SPEC", value_parser = parse_gateway)]
    gw: Vec<GatewaySpec>,

    /// Fall back to the first host address of the interface's subnet
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    use_host_min_as_gw: bool,

    /// Address family to manage (repeatable, defaults to both)
    #[arg(long, value_name = "v4|v6", value_parser = parse_family)]
    family: Vec<Family>,

    /// First routing table id of the managed pool
    #[arg(long, default_value_t = TABLE_RANGE_START)]
    table_start: u32,

    /// Last routing table id of the managed pool
    #[arg(long, default_value_t = TABLE_RANGE_END)]
    table_end: u32,
}

fn parse_gateway(s: &str) -> Result<GatewaySpec, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_family(s: &str) -> Result<Family, String> {
    s.parse().map_err(|e| format!("{e}"))
}

impl Args {
    fn into_config(self) -> Result<EgressConfig> {
        let range = TableRange::new(self.table_start, self.table_end)?;
        let mut config = EgressConfig::default()
            .with_host_min_fallback(self.use_host_min_as_gw)
            .with_table_range(range);
        config.iface_patterns = self.iface;
        config.gateways = self.gw;
        if !self.family.is_empty() {
            config = config.with_families(self.family);
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_egress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let watch_mode = args.watch;
    let config = args.into_config().context("Invalid configuration")?;

    info!(
        patterns = ?config.iface_patterns.iter().map(Regex::as_str).collect::<Vec<_>>(),
        gateways = ?config.gateways.iter().map(ToString::to_string).collect::<Vec<_>>(),
        host_min = config.use_host_min_as_gw,
        tables = %format!("{}-{}", config.table_range.start(), config.table_range.end()),
        watch = watch_mode,
        "Starting mvirt-egress"
    );

    let store = NetlinkPolicyStore::new()
        .context("Failed to open netlink connection")?;
    let reconciler = EgressReconciler::new(Arc::new(store), config);

    if !watch_mode {
        let summary = reconciler.reconcile().await?;
        info!(
            mutations = summary.mutations(),
            tables = summary.tables,
            "Reconciliation complete"
        );
        return Ok(());
    }

    let events = EventStreams::subscribe()?;
    let mut sigint = signal(SignalKind::interrupt())
        .context("Failed to register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate())
        .context("Failed to register SIGTERM handler")?;

    tokio::select! {
        result = watch::run(&reconciler, events) => {
            if let Err(e) = &result {
                error!(error = %e, "Watch loop failed");
            }
            result?;
        }
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }

    info!("mvirt-egress stopped");
    Ok(())
}
