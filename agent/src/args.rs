use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use egressgateway_core::Family;
use egressgateway_ipset::CmdIpset;
use egressgateway_iptables::{BackendMode, CmdDriver, Options, Table, Version};
use egressgateway_k8s_api::{
    EgressClusterEndpointSlice, EgressClusterInfo, EgressClusterPolicy, EgressEndpointSlice,
    EgressGateway, EgressPolicy,
};

use crate::config::FileConfig;
use crate::index::Index;
use crate::reconcile::{Reconciler, Tables, CHAIN_PREFIX};
use crate::resources::KubeResources;

#[derive(Debug, Parser)]
#[clap(
    name = "egressgateway-agent",
    about = "Programs per-node egress-gateway kernel state"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "egressgateway=info,warn",
        env = "EGRESSGATEWAY_AGENT_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Path to the configmap-mounted agent configuration.
    #[clap(long)]
    config: Option<PathBuf>,

    /// The node this agent programs; only local state is reconciled.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            config,
            node_name,
        } = self;

        let config = FileConfig::load(config.as_deref())?;
        if !config.enable_ipv4 && !config.enable_ipv6 {
            bail!("at least one of enableIPv4/enableIPv6 must be set");
        }

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .build()
            .await?;

        let tables = build_tables(&config).await?;
        let sets = Arc::new(CmdIpset::new());

        let (tx, rx) = mpsc::unbounded_channel();
        let index = Index::shared(tx.clone());

        let gateways = runtime.watch_all::<EgressGateway>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), gateways).instrument(info_span!("egressgateways")),
        );

        let policies = runtime.watch_all::<EgressPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("egresspolicies")),
        );

        let cluster_policies = runtime.watch_all::<EgressClusterPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), cluster_policies)
                .instrument(info_span!("egressclusterpolicies")),
        );

        let slices = runtime.watch_all::<EgressEndpointSlice>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), slices)
                .instrument(info_span!("egressendpointslices")),
        );

        let cluster_slices =
            runtime.watch_all::<EgressClusterEndpointSlice>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), cluster_slices)
                .instrument(info_span!("egressclusterendpointslices")),
        );

        let infos = runtime.watch_all::<EgressClusterInfo>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), infos).instrument(info_span!("egressclusterinfos")),
        );

        let resources = KubeResources::new(runtime.client());
        let reconciler = Reconciler::new(resources, sets, tables, &config, node_name)?;
        tokio::spawn(reconciler.run(rx, tx).instrument(info_span!("reconcile")));

        // Block on the shutdown signal; watches and the reconciler drain
        // with the runtime.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

/// Builds the per-family table handles.
///
/// The installed iptables version decides the restore lock strategy and
/// resolves `backendMode: auto`; without that answer there is no valid
/// operating state, so detection retries until it succeeds.
async fn build_tables(config: &FileConfig) -> Result<Tables> {
    let configured_mode: BackendMode = config
        .iptables
        .backend_mode
        .parse()
        .map_err(|error| anyhow::anyhow!("{}", error))?;

    let version = loop {
        match Version::detect() {
            Ok(version) => break version,
            Err(error) => {
                warn!(%error, "failed to detect iptables version; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let mode = match configured_mode {
        BackendMode::Auto => version.backend,
        mode => mode,
    };
    let restore_supports_lock =
        config.iptables.restore_supports_lock || version.restore_supports_lock();
    info!(?version, ?mode, restore_supports_lock, "iptables backend");

    let options = Options {
        backend: mode,
        refresh_interval: config.refresh_interval(),
        lock_timeout: Duration::from_secs(config.iptables.lock_timeout_second),
        lock_probe_interval: Duration::from_millis(config.iptables.lock_probe_interval_millis),
        initial_post_write_interval: Duration::from_secs(
            config.iptables.initial_post_write_interval_second,
        ),
        restore_supports_lock,
        lock_file_path: config.iptables.lock_file_path.clone(),
    };

    let mut tables = Tables {
        mangle: Vec::new(),
        nat: Vec::new(),
        filter: Vec::new(),
    };
    let mut families = Vec::new();
    if config.enable_ipv4 {
        families.push(Family::V4);
    }
    if config.enable_ipv6 {
        families.push(Family::V6);
    }
    for family in families {
        let new = |name: &str| {
            Table::new(
                name,
                family,
                CHAIN_PREFIX,
                &options,
                Box::new(CmdDriver::new(mode)),
            )
        };
        tables.mangle.push(new("mangle"));
        tables.nat.push(new("nat"));
        tables.filter.push(new("filter"));
    }
    Ok(tables)
}
