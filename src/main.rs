//! Confab server binary
//!
//! Wires configuration, store, push connectors, the hub, and cluster
//! plumbing together. Transports register on top of the hub and are not part
//! of the core build.
//!
//! Exit codes: 0 normal, 1 config error, 2 store init error, 3 cluster init
//! error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use confab::cluster::{Cluster, ClusterReq, ClusterResp, LoopbackTransport};
use confab::config::{Config, FailoverConfig};
use confab::hub::Hub;
use confab::push::PushRegistry;
use confab::store::{MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "confab")]
#[command(about = "Clustered real-time messaging server")]
#[command(version)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "confab.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_store(config: &Config) -> anyhow::Result<Store> {
    // Store adapters register here; the in-memory adapter backs single-node
    // runs and development.
    if let Some(adapter) = config
        .store
        .as_ref()
        .and_then(|s| s.get("adapter"))
        .and_then(|a| a.as_str())
        && adapter != "memory"
    {
        bail!("unknown store adapter '{adapter}'");
    }
    info!("in-memory store initialized");
    Ok(MemoryStore::new().handle())
}

type ClusterInboxes = (mpsc::Receiver<ClusterReq>, mpsc::Receiver<ClusterResp>);

fn init_cluster(
    config: &Config,
) -> anyhow::Result<Option<(Arc<Cluster>, Option<FailoverConfig>, ClusterInboxes)>> {
    let Some(cluster_cfg) = &config.cluster else {
        return Ok(None);
    };
    if cluster_cfg.nodes.len() < 2 {
        bail!("cluster requires at least two nodes");
    }
    info!(node = %cluster_cfg.self_name, nodes = cluster_cfg.nodes.len(), "cluster enabled");
    let transport = Arc::new(LoopbackTransport::new());
    let inboxes = transport.register(&cluster_cfg.self_name);
    let cluster = Arc::new(Cluster::new(
        &cluster_cfg.self_name,
        cluster_cfg.nodes.clone(),
        transport,
    ));
    Ok(Some((cluster, cluster_cfg.failover.clone(), inboxes)))
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    let store = match init_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store init failed");
            std::process::exit(2);
        }
    };

    let clustering = match init_cluster(&config) {
        Ok(clustering) => clustering,
        Err(e) => {
            error!(error = %e, "cluster init failed");
            std::process::exit(3);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let push = PushRegistry::new();

        let (cluster, failover_cfg, inboxes) = match clustering {
            Some((cluster, failover_cfg, inboxes)) => {
                (Some(cluster), failover_cfg, Some(inboxes))
            }
            None => (None, None, None),
        };

        let hub = Hub::new(
            store,
            push,
            config.limits.clone(),
            cluster.clone(),
            failover_cfg.clone(),
        );

        if let Some((mut req_rx, mut resp_rx)) = inboxes {
            let h = hub.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(req) = req_rx.recv() => h.handle_cluster_req(req).await,
                        Some(resp) = resp_rx.recv() => h.handle_cluster_resp(resp).await,
                        else => return,
                    }
                }
            });
        }

        if let Some(cfg) = failover_cfg
            && cfg.enabled
        {
            let h = hub.clone();
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(cfg.heartbeat.max(10)));
            tokio::spawn(async move {
                loop {
                    ticker.tick().await;
                    h.failover_tick().await;
                }
            });
        }

        info!("confab is up");

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "signal handler failed");
        }

        info!("shutting down");
        hub.shutdown().await;
    });
}
