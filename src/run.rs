//! Process-wide worker orchestration (spec §5)
//!
//! One task per enabled, valid cluster. Per-cluster startup failures are
//! logged and do not abort sibling workers. Shutdown is cooperative via a
//! `CancellationToken`; a worker finishes its in-flight call and sink write
//! and then returns.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::ClusterClientBuilder;
use crate::config::GlobalConfig;
use crate::scheduler::{prepare_cluster, run_cluster_worker};
use crate::sink::Sink;

/// Run every enabled cluster's worker to completion or shutdown, returning
/// once all workers have finished. Mirrors spec §5's "process-wide wait
/// group": the process exits when every worker has returned.
pub async fn run_all_clusters(
    config: Arc<GlobalConfig>,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
) {
    let mut handles = Vec::new();

    for cluster_config in &config.clusters {
        if cluster_config.disabled {
            info!(cluster = %cluster_config.hostname, "cluster disabled, skipping");
            continue;
        }

        let cluster_config = cluster_config.clone();
        let config = config.clone();
        let sink = sink.clone();
        let shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_one_cluster(cluster_config.clone(), config, sink, shutdown).await {
                error!(cluster = %cluster_config.hostname, error = %e, "cluster worker terminated with error");
            }
        });
        handles.push(handle);
    }

    futures::future::join_all(handles).await;
}

async fn run_one_cluster(
    cluster_config: crate::config::ClusterConfig,
    config: Arc<GlobalConfig>,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let password = cluster_config
        .resolve_password()
        .map_err(|e| crate::error::CollectorError::ValidationError(e.to_string()))?;

    let client = ClusterClientBuilder::from_cluster_config(&cluster_config, password)
        .timeout(Duration::from_secs(120))
        .max_retries(config.max_retries)
        .build()?;

    let (mut state, pq) = prepare_cluster(&client, &cluster_config, &config).await?;

    sink.init().await?;

    info!(cluster = %state.name, os_version = %state.os_version, "cluster worker starting collection loop");

    run_cluster_worker(&client, &mut state, pq, &config, sink.as_ref(), shutdown).await
}

/// Run a single collection pass across all enabled clusters and return,
/// without entering the scheduling loop. Used by `--once` for credential
/// smoke-testing.
pub async fn run_once(config: Arc<GlobalConfig>, sink: Arc<dyn Sink>) {
    for cluster_config in &config.clusters {
        if cluster_config.disabled {
            continue;
        }
        let password = match cluster_config.resolve_password() {
            Ok(p) => p,
            Err(e) => {
                error!(cluster = %cluster_config.hostname, error = %e, "failed to resolve password");
                continue;
            }
        };
        let client = match ClusterClientBuilder::from_cluster_config(cluster_config, password)
            .timeout(Duration::from_secs(120))
            .max_retries(config.max_retries)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                error!(cluster = %cluster_config.hostname, error = %e, "failed to build client");
                continue;
            }
        };
        match prepare_cluster(&client, cluster_config, &config).await {
            Ok((state, _pq)) => {
                if let Err(e) = sink.init().await {
                    error!(cluster = %state.name, error = %e, "sink init failed");
                    continue;
                }
                info!(cluster = %state.name, os_version = %state.os_version, "connected and fetched metadata");
            }
            Err(e) => {
                error!(cluster = %cluster_config.hostname, error = %e, "cluster connect/metadata fetch failed");
            }
        }
    }
}
