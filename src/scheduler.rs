//! Per-cluster collection loop (spec §4.4)
//!
//! Bucketing from `StatGroupConfig` + fetched `StatDetail`s, a PQ-driven
//! dispatch loop with three task-type branches, per-tick retry independent
//! of the client's own connection-level backoff, bad-stats bookkeeping, and
//! rescheduling by cadence.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ClusterClient;
use crate::config::{ClusterConfig, GlobalConfig, IntervalSpec};
use crate::decode::{decode_client_summary_item, decode_protocol_summary_item, decode_result};
use crate::error::{CollectorError, Result};
use crate::model::{ErrorClass, NodeNumber, Point, StatDetail, StatKey};
use crate::pq::{Bucket, ScheduledTask, TaskKind, TaskQueue};
use crate::sink::{write_with_retry, RetryPolicy, Sink};

/// Per-cluster connection/run state carried for the lifetime of the worker
/// (spec §3 "Cluster"). Most fields live on `ClusterClient`/`TaskQueue`
/// directly; this struct holds what's left: name/version and the bad-stats
/// set.
pub struct ClusterState {
    pub name: String,
    pub os_version: String,
    pub bad_stats: HashSet<StatKey>,
}

/// Compute regular buckets from configured stat groups and fetched metadata
/// (spec §4.4 steps 1-3). Invalid keys (no metadata, `StatDetail::invalid`)
/// are dropped with a single warning each.
pub fn compute_buckets(
    stat_groups: &[crate::config::StatGroupConfig],
    details: &HashMap<StatKey, StatDetail>,
    min_update_interval: Duration,
) -> Vec<Bucket> {
    let mut by_duration: HashMap<u64, Vec<StatKey>> = HashMap::new();

    for group in stat_groups {
        match group.interval {
            IntervalSpec::Absolute(d) => {
                let secs = d.as_secs().max(1);
                let bucket = by_duration.entry(secs).or_default();
                for key in &group.keys {
                    match details.get(key) {
                        Some(detail) if detail.valid => bucket.push(key.clone()),
                        _ => warn!(key = %key, "dropping invalid key from absolute-interval group"),
                    }
                }
            }
            IntervalSpec::Multiplier(m) => {
                for key in &group.keys {
                    let Some(detail) = details.get(key).filter(|d| d.valid) else {
                        warn!(key = %key, "dropping invalid key from multiplier group");
                        continue;
                    };
                    let native = detail.native_update_interval.as_secs_f64();
                    let effective_secs = if native == 0.0 {
                        min_update_interval.as_secs_f64()
                    } else {
                        (m * native).max(min_update_interval.as_secs_f64())
                    };
                    let secs = effective_secs.round().max(1.0) as u64;
                    by_duration.entry(secs).or_default().push(key.clone());
                }
            }
        }
    }

    by_duration
        .into_iter()
        .map(|(secs, keys)| Bucket {
            interval: Duration::from_secs(secs),
            keys,
        })
        .collect()
}

/// Seed the PQ with one task per bucket plus enabled summary tasks
/// (spec §4.4 steps 4-6).
pub fn seed_queue(
    buckets: Vec<Bucket>,
    protocol_summary_enabled: bool,
    client_summary_enabled: bool,
) -> TaskQueue {
    let mut pq = TaskQueue::new();
    let now = Utc::now();
    for bucket in buckets {
        pq.push(ScheduledTask {
            due: now,
            kind: TaskKind::RegularBucket(bucket),
        });
    }
    if protocol_summary_enabled {
        pq.push(ScheduledTask {
            due: now,
            kind: TaskKind::ProtocolSummary,
        });
    }
    if client_summary_enabled {
        pq.push(ScheduledTask {
            due: now,
            kind: TaskKind::ClientSummary,
        });
    }
    pq
}

/// Run a cluster worker's collection loop until shutdown or a fatal error
/// (spec §4.4 "Loop body", §5).
pub async fn run_cluster_worker(
    client: &ClusterClient,
    state: &mut ClusterState,
    mut pq: TaskQueue,
    config: &GlobalConfig,
    sink: &dyn Sink,
    shutdown: CancellationToken,
) -> Result<()> {
    if pq.is_empty() {
        error!(cluster = %state.name, "no tasks scheduled after bucketing, nothing to do");
        return Ok(());
    }

    loop {
        if shutdown.is_cancelled() {
            info!(cluster = %state.name, "shutdown signal received, worker returning");
            return Ok(());
        }

        let mut task = match pq.pop() {
            Some(t) => t,
            None => return Ok(()),
        };

        let now = Utc::now();
        if task.due > now {
            let wait = (task.due - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.cancelled() => {
                    info!(cluster = %state.name, "shutdown signal received while sleeping, worker returning");
                    return Ok(());
                }
            }
        }

        let outcome = match &task.kind {
            TaskKind::RegularBucket(bucket) => {
                collect_regular_bucket(client, state, bucket, config).await
            }
            TaskKind::ProtocolSummary => collect_protocol_summary(client, state).await,
            TaskKind::ClientSummary => collect_client_summary(client, state).await,
        };

        let points = match outcome {
            Ok(points) => points,
            Err(e) if is_fatal_collection_error(&e) => {
                error!(cluster = %state.name, error = %e, "fatal collection error, worker terminating");
                return Err(e);
            }
            Err(e) => {
                warn!(cluster = %state.name, error = %e, "collection tick failed, skipping this tick");
                task.reschedule();
                pq.push(task);
                continue;
            }
        };

        if !points.is_empty() {
            let policy = RetryPolicy::sink_default(config.stats_processor_max_retries);
            if let Err(e) = write_with_retry(sink, &points, policy).await {
                error!(cluster = %state.name, error = %e, "sink write failed after retries, worker terminating");
                return Err(e);
            }
        }

        task.reschedule();
        pq.push(task);
    }
}

async fn collect_regular_bucket(
    client: &ClusterClient,
    state: &mut ClusterState,
    bucket: &Bucket,
    config: &GlobalConfig,
) -> Result<Vec<Point>> {
    let keys: Vec<StatKey> = bucket
        .keys
        .iter()
        .filter(|k| !state.bad_stats.contains(*k))
        .cloned()
        .collect();
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let results = retry_data_fetch(|| client.fetch_current_stats(&keys)).await?;

    let mut points = Vec::new();
    for result in &results {
        match result.error_code.class() {
            ErrorClass::Success | ErrorClass::Degraded => {
                match decode_result(&state.name, result, config.include_degraded) {
                    Ok(p) => {
                        if !p.is_empty() {
                            points.push(p);
                        }
                    }
                    Err(e) if e.is_invariant() => {
                        error!(key = %result.key, error = %e, "decoder invariant violated, terminating worker");
                        return Err(CollectorError::Decode(e));
                    }
                    Err(e) => warn!(key = %result.key, error = %e, "decode failed, skipping result"),
                }
            }
            ErrorClass::Transient => {
                debug!(key = %result.key, "transient error, skipping this tick");
            }
            ErrorClass::Permanent => {
                if state.bad_stats.insert(result.key.clone()) {
                    warn!(key = %result.key, "key permanently unavailable, added to bad-stats set");
                }
            }
            ErrorClass::Unknown => {
                warn!(key = %result.key, code = ?result.error_code, "unknown error code, skipping");
            }
        }
    }
    Ok(points)
}

async fn collect_protocol_summary(
    client: &ClusterClient,
    state: &ClusterState,
) -> Result<Vec<Point>> {
    let items = retry_data_fetch(|| client.fetch_summary_protocol()).await?;
    let mut points = Vec::new();
    for item in &items {
        match decode_protocol_summary_item(&state.name, node_hint(item), item) {
            Ok(p) => points.push(p),
            Err(e) if e.is_invariant() => {
                error!(error = %e, "decoder invariant violated, terminating worker");
                return Err(CollectorError::Decode(e));
            }
            Err(e) => warn!(error = %e, "protocol summary item decode failed, skipping"),
        }
    }
    Ok(points)
}

async fn collect_client_summary(
    client: &ClusterClient,
    state: &ClusterState,
) -> Result<Vec<Point>> {
    let items = retry_data_fetch(|| client.fetch_summary_client()).await?;
    let mut points = Vec::new();
    for item in &items {
        match decode_client_summary_item(&state.name, node_hint(item), item) {
            Ok(p) => points.push(p),
            Err(e) if e.is_invariant() => {
                error!(error = %e, "decoder invariant violated, terminating worker");
                return Err(CollectorError::Decode(e));
            }
            Err(e) => warn!(error = %e, "client summary item decode failed, skipping"),
        }
    }
    Ok(points)
}

/// True for the narrow set of per-tick collection errors that should
/// terminate the worker (spec §7): a decoder invariant violation. A
/// non-200/`{errors:[...]}`/parse failure from the data fetch itself only
/// skips this tick and is handled by the caller, not here.
fn is_fatal_collection_error(e: &CollectorError) -> bool {
    matches!(e, CollectorError::Decode(d) if d.is_invariant())
}

fn node_hint(item: &crate::value::Value) -> Option<NodeNumber> {
    item.as_map()?
        .get("node")
        .and_then(|v| v.as_number())
        .map(|n| NodeNumber(n as u32))
}

/// Per-tick retry for data fetches (spec §4.4: 10s initial, doubling, clamp
/// 1280s, unbounded, independent of the run-level max-retries). Only
/// connection-level failures are retried; everything else is surfaced.
async fn retry_data_fetch<F, Fut, T>(mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let policy = RetryPolicy::data_fetch_default();
    let mut delay = policy.initial;
    loop {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => {
                debug!(delay = ?delay, "retrying data fetch after connection error");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connect, fetch per-key metadata and cluster identity, then compute
/// buckets and seed the queue for one cluster (spec §4.4 preamble).
pub async fn prepare_cluster(
    client: &ClusterClient,
    cluster_config: &ClusterConfig,
    config: &GlobalConfig,
) -> Result<(ClusterState, TaskQueue)> {
    client.connect().await?;
    let (name, os_version) = client.fetch_cluster_config().await?;
    let name = if cluster_config.effective_preserve_case(config.preserve_case) {
        name
    } else {
        name.to_lowercase()
    };

    let mut details = HashMap::new();
    for group in &config.stat_groups {
        for key in &group.keys {
            if details.contains_key(key) {
                continue;
            }
            let detail = client.fetch_key_metadata(key).await?;
            details.insert(key.clone(), detail);
        }
    }

    let buckets = compute_buckets(&config.stat_groups, &details, config.min_update_interval());
    let pq = seed_queue(buckets, config.summary.protocol, config.summary.client);

    Ok((
        ClusterState {
            name,
            os_version,
            bad_stats: HashSet::new(),
        },
        pq,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatGroupConfig;

    fn detail(native_secs: f64) -> StatDetail {
        StatDetail {
            valid: true,
            description: String::new(),
            units: String::new(),
            scope: String::new(),
            datatype: String::new(),
            aggregation_type: String::new(),
            native_update_interval: Duration::from_secs_f64(native_secs),
        }
    }

    #[test]
    fn absolute_interval_groups_by_duration() {
        let groups = vec![StatGroupConfig {
            name: "g".into(),
            interval: IntervalSpec::Absolute(Duration::from_secs(30)),
            keys: vec!["k1".into(), "k2".into()],
        }];
        let mut details = HashMap::new();
        details.insert("k1".to_string(), detail(0.0));
        details.insert("k2".to_string(), detail(0.0));
        let buckets = compute_buckets(&groups, &details, Duration::from_secs(10));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].interval, Duration::from_secs(30));
        assert_eq!(buckets[0].keys.len(), 2);
    }

    #[test]
    fn multiplier_uses_native_interval_and_floor() {
        let groups = vec![StatGroupConfig {
            name: "g".into(),
            interval: IntervalSpec::Multiplier(2.0),
            keys: vec!["fast".into(), "ondemand".into()],
        }];
        let mut details = HashMap::new();
        details.insert("fast".to_string(), detail(20.0));
        details.insert("ondemand".to_string(), detail(0.0));
        let buckets = compute_buckets(&groups, &details, Duration::from_secs(10));
        let durations: HashSet<u64> = buckets.iter().map(|b| b.interval.as_secs()).collect();
        assert!(durations.contains(&40));
        assert!(durations.contains(&10));
    }

    #[test]
    fn multiplier_respects_floor_over_native() {
        let groups = vec![StatGroupConfig {
            name: "g".into(),
            interval: IntervalSpec::Multiplier(1.0),
            keys: vec!["slow".into()],
        }];
        let mut details = HashMap::new();
        details.insert("slow".to_string(), detail(2.0));
        let buckets = compute_buckets(&groups, &details, Duration::from_secs(10));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].interval, Duration::from_secs(10));
    }

    #[test]
    fn invalid_keys_are_dropped() {
        let groups = vec![StatGroupConfig {
            name: "g".into(),
            interval: IntervalSpec::Absolute(Duration::from_secs(30)),
            keys: vec!["missing".into()],
        }];
        let details = HashMap::new();
        let buckets = compute_buckets(&groups, &details, Duration::from_secs(10));
        assert!(buckets.is_empty());
    }

    #[test]
    fn seed_queue_adds_summary_tasks_when_enabled() {
        let pq = seed_queue(Vec::new(), true, true);
        assert_eq!(pq.len(), 2);
    }

    #[test]
    fn seed_queue_empty_without_buckets_or_summaries() {
        let pq = seed_queue(Vec::new(), false, false);
        assert!(pq.is_empty());
    }
}
