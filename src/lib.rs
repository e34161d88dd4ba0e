//! Multi-cluster statistics collector core for Dell PowerScale OneFS (PAPI)
//!
//! This crate is the core of a collector: a cluster API client, a recursive
//! stat decoder, a per-cluster scheduler, and a sink write-retry contract.
//! It does not ship a metric store, an HTTP server, or a concrete TSDB
//! sink — those live downstream, against the [`sink::Sink`] trait.
//!
//! # Module Organization
//!
//! - **Wire and data model**: [`value`], [`model`]
//! - **Decoding**: [`decode`]
//! - **Scheduling**: [`pq`], [`scheduler`]
//! - **Transport**: [`client`]
//! - **Configuration**: [`config`]
//! - **Persistence boundary**: [`sink`]
//! - **Orchestration**: [`run`]
//! - **Errors**: [`error`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use onefs_stats_collector::config::GlobalConfig;
//! use onefs_stats_collector::run::run_all_clusters;
//! use onefs_stats_collector::sink::NullSink;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let raw = std::fs::read_to_string("collector.toml")?;
//! let config = Arc::new(GlobalConfig::from_toml_str(&raw)?);
//! let sink = Arc::new(NullSink);
//! run_all_clusters(config, sink, CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod model;
pub mod pq;
pub mod run;
pub mod scheduler;
pub mod sink;
pub mod value;

#[cfg(feature = "test-support")]
pub mod testing;

pub use error::{CollectorError, Result};
pub use value::{Value, ValueKind};
