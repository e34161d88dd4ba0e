//! Testing utilities for collector core consumers
//!
//! Provides a `wiremock`-backed fake PowerScale PAPI so both this crate's
//! own integration tests and downstream sink crates can exercise a
//! `ClusterClient` without a real cluster.
//!
//! # Feature Flag
//!
//! Only available behind the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! onefs-stats-collector = { version = "0.1", features = ["test-support"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use onefs_stats_collector::testing::MockClusterServer;
//!
//! #[tokio::test]
//! async fn test_fetch() {
//!     let server = MockClusterServer::start().await;
//!     server.mock_session_create(14400).await;
//!     server.mock_cluster_config("clusterA", "9.5.0.0").await;
//!
//!     let client = server.client();
//!     client.connect().await.unwrap();
//! }
//! ```

pub mod server;

pub use server::MockClusterServer;

pub use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};
