//! Mock server wrapper for testing `ClusterClient` against a fake PAPI
//!
//! # Example
//!
//! ```ignore
//! use onefs_stats_collector::testing::MockClusterServer;
//!
//! #[tokio::test]
//! async fn test_current_stats() {
//!     let server = MockClusterServer::start().await;
//!     server.mock_session_create(14400).await;
//!     server.mock_cluster_config("clusterA", "9.5.0.0").await;
//!     server.mock_current_stats(serde_json::json!({"stats": []})).await;
//!
//!     let client = server.client();
//!     client.connect().await.unwrap();
//! }
//! ```

use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::client::{ClusterClient, ClusterClientBuilder};
use crate::config::AuthType;

/// A wrapper around a `wiremock::MockServer` preconfigured to answer the
/// PAPI endpoints this crate's `ClusterClient` calls (spec §6.1).
pub struct MockClusterServer {
    server: MockServer,
}

impl MockClusterServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn inner(&self) -> &MockServer {
        &self.server
    }

    /// A `ClusterClient` pointed at this mock server, session-authenticated
    /// by default.
    pub fn client(&self) -> ClusterClient {
        ClusterClientBuilder::new()
            .base_url(self.uri())
            .username("admin")
            .password("password")
            .authtype(AuthType::Session)
            .verify_ssl(false)
            .build()
            .expect("failed to build test client")
    }

    pub fn client_with_authtype(&self, authtype: AuthType) -> ClusterClient {
        ClusterClientBuilder::new()
            .base_url(self.uri())
            .username("admin")
            .password("password")
            .authtype(authtype)
            .verify_ssl(false)
            .build()
            .expect("failed to build test client")
    }

    /// Mock `POST /session/1/session`, returning 201 with an `isicsrf`
    /// cookie and the given `timeout_absolute`.
    pub async fn mock_session_create(&self, timeout_absolute: i64) {
        Mock::given(method("POST"))
            .and(path("/session/1/session"))
            .respond_with(
                ResponseTemplate::new(201)
                    .append_header("Set-Cookie", "isicsrf=test-csrf-token; Path=/")
                    .set_body_json(json!({ "timeout_absolute": timeout_absolute })),
            )
            .mount(&self.server)
            .await;
    }

    /// Mock a `POST /session/1/session` that always fails authentication.
    pub async fn mock_session_create_failure(&self) {
        Mock::given(method("POST"))
            .and(path("/session/1/session"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_cluster_config(&self, name: &str, onefs_version: &str) {
        Mock::given(method("GET"))
            .and(path("/platform/1/cluster/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": name,
                "onefs_version": { "version": onefs_version },
            })))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_key_metadata(&self, key: &str, entry: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/platform/1/statistics/keys/{key}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [entry] })))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_current_stats(&self, response: Value) {
        Mock::given(method("GET"))
            .and(path("/platform/1/statistics/current"))
            .and(query_param("devid", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_summary_protocol(&self, items: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/platform/3/statistics/summary/protocol"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "protocol": items })),
            )
            .mount(&self.server)
            .await;
    }

    pub async fn mock_summary_client(&self, items: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/platform/3/statistics/summary/client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "client": items })))
            .mount(&self.server)
            .await;
    }
}
