//! Integration tests for `ClusterClient` against a mocked PAPI.

use onefs_stats_collector::config::AuthType;
use onefs_stats_collector::error::CollectorError;
use onefs_stats_collector::testing::MockClusterServer;
use serde_json::json;

#[tokio::test]
async fn session_auth_connect_succeeds() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;

    let client = server.client();
    client.connect().await.unwrap();
}

#[tokio::test]
async fn fetch_cluster_config_returns_name_and_version() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;
    server.mock_cluster_config("clusterA", "9.5.0.0").await;

    let client = server.client();
    client.connect().await.unwrap();
    let (name, version) = client.fetch_cluster_config().await.unwrap();
    assert_eq!(name, "clusterA");
    assert_eq!(version, "9.5.0.0");
}

#[tokio::test]
async fn fetch_key_metadata_parses_native_interval() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;
    server
        .mock_key_metadata(
            "cluster.cpu.user.avg",
            json!({
                "description": "CPU user time",
                "units": "percent",
                "scope": "cluster",
                "type": "float64",
                "aggregation_type": "average",
                "policies": [{"persistent": false, "interval": 30.0}],
            }),
        )
        .await;

    let client = server.client();
    client.connect().await.unwrap();
    let detail = client
        .fetch_key_metadata(&"cluster.cpu.user.avg".to_string())
        .await
        .unwrap();
    assert!(detail.valid);
    assert_eq!(detail.native_update_interval.as_secs(), 30);
    assert_eq!(detail.units, "percent");
}

#[tokio::test]
async fn fetch_key_metadata_failure_marks_invalid_not_fatal() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;
    // No mock for this key: wiremock returns 404 and the client must not propagate an error.

    let client = server.client();
    client.connect().await.unwrap();
    let detail = client
        .fetch_key_metadata(&"missing.key".to_string())
        .await
        .unwrap();
    assert!(!detail.valid);
}

#[tokio::test]
async fn fetch_current_stats_decodes_results() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;
    server
        .mock_current_stats(json!({
            "stats": [
                {
                    "devid": 0,
                    "key": "cluster.cpu.user.avg",
                    "time": 1000,
                    "error_code": "None",
                    "error": null,
                    "value": 42.5,
                }
            ]
        }))
        .await;

    let client = server.client();
    client.connect().await.unwrap();
    let results = client
        .fetch_current_stats(&["cluster.cpu.user.avg".to_string()])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, "cluster.cpu.user.avg");
}

#[tokio::test]
async fn current_stats_top_level_error_is_surfaced() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;
    server
        .mock_current_stats(json!({ "errors": [{"code": "E_BAD", "message": "boom"}] }))
        .await;

    let client = server.client();
    client.connect().await.unwrap();
    let err = client
        .fetch_current_stats(&["some.key".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::ApiError { .. }));
}

#[tokio::test]
async fn basic_auth_401_is_fatal() {
    let server = MockClusterServer::start().await;
    // No session mock needed for basic auth; cluster config returns 401.
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/platform/1/cluster/config"))
        .respond_with(wiremock::ResponseTemplate::new(401))
        .mount(server.inner())
        .await;

    let client = server.client_with_authtype(AuthType::Basic);
    let err = client.fetch_cluster_config().await.unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn summary_protocol_and_client_fetch() {
    let server = MockClusterServer::start().await;
    server.mock_session_create(14400).await;
    server
        .mock_summary_protocol(vec![json!({
            "class": "read",
            "operation": "read",
            "protocol": "nfs3",
            "operation_count": 10.0,
            "operation_rate": 2.5,
        })])
        .await;
    server
        .mock_summary_client(vec![json!({
            "local_addr": "1.2.3.4",
            "protocol": "nfs3",
            "class": "read",
            "in_rate": 123.0,
        })])
        .await;

    let client = server.client();
    client.connect().await.unwrap();

    let protocol = client.fetch_summary_protocol().await.unwrap();
    assert_eq!(protocol.len(), 1);

    let client_summary = client.fetch_summary_client().await.unwrap();
    assert_eq!(client_summary.len(), 1);
}
