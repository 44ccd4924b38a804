//! Client tests against a mocked etcd gateway.

use parley_coord::kv::encode_bytes;
use parley_coord::{
    Client, CoordError, EventKind, Lease, RangeOptions, Registry, ServiceNode, WatchEnd,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INVALID_TOKEN: &str = r#"{"error":"etcdserver: invalid auth token","code":16}"#;

async fn mount_authenticate(server: &MockServer, token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/v3/auth/authenticate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"header": {}, "token": token})),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn client_for(server: &MockServer) -> Client {
    Client::connect(&server.uri()).unwrap()
}

#[tokio::test]
async fn get_without_matches_returns_empty_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "header": {"revision": "12"}
        })))
        .mount(&server)
        .await;

    let kvs = client_for(&server)
        .get("/missing", RangeOptions::new())
        .await
        .unwrap();
    assert!(kvs.is_empty());
}

#[tokio::test]
async fn get_prefix_decodes_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .and(body_partial_json(json!({
            "key": encode_bytes("/cfg/"),
            "range_end": encode_bytes("/cfg0"),
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "header": {"revision": "9"},
            "kvs": [
                {"key": encode_bytes("/cfg/a"), "value": encode_bytes("1"), "mod_revision": "3"},
                {"key": encode_bytes("/cfg/b"), "value": encode_bytes("二"), "mod_revision": "8"}
            ],
            "count": "2"
        })))
        .mount(&server)
        .await;

    let kvs = client_for(&server).get_prefix("/cfg/").await.unwrap();
    assert_eq!(kvs.len(), 2);
    assert_eq!(kvs[0].key, "/cfg/a");
    assert_eq!(kvs[1].value, "二");
    assert_eq!(kvs[1].mod_revision, 8);
}

#[tokio::test]
async fn get_returns_binary_values_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kvs": [{"key": encode_bytes("/blob"), "value": encode_bytes([0xff, 0x00, 0xfe])}]
        })))
        .mount(&server)
        .await;

    let kvs = client_for(&server)
        .get("/blob", RangeOptions::new())
        .await
        .unwrap();
    assert_eq!(kvs.len(), 1);
    assert_eq!(kvs[0].key, "/blob");
    assert_eq!(&kvs[0].value[..], &[0xff, 0x00, 0xfe]);
    assert!(matches!(kvs[0].value_str(), Err(CoordError::Decode(_))));
}

#[tokio::test]
async fn keep_alive_returns_lease() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/lease/keepalive"))
        .and(body_partial_json(json!({"ID": "7587"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {"header": {}, "ID": "7587", "TTL": "60"}
        })))
        .mount(&server)
        .await;

    let lease = client_for(&server).keep_alive(7587).await.unwrap();
    assert_eq!(lease, Lease { id: 7587, ttl: 60 });
}

#[tokio::test]
async fn keep_alive_without_ttl_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/lease/keepalive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {"header": {}, "ID": "7587"}
        })))
        .mount(&server)
        .await;

    let err = client_for(&server).keep_alive(7587).await.unwrap_err();
    assert!(matches!(err, CoordError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn keep_alive_without_result_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/lease/keepalive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"header": {}})))
        .mount(&server)
        .await;

    let err = client_for(&server).keep_alive(1).await.unwrap_err();
    assert!(matches!(err, CoordError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn token_is_sent_in_authorization_header() {
    let server = MockServer::start().await;
    mount_authenticate(&server, "tok-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/put"))
        .and(header("authorization", "tok-1"))
        .and(body_partial_json(json!({
            "key": encode_bytes("k"),
            "value": encode_bytes("v"),
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"header": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.auth("root", "pw").await.unwrap();
    assert_eq!(client.token().await.as_deref(), Some("tok-1"));
    client.put("k", "v", None).await.unwrap();
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_and_call_retried() {
    let server = MockServer::start().await;
    // Initial auth plus exactly one refresh.
    mount_authenticate(&server, "fresh", 2).await;

    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kvs": [{"key": encode_bytes("a"), "value": encode_bytes("b")}]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.auth("root", "pw").await.unwrap();

    let kvs = client.get("a", RangeOptions::new()).await.unwrap();
    assert_eq!(kvs.len(), 1);
    assert_eq!(kvs[0].value, "b");
    assert_eq!(client.reauth_count(), 1);
}

#[tokio::test]
async fn second_rejection_propagates_without_further_retries() {
    let server = MockServer::start().await;
    mount_authenticate(&server, "still-bad", 2).await;

    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.auth("root", "pw").await.unwrap();

    let err = client.get("a", RangeOptions::new()).await.unwrap_err();
    match err {
        CoordError::Status { status, message } => {
            assert_eq!(status, 401);
            assert!(message.contains("invalid auth token"));
        }
        other => panic!("Expected Status error, got {other:?}"),
    }
    assert_eq!(client.reauth_count(), 1);
}

#[tokio::test]
async fn rejection_without_credentials_reports_missing_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .get("a", RangeOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::NoCredentials), "got {err:?}");
}

#[tokio::test]
async fn other_failures_propagate_unmodified() {
    let server = MockServer::start().await;
    mount_authenticate(&server, "tok", 1).await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(503).set_body_string("etcdserver: leader changed"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.auth("root", "pw").await.unwrap();

    let err = client.get("a", RangeOptions::new()).await.unwrap_err();
    assert!(matches!(err, CoordError::Status { status: 503, .. }));
    assert_eq!(client.reauth_count(), 0);
}

#[tokio::test]
async fn watch_delivers_events_until_stream_ends() {
    let server = MockServer::start().await;
    let body = [
        json!({"result": {"header": {"revision": "5"}, "created": true}}).to_string(),
        json!({"result": {"header": {"revision": "6"}, "events": [
            {"kv": {"key": encode_bytes("/svc/a"), "value": encode_bytes("up"), "mod_revision": "6"}}
        ]}})
        .to_string(),
        json!({"result": {"header": {"revision": "7"}, "events": [
            {"type": "DELETE", "kv": {"key": encode_bytes("/svc/a"), "mod_revision": "7"}}
        ]}})
        .to_string(),
    ]
    .join("\n");

    Mock::given(method("POST"))
        .and(path("/v3/watch"))
        .and(body_partial_json(json!({"create_request": {
            "key": encode_bytes("/svc/"),
            "range_end": encode_bytes("/svc0"),
        }})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut watcher = client.watch_keys_with_prefix("/svc/", move |event| {
        sink.lock().unwrap().push(event);
    });

    assert_eq!(watcher.run().await.unwrap(), WatchEnd::Ended);
    assert_eq!(watcher.last_revision(), 7);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].kind, EventKind::Put);
    assert_eq!(seen[0].kv.value, "up");
    assert_eq!(seen[1].kind, EventKind::Delete);
    assert_eq!(seen[1].kv.key, "/svc/a");
}

#[tokio::test]
async fn watch_delivers_binary_values() {
    let server = MockServer::start().await;
    let line = json!({"result": {"header": {"revision": "3"}, "events": [
        {"kv": {"key": encode_bytes("/svc/bin"), "value": encode_bytes([0x80, 0x81])}}
    ]}});
    Mock::given(method("POST"))
        .and(path("/v3/watch"))
        .respond_with(ResponseTemplate::new(200).set_body_string(line.to_string()))
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut watcher = client.watch_keys_with_prefix("/svc/", move |event| {
        sink.lock().unwrap().push(event.kv.value);
    });

    assert_eq!(watcher.run().await.unwrap(), WatchEnd::Ended);
    assert_eq!(*seen.lock().unwrap(), vec![vec![0x80u8, 0x81]]);
}

#[tokio::test]
async fn watch_refreshes_rejected_token_before_streaming() {
    let server = MockServer::start().await;
    mount_authenticate(&server, "fresh", 2).await;

    Mock::given(method("POST"))
        .and(path("/v3/watch"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    let line = json!({"result": {"header": {"revision": "4"}, "events": [
        {"kv": {"key": encode_bytes("/svc/a"), "value": encode_bytes("up")}}
    ]}});
    Mock::given(method("POST"))
        .and(path("/v3/watch"))
        .and(header("authorization", "fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_string(line.to_string()))
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server));
    client.auth("root", "pw").await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut watcher = client.watch_keys_with_prefix("/svc/", move |event| {
        sink.lock().unwrap().push(event.kv.key_str().into_owned());
    });

    assert_eq!(watcher.run().await.unwrap(), WatchEnd::Ended);
    assert_eq!(client.reauth_count(), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["/svc/a".to_string()]);
}

#[tokio::test]
async fn auth_error_inside_watch_stream_is_a_status_error() {
    let server = MockServer::start().await;
    let body = [
        json!({"result": {"header": {"revision": "5"}, "created": true}}).to_string(),
        json!({"error": {"grpc_code": 16, "http_code": 401,
                         "message": "etcdserver: invalid auth token"}})
        .to_string(),
    ]
    .join("\n");
    Mock::given(method("POST"))
        .and(path("/v3/watch"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server));
    let mut watcher = client.watch_keys_with_prefix("/svc/", |_| {});

    let err = watcher.run().await.unwrap_err();
    assert!(
        matches!(&err, CoordError::Status { message, .. } if message.contains("invalid auth token")),
        "got {err:?}"
    );
    assert_eq!(client.reauth_count(), 0);
}

#[tokio::test]
async fn watch_can_be_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/watch"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{}\n")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server));
    let mut watcher = client.watch_keys_with_prefix("/svc/", |_| {});
    let cancel = watcher.cancel_token();

    let run = tokio::spawn(async move { watcher.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("watch did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, WatchEnd::Cancelled);
}

#[tokio::test]
async fn watches_on_different_prefixes_are_independent() {
    let server = MockServer::start().await;
    for (prefix, value) in [("/a/", "from-a"), ("/b/", "from-b")] {
        let line = json!({"result": {"header": {"revision": "2"}, "events": [
            {"kv": {"key": encode_bytes(format!("{prefix}k")), "value": encode_bytes(value)}}
        ]}});
        Mock::given(method("POST"))
            .and(path("/v3/watch"))
            .and(body_partial_json(
                json!({"create_request": {"key": encode_bytes(prefix)}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(line.to_string()))
            .mount(&server)
            .await;
    }

    let client = Arc::new(client_for(&server));
    let a_seen = Arc::new(Mutex::new(Vec::new()));
    let b_seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&a_seen);
    let mut a = client.watch_keys_with_prefix("/a/", move |e| {
        sink.lock().unwrap().push(e.kv.value_str().unwrap().to_string());
    });
    let sink = Arc::clone(&b_seen);
    let mut b = client.watch_keys_with_prefix("/b/", move |e| {
        sink.lock().unwrap().push(e.kv.value_str().unwrap().to_string());
    });

    let (ra, rb) = tokio::join!(a.run(), b.run());
    assert_eq!(ra.unwrap(), WatchEnd::Ended);
    assert_eq!(rb.unwrap(), WatchEnd::Ended);
    assert_eq!(*a_seen.lock().unwrap(), vec!["from-a".to_string()]);
    assert_eq!(*b_seen.lock().unwrap(), vec!["from-b".to_string()]);
}

#[tokio::test]
async fn registry_registers_and_lists_nodes() {
    let server = MockServer::start().await;
    let node = ServiceNode::new("n1", "parley", "127.0.0.1:8080").with_service("ws", "room");

    Mock::given(method("POST"))
        .and(path("/v3/lease/grant"))
        .and(body_partial_json(json!({"TTL": "15"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ID": "42", "TTL": "15"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/put"))
        .and(body_partial_json(json!({
            "key": encode_bytes("/parley/registry/parley/n1"),
            "lease": "42",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"header": {}})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kvs": [
                {"key": encode_bytes("/parley/registry/parley/n1"),
                 "value": encode_bytes(serde_json::to_string(&node).unwrap())},
                {"key": encode_bytes("/parley/registry/parley/junk"),
                 "value": encode_bytes("not json")}
            ]
        })))
        .mount(&server)
        .await;

    let registry = Registry::new(Arc::new(client_for(&server)));
    let lease = registry.register(&node, 15).await.unwrap();
    assert_eq!(lease, Lease { id: 42, ttl: 15 });

    let nodes = registry.nodes("parley").await.unwrap();
    assert_eq!(nodes, vec![node]);
}
