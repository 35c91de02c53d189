// Two-node cluster end to end over real sockets: gossip convergence,
// HTTP forwarding to the primary, asynchronous replication, RESP MOVED
// redirects, and availability after a member leaves.

use hypercache::cluster::HashRing;
use hypercache::{HyperCacheConfig, Node};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn node_config(
    id: &str,
    resp_port: u16,
    http_port: u16,
    gossip_port: u16,
    seeds: Vec<String>,
) -> HyperCacheConfig {
    let mut config = HyperCacheConfig::default();
    config.fill_defaults();
    config.node.id = id.to_string();
    config.node.data_dir = std::env::temp_dir().join(format!(
        "hypercache-cluster-test-{id}-{}",
        uuid::Uuid::new_v4().simple()
    ));
    config.network.resp_bind = "127.0.0.1".into();
    config.network.http_bind = "127.0.0.1".into();
    config.network.gossip_bind = "127.0.0.1".into();
    config.network.gossip_advertise = "127.0.0.1".into();
    config.network.resp_port = resp_port;
    config.network.http_port = http_port;
    config.network.gossip_port = gossip_port;
    config.cluster.seeds = seeds;
    config.cluster.replication_factor = 3;
    config.cluster.heartbeat_interval_ms = 100;
    config.cluster.suspect_after_ms = 400;
    config.cluster.dead_after_ms = 400;
    config.persistence.enabled = false;
    config
}

async fn wait_for<F>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A key whose ring primary is the wanted member, by the same hash the
/// nodes use.
fn key_with_primary(members: &[&str], wanted: &str) -> String {
    let names: Vec<String> = members.iter().map(|s| s.to_string()).collect();
    let ring = HashRing::build(&names, 256, 1);
    for i in 0..100_000u32 {
        let key = format!("user:{i}");
        if ring.primary(key.as_bytes()) == Some(wanted) {
            return key;
        }
    }
    panic!("no key found with primary {wanted}");
}

async fn resp_roundtrip(addr: &str, command: &str) -> String {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(command.as_bytes()).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = socket.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_node_cluster_end_to_end() {
    let n1 = Node::new(node_config("n1", 26480, 28480, 27480, vec![])).unwrap();
    n1.start().await.unwrap();
    let n2 = Node::new(node_config(
        "n2",
        26481,
        28481,
        27481,
        vec!["127.0.0.1:27480".to_string()],
    ))
    .unwrap();
    n2.start().await.unwrap();

    let client = reqwest::Client::new();

    // Gossip convergence: both nodes see a 2-member ring.
    let status = |port: u16| {
        let client = client.clone();
        async move {
            client
                .get(format!("http://127.0.0.1:{port}/api/cluster/status"))
                .send()
                .await
                .unwrap()
                .json::<serde_json::Value>()
                .await
                .unwrap()
        }
    };
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let s1 = status(28480).await;
            let s2 = status(28481).await;
            if s1["alive"] == 2 && s2["alive"] == 2 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster never converged: {s1} / {s2}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // Cross-node forwarding: write a key owned by n2 through n1.
    let key = key_with_primary(&["n1", "n2"], "n2");
    let response = client
        .put(format!("http://127.0.0.1:28480/api/cache/default/{key}"))
        .header("x-correlation-id", "it-forward-1")
        .json(&serde_json::json!({"value": "data"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-correlation-id").unwrap(),
        "it-forward-1"
    );

    // Readable from both nodes.
    for port in [28480u16, 28481] {
        let response = client
            .get(format!("http://127.0.0.1:{port}/api/cache/default/{key}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "miss via port {port}");
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["value"], "data");
    }

    // Replication: with factor 3 both nodes own the key, so n1 converges
    // to a local copy without being asked.
    {
        let engine = n1.engine();
        let probe = key.clone();
        wait_for("replication to n1", Duration::from_secs(2), move || {
            engine.get("default", probe.as_bytes()).is_ok()
        })
        .await;
    }

    // RESP MOVED: a SET on n1 for a key whose primary is n2 names n2's
    // advertised endpoint; the same SET against n2 succeeds.
    let moved_key = key_with_primary(&["n1", "n2"], "n2");
    let reply = resp_roundtrip(
        "127.0.0.1:26480",
        &format!("SET {moved_key} s\r\n"),
    )
    .await;
    assert!(
        reply.starts_with("-MOVED 127.0.0.1:26481"),
        "expected MOVED, got: {reply}"
    );
    let reply = resp_roundtrip(
        "127.0.0.1:26481",
        &format!("SET {moved_key} s\r\n"),
    )
    .await;
    assert_eq!(reply, "+OK\r\n");

    // A 404 is a 404 everywhere.
    let response = client
        .get("http://127.0.0.1:28481/api/cache/default/definitely-absent")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Member departure: n2 leaves, n1 rebuilds the ring and keeps serving
    // the replicated key locally.
    let owned_key = key.to_string();
    n2.stop().await;
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let s1 = status(28480).await;
            if s1["alive"] == 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "n1 never noticed the departure: {s1}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    let response = client
        .get(format!(
            "http://127.0.0.1:28480/api/cache/default/{owned_key}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "key lost after member departure");

    n1.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_node_http_surface() {
    let node = Node::new(node_config("solo", 26490, 28490, 27490, vec![])).unwrap();
    node.start().await.unwrap();
    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:28490";

    // Health flips to ready after start.
    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // S1: PUT, GET, DELETE, GET.
    let response = client
        .put(format!("{base}/api/cache/default/k1"))
        .json(&serde_json::json!({"value": "v1", "ttl_hours": 1.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{base}/api/cache/default/k1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["value"], "v1");

    let response = client
        .delete(format!("{base}/api/cache/default/k1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{base}/api/cache/default/k1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Correlation id is generated when absent.
    let response = client
        .get(format!("{base}/api/cache/default/whatever"))
        .send()
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-correlation-id"));

    // Batch surface.
    let response = client
        .post(format!("{base}/api/cache/default/batch/set"))
        .json(&serde_json::json!({"items": [
            {"key": "b1", "value": "x"},
            {"key": "b2", "value": "y"},
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["stored"], 2);

    let response = client
        .post(format!("{base}/api/cache/default/batch/get"))
        .json(&serde_json::json!({"keys": ["b1", "b2", "nope"]}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["value"], "x");
    assert!(results[2]["value"].is_null());

    // Metrics and config are served.
    let response = client
        .get(format!("{base}/api/node/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = client.get(format!("{base}/api/config")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // RESP S1 equivalent on the same engine.
    let reply = resp_roundtrip("127.0.0.1:26490", "SET rk rv\r\n").await;
    assert_eq!(reply, "+OK\r\n");
    let reply = resp_roundtrip("127.0.0.1:26490", "GET rk\r\n").await;
    assert_eq!(reply, "$2\r\nrv\r\n");
    let reply = resp_roundtrip("127.0.0.1:26490", "PING\r\n").await;
    assert_eq!(reply, "+PONG\r\n");
    let reply = resp_roundtrip("127.0.0.1:26490", "DEL rk\r\n").await;
    assert_eq!(reply, ":1\r\n");
    let reply = resp_roundtrip("127.0.0.1:26490", "GET rk\r\n").await;
    assert_eq!(reply, "$-1\r\n");

    node.stop().await;
}
