/// Multi-node relay tests: envelopes flow between real nodes over TCP and
/// every observation reaches the tracer.
extern crate wnode_core;

use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use wnode_core::metrics::{EnvelopeMetrics, MetricsTracer};
use wnode_core::p2p::{Envelope, EnvelopeMeta, EnvelopeSource, EnvelopeTracer, Topic};
use wnode_core::{Node, NodeConfig};

#[derive(Default)]
struct RecordingTracer {
    seen: Mutex<Vec<EnvelopeMeta>>,
}

impl RecordingTracer {
    fn snapshot(&self) -> Vec<EnvelopeMeta> {
        self.seen.lock().unwrap().clone()
    }
}

impl EnvelopeTracer for RecordingTracer {
    fn trace(&self, meta: &EnvelopeMeta) {
        self.seen.lock().unwrap().push(meta.clone());
    }
}

fn test_config(peers: &[SocketAddr]) -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        known_peers: peers.iter().map(|p| p.to_string()).collect(),
        retry_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(200),
        handle_signals: false,
        ..Default::default()
    }
}

async fn start(node: &Node) -> SocketAddr {
    timeout(Duration::from_secs(5), node.start())
        .await
        .expect("start timed out")
        .expect("node task dropped")
        .expect("bind failed")
}

async fn wait_connected(node: &Node, want: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (_, connected, _) = node.status().await;
        if connected >= want {
            return;
        }
        assert!(Instant::now() < deadline, "node {} never reached {} peers", node.id, want);
        sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(50)).await;
    }
}

async fn stop(nodes: &[&Node]) {
    for node in nodes {
        node.request_shutdown();
    }
    for node in nodes {
        let _ = timeout(Duration::from_secs(3), node.wait()).await;
    }
}

#[tokio::test]
async fn test_relay_is_traced_on_both_nodes() {
    let registry_a = Registry::new();
    let registry_b = Registry::new();
    let tracer_a = MetricsTracer::new(EnvelopeMetrics::register(&registry_a).unwrap());
    let tracer_b = MetricsTracer::new(EnvelopeMetrics::register(&registry_b).unwrap());

    let node_a = Node::new(test_config(&[]), Some(Arc::new(tracer_a.clone())));
    let addr_a = start(&node_a).await;
    let node_b = Node::new(test_config(&[addr_a]), Some(Arc::new(tracer_b.clone())));
    start(&node_b).await;

    wait_connected(&node_a, 1).await;
    wait_connected(&node_b, 1).await;

    let topic = Topic::from_name("status");
    let envelope = Envelope::new(topic, 60, b"hello mesh".to_vec());
    assert!(node_a.send_envelope(envelope.clone()).await.unwrap());

    let local = EnvelopeMeta::new(&envelope, EnvelopeSource::Unknown, true, "");
    assert_eq!(tracer_a.metrics().count(&local), 1);
    assert_eq!(tracer_a.metrics().volume(&local), u64::from(envelope.size()));

    let received = EnvelopeMeta::new(&envelope, EnvelopeSource::P2p, true, &node_a.id);
    wait_for("envelope at node b", || tracer_b.metrics().count(&received) == 1).await;
    assert_eq!(tracer_b.metrics().volume(&received), u64::from(envelope.size()));
    assert_eq!(node_b.envelope_count().await, 1);

    // Re-sending locally is a duplicate and is not relayed again
    assert!(!node_a.send_envelope(envelope.clone()).await.unwrap());
    let local_dup = EnvelopeMeta::new(&envelope, EnvelopeSource::Unknown, false, "");
    assert_eq!(tracer_a.metrics().count(&local_dup), 1);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(tracer_b.metrics().count(&received), 1);

    stop(&[&node_a, &node_b]).await;
}

#[tokio::test]
async fn test_triangle_sees_each_envelope_once_new() {
    let tracer = Arc::new(RecordingTracer::default());

    let node_a = Node::new(test_config(&[]), Some(tracer.clone()));
    let addr_a = start(&node_a).await;
    let node_b = Node::new(test_config(&[addr_a]), Some(tracer.clone()));
    let addr_b = start(&node_b).await;
    let node_c = Node::new(test_config(&[addr_a, addr_b]), Some(tracer.clone()));
    start(&node_c).await;

    for node in [&node_a, &node_b, &node_c] {
        wait_connected(node, 2).await;
    }

    node_a.post(Topic([1, 2, 3, 4]), b"flood".to_vec()).await.unwrap();

    // Origin sends 2 copies. b and c each forward only their first copy, and
    // never back to its sender, so there are 4 receipts whatever the arrival
    // order. Only the first copy at b and at c is new.
    let p2p_receipts = || {
        tracer
            .snapshot()
            .into_iter()
            .filter(|m| m.source == EnvelopeSource::P2p)
            .collect::<Vec<_>>()
    };
    wait_for("p2p receipts", || {
        let p2p = p2p_receipts();
        p2p.len() >= 4 && p2p.iter().filter(|m| m.is_new).count() == 2
    })
    .await;
    sleep(Duration::from_millis(200)).await;

    let p2p = p2p_receipts();
    assert_eq!(p2p.len(), 4);
    assert_eq!(p2p.iter().filter(|m| m.is_new).count(), 2);
    assert!(p2p.iter().all(|m| !m.peer.is_empty()));

    let seen = tracer.snapshot();

    let local: Vec<_> = seen.iter().filter(|m| m.source == EnvelopeSource::Unknown).collect();
    assert_eq!(local.len(), 1);
    assert!(local[0].is_new);
    assert!(local[0].peer.is_empty());

    stop(&[&node_a, &node_b, &node_c]).await;
}

#[tokio::test]
async fn test_bootstrap_peer_is_redialed_after_restart() {
    let node_a = Node::new(test_config(&[]), None);
    let addr_a = start(&node_a).await;

    let config_b = NodeConfig {
        peer_stale_timeout: Duration::from_millis(100),
        max_connection_attempts: 2,
        redial_cooldown: Duration::from_millis(500),
        ..test_config(&[addr_a])
    };
    let node_b = Node::new(config_b, None);
    start(&node_b).await;
    wait_connected(&node_b, 1).await;

    stop(&[&node_a]).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while node_b.status().await.1 != 0 {
        assert!(Instant::now() < deadline, "b never noticed a went away");
        sleep(Duration::from_millis(50)).await;
    }
    // Let b use up its dial attempts and run a few heartbeats
    sleep(Duration::from_secs(1)).await;

    let restarted = NodeConfig {
        listen_addr: addr_a,
        ..test_config(&[])
    };
    let node_a2 = Node::new(restarted, None);
    start(&node_a2).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let links = node_a2.status().await.1;
        if links == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "b never redialed its configured bootstrap peer");
        sleep(Duration::from_millis(50)).await;
    }
    wait_connected(&node_b, 1).await;

    stop(&[&node_a2, &node_b]).await;
}

#[tokio::test]
async fn test_expired_envelopes_are_not_traced() {
    let tracer = Arc::new(RecordingTracer::default());
    let node = Node::new(test_config(&[]), Some(tracer.clone()));
    start(&node).await;

    let mut envelope = Envelope::new(Topic::default(), 10, Vec::new());
    envelope.expiry = 1;
    assert!(node.send_envelope(envelope).await.is_err());
    assert!(tracer.snapshot().is_empty());

    stop(&[&node]).await;
}

#[tokio::test]
async fn test_bind_failure_is_reported_at_start() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = NodeConfig {
        listen_addr: taken.local_addr().unwrap(),
        handle_signals: false,
        ..Default::default()
    };

    let node = Node::new(config, None);
    let started = timeout(Duration::from_secs(5), node.start()).await.unwrap().unwrap();
    assert!(started.is_err());
    timeout(Duration::from_secs(1), node.wait()).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_node() {
    let node = Node::new(test_config(&[]), None);
    start(&node).await;
    node.request_shutdown();
    timeout(Duration::from_secs(3), node.wait()).await.unwrap();
    assert!(node.is_shutting_down());
}
