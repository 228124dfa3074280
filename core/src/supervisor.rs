/// Process supervisor: metrics init, node start, account injection, stats server
use crate::accounts::{inject_test_accounts, load_test_accounts};
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::metrics::{EnvelopeMetrics, MetricsServer, MetricsTracer};
use crate::node::Node;
use crate::p2p::EnvelopeTracer;
use prometheus::Registry;
use std::sync::Arc;
use tracing::{error, info};

/// Metrics state built once, before the node exists
pub struct MetricsHandle {
    pub registry: Arc<Registry>,
    pub tracer: MetricsTracer,
}

/// Create the registry and register the envelope counters in it
pub fn init_metrics() -> Result<MetricsHandle> {
    let registry = Registry::new();
    let metrics = EnvelopeMetrics::register(&registry)?;
    Ok(MetricsHandle {
        registry: Arc::new(registry),
        tracer: MetricsTracer::new(metrics),
    })
}

/// Header printed before the node starts
pub fn header(config: &Config) -> String {
    format!(
        "Starting envelope relay node...\nConfig: listen={} peers={:?} data_dir={} stats={} stats_addr={} inject_accounts={}",
        config.node.listen_addr,
        config.node.known_peers,
        config.data_dir.display(),
        config.stats_enabled,
        config.stats_addr,
        config.inject_accounts,
    )
}

/// Run the whole process until the node stops
pub async fn run(config: Config) -> Result<()> {
    if config.inject_accounts {
        load_test_accounts(&config.data_dir)?;
    }

    let metrics = init_metrics()?;
    let tracer: Arc<dyn EnvelopeTracer> = Arc::new(metrics.tracer.clone());

    let node = Node::new(config.node_config(), Some(tracer));
    supervise(&config, &node, metrics.registry).await
}

/// Start `node`, inject accounts, serve stats, and return once the node has
/// stopped. Any startup failure stops the node before the error is returned.
pub async fn supervise(config: &Config, node: &Node, registry: Arc<Registry>) -> Result<()> {
    let listen_addr = node
        .start()
        .await
        .map_err(|_| NodeError::Connection("Node exited before signalling start".to_string()))??;
    info!("Node {} started on {}", node.id, listen_addr);

    if config.inject_accounts {
        if let Err(e) = inject_test_accounts(node.accounts(), &config.data_dir).await {
            error!("Failed to inject test accounts: {}", e);
            stop(node).await;
            return Err(e);
        }
    }

    if !config.stats_enabled {
        node.wait().await;
        return Ok(());
    }

    info!("Stats enabled on {}", config.stats_addr);
    let server = match MetricsServer::bind(config.stats_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind stats server on {}: {}", config.stats_addr, e);
            stop(node).await;
            return Err(e);
        }
    };

    let mut server_task = tokio::spawn(server.serve(registry));
    tokio::select! {
        _ = node.wait() => {
            server_task.abort();
            Ok(())
        }
        served = &mut server_task => {
            stop(node).await;
            match served {
                Ok(result) => result,
                Err(e) => Err(NodeError::Metrics(format!("Metrics server task failed: {}", e))),
            }
        }
    }
}

async fn stop(node: &Node) {
    node.request_shutdown();
    node.wait().await;
}
