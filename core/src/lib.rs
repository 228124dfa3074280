/// wnode-status - envelope relay node with per-envelope metrics
///
/// A small peer-to-peer node that relays topic-tagged envelopes, traces every
/// envelope it observes into Prometheus counters, and serves them over HTTP.

pub mod accounts;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod p2p;
pub mod supervisor;

pub use config::{Config, NodeConfig};
pub use error::{NodeError, Result};
pub use metrics::{EnvelopeMetrics, MetricsServer, MetricsTracer};
pub use node::Node;
