//! Envelope metrics: the counter families, the tracer that feeds them and
//! the HTTP endpoint that exposes them.
//!
//! Everything hangs off an explicit [`prometheus::Registry`] built once at
//! startup and shared with the node (through the tracer) and the server.

pub mod server;
pub mod tracer;

pub use server::{render_metrics, MetricsServer};
pub use tracer::MetricsTracer;

use crate::error::{NodeError, Result};
use crate::p2p::envelope::EnvelopeMeta;
use prometheus::core::Collector;
use prometheus::{IntCounterVec, Opts, Registry};
use tracing::debug;

pub const ENVELOPE_COUNTER: &str = "envelope_counter";
pub const ENVELOPE_VOLUME: &str = "envelope_volume";

/// Label names shared by both families, in label-value order
pub const ENVELOPE_LABELS: [&str; 4] = ["topic", "source", "is_new", "peer"];

/// Per-envelope counters keyed by (topic, source, is_new, peer).
///
/// Series are never removed, so the number of series grows with the number
/// of distinct peers and topics seen over the life of the process.
#[derive(Clone)]
pub struct EnvelopeMetrics {
    envelope_counter: IntCounterVec,
    envelope_volume: IntCounterVec,
}

impl EnvelopeMetrics {
    /// Build both families and register them in `registry`.
    ///
    /// Registering a second time into the same registry fails with
    /// [`NodeError::DuplicateRegistration`] and leaves the registry as it was.
    pub fn register(registry: &Registry) -> Result<Self> {
        let envelope_counter = IntCounterVec::new(
            Opts::new(ENVELOPE_COUNTER, "Envelopes counter"),
            &ENVELOPE_LABELS,
        )?;
        let envelope_volume = IntCounterVec::new(
            Opts::new(ENVELOPE_VOLUME, "Volume of received envelopes in bytes"),
            &ENVELOPE_LABELS,
        )?;

        registry
            .register(Box::new(envelope_counter.clone()))
            .map_err(|e| registration_error(ENVELOPE_COUNTER, e))?;
        if let Err(e) = registry.register(Box::new(envelope_volume.clone())) {
            let _ = registry.unregister(Box::new(envelope_counter));
            return Err(registration_error(ENVELOPE_VOLUME, e));
        }

        Ok(Self {
            envelope_counter,
            envelope_volume,
        })
    }

    /// Count one envelope and add its size to the volume
    pub fn record(&self, meta: &EnvelopeMeta) {
        let topic = meta.topic.to_string();
        let is_new = meta.is_new.to_string();
        let labels = [topic.as_str(), meta.source.as_str(), is_new.as_str(), meta.peer.as_str()];

        match self.envelope_counter.get_metric_with_label_values(&labels) {
            Ok(counter) => counter.inc(),
            Err(e) => debug!("Skipping envelope count: {}", e),
        }
        match self.envelope_volume.get_metric_with_label_values(&labels) {
            Ok(volume) => volume.inc_by(u64::from(meta.size)),
            Err(e) => debug!("Skipping envelope volume: {}", e),
        }
    }

    /// Current `envelope_counter` value for the series `meta` falls into
    pub fn count(&self, meta: &EnvelopeMeta) -> u64 {
        series_value(&self.envelope_counter, meta)
    }

    /// Current `envelope_volume` value for the series `meta` falls into
    pub fn volume(&self, meta: &EnvelopeMeta) -> u64 {
        series_value(&self.envelope_volume, meta)
    }
}

fn registration_error(name: &str, err: prometheus::Error) -> NodeError {
    match err {
        prometheus::Error::AlreadyReg => NodeError::DuplicateRegistration(name.to_string()),
        other => NodeError::from(other),
    }
}

/// Read a series without creating it
fn series_value(family: &IntCounterVec, meta: &EnvelopeMeta) -> u64 {
    let topic = meta.topic.to_string();
    let is_new = meta.is_new.to_string();
    let wanted = [
        ("topic", topic.as_str()),
        ("source", meta.source.as_str()),
        ("is_new", is_new.as_str()),
        ("peer", meta.peer.as_str()),
    ];

    family
        .collect()
        .iter()
        .flat_map(|mf| mf.get_metric())
        .find(|m| {
            wanted.iter().all(|(name, value)| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == *name && l.get_value() == *value)
            })
        })
        .map(|m| m.get_counter().get_value() as u64)
        .unwrap_or(0)
}
