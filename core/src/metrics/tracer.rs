/// Envelope tracer backed by the envelope counters
use crate::metrics::EnvelopeMetrics;
use crate::p2p::envelope::{EnvelopeMeta, EnvelopeTracer};

/// Traces every envelope the node observes into [`EnvelopeMetrics`]
#[derive(Clone)]
pub struct MetricsTracer {
    metrics: EnvelopeMetrics,
}

impl MetricsTracer {
    pub fn new(metrics: EnvelopeMetrics) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &EnvelopeMetrics {
        &self.metrics
    }
}

impl EnvelopeTracer for MetricsTracer {
    fn trace(&self, meta: &EnvelopeMeta) {
        self.metrics.record(meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::envelope::{EnvelopeSource, Topic};
    use prometheus::Registry;
    use std::sync::Arc;

    #[test]
    fn test_trace_counts_and_sums() {
        let tracer = MetricsTracer::new(EnvelopeMetrics::register(&Registry::new()).unwrap());
        let meta = EnvelopeMeta {
            topic: Topic([0xde, 0xad, 0xbe, 0xef]),
            source: EnvelopeSource::Unknown,
            is_new: false,
            peer: String::new(),
            size: 64,
        };

        let mut last = (0, 0);
        for _ in 0..3 {
            tracer.trace(&meta);
            let now = (tracer.metrics().count(&meta), tracer.metrics().volume(&meta));
            assert!(now.0 > last.0 && now.1 > last.1);
            last = now;
        }
        assert_eq!(last, (3, 192));
    }

    #[test]
    fn test_usable_as_trait_object() {
        let tracer = MetricsTracer::new(EnvelopeMetrics::register(&Registry::new()).unwrap());
        let shared: Arc<dyn EnvelopeTracer> = Arc::new(tracer.clone());
        let meta = EnvelopeMeta {
            topic: Topic::default(),
            source: EnvelopeSource::P2p,
            is_new: true,
            peer: "peer-1".to_string(),
            size: 1,
        };
        shared.trace(&meta);
        assert_eq!(tracer.metrics().count(&meta), 1);
    }
}
