use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

/// Prometheus gauges published by the server
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Currently established plus establishing sessions
    pub concurrent_sessions: IntGauge,

    /// Inbound calls admitted within the last one second window
    pub calls_per_second: IntGauge,
}

impl Metrics {
    pub fn new(namespace: &str) -> Self {
        let registry = Registry::new();

        let concurrent_sessions = IntGauge::new(
            format!("{namespace}_concurrent_sessions"),
            "Number of concurrent SIP sessions",
        )
        .expect("valid gauge options");

        let calls_per_second = IntGauge::new(
            format!("{namespace}_calls_per_second"),
            "Inbound calls admitted in the last second",
        )
        .expect("valid gauge options");

        registry
            .register(Box::new(concurrent_sessions.clone()))
            .expect("gauge registers once");
        registry
            .register(Box::new(calls_per_second.clone()))
            .expect("gauge registers once");

        Self {
            registry,
            concurrent_sessions,
            calls_per_second,
        }
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("failed to encode metrics: {e}");
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gauges_show_up_in_exposition() {
        let metrics = Metrics::new("mrf");
        metrics.concurrent_sessions.set(3);
        metrics.calls_per_second.set(7);

        let text = metrics.gather();
        assert!(text.contains("mrf_concurrent_sessions 3"));
        assert!(text.contains("mrf_calls_per_second 7"));
    }
}
