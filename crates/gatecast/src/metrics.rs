use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics shared by the gateway router and shard actors.
pub struct RoutingMetrics {
    /// Number of shards the gateway currently tracks.
    pub shards: IntGauge,
    /// Number of live pooled connections across local shard actors.
    pub connections: IntGauge,
    /// Requests routed by the gateway.
    pub routed: IntCounter,
    /// Background calls (introductions, relays, close notices) that failed
    /// and were dropped.
    pub relay_failures: IntCounter,
}

impl RoutingMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let shards = IntGauge::with_opts(Opts::new(
            "gatecast_shards",
            "Number of shards tracked by the gateway",
        ))?;
        let connections = IntGauge::with_opts(Opts::new(
            "gatecast_connections",
            "Number of live pooled connections",
        ))?;
        let routed = IntCounter::with_opts(Opts::new(
            "gatecast_routed_total",
            "Requests routed by the gateway",
        ))?;
        let relay_failures = IntCounter::with_opts(Opts::new(
            "gatecast_relay_failures_total",
            "Dropped background calls",
        ))?;

        registry.register(Box::new(shards.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(routed.clone()))?;
        registry.register(Box::new(relay_failures.clone()))?;

        Ok(Self {
            shards,
            connections,
            routed,
            relay_failures,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            shards: IntGauge::new("gatecast_shards", "shards").expect("valid metric name"),
            connections: IntGauge::new("gatecast_connections", "connections")
                .expect("valid metric name"),
            routed: IntCounter::new("gatecast_routed_total", "routed").expect("valid metric name"),
            relay_failures: IntCounter::new("gatecast_relay_failures_total", "relay failures")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_with_registry() {
        let registry = Registry::new();
        let metrics = RoutingMetrics::new(&registry).unwrap();
        metrics.routed.inc();
        metrics.shards.set(3);

        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "gatecast_shards"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "gatecast_routed_total"));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        let _first = RoutingMetrics::new(&registry).unwrap();
        assert!(RoutingMetrics::new(&registry).is_err());
    }

    #[test]
    fn unregistered_metrics_are_usable() {
        let metrics = RoutingMetrics::unregistered();
        metrics.connections.inc();
        metrics.relay_failures.inc();
        assert_eq!(metrics.connections.get(), 1);
    }
}
