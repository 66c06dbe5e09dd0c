//! Pipeline counters, registered in a per-engine prometheus registry.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::errors::{TwError, TwResult};

/// Counters shared by every stage. Cloning shares the underlying series.
#[derive(Clone)]
pub struct Counters {
    registry: Registry,

    // -------- MPS --------
    pub ticks: IntCounter,
    pub fills: IntCounter,
    pub rejected_inputs: IntCounter,
    pub snapshots: IntCounter,
    pub snapshot_dropped: IntCounter,

    // -------- RCP --------
    pub metrics_records: IntCounter,
    pub slow_computation: IntCounter,
    pub degenerate_state: IntCounter,
    pub backpressure: IntCounter,

    // -------- RE --------
    pub rule_misconfig: IntCounter,
    pub candidate_alerts: IntCounter,

    // -------- AIM --------
    pub alerts_raised: IntCounter,
    pub alerts_deduplicated: IntCounter,
    pub notifications_sent: IntCounter,
    pub notification_retries: IntCounter,
    pub notification_failed: IntCounter,
    pub isolations_active: IntGauge,
    pub aim_queue_depth: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> TwResult<IntCounter> {
    let c = IntCounter::new(name, help).map_err(prom_error)?;
    registry.register(Box::new(c.clone())).map_err(prom_error)?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> TwResult<IntGauge> {
    let g = IntGauge::new(name, help).map_err(prom_error)?;
    registry.register(Box::new(g.clone())).map_err(prom_error)?;
    Ok(g)
}

fn prom_error(e: prometheus::Error) -> TwError {
    TwError::Internal(format!("metrics registry: {}", e))
}

impl Counters {
    pub fn new() -> TwResult<Self> {
        let r = Registry::new_custom(Some("tripwire".to_string()), None).map_err(prom_error)?;
        Ok(Self {
            ticks: counter(&r, "ticks_total", "market data ticks applied")?,
            fills: counter(&r, "fills_total", "fills applied")?,
            rejected_inputs: counter(&r, "rejected_inputs_total", "ticks and fills rejected at ingress")?,
            snapshots: counter(&r, "snapshots_total", "snapshots published")?,
            snapshot_dropped: counter(&r, "snapshot_dropped_total", "snapshots dropped on queue overflow")?,
            metrics_records: counter(&r, "metrics_records_total", "risk metrics records produced")?,
            slow_computation: counter(&r, "slow_computation_total", "records over the latency budget")?,
            degenerate_state: counter(&r, "degenerate_state_total", "records flagged degenerate")?,
            backpressure: counter(&r, "backpressure_total", "blocked sends on the metrics queue")?,
            rule_misconfig: counter(&r, "rule_misconfig_total", "rule evaluations skipped on unresolved paths")?,
            candidate_alerts: counter(&r, "candidate_alerts_total", "alerts emitted by the rule engine")?,
            alerts_raised: counter(&r, "alerts_raised_total", "alerts created")?,
            alerts_deduplicated: counter(&r, "alerts_deduplicated_total", "duplicate alerts folded")?,
            notifications_sent: counter(&r, "notifications_sent_total", "successful sink deliveries")?,
            notification_retries: counter(&r, "notification_retries_total", "sink delivery retries")?,
            notification_failed: counter(&r, "notification_failed_total", "deliveries abandoned after retries")?,
            isolations_active: gauge(&r, "isolations_active", "active isolation actions")?,
            aim_queue_depth: gauge(&r, "aim_queue_depth", "evaluations waiting for the alert manager")?,
            registry: r,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered series.
    pub fn render(&self) -> TwResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(prom_error)?;
        String::from_utf8(buf).map_err(|e| TwError::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters")
            .field("snapshots", &self.snapshots.get())
            .field("snapshot_dropped", &self.snapshot_dropped.get())
            .field("metrics_records", &self.metrics_records.get())
            .field("alerts_raised", &self.alerts_raised.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let a = Counters::new().unwrap();
        let b = Counters::new().unwrap();
        a.snapshot_dropped.inc();
        assert_eq!(a.snapshot_dropped.get(), 1);
        assert_eq!(b.snapshot_dropped.get(), 0);
    }

    #[test]
    fn renders_text_exposition() {
        let c = Counters::new().unwrap();
        c.ticks.inc_by(3);
        let text = c.render().unwrap();
        assert!(text.contains("tripwire_ticks_total 3"));
        assert!(text.contains("tripwire_isolations_active"));
    }
}
