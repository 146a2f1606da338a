//! # Prometheus Metrics
//!
//! Counters and gauges for a scenario run, kept in a dedicated
//! [`prometheus::Registry`] and rendered in the text exposition format at the
//! end of the run.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

/// Metric handles for one run.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Deposit requests executed.
    pub deposits_executed_total: IntCounter,
    /// Withdraw requests executed.
    pub withdrawals_executed_total: IntCounter,
    /// Operations that completed normally.
    pub operations_completed_total: IntCounter,
    /// Operations closed by the emergency override.
    pub emergency_overrides_total: IntCounter,
    /// Steps that returned an error, expected or not.
    pub failed_steps_total: IntCounter,
    /// Loss recorded in the current epoch, canonical USD units.
    pub realized_loss: IntGauge,
    /// Vault total value after the last step, canonical USD units.
    pub total_value: IntGauge,
    /// Wall time spent applying each step.
    pub step_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tidepool".into()), None)?;

        let deposits_executed_total =
            IntCounter::new("deposits_executed_total", "Deposit requests executed")?;
        registry.register(Box::new(deposits_executed_total.clone()))?;

        let withdrawals_executed_total =
            IntCounter::new("withdrawals_executed_total", "Withdraw requests executed")?;
        registry.register(Box::new(withdrawals_executed_total.clone()))?;

        let operations_completed_total = IntCounter::new(
            "operations_completed_total",
            "Operations completed through the normal return and revalue path",
        )?;
        registry.register(Box::new(operations_completed_total.clone()))?;

        let emergency_overrides_total = IntCounter::new(
            "emergency_overrides_total",
            "Operations closed by the admin emergency override",
        )?;
        registry.register(Box::new(emergency_overrides_total.clone()))?;

        let failed_steps_total =
            IntCounter::new("failed_steps_total", "Scenario steps that returned an error")?;
        registry.register(Box::new(failed_steps_total.clone()))?;

        let realized_loss = IntGauge::new(
            "realized_loss",
            "Cumulative loss recorded in the current loss epoch (9-decimal USD)",
        )?;
        registry.register(Box::new(realized_loss.clone()))?;

        let total_value = IntGauge::new(
            "total_value",
            "Vault total value after the last step (9-decimal USD)",
        )?;
        registry.register(Box::new(total_value.clone()))?;

        let step_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("step_latency_seconds", "Time spent applying one scenario step")
                .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1]),
        )?;
        registry.register(Box::new(step_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            deposits_executed_total,
            withdrawals_executed_total,
            operations_completed_total,
            emergency_overrides_total,
            failed_steps_total,
            realized_loss,
            total_value,
            step_latency_seconds,
        })
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Clamps a `u128` amount into a gauge value.
pub fn gauge_value(amount: u128) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_namespace() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.deposits_executed_total.inc();
        metrics.realized_loss.set(gauge_value(42));
        let text = metrics.encode().unwrap();
        assert!(text.contains("tidepool_deposits_executed_total 1"));
        assert!(text.contains("tidepool_realized_loss 42"));
    }

    #[test]
    fn gauge_value_saturates() {
        assert_eq!(gauge_value(u128::MAX), i64::MAX);
        assert_eq!(gauge_value(7), 7);
    }
}
