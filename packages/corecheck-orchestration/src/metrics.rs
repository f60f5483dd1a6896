//! Prometheus metrics (`metrics` feature)
//!
//! Without the feature, [`PipelineMetrics`] is a no-op with the same methods
//! and renders nothing.

#[cfg(feature = "metrics")]
mod enabled {
    use prometheus::{
        register_int_counter_vec_with_registry, register_int_counter_with_registry, Encoder,
        IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
    };

    use crate::error::{OrchestratorError, Result};

    #[derive(Clone)]
    pub struct PipelineMetrics {
        pub executions: IntCounterVec,
        pub deliveries: IntCounter,
        pub acknowledgements: IntCounter,
        pub dead_letters: IntCounter,
        registry: Registry,
    }

    impl PipelineMetrics {
        /// Counters registered in a fresh registry of their own
        pub fn standalone() -> Result<Self> {
            Self::new(&Registry::new())
        }

        pub fn new(registry: &Registry) -> Result<Self> {
            Ok(Self {
                executions: register_int_counter_vec_with_registry!(
                    Opts::new(
                        "corecheck_executions_total",
                        "Executions reaching a terminal state"
                    ),
                    &["outcome"],
                    registry
                )
                .map_err(OrchestratorError::config)?,
                deliveries: register_int_counter_with_registry!(
                    Opts::new("corecheck_queue_deliveries_total", "Queue messages leased"),
                    registry
                )
                .map_err(OrchestratorError::config)?,
                acknowledgements: register_int_counter_with_registry!(
                    Opts::new("corecheck_queue_acks_total", "Queue messages acknowledged"),
                    registry
                )
                .map_err(OrchestratorError::config)?,
                dead_letters: register_int_counter_with_registry!(
                    Opts::new(
                        "corecheck_queue_dead_letters_total",
                        "Queue messages moved to the dead-letter set"
                    ),
                    registry
                )
                .map_err(OrchestratorError::config)?,
                registry: registry.clone(),
            })
        }

        /// Text exposition of every metric in the registry
        pub fn render(&self) -> Result<String> {
            let mut buffer = Vec::new();
            TextEncoder::new()
                .encode(&self.registry.gather(), &mut buffer)
                .map_err(OrchestratorError::config)?;
            String::from_utf8(buffer).map_err(OrchestratorError::config)
        }

        pub fn execution_finished(&self, outcome: &str) {
            self.executions.with_label_values(&[outcome]).inc();
        }

        pub fn delivered(&self, count: usize) {
            self.deliveries.inc_by(count as u64);
        }

        pub fn acknowledged(&self) {
            self.acknowledgements.inc();
        }

        pub fn dead_lettered(&self, count: usize) {
            self.dead_letters.inc_by(count as u64);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_counters_registered() {
            let registry = Registry::new();
            let metrics = PipelineMetrics::new(&registry).unwrap();

            metrics.execution_finished("succeeded");
            metrics.execution_finished("succeeded");
            metrics.delivered(3);

            assert_eq!(
                metrics.executions.with_label_values(&["succeeded"]).get(),
                2
            );
            assert_eq!(metrics.deliveries.get(), 3);
            assert!(PipelineMetrics::new(&registry).is_err());
        }

        #[test]
        fn test_render_exposes_counters() {
            let metrics = PipelineMetrics::standalone().unwrap();
            metrics.execution_finished("failed");
            metrics.acknowledged();

            let text = metrics.render().unwrap();
            assert!(text.contains("corecheck_executions_total{outcome=\"failed\"} 1"));
            assert!(text.contains("corecheck_queue_acks_total 1"));
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod disabled {
    use crate::error::Result;

    #[derive(Clone, Default)]
    pub struct PipelineMetrics;

    impl PipelineMetrics {
        pub fn standalone() -> Result<Self> {
            Ok(Self)
        }

        pub fn render(&self) -> Result<String> {
            Ok(String::new())
        }

        pub fn execution_finished(&self, _outcome: &str) {}
        pub fn delivered(&self, _count: usize) {}
        pub fn acknowledged(&self) {}
        pub fn dead_lettered(&self, _count: usize) {}
    }
}

#[cfg(feature = "metrics")]
pub use enabled::PipelineMetrics;

#[cfg(not(feature = "metrics"))]
pub use disabled::PipelineMetrics;
