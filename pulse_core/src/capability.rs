//! Capability negotiation with the sensor host.

use crate::host::{ExerciseCapabilities, SensorHost};
use crate::{ActivityType, Error, MetricType, Result};

/// Asks the host what it can track for the configured activity
#[derive(Clone, Debug)]
pub struct CapabilityNegotiator {
    activity: ActivityType,
    required: Vec<MetricType>,
}

impl CapabilityNegotiator {
    pub fn new(activity: ActivityType, required: Vec<MetricType>) -> Self {
        Self { activity, required }
    }

    /// Query the host and check every required metric is available.
    ///
    /// A missing required metric yields `CapabilityUnavailable`.
    pub async fn negotiate(&self, host: &dyn SensorHost) -> Result<ExerciseCapabilities> {
        let capabilities = host.capabilities(self.activity).await?;

        let mut missing: Vec<MetricType> = self
            .required
            .iter()
            .copied()
            .filter(|m| !capabilities.supports(*m))
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(Error::CapabilityUnavailable(format!(
                "{:?} does not support {:?}",
                self.activity, missing
            )));
        }

        tracing::debug!(
            "Host supports {} metrics and {} goal types for {:?}",
            capabilities.supported_metrics.len(),
            capabilities.supported_goals.len(),
            self.activity
        );
        Ok(capabilities)
    }

    /// Restrict a wish list of metrics to what the host supports
    pub fn tracked_metrics(
        capabilities: &ExerciseCapabilities,
        wanted: &[MetricType],
    ) -> Vec<MetricType> {
        wanted
            .iter()
            .copied()
            .filter(|m| capabilities.supports(*m))
            .collect()
    }
}
