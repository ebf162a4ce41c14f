use crate::metrics::factory::MetricFactory;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds the prometheus instruments of a data source and turns it into a
/// collector that can be handed to the [`crate::registry::CollectorRegistry`].
pub trait Metric {
    fn register(self, factory: &MetricFactory) -> anyhow::Result<Arc<dyn Collector>>;
}

/// A named unit that samples one category of system data per tick.
///
/// `init` runs exactly once before the first `sample`, and `close` runs exactly
/// once at shutdown no matter how many samples failed. All three are invoked
/// sequentially by the registry, never concurrently for the same collector.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Unique, stable identifier. Used as the `collector` metric label.
    fn name(&self) -> &str;

    async fn init(&self) -> anyhow::Result<()>;

    /// `cancel` fires once the agent is shutting down. Work already measured
    /// is still expected to be published.
    async fn sample(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}
