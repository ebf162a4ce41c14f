use crate::metrics::factory::MetricFactory;
use prometheus::{HistogramVec, IntCounterVec};

/// Failed sample steps, labeled by collector name. Shared by the registry
/// (failed `sample` calls) and the collectors (suppressed sub-step failures).
pub fn collect_errors(factory: &MetricFactory) -> anyhow::Result<IntCounterVec> {
    factory.counter_vec(
        "agent_collect_errors_total",
        "Total collection errors",
        &["collector"],
    )
}

pub fn collect_duration(factory: &MetricFactory) -> anyhow::Result<HistogramVec> {
    factory.histogram_vec(
        "agent_collect_duration_seconds",
        "Collection duration per collector",
        &["collector"],
    )
}
