use crate::config::{Collectors, Monitor};
use crate::datasource::TokioReader;
use crate::datasource::cpu::ProcCpu;
use crate::datasource::load_average::ProcLoadAverage;
use crate::domain::{Collector, Metric};
use crate::metrics;
use crate::metrics::factory::MetricFactory;
use crate::metrics::load::{LoadCalculator, LoadGauges};
use crate::registry::{CollectorRegistry, RegistryState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn init_collectors(
    config: &Collectors,
    factory: &MetricFactory,
) -> anyhow::Result<Vec<Arc<dyn Collector>>> {
    let mut collectors = vec![];

    if config.cpu.enabled {
        let data_source = ProcCpu::new(TokioReader::new());
        let cpu_usage = metrics::cpu::CpuUsage::new(config.cpu.clone(), data_source);
        collectors.push(cpu_usage.register(factory)?);
    } else {
        tracing::debug!("CPU collector disabled");
    }

    if collectors.is_empty() {
        return Err(anyhow::anyhow!(
            "No collectors enabled; check the monitor.collectors configuration"
        ));
    }

    Ok(collectors)
}

/// Builds the registry with every enabled collector. The registry is returned
/// in the `Created` state; starting it is up to the caller.
pub fn init_registry(
    config: &Monitor,
    factory: &MetricFactory,
) -> anyhow::Result<CollectorRegistry> {
    if config.process_metrics {
        register_process_metrics(factory)?;
    }

    let mut registry = CollectorRegistry::new(config.interval(), factory)?;
    for collector in init_collectors(&config.collectors, factory)? {
        registry.register(collector);
    }

    Ok(registry)
}

/// Spawns the load calculator when it is enabled.
pub fn start_load_calculator(
    config: &Collectors,
    factory: &MetricFactory,
    cancel: CancellationToken,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    if !config.load_calculator.enabled {
        return Ok(None);
    }

    let cycle = Duration::from_millis(config.load_calculator.sample_cycle_ms);
    let calculator = Arc::new(LoadCalculator::new(cycle)?);
    let gauges = LoadGauges::register(factory)?;
    let data_source = ProcLoadAverage::new(TokioReader::new());

    Ok(Some(calculator.start(data_source, gauges, cancel)?))
}

/// The running background work: the collector registry and the optional load
/// calculator task.
pub struct Agent {
    collectors: CollectorRegistry,
    load_calculator: Option<JoinHandle<()>>,
}

impl Agent {
    pub fn state(&self) -> RegistryState {
        self.collectors.state()
    }

    /// Closes the collectors and waits for the load calculator. The caller is
    /// expected to have cancelled the token the agent was started with.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let result = self.collectors.shutdown().await;

        if let Some(handle) = self.load_calculator.take() {
            if let Err(error) = handle.await {
                tracing::error!(?error, "The load calculator did not finish cleanly");
            }
        }

        result
    }
}

/// Starts `collectors` and then the load calculator. If the load calculator
/// cannot be started, the already running collectors are shut down before the
/// error is returned.
pub async fn start_agent(
    mut collectors: CollectorRegistry,
    config: &Collectors,
    factory: &MetricFactory,
    cancel: &CancellationToken,
) -> anyhow::Result<Agent> {
    collectors.start(cancel.child_token()).await?;

    match start_load_calculator(config, factory, cancel.child_token()) {
        Ok(load_calculator) => Ok(Agent {
            collectors,
            load_calculator,
        }),
        Err(error) => {
            if let Err(close_error) = collectors.shutdown().await {
                tracing::error!(error = ?close_error, "Failed to close the collectors");
            }

            Err(error.context("Failed to start the load calculator"))
        }
    }
}

#[cfg(target_os = "linux")]
fn register_process_metrics(factory: &MetricFactory) -> anyhow::Result<()> {
    let collector = prometheus::process_collector::ProcessCollector::for_self();
    factory.registry().register(Box::new(collector))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn register_process_metrics(_: &MetricFactory) -> anyhow::Result<()> {
    tracing::warn!("Process metrics are only available on Linux");
    Ok(())
}
