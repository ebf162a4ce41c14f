use crate::domain::{Collector, Metric};
use crate::metrics::agent;
use crate::metrics::factory::MetricFactory;
use crate::metrics::load::LoadAverages;
use anyhow::Context;
use prometheus::{Gauge, GaugeVec, IntCounter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const COLLECTOR_NAME: &str = "cpu";

/// Label used for the aggregate row of `/proc/stat`.
pub const TOTAL_CPU: &str = "total";

pub const MODES: [&str; 8] = [
    "user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal",
];
const MODE_IDLE: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub enabled: bool,
    /// Report the usage ratio per logical core instead of the aggregate.
    pub per_core: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            per_core: true,
        }
    }
}

pub trait DataSource {
    /// Busy ratio (0..=1) across all cores and per core.
    fn cpu_usage(&self) -> impl Future<Output = anyhow::Result<CpuUsageStats>> + Send;

    /// Raw cumulative counters per CPU row. The aggregate row is labeled [`TOTAL_CPU`].
    fn cpu_times(&self) -> impl Future<Output = anyhow::Result<Vec<(String, CpuTimes)>>> + Send;

    fn cpu_info(&self) -> impl Future<Output = anyhow::Result<CpuInfo>> + Send;

    fn load_average(&self) -> impl Future<Output = anyhow::Result<LoadAverages>> + Send;
}

#[derive(Debug, Clone)]
pub struct CpuUsageStats {
    pub total_usage: f64,
    pub cores: Vec<CoreUsageStats>,
}

#[derive(Debug, Clone)]
pub struct CoreUsageStats {
    /// Row id as reported by the kernel, e.g. `cpu3`.
    pub cpu: String,
    pub usage: f64,
}

/// Cumulative time spent in each mode since boot, in clock ticks.
/// Columns the kernel does not report stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
}

impl CpuTimes {
    /// Values in the order of [`MODES`].
    pub fn as_array(&self) -> [f64; 8] {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfo {
    pub model_name: String,
    /// `processor` ids, one per logical CPU.
    pub processors: Vec<String>,
    pub logical_cores: u64,
    pub physical_cores: u64,
}

/// Percentages (0..=100) derived from two consecutive counter snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeUsage {
    pub modes: [f64; 8],
    pub total_usage: f64,
}

/// Keeps the last counter snapshot per CPU id and turns consecutive snapshots
/// into per-mode percentages.
#[derive(Debug, Default)]
pub struct ModeBreakdown {
    previous: HashMap<String, CpuTimes>,
}

impl ModeBreakdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `current` as the new baseline for `cpu` and returns the usage
    /// since the previous baseline. Returns `None` on the first observation of
    /// a CPU id and when the counters did not advance.
    pub fn observe(&mut self, cpu: &str, current: CpuTimes) -> Option<ModeUsage> {
        let previous = self.previous.insert(cpu.to_owned(), current)?;

        let current = current.as_array();
        let previous = previous.as_array();

        let mut deltas = [0.0; 8];
        for (idx, delta) in deltas.iter_mut().enumerate() {
            *delta = current[idx] - previous[idx];
        }

        let delta_total: f64 = deltas.iter().sum();
        if delta_total <= 0.0 {
            tracing::debug!(cpu, "CPU time did not advance, skipping usage calculation");
            return None;
        }

        let mut modes = [0.0; 8];
        for (idx, mode) in modes.iter_mut().enumerate() {
            *mode = deltas[idx] / delta_total * 100.0;
        }

        Some(ModeUsage {
            modes,
            total_usage: (delta_total - deltas[MODE_IDLE]) / delta_total * 100.0,
        })
    }
}

pub struct CpuUsage<T> {
    config: Config,
    data_source: T,
}

impl<T> CpuUsage<T>
where
    T: DataSource,
{
    pub fn new(config: Config, data_source: T) -> Self {
        Self {
            config,
            data_source,
        }
    }
}

impl<T> Metric for CpuUsage<T>
where
    T: DataSource + Send + Sync + 'static,
{
    fn register(self, factory: &MetricFactory) -> anyhow::Result<Arc<dyn Collector>> {
        let metrics = Metrics::register(factory)?;
        Ok(Arc::new(CpuCollector::new(
            self.config,
            metrics,
            self.data_source,
        )))
    }
}

#[derive(Clone)]
struct Metrics {
    usage_ratio: GaugeVec,   // Labels: ["cpu"]
    usage_percent: GaugeVec, // Labels: ["cpu"]
    mode_percent: GaugeVec,  // Labels: ["cpu", "mode"]
    info: GaugeVec,          // Labels: ["cpu", "model", "cores"]
    load1: Gauge,
    load5: Gauge,
    load15: Gauge,
    errors: IntCounter,
}

impl Metrics {
    fn register(factory: &MetricFactory) -> anyhow::Result<Self> {
        Ok(Self {
            usage_ratio: factory.gauge_vec("cpu_usage_ratio", "CPU usage ratio", &["cpu"])?,
            usage_percent: factory.gauge_vec(
                "cpu_usage_percent",
                "Total CPU usage percentage",
                &["cpu"],
            )?,
            mode_percent: factory.gauge_vec(
                "cpu_usage_mode_percent",
                "CPU usage percentage by mode (user, system, idle, iowait, etc.)",
                &["cpu", "mode"],
            )?,
            info: factory.gauge_vec(
                "cpu_info",
                "CPU information (model, cores)",
                &["cpu", "model", "cores"],
            )?,
            load1: factory.gauge("cpu_load1", "1 minute load average")?,
            load5: factory.gauge("cpu_load5", "5 minute load average")?,
            load15: factory.gauge("cpu_load15", "15 minute load average")?,
            errors: agent::collect_errors(factory)?.with_label_values(&[COLLECTOR_NAME]),
        })
    }
}

struct CpuCollector<T> {
    config: Config,
    metrics: Metrics,
    data_source: T,
    breakdown: Mutex<ModeBreakdown>,
    info_collected: AtomicBool,
}

impl<T> CpuCollector<T>
where
    T: DataSource + Send + Sync + 'static,
{
    fn new(config: Config, metrics: Metrics, data_source: T) -> Self {
        Self {
            config,
            metrics,
            data_source,
            breakdown: Mutex::new(ModeBreakdown::new()),
            info_collected: AtomicBool::new(false),
        }
    }

    fn update_usage_ratio(&self, stats: &CpuUsageStats) {
        if self.config.per_core {
            for core in &stats.cores {
                self.metrics
                    .usage_ratio
                    .with_label_values(&[core.cpu.as_str()])
                    .set(core.usage);
            }
        } else {
            self.metrics
                .usage_ratio
                .with_label_values(&[TOTAL_CPU])
                .set(stats.total_usage);
        }
    }

    async fn sample_load_average(&self) -> anyhow::Result<()> {
        let load = self.data_source.load_average().await?;
        self.metrics.load1.set(load.one);
        self.metrics.load5.set(load.five);
        self.metrics.load15.set(load.fifteen);

        tracing::debug!(
            load1 = load.one,
            load5 = load.five,
            load15 = load.fifteen,
            "Collected CPU load"
        );
        Ok(())
    }

    async fn sample_mode_breakdown(&self) -> anyhow::Result<()> {
        let rows = self.data_source.cpu_times().await?;

        let Ok(mut breakdown) = self.breakdown.lock() else {
            return Err(anyhow::anyhow!(
                "Failed to access the previous CPU times snapshot due to a poisoned lock"
            ));
        };

        for (cpu, times) in rows {
            let Some(usage) = breakdown.observe(&cpu, times) else {
                continue;
            };

            for (mode, percent) in MODES.into_iter().zip(usage.modes) {
                self.metrics
                    .mode_percent
                    .with_label_values(&[cpu.as_str(), mode])
                    .set(percent);
            }

            self.metrics
                .usage_percent
                .with_label_values(&[cpu.as_str()])
                .set(usage.total_usage);

            tracing::debug!(
                cpu = %cpu,
                user = usage.modes[0],
                system = usage.modes[2],
                idle = usage.modes[MODE_IDLE],
                total = usage.total_usage,
                "Collected CPU mode usage"
            );
        }

        Ok(())
    }

    async fn sample_static_info(&self) -> anyhow::Result<()> {
        if self.info_collected.load(Ordering::Acquire) {
            return Ok(());
        }

        let info = self.data_source.cpu_info().await?;
        let cores = info.physical_cores.to_string();
        for processor in &info.processors {
            self.metrics
                .info
                .with_label_values(&[processor.as_str(), info.model_name.as_str(), cores.as_str()])
                .set(1.0);
        }

        self.info_collected.store(true, Ordering::Release);
        tracing::info!(
            model = %info.model_name,
            physical_cores = info.physical_cores,
            logical_cores = info.logical_cores,
            "CPU static info collection completed"
        );

        Ok(())
    }
}

#[async_trait::async_trait]
impl<T> Collector for CpuCollector<T>
where
    T: DataSource + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        COLLECTOR_NAME
    }

    async fn init(&self) -> anyhow::Result<()> {
        let rows = self
            .data_source
            .cpu_times()
            .await
            .context("The CPU counters are not readable")?;

        if rows.is_empty() {
            return Err(anyhow::anyhow!("No CPU rows found in the CPU counters"));
        }

        tracing::debug!(cpus = rows.len(), "CPU collector initialized");
        Ok(())
    }

    // Not cancellable: a pass that is already running when shutdown starts is
    // published in full.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn sample(&self, _: &CancellationToken) -> anyhow::Result<()> {
        let stats = self
            .data_source
            .cpu_usage()
            .await
            .context("Failed to get the CPU usage")?;
        self.update_usage_ratio(&stats);

        if let Err(error) = self.sample_load_average().await {
            tracing::warn!(?error, "Failed to get the CPU load");
        }

        if let Err(error) = self.sample_mode_breakdown().await {
            tracing::error!(?error, "Failed to collect the CPU mode usage");
            self.metrics.errors.inc();
        }

        if let Err(error) = self.sample_static_info().await {
            tracing::error!(?error, "Failed to collect the CPU static info");
            self.metrics.errors.inc();
        }

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        tracing::debug!("CPU collector closed");
        Ok(())
    }
}
