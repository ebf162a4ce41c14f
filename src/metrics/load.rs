use crate::metrics::factory::MetricFactory;
use prometheus::Gauge;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const WINDOW_1M: f64 = 60.0;
const WINDOW_5M: f64 = 300.0;
const WINDOW_15M: f64 = 900.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub enabled: bool,
    pub sample_cycle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_cycle_ms: Duration::from_secs(1).as_millis() as u64,
        }
    }
}

/// 1, 5 and 15 minute load averages as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverages {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

pub trait DataSource {
    /// Instantaneous load the moving averages are fed with.
    fn current_load(&self) -> impl Future<Output = anyhow::Result<f64>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum LoadCalculatorError {
    #[error("sample cycle must be positive (got {0:?})")]
    InvalidSampleCycle(Duration),

    #[error("load calculation only supports Linux (current OS: {0})")]
    UnsupportedPlatform(&'static str),
}

/// Consistent view of the three moving averages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Loads {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub initialized: bool,
}

#[derive(Debug, Default)]
struct State {
    load1: f64,
    load5: f64,
    load15: f64,
    initialized: bool,
}

/// Exponential moving average of the system load over 1, 5 and 15 minute
/// windows, computed independently of the kernel's own averages.
#[derive(Debug)]
pub struct LoadCalculator {
    sample_cycle: Duration,
    alpha1: f64,
    alpha5: f64,
    alpha15: f64,
    state: RwLock<State>,
}

impl LoadCalculator {
    pub fn new(sample_cycle: Duration) -> Result<Self, LoadCalculatorError> {
        if sample_cycle.is_zero() {
            return Err(LoadCalculatorError::InvalidSampleCycle(sample_cycle));
        }

        let dt = sample_cycle.as_secs_f64();
        Ok(Self {
            sample_cycle,
            alpha1: 1.0 - (-dt / WINDOW_1M).exp(),
            alpha5: 1.0 - (-dt / WINDOW_5M).exp(),
            alpha15: 1.0 - (-dt / WINDOW_15M).exp(),
            state: RwLock::new(State::default()),
        })
    }

    pub fn loads(&self) -> Loads {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Loads {
            load1: state.load1,
            load5: state.load5,
            load15: state.load15,
            initialized: state.initialized,
        }
    }

    /// Feeds one instantaneous load value. The first value seeds all three
    /// averages directly.
    pub fn update(&self, current: f64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.initialized {
            state.load1 = current;
            state.load5 = current;
            state.load15 = current;
            state.initialized = true;
            return;
        }

        state.load1 = state.load1 * (1.0 - self.alpha1) + current * self.alpha1;
        state.load5 = state.load5 * (1.0 - self.alpha5) + current * self.alpha5;
        state.load15 = state.load15 * (1.0 - self.alpha15) + current * self.alpha15;
    }

    /// Spawns the sampling task. It runs on its own timer until `cancel` fires.
    pub fn start<T>(
        self: &Arc<Self>,
        data_source: T,
        gauges: LoadGauges,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, LoadCalculatorError>
    where
        T: DataSource + Send + Sync + 'static,
    {
        if !cfg!(target_os = "linux") {
            return Err(LoadCalculatorError::UnsupportedPlatform(
                std::env::consts::OS,
            ));
        }

        let calculator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            calculator.run(data_source, gauges, cancel).await
        }))
    }

    async fn run<T: DataSource>(
        &self,
        data_source: T,
        gauges: LoadGauges,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.sample_cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(sample_cycle = ?self.sample_cycle, "Load calculator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Load calculator stopped");
                    return;
                }

                _ = ticker.tick() => {
                    match data_source.current_load().await {
                        Ok(current) => {
                            self.update(current);
                            gauges.publish(self.loads());
                        }

                        Err(error) => {
                            tracing::warn!(?error, "Load calculator sample failed");
                        }
                    }
                }
            }
        }
    }
}

/// Gauges for the estimated averages. Named apart from the kernel reported
/// `cpu_load*` gauges.
#[derive(Clone)]
pub struct LoadGauges {
    load1: Gauge,
    load5: Gauge,
    load15: Gauge,
}

impl LoadGauges {
    pub fn register(factory: &MetricFactory) -> anyhow::Result<Self> {
        Ok(Self {
            load1: factory.gauge(
                "cpu_load1_estimate",
                "Estimated 1 minute load average (exponential moving average)",
            )?,
            load5: factory.gauge(
                "cpu_load5_estimate",
                "Estimated 5 minute load average (exponential moving average)",
            )?,
            load15: factory.gauge(
                "cpu_load15_estimate",
                "Estimated 15 minute load average (exponential moving average)",
            )?,
        })
    }

    fn publish(&self, loads: Loads) {
        if !loads.initialized {
            return;
        }

        self.load1.set(loads.load1);
        self.load5.set(loads.load5);
        self.load15.set(loads.load15);
    }
}
