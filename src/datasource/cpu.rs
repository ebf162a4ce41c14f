use crate::datasource::Reader;
use crate::datasource::load_average::read_load_average;
use crate::metrics::cpu::{
    CoreUsageStats, CpuInfo, CpuTimes, CpuUsageStats, DataSource, TOTAL_CPU,
};
use crate::metrics::load::LoadAverages;
use anyhow::Context;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

const PATH_PROC_STAT: &str = "/proc/stat";
const PATH_CPU_INFO: &str = "/proc/cpuinfo";
const MIN_TIME_BETWEEN_MEASUREMENTS: Duration = Duration::from_millis(250);

const CPU_IDLE: usize = 3;
const CPU_IOWAIT: usize = 4;

// user, nice, system, idle, iowait, irq, softirq, steal. Guest and guest_nice
// are already accounted in user and nice, so they are not read at all.
const CPU_COLUMNS: usize = 8;

type Counters = [u64; CPU_COLUMNS];

/// One `/proc/stat` row: the kernel's id (`cpu`, `cpu0`, ...) and its counters.
type CpuRow = (String, Counters);

pub struct ProcCpu<R> {
    reader: R,
    measurement: Mutex<Option<(Instant, Vec<CpuRow>)>>,
}

impl<R> ProcCpu<R>
where
    R: Reader,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            measurement: Mutex::new(None),
        }
    }

    async fn read_proc_stat(&self) -> anyhow::Result<String> {
        self.reader
            .read_to_string(PATH_PROC_STAT)
            .await
            .with_context(|| format!("Failed to read {}", PATH_PROC_STAT))
    }
}

impl<R> DataSource for ProcCpu<R>
where
    R: Reader,
{
    #[allow(clippy::manual_async_fn)]
    fn cpu_usage(&self) -> impl Future<Output = anyhow::Result<CpuUsageStats>> + Send {
        async move {
            let Ok(mut previous) = self.measurement.lock().map(|x| x.clone()) else {
                return Err(anyhow::anyhow!(
                    "Failed to retrieve the previous CPU usage snapshot due to a poisoned lock"
                ));
            };

            let (timestamp, previous) = match previous.take() {
                Some(previous) => previous,
                None => {
                    let measurement = parse_counters(&self.read_proc_stat().await?);
                    (Instant::now(), measurement)
                }
            };

            let time_since_measurement = timestamp.elapsed();
            if time_since_measurement < MIN_TIME_BETWEEN_MEASUREMENTS {
                let to_sleep = MIN_TIME_BETWEEN_MEASUREMENTS.saturating_sub(time_since_measurement);
                tokio::time::sleep(to_sleep).await;
            }

            let current = parse_counters(&self.read_proc_stat().await?);
            let now = Instant::now();
            if current.is_empty() {
                return Err(anyhow::anyhow!("No CPU rows found in {}", PATH_PROC_STAT));
            }

            if !same_cpus(&previous, &current) {
                // Keep the new snapshot so the next call can succeed again
                if let Ok(mut guard) = self.measurement.lock() {
                    *guard = Some((now, current.clone()));
                }

                return Err(anyhow::anyhow!(
                    "The set of online CPUs changed: previous={}; current={}",
                    previous.len(),
                    current.len()
                ));
            }

            let total_usage = busy_ratio(&current[0].1, &previous[0].1);
            let cores = previous
                .iter()
                .zip(current.iter())
                .skip(1) // the first element is the "total" CPU usage across all cores
                .map(|((_, prev), (cpu, curr))| CoreUsageStats {
                    cpu: cpu.clone(),
                    usage: busy_ratio(curr, prev),
                })
                .collect::<Vec<_>>();

            match self.measurement.lock() {
                Ok(mut guard) => {
                    *guard = Some((now, current));
                }
                Err(_) => {
                    return Err(anyhow::anyhow!(
                        "Failed to update CPU usage measurement snapshot due to a poisoned lock"
                    ));
                }
            }

            Ok(CpuUsageStats { total_usage, cores })
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn cpu_times(&self) -> anyhow::Result<Vec<(String, CpuTimes)>> {
        let content = self.read_proc_stat().await?;
        Ok(parse_cpu_times(&content))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn cpu_info(&self) -> anyhow::Result<CpuInfo> {
        let content = self
            .reader
            .read_to_string(PATH_CPU_INFO)
            .await
            .with_context(|| format!("Failed to read {}", PATH_CPU_INFO))?;

        Ok(parse_cpu_info(&content))
    }

    async fn load_average(&self) -> anyhow::Result<LoadAverages> {
        read_load_average(&self.reader).await
    }
}

fn cpu_rows(content: &str) -> impl Iterator<Item = (&str, Vec<&str>)> {
    content
        .lines()
        .filter(|l| l.starts_with("cpu"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            Some((id, parts.take(CPU_COLUMNS).collect()))
        })
}

fn parse_counters(content: &str) -> Vec<CpuRow> {
    cpu_rows(content)
        .map(|(id, columns)| {
            let mut vals = [0u64; CPU_COLUMNS];
            for (idx, part) in columns.iter().enumerate() {
                vals[idx] = part.parse::<u64>().unwrap_or(0);
            }

            (id.to_owned(), vals)
        })
        .collect()
}

// Offline CPUs have no row, so rows are matched by id rather than position.
fn same_cpus(previous: &[CpuRow], current: &[CpuRow]) -> bool {
    previous.len() == current.len()
        && previous
            .iter()
            .zip(current)
            .all(|((prev, _), (curr, _))| prev == curr)
}

/// Raw counters per CPU row. The aggregate `cpu` row is relabeled as
/// [`TOTAL_CPU`]; missing or unparsable columns are reported as zero.
fn parse_cpu_times(content: &str) -> Vec<(String, CpuTimes)> {
    cpu_rows(content)
        .map(|(id, columns)| {
            let column = |idx: usize| {
                columns
                    .get(idx)
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };

            let times = CpuTimes {
                user: column(0),
                nice: column(1),
                system: column(2),
                idle: column(3),
                iowait: column(4),
                irq: column(5),
                softirq: column(6),
                steal: column(7),
            };

            let id = if id == "cpu" { TOTAL_CPU } else { id };
            (id.to_owned(), times)
        })
        .collect()
}

fn busy_ratio(curr: &Counters, prev: &Counters) -> f64 {
    let mut deltas = [0u64; CPU_COLUMNS];
    for i in 0..CPU_COLUMNS {
        deltas[i] = curr[i].saturating_sub(prev[i]);
    }

    let total_delta: u64 = deltas.iter().sum();
    if total_delta == 0 {
        return 0.0;
    }

    let t = total_delta as f64;
    let busy = 1.0 - deltas[CPU_IDLE] as f64 / t - deltas[CPU_IOWAIT] as f64 / t;
    busy.max(0.0)
}

/// Physical cores are taken from `cpu cores` when present (x86), otherwise
/// from the number of distinct `core id` values, otherwise the number of
/// logical processors.
fn parse_cpu_info(content: &str) -> CpuInfo {
    let mut model_name = String::new();
    let mut processors = Vec::new();
    let mut logical_cores = 0u64;
    let mut cpu_cores = None;
    let mut core_ids = HashSet::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let value = value.trim();
        match key.trim() {
            "model name" => model_name = value.to_owned(),
            "cpu cores" => cpu_cores = value.parse::<u64>().ok(),
            "core id" => {
                core_ids.insert(value.to_owned());
            }
            "processor" => {
                processors.push(value.to_owned());
                if let Ok(id) = value.parse::<u64>() {
                    logical_cores = logical_cores.max(id + 1);
                }
            }
            _ => {}
        }
    }

    let logical_cores = logical_cores.max(processors.len() as u64);
    let physical_cores = match cpu_cores {
        Some(cores) => cores,
        None if !core_ids.is_empty() => core_ids.len() as u64,
        None => logical_cores,
    };

    CpuInfo {
        model_name,
        processors,
        logical_cores,
        physical_cores,
    }
}
