use crate::metrics::{cpu, load};
use config::Config;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub enable_stdout: bool,
    pub enable_log_file: bool,
    pub log_file_directory: Option<String>,
    pub level: String,
    pub directives: Vec<String>,
    pub max_log_files: usize,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            enable_log_file: false,
            log_file_directory: Some("/tmp/var/log/metrics-agent/".to_owned()),
            level: "INFO".to_owned(),
            directives: vec![],
            max_log_files: 7,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http {
    pub address: String,
    pub port: u16,
    pub timeout: u64,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_owned(),
            port: 8080,
            timeout: Duration::from_secs(10).as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collectors {
    #[serde(default = "cpu::Config::default")]
    pub cpu: cpu::Config,

    #[serde(default = "load::Config::default")]
    pub load_calculator: load::Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    /// Sampling interval shared by all collectors.
    pub interval_secs: u64,

    /// Export the prometheus process metrics of the agent itself.
    pub process_metrics: bool,

    #[serde(default = "Collectors::default")]
    pub collectors: Collectors,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            process_metrics: true,
            collectors: Collectors::default(),
        }
    }
}

impl Monitor {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "Log::default")]
    pub log: Log,

    #[serde(default = "Http::default")]
    pub http: Http,

    #[serde(default = "Monitor::default")]
    pub monitor: Monitor,
}

impl Configuration {
    pub fn load(base_path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        let base_path = base_path.as_ref();

        let cfg = Config::builder()
            .add_source(
                config::File::from(base_path.join("config.toml"))
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::File::from(base_path.join("config.json"))
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("AGENT").separator("__"))
            .build()?;

        cfg.try_deserialize()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http.address.trim().is_empty() {
            return Err(anyhow::anyhow!("http.address cannot be empty"));
        }

        let interval = self.monitor.interval_secs;
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval) {
            return Err(anyhow::anyhow!(
                "monitor.interval_secs must be between {} and {} seconds, got {}",
                MIN_INTERVAL_SECS,
                MAX_INTERVAL_SECS,
                interval
            ));
        }

        let collectors = &self.monitor.collectors;
        if !collectors.cpu.enabled {
            return Err(anyhow::anyhow!(
                "At least one collector must be enabled (monitor.collectors.cpu)"
            ));
        }

        if collectors.load_calculator.enabled && collectors.load_calculator.sample_cycle_ms == 0 {
            return Err(anyhow::anyhow!(
                "monitor.collectors.load_calculator.sample_cycle_ms must be positive"
            ));
        }

        Ok(())
    }
}

pub fn get_config_base_path(args: impl Iterator<Item = String>) -> anyhow::Result<String> {
    let mut positional = args.skip(1).filter(|arg| !arg.starts_with("--"));
    let base_path = positional.next().unwrap_or_else(|| "./".to_owned());

    if let Some(extra) = positional.next() {
        return Err(anyhow::anyhow!("Unexpected argument: {}", extra));
    }

    Ok(base_path)
}

pub fn should_print_config_and_exit(mut args: impl Iterator<Item = String>) -> bool {
    args.any(|arg| arg == "--print-config")
}

pub fn print_config(configuration: &Configuration) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(configuration)?);
    Ok(())
}
