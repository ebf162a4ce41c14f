//! Drives a fixed set of collectors on a shared ticker.
//!
//! Collectors are initialized once, in registration order, when the registry
//! is started. A single background task then samples all of them on every
//! tick, sequentially and in the same order, until either the caller's token
//! or the registry's own token is cancelled. Shutting down waits for that task
//! before closing the collectors, so `close` never overlaps a sampling pass.

use crate::domain::Collector;
use crate::metrics::agent;
use crate::metrics::factory::MetricFactory;
use prometheus::{HistogramVec, IntCounterVec};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Closed,
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistryState::Created => "created",
            RegistryState::Initialized => "initialized",
            RegistryState::Running => "running",
            RegistryState::ShuttingDown => "shutting down",
            RegistryState::Closed => "closed",
        };

        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("collector [{name}] failed to initialize: {source:#}")]
    Init {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("the collector registry cannot be started while {0}")]
    InvalidState(RegistryState),

    #[error("the sampling interval must be positive")]
    InvalidInterval,
}

#[derive(Clone)]
struct Metrics {
    errors: IntCounterVec,
    duration: HistogramVec,
}

pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn Collector>>,
    interval: Duration,
    state: RegistryState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    metrics: Metrics,
}

impl CollectorRegistry {
    pub fn new(interval: Duration, factory: &MetricFactory) -> anyhow::Result<Self> {
        if interval.is_zero() {
            return Err(RegistryError::InvalidInterval.into());
        }

        Ok(Self {
            collectors: vec![],
            interval,
            state: RegistryState::Created,
            cancel: CancellationToken::new(),
            task: None,
            metrics: Metrics {
                errors: agent::collect_errors(factory)?,
                duration: agent::collect_duration(factory)?,
            },
        })
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn names(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Adds a collector. Returns `false` and drops the collector when the name
    /// is already taken or the registry has already been started.
    pub fn register(&mut self, collector: Arc<dyn Collector>) -> bool {
        if self.state != RegistryState::Created {
            tracing::warn!(
                collector = collector.name(),
                state = %self.state,
                "Ignoring collector registered after start"
            );
            return false;
        }

        if self.collectors.iter().any(|c| c.name() == collector.name()) {
            tracing::warn!(
                collector = collector.name(),
                "Collector is already registered, ignoring duplicate"
            );
            return false;
        }

        tracing::debug!(collector = collector.name(), "Registered collector");
        self.collectors.push(collector);
        true
    }

    /// Initializes every collector and starts the sampling loop.
    ///
    /// Any `init` failure is returned as [`RegistryError::Init`] and nothing is
    /// sampled; callers are expected to treat it as fatal. Cancelling `cancel`
    /// stops the loop just like [`CollectorRegistry::shutdown`] does, but
    /// leaves the collectors open.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), RegistryError> {
        if self.state != RegistryState::Created {
            return Err(RegistryError::InvalidState(self.state));
        }

        for collector in &self.collectors {
            collector
                .init()
                .await
                .map_err(|source| RegistryError::Init {
                    name: collector.name().to_owned(),
                    source,
                })?;

            tracing::debug!(collector = collector.name(), "Collector initialized");
        }
        self.state = RegistryState::Initialized;

        let worker = Worker {
            collectors: self.collectors.clone(),
            metrics: self.metrics.clone(),
        };

        let interval = self.interval;
        let internal = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            worker.run(interval, cancel, internal).await
        }));
        self.state = RegistryState::Running;

        tracing::info!(
            interval = ?self.interval,
            collectors = ?self.names(),
            "Collector registry started"
        );

        Ok(())
    }

    /// Stops the sampling loop and closes every collector in registration
    /// order. All collectors are closed even if some fail; the last failure is
    /// returned.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.state == RegistryState::Closed {
            tracing::warn!("Collector registry is already closed");
            return Ok(());
        }

        tracing::info!("Shutting down the collector registry");
        self.state = RegistryState::ShuttingDown;
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::error!(?error, "The sampling task did not finish cleanly");
            }
        }

        let result = close_all(&self.collectors).await;
        self.state = RegistryState::Closed;
        tracing::info!("Collector registry closed");

        result
    }
}

async fn close_all(collectors: &[Arc<dyn Collector>]) -> anyhow::Result<()> {
    let mut last_error = None;
    for collector in collectors {
        tracing::debug!(collector = collector.name(), "Closing collector");
        if let Err(error) = collector.close().await {
            tracing::error!(collector = collector.name(), ?error, "Failed to close collector");
            last_error = Some(error);
        }
    }

    match last_error {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

struct Worker {
    collectors: Vec<Arc<dyn Collector>>,
    metrics: Metrics,
}

impl Worker {
    async fn run(
        &self,
        interval: Duration,
        external: CancellationToken,
        internal: CancellationToken,
    ) {
        if let Err(error) = self.sample_all(&external).await {
            tracing::warn!(?error, "First collection failed");
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = external.cancelled() => {
                    tracing::info!("Collector registry stopped by external cancellation");
                    return;
                }

                _ = internal.cancelled() => {
                    tracing::info!("Collector registry stopped by internal shutdown");
                    return;
                }

                _ = ticker.tick() => {
                    if let Err(error) = self.sample_all(&external).await {
                        tracing::debug!(?error, "Collection tick finished with errors");
                    }
                }
            }
        }
    }

    /// One sampling pass over every collector. Failures are logged and counted
    /// and never stop the remaining collectors. `cancel` is the caller's token.
    async fn sample_all(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut failed = 0;
        for collector in &self.collectors {
            let name = collector.name();
            let start = Instant::now();
            let result = collector.sample(cancel).await;

            self.metrics
                .duration
                .with_label_values(&[name])
                .observe(start.elapsed().as_secs_f64());

            if let Err(error) = result {
                tracing::warn!(collector = name, ?error, "Collection failed");
                self.metrics.errors.with_label_values(&[name]).inc();
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(anyhow::anyhow!(
                "{} of {} collectors failed to collect data",
                failed,
                self.collectors.len()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::sample_value;
    use prometheus::Registry;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct TestCollector {
        name: String,
        journal: Journal,
        samples: Arc<AtomicUsize>,
        fail_init: bool,
        fail_sample: bool,
        fail_close: bool,
    }

    impl TestCollector {
        fn new(name: &str, journal: &Journal) -> Self {
            Self {
                name: name.to_owned(),
                journal: journal.clone(),
                samples: Arc::new(AtomicUsize::new(0)),
                fail_init: false,
                fail_sample: false,
                fail_close: false,
            }
        }

        fn record(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", event, self.name));
        }
    }

    #[async_trait::async_trait]
    impl Collector for TestCollector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(&self) -> anyhow::Result<()> {
            self.record("init");
            if self.fail_init {
                return Err(anyhow::anyhow!("{} init failed", self.name));
            }
            Ok(())
        }

        async fn sample(&self, _: &CancellationToken) -> anyhow::Result<()> {
            self.record("sample");
            self.samples.fetch_add(1, Ordering::SeqCst);
            if self.fail_sample {
                return Err(anyhow::anyhow!("{} sample failed", self.name));
            }
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.record("close");
            if self.fail_close {
                return Err(anyhow::anyhow!("{} close failed", self.name));
            }
            Ok(())
        }
    }

    fn new_registry() -> (CollectorRegistry, MetricFactory) {
        let factory = MetricFactory::new(Registry::new());
        let registry = CollectorRegistry::new(Duration::from_secs(10), &factory).unwrap();
        (registry, factory)
    }

    fn events(journal: &Journal, event: &str) -> Vec<String> {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(event))
            .cloned()
            .collect()
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let factory = MetricFactory::new(Registry::new());
        assert!(CollectorRegistry::new(Duration::ZERO, &factory).is_err());
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        assert!(registry.register(Arc::new(TestCollector::new("cpu", &journal))));
        assert!(!registry.register(Arc::new(TestCollector::new("cpu", &journal))));
        assert!(registry.register(Arc::new(TestCollector::new("disk", &journal))));

        assert_eq!(registry.names().len(), 2);
        assert_eq!(registry.names(), vec!["cpu", "disk"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_prevents_running() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        let mut failing = TestCollector::new("b", &journal);
        failing.fail_init = true;
        let samples = failing.samples.clone();

        registry.register(Arc::new(TestCollector::new("a", &journal)));
        registry.register(Arc::new(failing));
        registry.register(Arc::new(TestCollector::new("c", &journal)));

        let result = registry.start(CancellationToken::new()).await;
        match result {
            Err(RegistryError::Init { name, .. }) => assert_eq!(name, "b"),
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(registry.state(), RegistryState::Created);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(samples.load(Ordering::SeqCst), 0);
        assert_eq!(events(&journal, "init"), vec!["init:a", "init:b"]);
        assert!(events(&journal, "sample").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_immediately_and_on_every_tick_in_order() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        registry.register(Arc::new(TestCollector::new("a", &journal)));
        registry.register(Arc::new(TestCollector::new("b", &journal)));

        registry.start(CancellationToken::new()).await.unwrap();
        assert_eq!(registry.state(), RegistryState::Running);

        // immediate pass plus the ticks at 10s and 20s
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            events(&journal, "sample"),
            vec![
                "sample:a", "sample:b", "sample:a", "sample:b", "sample:a", "sample:b"
            ]
        );

        registry.shutdown().await.unwrap();
        assert_eq!(registry.state(), RegistryState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_failure_does_not_stop_other_collectors() {
        let journal = Journal::default();
        let (mut registry, factory) = new_registry();

        let mut failing = TestCollector::new("a", &journal);
        failing.fail_sample = true;
        let healthy = TestCollector::new("b", &journal);
        let healthy_samples = healthy.samples.clone();

        registry.register(Arc::new(failing));
        registry.register(Arc::new(healthy));
        registry.start(CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(healthy_samples.load(Ordering::SeqCst), 2);

        let metrics = factory.registry();
        assert_eq!(
            sample_value(metrics, r#"agent_collect_errors_total{collector="a"}"#),
            Some(2.0)
        );
        assert_eq!(
            sample_value(metrics, r#"agent_collect_duration_seconds_count{collector="b"}"#),
            Some(2.0)
        );

        registry.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sampling_after_shutdown() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        let collector = TestCollector::new("a", &journal);
        let samples = collector.samples.clone();
        registry.register(Arc::new(collector));

        registry.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.shutdown().await.unwrap();

        let after_shutdown = samples.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(after_shutdown, 1);
        assert_eq!(samples.load(Ordering::SeqCst), after_shutdown);
        assert_eq!(events(&journal, "close"), vec!["close:a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_stops_the_loop() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        let collector = TestCollector::new("a", &journal);
        let samples = collector.samples.clone();
        registry.register(Arc::new(collector));

        let external = CancellationToken::new();
        registry.start(external.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        external.cancel();
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(samples.load(Ordering::SeqCst), 1);

        // the collectors stay open until shutdown
        assert!(events(&journal, "close").is_empty());
        registry.shutdown().await.unwrap();
        assert_eq!(events(&journal, "close"), vec!["close:a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_runs_for_all_and_returns_last_error() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        let mut second = TestCollector::new("b", &journal);
        second.fail_close = true;
        let mut fourth = TestCollector::new("d", &journal);
        fourth.fail_close = true;

        registry.register(Arc::new(TestCollector::new("a", &journal)));
        registry.register(Arc::new(second));
        registry.register(Arc::new(TestCollector::new("c", &journal)));
        registry.register(Arc::new(fourth));
        registry.start(CancellationToken::new()).await.unwrap();

        let error = registry.shutdown().await.unwrap_err();
        assert_eq!(error.to_string(), "d close failed");
        assert_eq!(
            events(&journal, "close"),
            vec!["close:a", "close:b", "close:c", "close:d"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_close_failure_is_returned() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        let mut failing = TestCollector::new("b", &journal);
        failing.fail_close = true;

        registry.register(Arc::new(TestCollector::new("a", &journal)));
        registry.register(Arc::new(failing));
        registry.register(Arc::new(TestCollector::new("c", &journal)));
        registry.start(CancellationToken::new()).await.unwrap();

        let error = registry.shutdown().await.unwrap_err();
        assert_eq!(error.to_string(), "b close failed");
        assert_eq!(events(&journal, "close").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_after_start_is_rejected() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        registry.register(Arc::new(TestCollector::new("a", &journal)));
        registry.start(CancellationToken::new()).await.unwrap();

        assert!(!registry.register(Arc::new(TestCollector::new("b", &journal))));
        assert_eq!(registry.names().len(), 1);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_twice_is_a_no_op() {
        let journal = Journal::default();
        let (mut registry, _) = new_registry();

        registry.register(Arc::new(TestCollector::new("a", &journal)));
        registry.start(CancellationToken::new()).await.unwrap();

        registry.shutdown().await.unwrap();
        registry.shutdown().await.unwrap();
        assert_eq!(events(&journal, "close").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let (mut registry, _) = new_registry();
        registry.start(CancellationToken::new()).await.unwrap();

        let result = registry.start(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(RegistryError::InvalidState(RegistryState::Running))
        ));

        registry.shutdown().await.unwrap();
    }
}
