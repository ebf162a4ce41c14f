use prometheus::{
    Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
enum Instrument {
    Gauge(Gauge),
    GaugeVec(GaugeVec, Vec<String>),
    CounterVec(IntCounterVec, Vec<String>),
    HistogramVec(HistogramVec, Vec<String>),
}

impl Instrument {
    fn kind(&self) -> &'static str {
        match self {
            Instrument::Gauge(_) => "gauge",
            Instrument::GaugeVec(..) => "gauge vector",
            Instrument::CounterVec(..) => "counter vector",
            Instrument::HistogramVec(..) => "histogram vector",
        }
    }
}

/// Creates prometheus instruments and registers them with the shared registry.
///
/// Every metric name is registered at most once per registry. Asking for the
/// same name again returns a clone of the cached instrument, so collectors that
/// share a metric (e.g. the error counter) or that are constructed more than
/// once never hit a duplicate registration error.
#[derive(Clone)]
pub struct MetricFactory {
    registry: Registry,
    instruments: Arc<Mutex<HashMap<String, Instrument>>>,
}

impl MetricFactory {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            instruments: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gauge(&self, name: &str, help: &str) -> anyhow::Result<Gauge> {
        let instrument = self.get_or_register(name, || {
            let gauge = Gauge::new(name, help)?;
            self.registry.register(Box::new(gauge.clone()))?;
            Ok(Instrument::Gauge(gauge))
        })?;

        match instrument {
            Instrument::Gauge(gauge) => Ok(gauge),
            other => Err(kind_mismatch(name, "gauge", &other)),
        }
    }

    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> anyhow::Result<GaugeVec> {
        let instrument = self.get_or_register(name, || {
            let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
            self.registry.register(Box::new(gauge.clone()))?;
            Ok(Instrument::GaugeVec(gauge, owned(labels)))
        })?;

        match instrument {
            Instrument::GaugeVec(gauge, known) => {
                check_labels(name, &known, labels)?;
                Ok(gauge)
            }
            other => Err(kind_mismatch(name, "gauge vector", &other)),
        }
    }

    pub fn counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> anyhow::Result<IntCounterVec> {
        let instrument = self.get_or_register(name, || {
            let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
            self.registry.register(Box::new(counter.clone()))?;
            Ok(Instrument::CounterVec(counter, owned(labels)))
        })?;

        match instrument {
            Instrument::CounterVec(counter, known) => {
                check_labels(name, &known, labels)?;
                Ok(counter)
            }
            other => Err(kind_mismatch(name, "counter vector", &other)),
        }
    }

    /// Histogram with the prometheus default buckets.
    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> anyhow::Result<HistogramVec> {
        let instrument = self.get_or_register(name, || {
            let histogram = HistogramVec::new(HistogramOpts::new(name, help), labels)?;
            self.registry.register(Box::new(histogram.clone()))?;
            Ok(Instrument::HistogramVec(histogram, owned(labels)))
        })?;

        match instrument {
            Instrument::HistogramVec(histogram, known) => {
                check_labels(name, &known, labels)?;
                Ok(histogram)
            }
            other => Err(kind_mismatch(name, "histogram vector", &other)),
        }
    }

    fn get_or_register<F>(&self, name: &str, create: F) -> anyhow::Result<Instrument>
    where
        F: FnOnce() -> anyhow::Result<Instrument>,
    {
        let Ok(mut instruments) = self.instruments.lock() else {
            return Err(anyhow::anyhow!(
                "Failed to register metric [{}] due to a poisoned lock",
                name
            ));
        };

        if let Some(instrument) = instruments.get(name) {
            tracing::debug!(metric = name, "Reusing already registered metric");
            return Ok(instrument.clone());
        }

        let instrument = create()?;
        instruments.insert(name.to_owned(), instrument.clone());
        Ok(instrument)
    }
}

fn owned(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|&l| l.to_owned()).collect()
}

fn check_labels(name: &str, known: &[String], requested: &[&str]) -> anyhow::Result<()> {
    if known.iter().map(String::as_str).eq(requested.iter().copied()) {
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "Metric [{}] is already registered with labels {:?}, requested {:?}",
        name,
        known,
        requested
    ))
}

fn kind_mismatch(name: &str, requested: &str, existing: &Instrument) -> anyhow::Error {
    anyhow::anyhow!(
        "Metric [{}] is already registered as a {}, requested a {}",
        name,
        existing.kind(),
        requested
    )
}
