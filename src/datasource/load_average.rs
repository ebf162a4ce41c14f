use crate::datasource::Reader;
use crate::metrics::load::{DataSource, LoadAverages};
use anyhow::Context;

pub(crate) const PATH_LOAD_AVG: &str = "/proc/loadavg";

pub struct ProcLoadAverage<R> {
    reader: R,
}

impl<R> ProcLoadAverage<R>
where
    R: Reader,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> DataSource for ProcLoadAverage<R>
where
    R: Reader,
{
    async fn current_load(&self) -> anyhow::Result<f64> {
        Ok(read_load_average(&self.reader).await?.one)
    }
}

pub(crate) async fn read_load_average<R: Reader>(reader: &R) -> anyhow::Result<LoadAverages> {
    let content = reader
        .read_to_string(PATH_LOAD_AVG)
        .await
        .with_context(|| format!("Failed to read {}", PATH_LOAD_AVG))?;

    parse_load_average(&content)
}

// Format: "0.52 0.58 0.59 1/467 12345"
fn parse_load_average(content: &str) -> anyhow::Result<LoadAverages> {
    let mut fields = content.split_whitespace();
    let mut next = |name: &str| -> anyhow::Result<f64> {
        let value = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("Invalid {} format: missing {}", PATH_LOAD_AVG, name))?;

        value
            .parse::<f64>()
            .with_context(|| format!("Invalid {} value in {}: {}", name, PATH_LOAD_AVG, value))
    };

    Ok(LoadAverages {
        one: next("load1")?,
        five: next("load5")?,
        fifteen: next("load15")?,
    })
}
