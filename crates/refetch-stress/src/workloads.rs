use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

/// How events of a workload are fed to the operator.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Partitioned by key, latest event per key wins.
    #[default]
    Keyed,
    /// One shared cache entry, events are processed one at a time.
    Serial,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Keyed => f.write_str("keyed"),
            Mode::Serial => f.write_str("serial"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    /// Number of concurrent event producers.
    pub concurrency: usize,
    #[serde(default)]
    pub mode: Mode,
    /// Events pick one of this many keys at random.
    #[serde(default = "default_keys")]
    pub keys: u64,
    /// Pause of every producer between two events.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Simulated fetch latency.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Probability of a simulated fetch to fail.
    #[serde(default)]
    pub failure_rate: f64,
    /// Overrides the TTL from the configuration file.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

fn default_keys() -> u64 {
    1
}

fn default_interval() -> Duration {
    Duration::from_millis(1)
}

impl Workload {
    fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be positive");
        ensure!(self.keys > 0, "at least one key is required");
        ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "failure_rate must be between 0 and 1"
        );
        Ok(())
    }
}

/// An input event of the stresstest.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub key: u64,
}

/// The data produced by the simulated fetch.
#[derive(Clone, Debug)]
pub struct Fetched {
    pub started: Instant,
}

/// The output event of the stresstest.
#[derive(Debug)]
pub enum Outcome {
    Fetched(Fetched),
    Failed(String),
}

#[derive(Debug, Default)]
pub struct FetchStats {
    pub invocations: AtomicUsize,
}

/// Creates a fetch function that waits for the workload's latency and fails at random.
pub fn simulated_fetch(
    workload: &Workload,
    stats: Arc<FetchStats>,
) -> impl Fn(Event) -> BoxFuture<'static, Result<Fetched, String>> + Send + Sync + 'static {
    let latency = workload.latency;
    let failure_rate = workload.failure_rate;
    move |event| {
        stats.invocations.fetch_add(1, Ordering::Relaxed);
        let fail = rand::rng().random_bool(failure_rate);
        let started = Instant::now();
        async move {
            tokio::time::sleep(latency).await;
            if fail {
                Err(format!("simulated failure for key {}", event.key))
            } else {
                Ok(Fetched { started })
            }
        }
        .boxed()
    }
}
