//! Helpers for testing fetch operators.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Timing sensitive tests should pause the tokio clock (`tokio::time::pause()`) before creating
//!    a [`FetchCounter`] or a [`schedule`], so that all offsets are measured on the paused clock.
//!
//!  - Offsets reported by the helpers are measured from the moment the helper was created. Compare
//!    them with `>=` and `<` rather than exact equality, the timer wheel rounds to milliseconds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use tokio::time::{self, Instant};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `refetch` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("refetch=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts invocations of a fetch function and records when each of them started.
#[derive(Clone, Debug)]
pub struct FetchCounter {
    origin: Instant,
    starts: Arc<Mutex<Vec<Duration>>>,
    completed: Arc<AtomicUsize>,
}

impl FetchCounter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            starts: Default::default(),
            completed: Default::default(),
        }
    }

    /// Records a single invocation at the current time.
    pub fn record(&self) {
        let offset = self.origin.elapsed();
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(offset);
    }

    /// The number of recorded invocations.
    pub fn invocations(&self) -> usize {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The number of fetches that ran to completion.
    ///
    /// Fetches that were dropped before their latency elapsed are not counted.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Start offsets of all invocations, relative to the creation of the counter.
    pub fn starts(&self) -> Vec<Duration> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Creates a fetch function that resolves to `respond(event)` after `latency`.
    ///
    /// Every call of the returned function is recorded as an invocation.
    pub fn delayed<E, D, F>(
        &self,
        latency: Duration,
        respond: F,
    ) -> impl Fn(E) -> BoxFuture<'static, Result<D, String>> + Send + Sync + 'static
    where
        E: Send + 'static,
        D: Send + 'static,
        F: Fn(E) -> Result<D, String> + Send + Sync + 'static,
    {
        let counter = self.clone();
        move |event| {
            counter.record();
            let result = respond(event);
            let completed = Arc::clone(&counter.completed);
            async move {
                time::sleep(latency).await;
                completed.fetch_add(1, Ordering::SeqCst);
                result
            }
            .boxed()
        }
    }

    /// Creates a fetch function that echoes the event after `latency`.
    pub fn echo<E>(
        &self,
        latency: Duration,
    ) -> impl Fn(E) -> BoxFuture<'static, Result<E, String>> + Send + Sync + 'static
    where
        E: Send + 'static,
    {
        self.delayed(latency, Ok)
    }
}

impl Default for FetchCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a stream that yields every event at its offset in milliseconds.
///
/// Offsets are relative to the call of this function and must be ascending. The stream completes
/// after the last event.
pub fn schedule<E>(events: impl IntoIterator<Item = (u64, E)>) -> BoxStream<'static, E>
where
    E: Send + 'static,
{
    let origin = Instant::now();
    let events: Vec<_> = events.into_iter().collect();
    stream::iter(events)
        .then(move |(offset, event)| async move {
            time::sleep_until(origin + Duration::from_millis(offset)).await;
            event
        })
        .boxed()
}

/// Collects all items of `stream` along with their offset from `origin`.
pub async fn collect_timed<S>(stream: S, origin: Instant) -> Vec<(Duration, S::Item)>
where
    S: Stream,
{
    stream
        .map(|item| (origin.elapsed(), item))
        .collect()
        .await
}
