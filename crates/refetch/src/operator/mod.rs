//! The keyed, cached, switching fetch operator.
//!
//! [`FetchStream`] turns a stream of input events into a stream of output events by running an
//! asynchronous fetch per event. Events are evaluated against a [`CacheEntry`] which decides
//! whether a cached value is re-delivered, an in-flight fetch is joined, or a new fetch is started.
//!
//! There are two modes:
//!
//! - **Keyed**, when [`FetchOptions::key_of`] is set: every key gets its own partition. Partitions
//!   are independent of each other, and within a partition a new event replaces the attachment of
//!   the previous one (latest wins). The replaced event produces no output.
//! - **Serial**, without a key: all events share one cache entry and are processed one at a time in
//!   arrival order. An event is only evaluated after the previous one produced its output.
//!
//! In both modes failures are turned into output events through the error callback, the stream
//! itself never fails.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, BoxFuture, abortable};
use futures::stream::{BoxStream, Fuse, FuturesUnordered};
use futures::{FutureExt, Stream, StreamExt, TryFutureExt};
use tokio::time::Instant;

use crate::config::FetchConfig;
use crate::source::{AsyncSource, FetchResult};
use crate::{CacheEntry, FetchError};

use self::partitions::Partitions;

mod partitions;

type KeyFn<E, K> = Arc<dyn Fn(&E) -> K + Send + Sync>;
type FetchFn<E, D> =
    Arc<dyn Fn(E) -> Result<BoxFuture<'static, FetchResult<D>>, FetchError> + Send + Sync>;
type MapFn<T, O> = Arc<dyn Fn(T) -> O + Send + Sync>;

/// Configures a [`FetchStream`].
///
/// `E` is the input event, `K` the partition key, `D` the fetched data and `O` the output event.
pub struct FetchOptions<E, K, D, O> {
    name: Arc<str>,
    key_of: Option<KeyFn<E, K>>,
    ttl: Option<Duration>,
    partition_idle_timeout: Option<Duration>,
    fetch: FetchFn<E, D>,
    on_success: MapFn<D, O>,
    on_error: MapFn<String, O>,
}

impl<E, D: 'static, O> FetchOptions<E, (), D, O> {
    /// Creates options for a fetch function that always returns a future.
    ///
    /// Without further configuration the operator runs in serial mode and does not cache.
    pub fn new<F, Fut, Err, S, X>(fetch: F, on_success: S, on_error: X) -> Self
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, Err>> + Send + 'static,
        Err: fmt::Display + 'static,
        S: Fn(D) -> O + Send + Sync + 'static,
        X: Fn(String) -> O + Send + Sync + 'static,
    {
        Self::try_new(
            move |event| Ok::<_, Infallible>(fetch(event)),
            on_success,
            on_error,
        )
    }

    /// Creates options for a fetch function that can fail before returning a future.
    ///
    /// A synchronous `Err` is treated exactly like a future resolving to an error.
    pub fn try_new<F, Fut, Rej, Err, S, X>(fetch: F, on_success: S, on_error: X) -> Self
    where
        F: Fn(E) -> Result<Fut, Rej> + Send + Sync + 'static,
        Rej: fmt::Display,
        Fut: Future<Output = Result<D, Err>> + Send + 'static,
        Err: fmt::Display + 'static,
        S: Fn(D) -> O + Send + Sync + 'static,
        X: Fn(String) -> O + Send + Sync + 'static,
    {
        let fetch: FetchFn<E, D> = Arc::new(move |event| {
            let future = fetch(event).map_err(FetchError::rejected)?;
            Ok(future.map_err(FetchError::failed).boxed())
        });
        Self {
            name: Arc::from("fetch"),
            key_of: None,
            ttl: None,
            partition_idle_timeout: None,
            fetch,
            on_success: Arc::new(on_success),
            on_error: Arc::new(on_error),
        }
    }
}

impl<E, K, D, O> FetchOptions<E, K, D, O> {
    /// Partitions events by the returned key, switching the operator into keyed mode.
    pub fn key_of<K2, F>(self, key_of: F) -> FetchOptions<E, K2, D, O>
    where
        F: Fn(&E) -> K2 + Send + Sync + 'static,
    {
        FetchOptions {
            name: self.name,
            key_of: Some(Arc::new(key_of)),
            ttl: self.ttl,
            partition_idle_timeout: self.partition_idle_timeout,
            fetch: self.fetch,
            on_success: self.on_success,
            on_error: self.on_error,
        }
    }

    /// Caches successful values for `ttl`. `None` or zero disables caching.
    pub fn ttl(mut self, ttl: impl Into<Option<Duration>>) -> Self {
        self.ttl = ttl.into().filter(|ttl| !ttl.is_zero());
        self
    }

    /// Evicts per-key state after the key has been idle for `timeout`.
    pub fn partition_idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.partition_idle_timeout = timeout.into();
        self
    }

    /// Sets the name used in metrics and logs.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Arc::from(name);
        self
    }

    /// Applies name, TTL and idle timeout from configuration.
    pub fn with_config(self, config: &FetchConfig) -> Self {
        self.name(&config.name)
            .ttl(config.ttl)
            .partition_idle_timeout(config.partition_idle_timeout)
    }

    /// Whether events are partitioned by key.
    pub fn is_keyed(&self) -> bool {
        self.key_of.is_some()
    }

    /// The effective TTL, `None` if caching is disabled.
    pub fn configured_ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

impl<E, K, D, O> Clone for FetchOptions<E, K, D, O> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            key_of: self.key_of.clone(),
            ttl: self.ttl,
            partition_idle_timeout: self.partition_idle_timeout,
            fetch: Arc::clone(&self.fetch),
            on_success: Arc::clone(&self.on_success),
            on_error: Arc::clone(&self.on_error),
        }
    }
}

impl<E, K, D, O> fmt::Debug for FetchOptions<E, K, D, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("name", &self.name)
            .field("keyed", &self.is_keyed())
            .field("ttl", &self.ttl)
            .field("partition_idle_timeout", &self.partition_idle_timeout)
            .finish_non_exhaustive()
    }
}

/// What to do with an event.
enum Decision<D> {
    /// The entry holds a valid value.
    Cached(D),
    /// Await a (possibly shared) computation.
    Attach(AsyncSource<D>),
    /// The fetch could not even be started.
    Rejected(FetchError),
}

impl<E, K, D, O> FetchOptions<E, K, D, O>
where
    D: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Invokes the fetch function, catching panics both in the call and in the future.
    fn start(&self, event: E) -> FetchResult<BoxFuture<'static, FetchResult<D>>> {
        metric!(counter("fetch.invocations") += 1, "operator" => &self.name);

        let future = match panic::catch_unwind(AssertUnwindSafe(|| (self.fetch)(event))) {
            Ok(future) => future?,
            Err(payload) => return Err(FetchError::from_panic(payload)),
        };

        let name = Arc::clone(&self.name);
        let started = Instant::now();
        let future = AssertUnwindSafe(future).catch_unwind().map(move |result| {
            metric!(timer("fetch.duration") = started.elapsed(), "operator" => &name);
            result.unwrap_or_else(|payload| Err(FetchError::from_panic(payload)))
        });
        Ok(future.boxed())
    }

    fn decide(&self, entry: &CacheEntry<D>, event: E) -> Decision<D> {
        if entry.is_valid() {
            if let Some(value) = entry.value() {
                metric!(counter("fetch.cache.hit") += 1, "operator" => &self.name);
                tracing::trace!(operator = %self.name, "re-delivering cached value");
                return Decision::Cached(value);
            }
        }

        if let Some(source) = entry.pending() {
            metric!(counter("fetch.coalesced") += 1, "operator" => &self.name);
            tracing::trace!(operator = %self.name, "joining pending fetch");
            return Decision::Attach(source);
        }

        match self.start(event) {
            Ok(computation) => Decision::Attach(entry.set_pending(computation)),
            Err(err) => Decision::Rejected(err),
        }
    }

    fn fail(&self, err: FetchError) -> O {
        report_failure(&self.name, &err);
        (self.on_error)(err.to_string())
    }

    /// Awaits `source` and maps its result to an output event.
    fn deliver(&self, source: AsyncSource<D>) -> BoxFuture<'static, O> {
        let name = Arc::clone(&self.name);
        let on_success = Arc::clone(&self.on_success);
        let on_error = Arc::clone(&self.on_error);
        async move {
            match source.await {
                Ok(data) => on_success(data),
                Err(err) => {
                    report_failure(&name, &err);
                    on_error(err.to_string())
                }
            }
        }
        .boxed()
    }

    fn emit(&self, decision: Decision<D>, ready: &mut VecDeque<O>) -> Option<AsyncSource<D>> {
        match decision {
            Decision::Cached(value) => ready.push_back((self.on_success)(value)),
            Decision::Rejected(err) => ready.push_back(self.fail(err)),
            Decision::Attach(source) => return Some(source),
        }
        None
    }
}

fn report_failure(name: &str, err: &FetchError) {
    metric!(
        counter("fetch.failures") += 1,
        "operator" => name,
        "kind" => err.metrics_tag(),
    );
    tracing::debug!(operator = %name, error = err as &dyn std::error::Error, "fetch failed");
}

struct Attempt<K, O> {
    key: K,
    id: u64,
    output: O,
}

struct Keyed<E, K, D, O> {
    key_of: KeyFn<E, K>,
    partitions: Partitions<K, D>,
    attempts: FuturesUnordered<Abortable<BoxFuture<'static, Attempt<K, O>>>>,
    next_id: u64,
}

impl<E, K, D, O> Keyed<E, K, D, O>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn on_event(&mut self, options: &FetchOptions<E, K, D, O>, ready: &mut VecDeque<O>, event: E) {
        let key = (self.key_of)(&event);
        let (partition, created) = self.partitions.get_or_create(key.clone());
        if created {
            metric!(counter("fetch.partitions.created") += 1, "operator" => &options.name);
        }

        // the new decision attaches before the previous attachment is aborted, so switching onto
        // the same pending computation never tears it down
        let decision = options.decide(partition.entry(), event);
        let Some(source) = options.emit(decision, ready) else {
            if partition.cancel() {
                metric!(counter("fetch.switched") += 1, "operator" => &options.name);
            }
            self.partitions.sync(&key, &partition);
            return;
        };

        let id = self.next_id;
        self.next_id += 1;

        let delivery = options.deliver(source);
        let attempt_key = key.clone();
        let attempt = async move {
            let output = delivery.await;
            Attempt {
                key: attempt_key,
                id,
                output,
            }
        };
        let (attempt, handle): (_, AbortHandle) = abortable(attempt.boxed());
        if partition.switch_to(id, handle) {
            metric!(counter("fetch.switched") += 1, "operator" => &options.name);
            tracing::trace!(operator = %options.name, "switched to latest event");
        }
        self.partitions.sync(&key, &partition);
        self.attempts.push(attempt);
    }

    fn poll_attempts(&mut self, cx: &mut Context<'_>, ready: &mut VecDeque<O>) -> bool {
        match self.attempts.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(Attempt { key, id, output }))) => {
                if let Some(partition) = self.partitions.get(&key) {
                    partition.finish(id);
                    self.partitions.sync(&key, &partition);
                }
                ready.push_back(output);
                true
            }
            // replaced by a later event for the same key
            Poll::Ready(Some(Err(_aborted))) => true,
            Poll::Ready(None) | Poll::Pending => false,
        }
    }
}

struct Serial<E, D, O> {
    entry: CacheEntry<D>,
    queue: VecDeque<E>,
    current: Option<BoxFuture<'static, O>>,
}

impl<E, D, O> Serial<E, D, O>
where
    D: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Evaluates queued events until one has to be awaited.
    fn advance<K>(&mut self, options: &FetchOptions<E, K, D, O>, ready: &mut VecDeque<O>) {
        while self.current.is_none() {
            let Some(event) = self.queue.pop_front() else {
                break;
            };
            let decision = options.decide(&self.entry, event);
            if let Some(source) = options.emit(decision, ready) {
                self.current = Some(options.deliver(source));
            }
        }
    }

    fn poll_current<K>(
        &mut self,
        cx: &mut Context<'_>,
        options: &FetchOptions<E, K, D, O>,
        ready: &mut VecDeque<O>,
    ) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        match current.poll_unpin(cx) {
            Poll::Ready(output) => {
                self.current = None;
                ready.push_back(output);
                self.advance(options, ready);
                true
            }
            Poll::Pending => false,
        }
    }

    fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }
}

enum Mode<E, K, D, O> {
    Keyed(Keyed<E, K, D, O>),
    Serial(Serial<E, D, O>),
}

/// The output stream of the fetch operator.
///
/// Created by [`fetch_operator`] or [`FetchStreamExt::fetch_with`]. Dropping the stream cancels
/// every attachment it holds; fetches without other attachers are dropped along with it.
pub struct FetchStream<E, K, D, O> {
    options: FetchOptions<E, K, D, O>,
    input: Fuse<BoxStream<'static, E>>,
    input_done: bool,
    ready: VecDeque<O>,
    mode: Mode<E, K, D, O>,
}

// No field is ever pinned structurally, everything that needs pinning is boxed.
impl<E, K, D, O> Unpin for FetchStream<E, K, D, O> {}

/// Applies the fetch operator to `input`.
pub fn fetch_operator<S, E, K, D, O>(
    input: S,
    options: FetchOptions<E, K, D, O>,
) -> FetchStream<E, K, D, O>
where
    S: Stream<Item = E> + Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    let mode = match &options.key_of {
        Some(key_of) => Mode::Keyed(Keyed {
            key_of: Arc::clone(key_of),
            partitions: Partitions::new(options.ttl, options.partition_idle_timeout),
            attempts: FuturesUnordered::new(),
            next_id: 0,
        }),
        None => Mode::Serial(Serial {
            entry: CacheEntry::new(options.ttl),
            queue: VecDeque::new(),
            current: None,
        }),
    };
    tracing::debug!(
        operator = %options.name,
        keyed = options.is_keyed(),
        ttl = ?options.ttl,
        "starting fetch operator"
    );

    FetchStream {
        options,
        input: input.boxed().fuse(),
        input_done: false,
        ready: VecDeque::new(),
        mode,
    }
}

impl<E, K, D, O> FetchStream<E, K, D, O>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn on_event(&mut self, event: E) {
        metric!(counter("fetch.events") += 1, "operator" => &self.options.name);
        match &mut self.mode {
            Mode::Keyed(keyed) => keyed.on_event(&self.options, &mut self.ready, event),
            Mode::Serial(serial) => {
                serial.queue.push_back(event);
                serial.advance(&self.options, &mut self.ready);
            }
        }
    }

    /// Pulls at most one event from the input.
    fn poll_input(&mut self, cx: &mut Context<'_>) -> bool {
        if self.input_done {
            return false;
        }
        match self.input.poll_next_unpin(cx) {
            Poll::Ready(Some(event)) => {
                self.on_event(event);
                true
            }
            Poll::Ready(None) => {
                tracing::trace!(operator = %self.options.name, "input completed");
                self.input_done = true;
                true
            }
            Poll::Pending => false,
        }
    }

    fn poll_work(&mut self, cx: &mut Context<'_>) -> bool {
        match &mut self.mode {
            Mode::Keyed(keyed) => keyed.poll_attempts(cx, &mut self.ready),
            Mode::Serial(serial) => serial.poll_current(cx, &self.options, &mut self.ready),
        }
    }

    fn is_done(&self) -> bool {
        let idle = match &self.mode {
            Mode::Keyed(keyed) => keyed.attempts.is_empty(),
            Mode::Serial(serial) => serial.is_idle(),
        };
        self.input_done && idle && self.ready.is_empty()
    }
}

impl<E, K, D, O> Stream for FetchStream<E, K, D, O>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    type Item = O;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<O>> {
        let this = self.get_mut();
        loop {
            if let Some(output) = this.ready.pop_front() {
                return Poll::Ready(Some(output));
            }

            // every completion that is already due is handled before the next event, an event
            // must not switch away from a finished attachment whose output was not taken yet
            let mut worked = false;
            while this.poll_work(cx) {
                worked = true;
            }
            let pulled = this.poll_input(cx);
            if worked || pulled || !this.ready.is_empty() {
                continue;
            }

            if this.is_done() {
                return Poll::Ready(None);
            }
            return Poll::Pending;
        }
    }
}

impl<E, K, D, O> fmt::Debug for FetchStream<E, K, D, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("FetchStream");
        f.field("options", &self.options)
            .field("input_done", &self.input_done)
            .field("ready", &self.ready.len());
        match &self.mode {
            Mode::Keyed(keyed) => f.field("attempts", &keyed.attempts.len()),
            Mode::Serial(serial) => f
                .field("queued", &serial.queue.len())
                .field("running", &serial.current.is_some()),
        };
        f.finish()
    }
}

/// Extension methods to apply the fetch operators to any stream.
pub trait FetchStreamExt: Stream + Sized + Send + 'static {
    /// See [`fetch_operator`].
    fn fetch_with<K, D, O>(
        self,
        options: FetchOptions<Self::Item, K, D, O>,
    ) -> FetchStream<Self::Item, K, D, O>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
        O: Send + 'static,
    {
        fetch_operator(self, options)
    }

    /// Maps every item to a fetch, switching to the latest item and caching results for `ttl`.
    ///
    /// Unlike [`fetch_with`](Self::fetch_with) there are no callbacks: the stream yields the
    /// fetch results directly. Items are never processed concurrently with each other; a new item
    /// replaces the one currently awaited.
    fn cached_switch<F, Fut, D, Err>(
        self,
        project: F,
        ttl: impl Into<Option<Duration>>,
    ) -> FetchStream<Self::Item, (), D, FetchResult<D>>
    where
        F: Fn(Self::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, Err>> + Send + 'static,
        Err: fmt::Display + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let options = FetchOptions::new(project, Ok, |message| Err(FetchError::Failed(message)))
            .key_of(|_| ())
            .name("cached_switch")
            .ttl(ttl);
        fetch_operator(self, options)
    }
}

impl<S> FetchStreamExt for S where S: Stream + Sized + Send + 'static {}
