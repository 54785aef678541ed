use std::future::Future;
use std::time::Duration;

use refetch::FetchOptions;

pub use refetch_test::{FetchCounter, collect_timed, schedule, setup};

/// The output event used throughout the tests: fetched data or the error message.
pub type Output<D> = Result<D, String>;

/// Creates serial, non-caching options that map results to [`Output`].
pub fn options<E, D, F, Fut>(fetch: F) -> FetchOptions<E, (), D, Output<D>>
where
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, String>> + Send + 'static,
    D: 'static,
{
    FetchOptions::new(fetch, Ok, Err)
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Asserts that `offset` lies within `[from, from + 10ms)`.
#[track_caller]
pub fn assert_around(offset: Duration, from: u64) {
    assert!(
        offset >= ms(from) && offset < ms(from + 10),
        "expected {offset:?} to be around {from}ms"
    );
}
