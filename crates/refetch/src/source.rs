use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

use crate::FetchError;

/// The outcome of a fetch, as delivered to every attacher.
pub type FetchResult<V> = Result<V, FetchError>;

type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

/// A shared, replayable handle to a possibly running computation.
///
/// The computation starts when the first attacher polls it. Every further attachment (see
/// [`attach`](Self::attach)) joins the same computation without re-running it, and receives the
/// same value or the same [`FetchError`], even if it attaches after the computation already
/// finished.
///
/// The computation is dropped as soon as the last attachment is dropped before completion.
pub struct AsyncSource<V> {
    inner: SharedFetch<V>,
}

impl<V: Clone> AsyncSource<V> {
    /// Wraps a computation into a new source.
    pub fn new<F>(computation: F) -> Self
    where
        F: Future<Output = FetchResult<V>> + Send + 'static,
    {
        Self {
            inner: computation.boxed().shared(),
        }
    }

    /// A source that is already resolved.
    pub fn ready(result: FetchResult<V>) -> Self
    where
        V: Send + 'static,
    {
        Self::new(futures::future::ready(result))
    }

    /// Creates another attachment to the same computation.
    pub fn attach(&self) -> Self {
        self.clone()
    }

    /// The number of live attachments, including this one.
    pub fn attachments(&self) -> usize {
        self.inner.strong_count().unwrap_or(1)
    }

    /// Returns the result if the computation has already completed.
    pub fn peek(&self) -> Option<&FetchResult<V>> {
        self.inner.peek()
    }

    /// Returns `true` if both handles attach to the same computation.
    pub fn same_source(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    /// Creates a handle that does not keep the computation alive.
    ///
    /// Returns `None` once the computation has completed.
    pub fn downgrade(&self) -> Option<WeakSource<V>> {
        self.inner.downgrade().map(|inner| WeakSource { inner })
    }
}

impl<V> Clone for AsyncSource<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone> Future for AsyncSource<V> {
    type Output = FetchResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<V> fmt::Debug for AsyncSource<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSource")
            .field("attachments", &self.inner.strong_count())
            .finish()
    }
}

/// A weak handle to an [`AsyncSource`].
pub struct WeakSource<V> {
    inner: WeakShared<BoxFuture<'static, FetchResult<V>>>,
}

impl<V: Clone> WeakSource<V> {
    /// Attaches to the computation if it is still alive.
    pub fn upgrade(&self) -> Option<AsyncSource<V>> {
        self.inner.upgrade().map(|inner| AsyncSource { inner })
    }
}

impl<V> Clone for WeakSource<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> fmt::Debug for WeakSource<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSource").finish_non_exhaustive()
    }
}
