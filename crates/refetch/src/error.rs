use std::any::Any;
use std::fmt;

use thiserror::Error;

/// A failed fetch attempt.
///
/// Whatever the fetch implementation reported is reduced to its message here, which is also what
/// ends up in the error callback of the operator. The error is [`Clone`] so that a single failure
/// can be delivered to every attacher of a shared computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The fetch could not be started.
    ///
    /// This is what a fallible fetch function returns synchronously, before any future exists.
    #[error("{0}")]
    Rejected(String),
    /// The fetch future resolved to an error.
    #[error("{0}")]
    Failed(String),
    /// The fetch function or its future panicked.
    #[error("{0}")]
    Panicked(String),
}

impl FetchError {
    /// Normalizes a synchronous failure into its message.
    pub fn rejected<E: fmt::Display>(err: E) -> Self {
        Self::Rejected(err.to_string())
    }

    /// Normalizes an asynchronous failure into its message.
    pub fn failed<E: fmt::Display>(err: E) -> Self {
        Self::Failed(err.to_string())
    }

    /// Converts a panic payload as returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "fetch panicked".to_owned(),
            },
        };
        Self::Panicked(message)
    }

    /// The message handed to the error callback.
    pub fn message(&self) -> &str {
        match self {
            Self::Rejected(message) | Self::Failed(message) | Self::Panicked(message) => message,
        }
    }

    /// Tag value used for the `fetch.failures` metric.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "sync",
            Self::Failed(_) => "async",
            Self::Panicked(_) => "panic",
        }
    }
}
