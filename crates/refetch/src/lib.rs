//! Request deduplication and caching between an event stream and asynchronous fetches.
//!
//! The [`fetch_operator`] (or [`FetchStreamExt::fetch_with`]) maps a stream of events onto
//! asynchronous fetches and turns their outcome into output events:
//!
//! - concurrent events for the same key share a single in-flight fetch,
//! - successful values can be reused for a configurable time to live,
//! - within a key the latest event wins, earlier attachments are cancelled,
//! - failures become regular output events and never end the stream.
//!
//! The building blocks, [`CacheEntry`] and [`AsyncSource`], are usable on their own.

#![warn(missing_debug_implementations)]

#[macro_use]
pub mod metrics;

pub mod config;
pub mod logging;

mod cache_entry;
mod error;
mod operator;
mod source;

pub use cache_entry::CacheEntry;
pub use error::FetchError;
pub use operator::{FetchOptions, FetchStream, FetchStreamExt, fetch_operator};
pub use source::{AsyncSource, FetchResult, WeakSource};
