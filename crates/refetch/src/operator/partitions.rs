use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::AbortHandle;

use crate::CacheEntry;

/// The state of a single key: its cache entry and the attachment currently awaited for it.
pub(crate) struct Partition<D> {
    entry: CacheEntry<D>,
    attempt: Mutex<Option<(u64, AbortHandle)>>,
}

impl<D: Clone> Partition<D> {
    fn new(ttl: Option<Duration>) -> Self {
        Self {
            entry: CacheEntry::new(ttl),
            attempt: Mutex::new(None),
        }
    }

    pub fn entry(&self) -> &CacheEntry<D> {
        &self.entry
    }

    /// Makes `id` the awaited attachment, aborting the previous one.
    ///
    /// Returns `true` if a previous attachment was still running.
    pub fn switch_to(&self, id: u64, handle: AbortHandle) -> bool {
        let previous = self
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, handle));
        match previous {
            Some((_, previous)) => {
                previous.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts the awaited attachment, if any.
    pub fn cancel(&self) -> bool {
        let previous = self
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match previous {
            Some((_, previous)) => {
                previous.abort();
                true
            }
            None => false,
        }
    }

    /// Whether an attachment is currently awaited.
    pub fn is_awaiting(&self) -> bool {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Marks attachment `id` as delivered.
    pub fn finish(&self, id: u64) {
        let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        if attempt.as_ref().is_some_and(|(current, _)| *current == id) {
            *attempt = None;
        }
    }
}

/// Per-key state of a keyed operator.
///
/// Partitions are created when a key is first seen. Without an idle timeout they live as long as
/// the operator does, otherwise a key that has not seen an event for that long starts over with an
/// empty cache entry.
///
/// A partition that awaits an attachment is never evicted, its idle time only starts counting once
/// the attachment delivered or was cancelled.
pub(crate) struct Partitions<K, D> {
    ttl: Option<Duration>,
    partitions: moka::sync::Cache<K, Arc<Partition<D>>>,
    /// Partitions with an awaited attachment, only tracked when partitions can be evicted.
    awaiting: Option<HashMap<K, Arc<Partition<D>>>>,
}

impl<K, D> Partitions<K, D>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Option<Duration>, idle_timeout: Option<Duration>) -> Self {
        let mut builder = moka::sync::Cache::builder();
        if let Some(idle_timeout) = idle_timeout {
            builder = builder.time_to_idle(idle_timeout);
        }
        Self {
            ttl,
            partitions: builder.build(),
            awaiting: idle_timeout.map(|_| HashMap::new()),
        }
    }

    /// Returns the partition for `key`, creating it if necessary.
    ///
    /// The flag is `true` if the partition was just created.
    pub fn get_or_create(&self, key: K) -> (Arc<Partition<D>>, bool) {
        if let Some(partition) = self.awaiting.as_ref().and_then(|awaiting| awaiting.get(&key)) {
            let partition = Arc::clone(partition);
            // restarts the idle timer in case the cache already dropped it
            self.partitions.insert(key, Arc::clone(&partition));
            return (partition, false);
        }

        let entry = self
            .partitions
            .entry(key)
            .or_insert_with(|| Arc::new(Partition::new(self.ttl)));
        let created = entry.is_fresh();
        (entry.into_value(), created)
    }

    pub fn get(&self, key: &K) -> Option<Arc<Partition<D>>> {
        let awaiting = self.awaiting.as_ref().and_then(|awaiting| awaiting.get(key));
        awaiting.cloned().or_else(|| self.partitions.get(key))
    }

    /// Pins `partition` while it awaits an attachment and releases it afterwards.
    pub fn sync(&mut self, key: &K, partition: &Arc<Partition<D>>) {
        let Some(awaiting) = self.awaiting.as_mut() else {
            return;
        };
        if partition.is_awaiting() {
            if !awaiting.contains_key(key) {
                awaiting.insert(key.clone(), Arc::clone(partition));
            }
        } else {
            awaiting.remove(key);
        }
    }
}
