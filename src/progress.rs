use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::blob_store::TransferObserver;

/// Batch progress callback, receives a percentage in `0.0..=100.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

struct Counters {
    sizes: Vec<u64>,
    last: Vec<u64>,
    transferred: u64,
}

/// Byte accounting for one batch.
///
/// Each file reports cumulative counts. The accumulator applies the delta
/// against that file's previous count, so retried chunks that report a
/// lower count move the total back instead of double counting.
pub struct ProgressAccumulator {
    total: u64,
    counters: Mutex<Counters>,
    on_progress: ProgressFn,
}

impl ProgressAccumulator {
    pub fn new(sizes: Vec<u64>, on_progress: ProgressFn) -> Self {
        let total = sizes.iter().sum();
        let last = vec![0; sizes.len()];
        Self {
            total,
            counters: Mutex::new(Counters {
                sizes,
                last,
                transferred: 0,
            }),
            on_progress,
        }
    }

    /// Record that file `index` has `cumulative` bytes on the store.
    pub fn record(&self, index: usize, cumulative: u64) {
        let percent = {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(size) = counters.sizes.get(index).copied() else {
                return;
            };
            let cumulative = cumulative.min(size);
            let previous = counters.last[index];
            counters.last[index] = cumulative;
            counters.transferred = counters.transferred + cumulative - previous;
            Self::percent_of(counters.transferred, self.total)
        };
        (self.on_progress)(percent);
    }

    /// Report completion of a batch with nothing to transfer.
    pub fn finish_empty(&self) {
        if self.total == 0 {
            (self.on_progress)(100.0);
        }
    }

    fn percent_of(transferred: u64, total: u64) -> f64 {
        if total == 0 {
            return 100.0;
        }
        transferred as f64 * 100.0 / total as f64
    }

    /// Observer that feeds one file's transfer into this batch.
    #[must_use]
    pub fn observer(self: &Arc<Self>, index: usize) -> FileProgress {
        FileProgress {
            batch: Arc::clone(self),
            index,
        }
    }
}

pub struct FileProgress {
    batch: Arc<ProgressAccumulator>,
    index: usize,
}

impl TransferObserver for FileProgress {
    fn on_transferred(&self, cumulative: u64) {
        self.batch.record(self.index, cumulative);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchProgress {
    pub percent: f64,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

/// Batches are scoped to the device that started them, so a guessed or
/// reused batch id never reaches another device's entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub device_id: String,
    pub batch_id: Uuid,
}

impl BatchKey {
    pub fn new(device_id: impl Into<String>, batch_id: Uuid) -> Self {
        Self {
            device_id: device_id.into(),
            batch_id,
        }
    }
}

/// Latest progress of every in-flight batch, polled by the upload form.
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    batches: Arc<Mutex<HashMap<BatchKey, BatchProgress>>>,
}

impl ProgressRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, key: &BatchKey) {
        self.set(key.clone(), 0.0, false);
    }

    pub fn update(&self, key: &BatchKey, percent: f64) {
        self.set(key.clone(), percent, false);
    }

    pub fn finish(&self, key: &BatchKey) {
        self.set(key.clone(), 100.0, true);
    }

    #[must_use]
    pub fn get(&self, key: &BatchKey) -> Option<BatchProgress> {
        self.lock().get(key).cloned()
    }

    /// Callback that publishes batch percentages under `key`.
    #[must_use]
    pub fn reporter(&self, key: BatchKey) -> ProgressFn {
        let registry = self.clone();
        Arc::new(move |percent| registry.update(&key, percent))
    }

    /// Drop entries not touched since `cutoff`.
    pub fn retain_recent(&self, cutoff: DateTime<Utc>) {
        self.lock().retain(|_, entry| entry.updated_at >= cutoff);
    }

    fn set(&self, key: BatchKey, percent: f64, finished: bool) {
        self.lock().insert(
            key,
            BatchProgress {
                percent: percent.clamp(0.0, 100.0),
                finished,
                updated_at: Utc::now(),
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BatchKey, BatchProgress>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodically drop batch entries older than an hour.
pub fn start_cleanup_task(registry: ProgressRegistry) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300)); // 5 minutes

        loop {
            interval.tick().await;
            registry.retain_recent(Utc::now() - chrono::Duration::hours(1));
        }
    });
}
