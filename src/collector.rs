//! Bounded fan-out over a list of work items.
//!
//! Every item yields an [`Outcome`]: processor errors and panics are captured
//! next to the item instead of aborting the run.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use futures::{future::join_all, stream, FutureExt, StreamExt};

// ---

/// Which fan-out [`ParallelCollector::run`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectMode {
    /// One global concurrency limit, see [`ParallelCollector::collect_parallel`].
    #[default]
    Parallel,
    /// Fixed-size batches, see [`ParallelCollector::collect`].
    Batched,
}

impl std::str::FromStr for CollectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(CollectMode::Parallel),
            "batched" => Ok(CollectMode::Batched),
            other => Err(format!("expected 'parallel' or 'batched', got '{other}'")),
        }
    }
}

/// Fan-out limits.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    // ---
    pub mode: CollectMode,
    /// Items per batch for [`ParallelCollector::collect`].
    pub batch_size: usize,
    /// In-flight items for [`ParallelCollector::collect_parallel`].
    pub concurrency: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            mode: CollectMode::Parallel,
            batch_size: 20,
            concurrency: 5,
        }
    }
}

/// Result of processing one item.
#[derive(Debug)]
pub struct Outcome<T, R> {
    // ---
    pub item: T,
    pub result: anyhow::Result<R>,
}

impl<T, R> Outcome<T, R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParallelCollector {
    config: CollectorConfig,
}

impl ParallelCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Process items with the configured [`CollectMode`]. Outcomes keep input order.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, processor: F) -> Vec<Outcome<T, R>>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        // ---
        match self.config.mode {
            CollectMode::Parallel => self.collect_parallel(items, processor).await,
            CollectMode::Batched => self.collect(items, processor).await,
        }
    }

    /// Process items in fixed-size batches; a batch finishes before the next starts.
    pub async fn collect<T, R, F, Fut>(&self, items: Vec<T>, processor: F) -> Vec<Outcome<T, R>>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        // ---
        let batch_size = self.config.batch_size.max(1);
        let batches = items.len().div_ceil(batch_size);
        let mut outcomes = Vec::with_capacity(items.len());

        for (i, batch) in items.chunks(batch_size).enumerate() {
            tracing::debug!(batch = i + 1, batches, size = batch.len(), "Processing batch");
            let pending = batch.iter().cloned().map(|item| run_one(item, &processor));
            outcomes.extend(join_all(pending).await);
        }

        outcomes
    }

    /// Process items under one global concurrency limit. Outcomes keep input order.
    pub async fn collect_parallel<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
    ) -> Vec<Outcome<T, R>>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        // ---
        stream::iter(items)
            .map(|item| run_one(item, &processor))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await
    }
}

async fn run_one<T, R, F, Fut>(item: T, processor: &F) -> Outcome<T, R>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    // ---
    let input = item.clone();
    let result = match AssertUnwindSafe(async move { processor(input).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "Collector task panicked");
            Err(anyhow!("task panicked: {message}"))
        }
    };
    Outcome { item, result }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks how many processors run at once.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlight {
        async fn hold(&self, ms: u64) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn create_test_collector(batch_size: usize, concurrency: usize) -> ParallelCollector {
        ParallelCollector::new(CollectorConfig {
            mode: CollectMode::Parallel,
            batch_size,
            concurrency,
        })
    }

    #[tokio::test]
    async fn test_parallel_keeps_input_order_and_limit() {
        // ---
        let in_flight = InFlight::default();
        let tracker = &in_flight;
        let collector = create_test_collector(20, 2);

        let outcomes = collector
            .collect_parallel(vec![30u64, 5, 20, 1, 10], move |ms| async move {
                tracker.hold(ms).await;
                Ok(ms * 2)
            })
            .await;

        let values: Vec<u64> = outcomes.iter().map(|o| *o.result.as_ref().unwrap()).collect();
        assert_eq!(values, vec![60, 10, 40, 2, 20]);
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_outcomes() {
        // ---
        let collector = create_test_collector(20, 3);

        let outcomes = collector
            .collect_parallel(vec![1, 2, 3], |n| async move {
                match n {
                    2 => Err(anyhow!("sensor 2 unreachable")),
                    3 => panic!("parser blew up"),
                    _ => Ok(n),
                }
            })
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].item, 2);
        assert!(outcomes[1].result.as_ref().unwrap_err().to_string().contains("unreachable"));
        assert_eq!(outcomes[2].item, 3);
        assert!(outcomes[2]
            .result
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("parser blew up"));
    }

    #[tokio::test]
    async fn test_batches_run_one_at_a_time() {
        // ---
        let in_flight = InFlight::default();
        let tracker = &in_flight;
        let collector = create_test_collector(2, 5);

        let outcomes = collector
            .collect((0..5).collect::<Vec<u64>>(), move |n| async move {
                tracker.hold(5).await;
                Ok(n)
            })
            .await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(Outcome::is_ok));
        assert_eq!(outcomes[4].item, 4);
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_follows_configured_mode() {
        // ---
        let in_flight = InFlight::default();
        let tracker = &in_flight;
        let batched = ParallelCollector::new(CollectorConfig {
            mode: CollectMode::Batched,
            batch_size: 3,
            concurrency: 1,
        });

        let outcomes = batched
            .run((0..6).collect::<Vec<u64>>(), move |n| async move {
                tracker.hold(5).await;
                Ok(n)
            })
            .await;

        assert_eq!(outcomes.len(), 6);
        // Batch size, not the concurrency limit, bounds the fan-out.
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 3);

        let in_flight = InFlight::default();
        let tracker = &in_flight;
        let parallel = create_test_collector(3, 1);
        parallel
            .run((0..4).collect::<Vec<u64>>(), move |n| async move {
                tracker.hold(1).await;
                Ok(n)
            })
            .await;
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mode_from_str() {
        // ---
        assert_eq!("batched".parse::<CollectMode>(), Ok(CollectMode::Batched));
        assert_eq!(" Parallel ".parse::<CollectMode>(), Ok(CollectMode::Parallel));
        assert!("serial".parse::<CollectMode>().is_err());
    }

    #[tokio::test]
    async fn test_empty_input() {
        // ---
        let collector = ParallelCollector::default();
        let outcomes: Vec<Outcome<u8, ()>> =
            collector.collect_parallel(Vec::new(), |_| async { Ok(()) }).await;
        assert!(outcomes.is_empty());
        assert_eq!(collector.config().batch_size, 20);
    }
}
