//! The multi-threaded batch producer pipeline.
//!
//! A [`BatchPipeline`] runs `num_workers` producer threads that claim batch jobs from a
//! shared counter, build them with a [`BatchSampler`] and push them into a bounded
//! channel of capacity `prefetch`. Job `n` is batch `n % batches_per_epoch` of epoch
//! `n / batches_per_epoch`.
//!
//! Batches arrive in whatever order the workers finish them, and the consumer side puts
//! them back into job order. Since every batch is a pure function of its job number,
//! the sequence of batches seen by the training loop does not depend on the number of
//! workers. Producers only claim jobs less than `prefetch` ahead of the next job the
//! consumer needs, which bounds the reorder buffer even when one job is slow.
//!
//! Producers stop when the shared [`CancellationToken`] is cancelled, when the job
//! budget (`max_epochs`) is used up, after reporting an error, or when the pipeline is
//! dropped.

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::sampler::{BatchSampler, SampledBatch};
use crate::BasenjiError;

/// A cooperative cancellation flag, shared between the training loop, the producers and
/// whoever wants to stop them (e.g. a signal handler).
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel once `signal` completes, e.g. `tokio::signal::ctrl_c()`. The signal is
    /// awaited on a background thread running its own single-threaded runtime; a signal
    /// that fails is logged and never cancels.
    pub fn cancel_on<F>(&self, signal: F) -> Result<JoinHandle<()>, BasenjiError>
    where
        F: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let token = self.clone();
        let handle = thread::Builder::new()
            .name("cancel-on-signal".to_string())
            .spawn(move || match runtime.block_on(signal) {
                Ok(()) => {
                    warn!("interrupted: stopping after the current step");
                    token.cancel();
                }
                Err(e) => error!(error = %e, "cannot listen for the interrupt signal"),
            })?;
        Ok(handle)
    }
}

fn default_num_workers() -> usize {
    2
}

fn default_prefetch() -> usize {
    8
}

/// Settings of a [`BatchPipeline`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// The capacity of the batch channel.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Stop producing after this many epochs; `None` produces until cancelled.
    #[serde(default)]
    pub max_epochs: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            prefetch: default_prefetch(),
            max_epochs: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), BasenjiError> {
        if self.num_workers == 0 || self.prefetch == 0 {
            return Err(BasenjiError::InvalidConfig(
                "num_workers and prefetch must be greater than zero".to_string(),
            ));
        }
        if self.max_epochs == Some(0) {
            return Err(BasenjiError::InvalidConfig(
                "max_epochs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Anything the training loop can pull batches from.
pub trait BatchSource {
    /// The next batch, or `None` once the source is exhausted.
    fn next_batch(&mut self) -> Result<Option<SampledBatch>, BasenjiError>;
}

impl BatchSource for std::vec::IntoIter<SampledBatch> {
    fn next_batch(&mut self) -> Result<Option<SampledBatch>, BasenjiError> {
        Ok(self.next())
    }
}

type Job = (u64, Result<SampledBatch, BasenjiError>);

/// How long a producer that is `prefetch` jobs ahead waits before checking again; the
/// consumer also wakes producers whenever it advances.
const LOOKAHEAD_WAIT: Duration = Duration::from_millis(20);

/// Producer threads feeding a bounded channel; see the module documentation.
pub struct BatchPipeline {
    receiver: Option<Receiver<Job>>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    token: CancellationToken,
    pending: BTreeMap<u64, Result<SampledBatch, BasenjiError>>,
    next_job: u64,
    consumed: Arc<AtomicU64>,
    claimed: Arc<AtomicU64>,
    total_jobs: Option<u64>,
}

impl std::fmt::Debug for BatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPipeline")
            .field("workers", &self.workers.len())
            .field("next_job", &self.next_job)
            .field("claimed", &self.claimed.load(Ordering::SeqCst))
            .field("buffered", &self.pending.len())
            .field("total_jobs", &self.total_jobs)
            .finish_non_exhaustive()
    }
}

impl BatchPipeline {
    /// Start the producer threads.
    pub fn spawn(
        sampler: Arc<BatchSampler>,
        config: &PipelineConfig,
        token: CancellationToken,
    ) -> Result<Self, BasenjiError> {
        Self::spawn_from(sampler, config, token, 0)
    }

    /// Start the producer threads at batch job `first_job`, skipping the batches a
    /// resumed run has already consumed.
    pub fn spawn_from(
        sampler: Arc<BatchSampler>,
        config: &PipelineConfig,
        token: CancellationToken,
        first_job: u64,
    ) -> Result<Self, BasenjiError> {
        config.validate()?;
        let batches_per_epoch = sampler.num_batches() as u64;
        let total_jobs = config
            .max_epochs
            .map(|epochs| epochs as u64 * batches_per_epoch);

        let (sender, receiver) = bounded(config.prefetch);
        let counter = Arc::new(AtomicU64::new(first_job));
        let consumed = Arc::new(AtomicU64::new(first_job));
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let producer = Producer {
                sampler: Arc::clone(&sampler),
                sender: sender.clone(),
                counter: Arc::clone(&counter),
                consumed: Arc::clone(&consumed),
                lookahead: config.prefetch as u64,
                stop: Arc::clone(&stop),
                token: token.clone(),
                batches_per_epoch,
                total_jobs,
            };
            let handle = thread::Builder::new()
                .name(format!("batch-producer-{}", worker_id))
                .spawn(move || producer.run())?;
            workers.push(handle);
        }
        debug!(
            num_workers = config.num_workers,
            prefetch = config.prefetch,
            batches_per_epoch,
            first_job,
            "started batch pipeline"
        );

        Ok(Self {
            receiver: Some(receiver),
            workers,
            stop,
            token,
            pending: BTreeMap::new(),
            next_job: first_job,
            consumed,
            claimed: counter,
            total_jobs,
        })
    }

    fn advance(&mut self) {
        self.next_job += 1;
        self.consumed.store(self.next_job, Ordering::SeqCst);
        self.wake_workers();
    }

    fn wake_workers(&self) {
        for handle in &self.workers {
            handle.thread().unpark();
        }
    }
}

impl BatchSource for BatchPipeline {
    fn next_batch(&mut self) -> Result<Option<SampledBatch>, BasenjiError> {
        loop {
            if let Some(result) = self.pending.remove(&self.next_job) {
                self.advance();
                return result.map(Some);
            }
            if self.total_jobs.map_or(false, |total| self.next_job >= total) {
                return Ok(None);
            }
            let Some(receiver) = &self.receiver else {
                return Ok(None);
            };
            match receiver.recv() {
                Ok((job, result)) => {
                    self.pending.insert(job, result);
                }
                Err(_) if self.token.is_cancelled() => return Err(BasenjiError::Cancelled),
                Err(_) => {
                    return Err(BasenjiError::PipelineDisconnected(format!(
                        "all producers exited before batch job {}",
                        self.next_job
                    )))
                }
            }
        }
    }
}

impl Drop for BatchPipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // dropping the receiver unblocks producers waiting on a full channel
        self.receiver.take();
        self.wake_workers();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Producer {
    sampler: Arc<BatchSampler>,
    sender: Sender<Job>,
    counter: Arc<AtomicU64>,
    /// The next job the consumer needs.
    consumed: Arc<AtomicU64>,
    lookahead: u64,
    stop: Arc<AtomicBool>,
    token: CancellationToken,
    batches_per_epoch: u64,
    total_jobs: Option<u64>,
}

impl Producer {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// Claim the next unclaimed job, waiting while it is `lookahead` or more jobs ahead
    /// of the consumer. `None` once the pipeline stops or the job budget is used up.
    fn claim(&self) -> Option<u64> {
        loop {
            if self.stopped() {
                return None;
            }
            let job = self.counter.load(Ordering::SeqCst);
            if self.total_jobs.map_or(false, |total| job >= total) {
                return None;
            }
            if job >= self.consumed.load(Ordering::SeqCst) + self.lookahead {
                thread::park_timeout(LOOKAHEAD_WAIT);
                continue;
            }
            if self
                .counter
                .compare_exchange(job, job + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(job);
            }
        }
    }

    fn run(self) {
        let mut order: Option<(usize, Vec<usize>)> = None;
        while let Some(job) = self.claim() {
            let epoch = (job / self.batches_per_epoch) as usize;
            let index = (job % self.batches_per_epoch) as usize;

            if order.as_ref().map_or(true, |(e, _)| *e != epoch) {
                order = Some((epoch, self.sampler.epoch_order(epoch)));
            }
            let epoch_order = order.as_ref().map(|(_, o)| o.as_slice()).unwrap_or(&[]);

            let result = catch_unwind(AssertUnwindSafe(|| {
                self.sampler.sample(epoch, index, epoch_order)
            }))
            .unwrap_or_else(|_| {
                Err(BasenjiError::PipelineDisconnected(format!(
                    "producer panicked building batch {} of epoch {}",
                    index, epoch
                )))
            });
            let failed = result.is_err();
            if let Err(e) = &result {
                error!(epoch, index, error = %e, "batch producer failed");
            }
            if self.sender.send((job, result)).is_err() || failed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{sampler::SamplerConfig, AugmentConfig};
    use crate::ranges::windows::WindowIndexer;
    use crate::test_utilities::synthetic_source;

    fn sampler() -> Arc<BatchSampler> {
        let source = Arc::new(synthetic_source(2, 1_000, 64, 8));
        let indexer = WindowIndexer::from_seqlens(source.seqlens(), 64).unwrap();
        let config = SamplerConfig {
            batch_size: 4,
            seed: 5,
            shuffle: true,
            strict: false,
            augment: AugmentConfig {
                reverse_complement: true,
                shifts: vec![-1, 0, 1],
            },
        };
        Arc::new(BatchSampler::new(source, &indexer, config).unwrap())
    }

    fn drain(mut pipeline: BatchPipeline) -> Vec<SampledBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = pipeline.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn test_pipeline_order_independent_of_workers() {
        let sampler = sampler();
        let run = |num_workers| {
            let config = PipelineConfig {
                num_workers,
                prefetch: 2,
                max_epochs: Some(2),
            };
            let pipeline =
                BatchPipeline::spawn(Arc::clone(&sampler), &config, CancellationToken::new())
                    .unwrap();
            drain(pipeline)
        };
        let one = run(1);
        let four = run(4);
        assert_eq!(one.len(), 2 * sampler.num_batches());
        assert_eq!(one.len(), four.len());
        for (a, b) in one.iter().zip(&four) {
            assert_eq!((a.epoch, a.index), (b.epoch, b.index));
            assert_eq!(a.batch, b.batch);
        }
        assert_eq!(one.last().map(|b| b.epoch), Some(1));
    }

    #[test]
    fn test_pipeline_resumes_at_job() {
        let sampler = sampler();
        let config = PipelineConfig {
            num_workers: 3,
            prefetch: 2,
            max_epochs: Some(2),
        };
        let all = drain(
            BatchPipeline::spawn(Arc::clone(&sampler), &config, CancellationToken::new()).unwrap(),
        );
        let first_job = sampler.num_batches() as u64 + 1;
        let rest = drain(
            BatchPipeline::spawn_from(sampler, &config, CancellationToken::new(), first_job)
                .unwrap(),
        );
        assert_eq!(rest.len(), all.len() - first_job as usize);
        for (a, b) in all[first_job as usize..].iter().zip(&rest) {
            assert_eq!((a.epoch, a.index), (b.epoch, b.index));
            assert_eq!(a.batch, b.batch);
        }
    }

    #[test]
    fn test_pipeline_claims_at_most_prefetch_ahead() {
        let config = PipelineConfig {
            num_workers: 6,
            prefetch: 2,
            max_epochs: Some(2),
        };
        let mut pipeline =
            BatchPipeline::spawn_from(sampler(), &config, CancellationToken::new(), 3).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(pipeline.claimed.load(Ordering::SeqCst) <= 3 + 2);

        let mut count = 0;
        while pipeline.next_batch().unwrap().is_some() {
            count += 1;
            let claimed = pipeline.claimed.load(Ordering::SeqCst);
            assert!(
                claimed <= pipeline.next_job + 2,
                "claimed {} at job {}",
                claimed,
                pipeline.next_job
            );
            assert!(pipeline.pending.len() < 2);
        }
        assert_eq!(count as u64, pipeline.total_jobs.unwrap() - 3);
    }

    #[test]
    fn test_pipeline_cancellation() {
        let token = CancellationToken::new();
        let config = PipelineConfig {
            num_workers: 2,
            prefetch: 1,
            max_epochs: None,
        };
        let mut pipeline = BatchPipeline::spawn(sampler(), &config, token.clone()).unwrap();
        assert!(pipeline.next_batch().unwrap().is_some());
        token.cancel();
        // drain what was already produced; then the producers are gone
        let mut result = pipeline.next_batch();
        while let Ok(Some(_)) = result {
            result = pipeline.next_batch();
        }
        assert!(matches!(result, Err(BasenjiError::Cancelled)));
    }

    #[test]
    fn test_cancel_on_signal() {
        use std::io;
        let token = CancellationToken::new();
        let (sender, receiver) = tokio::sync::oneshot::channel::<()>();
        let handle = token
            .cancel_on(async move {
                receiver
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            })
            .unwrap();
        assert!(!token.is_cancelled());
        sender.send(()).unwrap();
        handle.join().unwrap();
        assert!(token.is_cancelled());

        let token = CancellationToken::new();
        let handle = token
            .cancel_on(async { Err(io::Error::new(io::ErrorKind::Other, "no signals")) })
            .unwrap();
        handle.join().unwrap();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_pipeline_config_validation() {
        let config = PipelineConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(BatchPipeline::spawn(sampler(), &config, CancellationToken::new()).is_err());
    }
}
