//! Bounded-concurrency execution of buckets on a worker.
//!
//! A scheduler of parallelism N runs N execution slots. Each slot repeatedly takes a unit from
//! the worker's [ResourceGuard], fetches a bucket, runs it, returns the unit, and reports the
//! result. A slot retires when its source has no more buckets; the scheduler is done once every
//! slot retired.

use std::collections::BTreeSet;
use std::sync::Arc;

use bq_utils::net_protocol::ids::BucketId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::bucket_source::SharedBucketSource;
use crate::client::ClientError;
use crate::liveness::{CompletedSignaler, LiveCount};
use crate::resource_guard::{ResourceError, ResourceGuard};
use crate::results_handler::SharedResultsHandler;
use crate::runner::{execute_bucket, SharedTestRunner};

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("could not fetch the next bucket: {0}")]
    Fetch(#[source] ClientError),

    #[error("could not submit the result of bucket {bucket_id}: {source}")]
    Submit {
        bucket_id: BucketId,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Resources(#[from] ResourceError),
}

/// Buckets currently held by this worker's slots, as listed in heartbeats.
#[derive(Clone, Default)]
pub struct InFlightBuckets(Arc<Mutex<BTreeSet<BucketId>>>);

impl InFlightBuckets {
    fn insert(&self, bucket_id: BucketId) {
        self.0.lock().insert(bucket_id);
    }

    fn remove(&self, bucket_id: BucketId) {
        self.0.lock().remove(&bucket_id);
    }

    pub fn snapshot(&self) -> Vec<BucketId> {
        self.0.lock().iter().copied().collect()
    }
}

pub struct SchedulerConfig {
    /// Number of execution slots.
    pub parallelism: usize,
    /// Units of the resource guard one bucket occupies while it runs.
    pub units_per_bucket: usize,
}

impl SchedulerConfig {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            units_per_bucket: 1,
        }
    }
}

#[derive(Clone)]
struct SlotCtx {
    guard: ResourceGuard,
    units_per_bucket: usize,
    source: SharedBucketSource,
    runner: SharedTestRunner,
    results: SharedResultsHandler,
    in_flight: InFlightBuckets,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchedulerExit {
    pub buckets_run: usize,
    pub errors: Vec<String>,
}

pub struct Scheduler {
    live_count: LiveCount,
    slots: Vec<JoinHandle<SchedulerExit>>,
}

impl Scheduler {
    pub fn start(
        config: SchedulerConfig,
        source: SharedBucketSource,
        runner: SharedTestRunner,
        results: SharedResultsHandler,
        in_flight: InFlightBuckets,
    ) -> Self {
        let SchedulerConfig {
            parallelism,
            units_per_bucket,
        } = config;
        let parallelism = parallelism.max(1);

        let ctx = SlotCtx {
            guard: ResourceGuard::new(parallelism * units_per_bucket.max(1)),
            units_per_bucket: units_per_bucket.max(1),
            source,
            runner,
            results,
            in_flight,
        };

        let (live_count, signal_completed) = LiveCount::new(parallelism);
        tracing::debug!(parallelism, "starting execution slots");

        let slots = (1..=parallelism)
            .map(|slot| tokio::spawn(run_slot(slot, ctx.clone(), signal_completed.clone())))
            .collect();

        Self { live_count, slots }
    }

    /// Number of slots that have not retired yet.
    pub fn live_slots(&self) -> usize {
        self.live_count.read()
    }

    /// Resolves once every slot retired. Cancel-safe.
    pub async fn wait(&mut self) {
        self.live_count.wait().await
    }

    /// Waits for all slots and sums up what they did.
    pub async fn join(mut self) -> SchedulerExit {
        self.wait().await;

        let mut exit = SchedulerExit::default();
        for slot in self.slots.drain(..) {
            match slot.await {
                Ok(slot_exit) => {
                    exit.buckets_run += slot_exit.buckets_run;
                    exit.errors.extend(slot_exit.errors);
                }
                Err(error) => {
                    tracing::error!(%error, "execution slot panicked");
                    exit.errors.push(error.to_string());
                }
            }
        }
        exit
    }
}

async fn run_slot(slot: usize, ctx: SlotCtx, signal_completed: CompletedSignaler) -> SchedulerExit {
    let mut exit = SchedulerExit::default();

    if let Err(error) = slot_loop(slot, &ctx, &mut exit).await {
        tracing::error!(slot, %error, "execution slot failed");
        exit.errors.push(error.to_string());
    }

    signal_completed.completed().await;
    tracing::debug!(slot, buckets_run = exit.buckets_run, "execution slot retired");
    exit
}

async fn slot_loop(slot: usize, ctx: &SlotCtx, exit: &mut SchedulerExit) -> Result<(), WorkError> {
    loop {
        let units = ctx.guard.acquire(ctx.units_per_bucket).await?;

        let claimed = match ctx.source.next_bucket().await? {
            Some(claimed) => claimed,
            None => return Ok(()),
        };
        let bucket_id = claimed.bucket.bucket_id();
        tracing::debug!(slot, ?bucket_id, "running bucket");

        ctx.in_flight.insert(bucket_id);
        let testing_result = execute_bucket(ctx.runner.as_ref(), &claimed.bucket).await;
        drop(units);

        let sent = ctx.results.send_result(&claimed, testing_result).await;
        ctx.in_flight.remove(bucket_id);
        exit.buckets_run += 1;

        if let Err(error) = sent {
            tracing::error!(slot, ?bucket_id, %error, "bucket result was not delivered");
            exit.errors.push(error.to_string());
        }
    }
}
