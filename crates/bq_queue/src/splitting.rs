//! Turning a job's configured tests into buckets.

use bq_utils::net_protocol::bucket::{
    Bucket, RunSettings, ScheduleStrategy, TestEntry, TestEntryConfiguration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitContext {
    /// Workers currently able to take work. Zero is treated as one.
    pub available_workers: usize,
}

/// Splits tests sharing one set of run settings into buckets. Every test ends up in exactly one
/// bucket, in the order given.
pub trait BucketSplitter: Send + Sync {
    fn split(&self, tests: Vec<TestEntry>, settings: &RunSettings, ctx: SplitContext)
        -> Vec<Bucket>;
}

pub struct IndividualSplitter;

impl BucketSplitter for IndividualSplitter {
    fn split(&self, tests: Vec<TestEntry>, settings: &RunSettings, _: SplitContext) -> Vec<Bucket> {
        tests
            .into_iter()
            .map(|test| Bucket::new(vec![test], settings.clone()))
            .collect()
    }
}

pub struct UnsplitSplitter;

impl BucketSplitter for UnsplitSplitter {
    fn split(&self, tests: Vec<TestEntry>, settings: &RunSettings, _: SplitContext) -> Vec<Bucket> {
        if tests.is_empty() {
            return vec![];
        }
        vec![Bucket::new(tests, settings.clone())]
    }
}

pub struct FixedBucketSizeSplitter {
    size: usize,
}

impl FixedBucketSizeSplitter {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }
}

impl BucketSplitter for FixedBucketSizeSplitter {
    fn split(&self, tests: Vec<TestEntry>, settings: &RunSettings, _: SplitContext) -> Vec<Bucket> {
        chunked(tests, self.size, settings)
    }
}

/// One bucket per available worker, sizes differing by at most one.
pub struct EquallyDividedSplitter;

impl BucketSplitter for EquallyDividedSplitter {
    fn split(&self, tests: Vec<TestEntry>, settings: &RunSettings, ctx: SplitContext) -> Vec<Bucket> {
        let buckets = ctx.available_workers.max(1).min(tests.len());
        if buckets == 0 {
            return vec![];
        }

        let base = tests.len() / buckets;
        let remainder = tests.len() % buckets;

        let mut tests = tests.into_iter();
        (0..buckets)
            .map(|i| {
                let size = base + usize::from(i < remainder);
                Bucket::new(tests.by_ref().take(size).collect(), settings.clone())
            })
            .collect()
    }
}

fn chunked(tests: Vec<TestEntry>, size: usize, settings: &RunSettings) -> Vec<Bucket> {
    tests
        .chunks(size)
        .map(|chunk| Bucket::new(chunk.to_vec(), settings.clone()))
        .collect()
}

pub fn splitter_for(strategy: ScheduleStrategy) -> Box<dyn BucketSplitter> {
    match strategy {
        ScheduleStrategy::Individual => Box::new(IndividualSplitter),
        ScheduleStrategy::Unsplit => Box::new(UnsplitSplitter),
        ScheduleStrategy::FixedBucketSize(size) => Box::new(FixedBucketSizeSplitter::new(size)),
        ScheduleStrategy::EquallyDivided => Box::new(EquallyDividedSplitter),
    }
}

/// Groups tests by identical run settings, keeping first-seen order of groups and of tests
/// within a group.
pub fn group_by_settings(
    configurations: Vec<TestEntryConfiguration>,
) -> Vec<(RunSettings, Vec<TestEntry>)> {
    let mut groups: Vec<(RunSettings, Vec<TestEntry>)> = Vec::new();
    for TestEntryConfiguration {
        test_entry,
        settings,
    } in configurations
    {
        match groups.iter_mut().find(|(group, _)| *group == settings) {
            Some((_, tests)) => tests.push(test_entry),
            None => groups.push((settings, vec![test_entry])),
        }
    }
    groups
}

/// Splits every settings group with `splitter`.
pub fn split_configurations(
    configurations: Vec<TestEntryConfiguration>,
    splitter: &dyn BucketSplitter,
    ctx: SplitContext,
) -> Vec<Bucket> {
    group_by_settings(configurations)
        .into_iter()
        .flat_map(|(settings, tests)| splitter.split(tests, &settings, ctx))
        .collect()
}
