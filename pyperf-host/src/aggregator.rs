//! Sample aggregation, standing in for `aggregate_stacks()`'s real job: the
//! cross-process histogram merge spec.md names as an external collaborator.
//! This crate's responsibility ends at "a sample arrived, hand it off" —
//! actually merging stacks into a profile is somebody else's concern.

use pyperf_common::{ErrorSample, Sample};

/// Receives published samples and error records as they drain off the
/// `SAMPLES`/`ERROR_SAMPLES` ring buffers (or, in tests, off the
/// simulator). Implementors decide what "aggregate" means; this crate only
/// guarantees every sample reaches one.
pub trait Aggregator {
    fn record_sample(&mut self, sample: &Sample);
    fn record_error(&mut self, error: &ErrorSample);
}

/// Default aggregator: logs each sample/error at debug level and keeps a
/// running count. Good enough to prove the pipeline end to end; a real
/// deployment would swap this for something that builds a flame graph or
/// ships to a metrics backend.
#[derive(Debug, Default)]
pub struct LoggingAggregator {
    pub samples_seen: u64,
    pub errors_seen: u64,
}

impl LoggingAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for LoggingAggregator {
    fn record_sample(&mut self, sample: &Sample) {
        self.samples_seen += 1;
        log::debug!(
            "pyperf: sample pid={} tid={} frames={} status={:?}",
            sample.pid,
            sample.tid,
            sample.stack.len,
            sample.status(),
        );
    }

    fn record_error(&mut self, error: &ErrorSample) {
        self.errors_seen += 1;
        log::warn!(
            "pyperf: error program_id={} pid={} tid={} message={}",
            error.program_id,
            error.pid,
            error.tid,
            error.message_str(),
        );
    }
}
