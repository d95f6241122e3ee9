//! 🚦 The Admission Governor: the bouncer at the door of the pipeline.
//!
//! One atomic counter of bundles in flight. Under `warn_threshold`, come on in.
//! Between the thresholds, come on in, but we're writing your name down.
//! At `reject_threshold`, the club is full, try again after `Retry-After`.
//!
//! Admission hands back a [`PipelineSlot`]. The slot gives the count back when it
//! drops, so every exit path (success, fatal upload, panic unwind, a task that got
//! aborted) releases exactly once. Nobody has to remember to call anything.
//!
//! 🦆 The duck has been in flight since 2019. The duck does not count.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use tracing::warn;

/// 🔧 Thresholds for the governor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// ⚠️ At or above this many bundles in flight, admissions are logged as warnings.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: usize,
    /// 🛑 At or above this many bundles in flight, new bundles are turned away.
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: usize,
}

fn default_warn_threshold() -> usize {
    100
}

fn default_reject_threshold() -> usize {
    500
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            reject_threshold: default_reject_threshold(),
        }
    }
}

/// 🛑 The pipeline is saturated. The request did no work and holds no slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pipeline saturated: {in_flight} bundles in flight, limit is {limit}")]
pub struct AdmissionRejected {
    pub in_flight: usize,
    pub limit: usize,
}

#[derive(Debug)]
struct Counter {
    in_flight: AtomicUsize,
    warn_threshold: usize,
    reject_threshold: usize,
}

/// 🚦 Cheap to clone; every clone shares the same counter.
#[derive(Debug, Clone)]
pub struct Governor {
    counter: Arc<Counter>,
}

impl Governor {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            counter: Arc::new(Counter {
                in_flight: AtomicUsize::new(0),
                warn_threshold: config.warn_threshold,
                reject_threshold: config.reject_threshold,
            }),
        }
    }

    /// 🎟️ Check-and-increment in one atomic step. Two racing requests can't both
    /// squeeze through the last seat.
    pub fn try_admit(&self) -> Result<PipelineSlot, AdmissionRejected> {
        let the_limit = self.counter.reject_threshold;
        let the_previous = self
            .counter
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < the_limit).then_some(current + 1)
            })
            .map_err(|current| AdmissionRejected {
                in_flight: current,
                limit: the_limit,
            })?;

        if the_previous >= self.counter.warn_threshold {
            warn!(
                in_flight = the_previous + 1,
                warn_threshold = self.counter.warn_threshold,
                reject_threshold = the_limit,
                "🚦 pipeline is getting crowded"
            );
        }

        Ok(PipelineSlot {
            counter: Arc::clone(&self.counter),
        })
    }

    /// 📊 Bundles currently between admission and their terminal outcome.
    pub fn in_flight(&self) -> usize {
        self.counter.in_flight.load(Ordering::Acquire)
    }
}

/// 🎟️ Proof of admission. Dropping it is the release.
#[derive(Debug)]
#[must_use = "dropping a PipelineSlot releases it immediately"]
pub struct PipelineSlot {
    counter: Arc<Counter>,
}

impl PipelineSlot {
    /// 👋 The explicit spelling of `drop(slot)`.
    pub fn release(self) {}
}

impl Drop for PipelineSlot {
    fn drop(&mut self) {
        // -- saturating: a slot can only exist if it incremented, but zero is a hard floor regardless
        let _ = self
            .counter
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }
}
