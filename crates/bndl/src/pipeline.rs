//! 🚂 The Pipeline: admit → convert → (wait) → upload → release.
//!
//! The endpoint hands a validated bundle to [`Pipeline::submit`]. The governor either
//! turns it away on the spot or hands back a slot, and then the bundle gets its own
//! `tokio::spawn`ed task that owns that slot. The HTTP response goes out right away;
//! the decoding and the uploading happen after nobody is watching.
//!
//! 🧠 Knowledge graph:
//! - Timestamps come from [`UniqueClock`]: epoch millis, bumped by one on collision, so two
//!   bundles in the same millisecond still get two storage keys.
//! - The slot lives in the task. Normal return, fatal upload, conversion error, panic:
//!   the slot drops, the counter goes down. Exactly once.
//! - No cross-bundle ordering and no cancellation. Once spawned, a bundle runs to its end.
//!
//! 🦆 The duck rides in the caboose.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::common::{RawBundle, bundle_id_for};
use crate::converter::{BundleMeta, ConverterConfig, convert};
use crate::governor::{AdmissionRejected, Governor, PipelineSlot};
use crate::uploader::{FatalUploadError, UploadReceipt, Uploader};

/// ⏱️ Epoch milliseconds that never repeat within one process.
#[derive(Debug, Default)]
pub struct UniqueClock {
    last: AtomicU64,
}

impl UniqueClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// ⏱️ `max(now, previous + 1)`.
    pub fn next(&self) -> u64 {
        let the_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let mut the_stamp = the_now;
        let _ = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                the_stamp = the_now.max(last + 1);
                Some(the_stamp)
            });
        the_stamp
    }
}

/// 📥 A bundle the endpoint already validated.
#[derive(Debug, Clone)]
pub struct Submission {
    pub raw: RawBundle,
    pub block_number: u64,
    /// 🪪 The JSON-RPC `id`, rendered as text whether it came in as a string or a number.
    pub request_id: String,
    pub referrer: Option<String>,
}

/// ✅ What the submitter's request got stamped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub bundle_id: String,
    pub timestamp: u64,
}

/// 🏁 How a bundle's background task ended.
#[derive(Debug)]
pub enum BundleOutcome {
    Uploaded(UploadReceipt),
    Fatal(FatalUploadError),
    /// 🧨 The converter refused the bundle outright. The endpoint should make this unreachable.
    Unconvertible(String),
}

#[derive(Debug)]
struct PipelineInner {
    governor: Governor,
    converter: ConverterConfig,
    uploader: Uploader,
    upload_delay: Duration,
    clock: UniqueClock,
}

/// 🚂 Cheap to clone. Every clone shares the governor, the clock, and the uploader.
#[derive(Debug, Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(
        governor: Governor,
        converter: ConverterConfig,
        uploader: Uploader,
        upload_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                governor,
                converter,
                uploader,
                upload_delay,
                clock: UniqueClock::new(),
            }),
        }
    }

    pub fn governor(&self) -> &Governor {
        &self.inner.governor
    }

    /// 🎟️ Admit and spawn, or reject without doing anything.
    ///
    /// The returned handle can be dropped; the task keeps running detached.
    pub fn submit(
        &self,
        submission: Submission,
    ) -> Result<(Accepted, JoinHandle<BundleOutcome>), AdmissionRejected> {
        let the_slot = self.inner.governor.try_admit()?;
        let the_accepted = Accepted {
            bundle_id: bundle_id_for(submission.block_number, &submission.request_id),
            timestamp: self.inner.clock.next(),
        };
        debug!(
            bundle_id = %the_accepted.bundle_id,
            txs = submission.raw.transactions.len(),
            in_flight = self.inner.governor.in_flight(),
            "🎟️ bundle admitted"
        );

        let the_inner = Arc::clone(&self.inner);
        let the_meta = BundleMeta {
            bundle_id: the_accepted.bundle_id.clone(),
            timestamp: the_accepted.timestamp,
            referrer: submission.referrer,
        };
        let the_handle = tokio::spawn(run_bundle(the_inner, the_slot, submission.raw, the_meta));
        Ok((the_accepted, the_handle))
    }

    /// 🧹 Wait until nothing is in flight, or `patience` runs out. True if everything finished.
    pub async fn drain(&self, patience: Duration) -> bool {
        let the_deadline = tokio::time::Instant::now() + patience;
        loop {
            let the_in_flight = self.inner.governor.in_flight();
            if the_in_flight == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= the_deadline {
                error!(
                    in_flight = the_in_flight,
                    "🧹 shutdown drain ran out of patience; these bundles are abandoned"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn run_bundle(
    inner: Arc<PipelineInner>,
    slot: PipelineSlot,
    mut raw: RawBundle,
    meta: BundleMeta,
) -> BundleOutcome {
    let the_bundle_id = meta.bundle_id.clone();

    let the_bundle = match convert(&mut raw, meta, &inner.converter).await {
        Ok(bundle) => bundle,
        Err(err) => {
            error!(bundle_id = %the_bundle_id, error = %format!("{err:#}"), "🧨 bundle could not be converted");
            slot.release();
            return BundleOutcome::Unconvertible(format!("{err:#}"));
        }
    };
    drop(raw);

    if !inner.upload_delay.is_zero() {
        tokio::time::sleep(inner.upload_delay).await;
    }

    let the_outcome = match inner.uploader.upload(the_bundle).await {
        Ok(receipt) => BundleOutcome::Uploaded(receipt),
        Err(fatal) => {
            error!(
                bundle_id = %fatal.bundle_id,
                key = %fatal.key,
                attempts = fatal.attempts,
                error = %fatal.last_error,
                "💀 bundle dropped after exhausting upload retries"
            );
            BundleOutcome::Fatal(fatal)
        }
    };
    slot.release();
    info!(
        bundle_id = %the_bundle_id,
        in_flight = inner.governor.in_flight(),
        "🏁 bundle finished"
    );
    the_outcome
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backends::{InMemorySink, SinkFactory};
    use crate::credentials::{AssumerBackend, CredentialChain, CredentialsConfig, InMemoryAssumer};
    use crate::governor::AdmissionConfig;
    use crate::test_fixtures::raw_bundle_of;
    use crate::uploader::UploadConfig;

    fn pipeline_into(sink: &InMemorySink, admission: AdmissionConfig) -> Pipeline {
        let the_chain = CredentialChain::new(
            CredentialsConfig {
                roles_to_assume: vec!["arn:aws:iam::1:role/only".into()],
                ..CredentialsConfig::default()
            },
            AssumerBackend::InMemory(InMemoryAssumer::new()),
            SinkFactory::InMemory(sink.clone()),
        );
        Pipeline::new(
            Governor::new(&admission),
            ConverterConfig::default(),
            Uploader::new(the_chain, &UploadConfig::default()),
            Duration::ZERO,
        )
    }

    fn submission(count: u64, request_id: &str) -> Submission {
        let (raw, _) = raw_bundle_of(count, "100");
        Submission {
            raw,
            block_number: 100,
            request_id: request_id.to_string(),
            referrer: None,
        }
    }

    #[test]
    fn the_one_where_the_clock_never_repeats_itself() {
        let the_clock = UniqueClock::new();
        let the_stamps: Vec<u64> = (0..1_000).map(|_| the_clock.next()).collect();
        let the_unique: HashSet<u64> = the_stamps.iter().copied().collect();
        assert_eq!(the_unique.len(), the_stamps.len());
        assert!(the_stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn the_one_where_a_bundle_rides_all_the_way_to_the_bucket() {
        let the_sink = InMemorySink::new();
        let the_pipeline = pipeline_into(&the_sink, AdmissionConfig::default());

        let (the_accepted, the_handle) = the_pipeline
            .submit(submission(3, "abc"))
            .expect("💀 an empty pipeline should admit");
        assert_eq!(the_accepted.bundle_id, "100_abc");

        let the_outcome = the_handle.await.expect("💀 bundle task panicked");
        let BundleOutcome::Uploaded(the_receipt) = the_outcome else {
            panic!("💀 expected an upload, got {the_outcome:?}");
        };
        assert_eq!(
            the_receipt.key,
            format!("raw_bundles/mevblocker_{}", the_accepted.timestamp)
        );
        let the_objects = the_sink.objects().await;
        let the_json: serde_json::Value =
            serde_json::from_slice(&the_objects[0].body).expect("💀 stored body is JSON");
        assert_eq!(the_json["transactions"].as_array().map(Vec::len), Some(3));
        assert_eq!(the_pipeline.governor().in_flight(), 0);
    }

    #[tokio::test]
    async fn the_one_where_the_same_id_twice_makes_two_objects() {
        let the_sink = InMemorySink::new();
        let the_pipeline = pipeline_into(&the_sink, AdmissionConfig::default());

        let (the_first, the_first_handle) = the_pipeline
            .submit(submission(1, "same"))
            .expect("💀 admit");
        let (the_second, the_second_handle) = the_pipeline
            .submit(submission(1, "same"))
            .expect("💀 admit");
        the_first_handle.await.expect("💀 panicked");
        the_second_handle.await.expect("💀 panicked");

        assert_eq!(the_first.bundle_id, the_second.bundle_id);
        assert_ne!(the_first.timestamp, the_second.timestamp);
        let the_keys: HashSet<String> = the_sink
            .objects()
            .await
            .into_iter()
            .map(|object| object.key)
            .collect();
        assert_eq!(the_keys.len(), 2);
    }

    #[tokio::test]
    async fn the_one_where_a_full_house_does_no_work() {
        let the_sink = InMemorySink::new();
        let the_pipeline = pipeline_into(&the_sink, AdmissionConfig::default());
        let the_held: Vec<PipelineSlot> = (0..500)
            .map(|_| the_pipeline.governor().try_admit().expect("💀 fill up"))
            .collect();

        let the_rejection = the_pipeline
            .submit(submission(1, "late"))
            .expect_err("💀 the 501st bundle must be rejected");

        assert_eq!(the_rejection.in_flight, 500);
        tokio::task::yield_now().await;
        assert_eq!(the_sink.attempts().await, 0);
        assert_eq!(the_sink.builds().await, 0);
        drop(the_held);
        assert_eq!(the_pipeline.governor().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_doomed_bundle_still_gives_its_slot_back() {
        let the_sink = InMemorySink::new();
        for _ in 0..4 {
            the_sink.fail_next("InternalError").await;
        }
        let the_pipeline = pipeline_into(&the_sink, AdmissionConfig::default());

        let (_, the_handle) = the_pipeline
            .submit(submission(2, "doomed"))
            .expect("💀 admit");
        let the_outcome = the_handle.await.expect("💀 panicked");

        assert!(matches!(the_outcome, BundleOutcome::Fatal(ref fatal) if fatal.attempts == 4));
        assert_eq!(the_pipeline.governor().in_flight(), 0);
        assert!(the_pipeline.drain(Duration::from_secs(1)).await);
    }
}
