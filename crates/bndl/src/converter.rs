//! 🔄 The Streaming Bundle Converter: [`RawBundle`] in, [`StructuredBundle`] out,
//! one bounded batch at a time.
//!
//! 🎬 *[a 50,000 transaction bundle walks into a single-threaded bar]*
//! *[the bartender says "we'll serve you in rounds of 100, and everyone else gets a turn in between"]*
//!
//! Two rules run this module:
//! 1. Never hold the whole raw bundle AND the whole decoded bundle at once. Raw entries
//!    are moved out of the input as they're decoded and dropped right after.
//! 2. Never hog the worker. After every batch we `yield_now()`, and big bundles get
//!    smaller batches so they yield more often. Tail latency for everyone else depends on it.
//!
//! A transaction that won't decode is logged and left out. One bad apple does not
//! get the whole barrel thrown away.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::common::{RawBundle, StructuredBundle};
use crate::decoder::{RevertingHashes, decode_with};

/// 🔧 Batching knobs for the converter.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConverterConfig {
    /// 📦 Transactions decoded between yields for normal-sized bundles.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 🐘 Bundles with more entries than this are "large" and yield more often.
    #[serde(default = "default_large_bundle_threshold")]
    pub large_bundle_threshold: usize,
    /// 🐁 Batch size used once a bundle crosses `large_bundle_threshold`.
    #[serde(default = "default_large_bundle_batch_size")]
    pub large_bundle_batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_large_bundle_threshold() -> usize {
    5_000
}

fn default_large_bundle_batch_size() -> usize {
    50
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            large_bundle_threshold: default_large_bundle_threshold(),
            large_bundle_batch_size: default_large_bundle_batch_size(),
        }
    }
}

impl ConverterConfig {
    /// 📏 The batch size for a bundle of `total` entries. Never zero, because a
    /// batch of zero is an infinite loop wearing a disguise.
    pub fn batch_size_for(&self, total: usize) -> usize {
        let the_size = if total > self.large_bundle_threshold {
            self.large_bundle_batch_size.min(self.batch_size)
        } else {
            self.batch_size
        };
        the_size.max(1)
    }
}

/// 🪪 Everything the converter stamps onto the bundle that didn't come from the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMeta {
    pub bundle_id: String,
    pub timestamp: u64,
    pub referrer: Option<String>,
}

/// 🔄 Decode `raw` into a [`StructuredBundle`], streaming and yielding as it goes.
///
/// On return `raw.transactions` is empty: ownership of the raw data ends here.
/// Fails only if the block number is unparseable, which the endpoint already rules out.
pub async fn convert(
    raw: &mut RawBundle,
    meta: BundleMeta,
    config: &ConverterConfig,
) -> Result<StructuredBundle> {
    let block_number = raw.parsed_block_number().with_context(|| {
        format!(
            "💀 Bundle {} has block number '{}', which is neither decimal nor hex. \
             The endpoint should have caught this. It did not. Awkward.",
            meta.bundle_id, raw.block_number
        )
    })?;

    let the_total = raw.transactions.len();
    let the_batch_size = config.batch_size_for(the_total);
    let reverting = RevertingHashes::new(raw.revert_protected_hashes.iter().flatten());

    let mut the_decoded = Vec::with_capacity(the_total);
    let mut the_dropped = 0usize;
    let mut the_index = 0usize;
    // -- 🚚 move the raw strings out; each one is freed the moment it's decoded
    let mut the_queue = std::mem::take(&mut raw.transactions).into_iter();

    loop {
        let mut took = 0usize;
        while took < the_batch_size {
            let Some(raw_tx) = the_queue.next() else {
                break;
            };
            match decode_with(&raw_tx, &reverting) {
                Ok(tx) => the_decoded.push(tx),
                Err(err) => {
                    the_dropped += 1;
                    warn!(
                        bundle_id = %meta.bundle_id,
                        index = the_index,
                        error = %err,
                        "🗑️ dropping transaction that refused to decode"
                    );
                }
            }
            took += 1;
            the_index += 1;
        }
        if took == 0 {
            break;
        }
        // -- 🤝 let the other bundles have a turn. this is the whole point.
        tokio::task::yield_now().await;
        if the_queue.len() == 0 {
            break;
        }
    }

    debug!(
        bundle_id = %meta.bundle_id,
        decoded = the_decoded.len(),
        dropped = the_dropped,
        batch_size = the_batch_size,
        "🔄 bundle converted"
    );

    Ok(StructuredBundle {
        bundle_id: meta.bundle_id,
        timestamp: meta.timestamp,
        block_number,
        transactions: the_decoded,
        referrer: meta.referrer,
    })
}
