//! 📤 The Retrying Uploader: one structured bundle in, one object in the bucket out,
//! or a [`FatalUploadError`] after the retry budget is spent.
//!
//! 🎬 *[the first PUT times out]* *[the second PUT gets "ExpiredToken"]*
//! *[the uploader sighs, throws away the client, rebuilds it, and the third PUT lands]*
//!
//! 🧠 Knowledge graph:
//! - Serialize ONCE, on the blocking pool. The decoded transactions are released right
//!   after, so the JSON body (a refcounted `Bytes`) is the only copy kept for retries.
//! - Attempt = `chain.get_client()` + `put_object`. A failed chain walk burns an attempt too.
//! - Classification is by lowercased error text. Anything smelling of credentials or the
//!   network invalidates the cached client; everything else keeps it.
//! - Backoff: `base * 2^(attempt - 1)`, so 1s, 2s, 4s with the defaults. Four attempts total.
//! - No dead-letter store. The pipeline logs the fatal error and the bundle is gone.
//!
//! ⚠️ At-least-once: a PUT that landed but whose response got lost will be retried
//! under the same key. Same key, same body, so the bucket ends up the same.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::common::StructuredBundle;
use crate::credentials::CredentialChain;

/// 🔧 The `[upload]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// ⏱️ Pause between conversion and upload. Zero in most deployments.
    #[serde(default)]
    pub upload_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_key_prefix() -> String {
    "raw_bundles/mevblocker_".to_string()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            upload_delay_ms: 0,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// 🔁 How many times, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// ⏳ Wait after failed attempt number `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let the_exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << the_exponent)
    }
}

/// 🩺 What a failed attempt means for the cached client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 🗑️ Credentials or connection trouble. Throw the client away.
    Reconnect,
    /// 🤷 Something else. The client is probably fine.
    Keep,
}

const RECONNECT_SMELLS: [&str; 7] = [
    "credential",
    "token",
    "expired",
    "network",
    "timeout",
    "connection",
    "dispatch",
];

/// 🩺 Sniff the whole error chain, lowercased.
pub fn classify(err: &anyhow::Error) -> FailureClass {
    let the_text = format!("{err:#}").to_lowercase();
    if RECONNECT_SMELLS.iter().any(|smell| the_text.contains(smell)) {
        FailureClass::Reconnect
    } else {
        FailureClass::Keep
    }
}

/// 💀 The retry budget is gone and the bundle was not stored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("💀 gave up on bundle {bundle_id} ({key}) after {attempts} attempt(s): {last_error}")]
pub struct FatalUploadError {
    pub bundle_id: String,
    pub key: String,
    pub attempts: u32,
    pub last_error: String,
}

/// ✅ Where the bundle landed and what it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub attempts: u32,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct Uploader {
    chain: CredentialChain,
    policy: RetryPolicy,
    key_prefix: String,
}

impl Uploader {
    pub fn new(chain: CredentialChain, config: &UploadConfig) -> Self {
        Self {
            chain,
            policy: RetryPolicy::from_config(config),
            key_prefix: config.key_prefix.clone(),
        }
    }

    /// 🗝️ `<key_prefix><timestamp>`.
    pub fn key_for(&self, timestamp: u64) -> String {
        format!("{}{}", self.key_prefix, timestamp)
    }

    pub async fn upload(&self, bundle: StructuredBundle) -> Result<UploadReceipt, FatalUploadError> {
        let the_key = self.key_for(bundle.timestamp);
        let the_bundle_id = bundle.bundle_id.clone();
        let the_timestamp = bundle.timestamp;

        let the_body = serialize_and_release(bundle).await.map_err(|err| FatalUploadError {
            bundle_id: the_bundle_id.clone(),
            key: the_key.clone(),
            attempts: 0,
            last_error: format!("{err:#}"),
        })?;

        let mut the_attempt = 0u32;
        loop {
            the_attempt += 1;
            match self.attempt_once(&the_key, the_body.clone(), the_timestamp).await {
                Ok(()) => {
                    info!(
                        bundle_id = %the_bundle_id,
                        key = %the_key,
                        attempt = the_attempt,
                        bytes = the_body.len(),
                        "📤 bundle uploaded"
                    );
                    return Ok(UploadReceipt {
                        key: the_key,
                        attempts: the_attempt,
                        bytes: the_body.len(),
                    });
                }
                Err(err) => {
                    let the_class = classify(&err);
                    if the_class == FailureClass::Reconnect {
                        self.chain.invalidate();
                    }
                    if the_attempt >= self.policy.max_attempts {
                        return Err(FatalUploadError {
                            bundle_id: the_bundle_id,
                            key: the_key,
                            attempts: the_attempt,
                            last_error: format!("{err:#}"),
                        });
                    }
                    let the_delay = self.policy.delay_after(the_attempt);
                    warn!(
                        bundle_id = %the_bundle_id,
                        key = %the_key,
                        attempt = the_attempt,
                        max_attempts = self.policy.max_attempts,
                        reconnect = the_class == FailureClass::Reconnect,
                        retry_in_ms = the_delay.as_millis() as u64,
                        error = %format!("{err:#}"),
                        "🔁 upload attempt failed, backing off"
                    );
                    tokio::time::sleep(the_delay).await;
                }
            }
        }
    }

    async fn attempt_once(&self, key: &str, body: Bytes, timestamp: u64) -> Result<()> {
        let the_client = self.chain.get_client(timestamp).await?;
        the_client.put_object(key, body).await
    }
}

/// 🧊 JSON on the blocking pool, then the decoded transactions are freed.
async fn serialize_and_release(mut bundle: StructuredBundle) -> Result<Bytes> {
    tokio::task::spawn_blocking(move || {
        let the_json = serde_json::to_vec(&bundle);
        bundle.release_transactions();
        debug!(bundle_id = %bundle.bundle_id, "🧊 bundle serialized, transactions released");
        the_json
    })
    .await
    .context("💀 The serializer thread vanished mid-bundle.")?
    .map(Bytes::from)
    .context("💀 A StructuredBundle refused to become JSON. It is made of strings and numbers. How.")
}
