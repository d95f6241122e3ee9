//! # Previously, on bndl...
//!
//! 🎬 The bundles needed somewhere to land. S3 was across the ocean. The tests
//! were impatient. So somebody wrote a sink that lives entirely in RAM and
//! forgets everything the moment the process blinks.
//!
//! [`InMemorySink`] records every object it's handed behind an `Arc<Mutex<...>>`
//! so tests can peek at what arrived. It can also be told to fail: queue up an
//! error message with [`InMemorySink::fail_next`] and the next `put_object` returns
//! exactly that error. That's how the uploader tests stage "token expired" without
//! waiting for a token to actually expire.
//!
//! ⚠️ This is NOT for production. `storage.backend = "in_memory"` is for local runs
//! where losing every bundle on restart is a feature.
//!
//! 🦆

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::trace;

use crate::backends::ObjectSink;

/// 📦 One object, as it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct Vault {
    objects: Vec<StoredObject>,
    scripted_failures: VecDeque<String>,
    attempts: usize,
    builds: usize,
}

/// 📦 A sink that never forgets (until the process exits).
///
/// Clone-able because tests need to peek inside after handing a copy to the
/// pipeline. Every clone shares the same vault.
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    vault: Arc<Mutex<Vault>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💣 The next `put_object` fails with `message`. Queue several to fail several in a row.
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.vault
            .lock()
            .await
            .scripted_failures
            .push_back(message.into());
    }

    /// 📋 Everything written so far, in write order.
    pub async fn objects(&self) -> Vec<StoredObject> {
        self.vault.lock().await.objects.clone()
    }

    /// 🔢 Every `put_object` call, successful or not.
    pub async fn attempts(&self) -> usize {
        self.vault.lock().await.attempts
    }

    /// 🏭 How many times a credential chain built a client around this sink.
    pub async fn builds(&self) -> usize {
        self.vault.lock().await.builds
    }

    pub(crate) async fn record_build(&self) {
        self.vault.lock().await.builds += 1;
    }
}

#[async_trait]
impl ObjectSink for InMemorySink {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        let mut the_vault = self.vault.lock().await;
        the_vault.attempts += 1;
        if let Some(the_failure) = the_vault.scripted_failures.pop_front() {
            return Err(anyhow!(the_failure));
        }
        trace!(key, bytes = body.len(), "📦 stashed object in memory");
        the_vault.objects.push(StoredObject {
            key: key.to_string(),
            body,
        });
        Ok(())
    }
}
