//! 🧪 An STS that lives in RAM and says yes to everyone.
//!
//! [`InMemoryAssumer`] mints fake credentials (`ASIAMEM1`, `ASIAMEM2`, ...) and writes
//! down every hop it was asked to make, including whose credentials the caller was
//! wearing at the time. Tests read that ledger to prove the chain walked in order
//! and only walked once. It can be told to fail the next hop, and it can be told
//! to dawdle, which is how the single-flight tests get a wide enough window for
//! sixteen callers to pile up behind one walk.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::credentials::{AssumeRoleRequest, CredentialSet, RoleAssumer};

/// 📝 One hop, as the fake STS saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedHop {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: String,
    pub duration_secs: u32,
    /// 🎩 Key id of the credentials the caller presented. `None` means ambient.
    pub prior_access_key_id: Option<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    hops: Vec<AssumedHop>,
    scripted_failures: VecDeque<String>,
    minted: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAssumer {
    ledger: Arc<Mutex<Ledger>>,
    delay: Duration,
}

impl InMemoryAssumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🐌 Every hop sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// 💣 The next hop fails with `message`.
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.ledger
            .lock()
            .await
            .scripted_failures
            .push_back(message.into());
    }

    pub async fn hops(&self) -> Vec<AssumedHop> {
        self.ledger.lock().await.hops.clone()
    }
}

#[async_trait]
impl RoleAssumer for InMemoryAssumer {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
        prior: Option<&CredentialSet>,
    ) -> Result<CredentialSet> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut the_ledger = self.ledger.lock().await;
        if let Some(the_failure) = the_ledger.scripted_failures.pop_front() {
            return Err(anyhow!(the_failure));
        }
        the_ledger.hops.push(AssumedHop {
            role_arn: request.role_arn.to_string(),
            session_name: request.session_name.to_string(),
            external_id: request.external_id.to_string(),
            duration_secs: request.duration_secs,
            prior_access_key_id: prior.map(|creds| creds.access_key_id.clone()),
        });
        the_ledger.minted += 1;
        let the_serial = the_ledger.minted;
        Ok(CredentialSet {
            access_key_id: format!("ASIAMEM{the_serial}"),
            secret_access_key: format!("in-memory-secret-{the_serial}"),
            session_token: format!("in-memory-token-{the_serial}"),
            expiry: Some(SystemTime::now() + Duration::from_secs(u64::from(request.duration_secs))),
        })
    }
}
