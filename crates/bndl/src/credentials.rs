//! 🎭🔐 The Credential Chain Manager: hop through a list of IAM roles, end up holding
//! a storage client, and make sure only one caller ever does the hopping at a time.
//!
//! 🎬 COLD OPEN. INT. STS. PEAK TRAFFIC.
//!
//! Forty uploads wake up at once. None of them has a client. Forty callers, forty
//! chains of `AssumeRole`, forty session names, one very confused STS rate limiter.
//! This module exists so that scene never airs. The first caller starts the walk,
//! the other thirty-nine await the very same future, and all forty leave with the
//! same client or the same error.
//!
//! 🧠 Knowledge graph:
//! - [`CredentialChain`]: cheap `Clone`, injected into the uploader. Owns the cache.
//! - Single-flight: a `std::sync::Mutex<ClientState>` holding the cached client and at most
//!   one in-flight walk as a `futures::future::Shared`. The lock is never held across an `.await`.
//! - Walk: hop 1 runs as the ambient identity, hop n as hop n-1. Every hop carries the
//!   external id, session name `<prefix>-<timestamp>`, and the session duration.
//! - [`RoleAssumer`] trait → [`StsRoleAssumer`] / [`InMemoryAssumer`] → [`AssumerBackend`] enum.
//! - The last hop's [`CredentialSet`] goes through [`SinkFactory::build`] into a [`StorageClient`].
//! - A cached client whose credentials expire within a minute is treated as absent.
//!
//! 🦆 The duck assumed a role once. It was "duck". Typecasting is real.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::backends::{ObjectSink, SinkBackend, SinkFactory};

pub mod in_mem;
pub mod sts;

pub use in_mem::{AssumedHop, InMemoryAssumer};
pub use sts::StsRoleAssumer;

/// ⏳ Credentials expiring sooner than this are already dead to us.
const THE_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// 🔧 The `[credentials]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CredentialsConfig {
    /// 🪪 Passed to every hop. Numeric env values are welcome too.
    #[serde(default, deserialize_with = "string_or_number")]
    pub external_id: String,
    /// 🎭 Role ARNs, in hop order. A comma separated string works as well as a list.
    #[serde(default, deserialize_with = "string_or_list")]
    pub roles_to_assume: Vec<String>,
    #[serde(default = "default_session_duration_secs")]
    pub session_duration_secs: u32,
    #[serde(default = "default_session_name_prefix")]
    pub session_name_prefix: String,
    /// 🔀 STS endpoint override for localstack and friends.
    #[serde(default)]
    pub sts_endpoint_url: Option<String>,
}

fn default_session_duration_secs() -> u32 {
    3_600
}

fn default_session_name_prefix() -> String {
    "mevblocker-dune-sync".to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            external_id: String::new(),
            roles_to_assume: Vec::new(),
            session_duration_secs: default_session_duration_secs(),
            session_name_prefix: default_session_name_prefix(),
            sts_endpoint_url: None,
        }
    }
}

impl CredentialsConfig {
    /// 🏷️ `<prefix>-<timestamp>`, shared by every hop of one walk.
    pub fn session_name(&self, timestamp: u64) -> String {
        format!("{}-{}", self.session_name_prefix, timestamp)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseScalar {
    Text(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl fmt::Display for LooseScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LooseScalar::Text(text) => f.write_str(text),
            LooseScalar::Unsigned(n) => write!(f, "{n}"),
            LooseScalar::Signed(n) => write!(f, "{n}"),
            LooseScalar::Float(n) => write!(f, "{n}"),
        }
    }
}

// -- env values like EXTERNAL_ID=123456 arrive as numbers. they are still ids.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(LooseScalar::deserialize(deserializer)?.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(LooseScalar),
    Many(Vec<LooseScalar>),
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let the_items = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(one) => vec![one.to_string()],
        OneOrMany::Many(many) => many.iter().map(ToString::to_string).collect(),
    };
    Ok(the_items
        .iter()
        .flat_map(|item| item.split(','))
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect())
}

/// 🔐 Short-lived credentials from one hop of the chain.
///
/// Never logged: the `Debug` impl keeps the key id and hides the rest.
/// Superseded by the next walk, never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiry: Option<SystemTime>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &"** redacted **")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl CredentialSet {
    #[cfg(test)]
    pub(crate) fn for_tests(access_key_id: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: "test-secret".into(),
            session_token: "test-token".into(),
            expiry: Some(SystemTime::now() + Duration::from_secs(3_600)),
        }
    }
}

/// 📨 One `AssumeRole` call's worth of parameters.
#[derive(Debug, Clone, Copy)]
pub struct AssumeRoleRequest<'a> {
    pub role_arn: &'a str,
    pub session_name: &'a str,
    pub external_id: &'a str,
    pub duration_secs: u32,
}

/// 🎭 Trade the credentials you have for the credentials of `request.role_arn`.
///
/// `prior` is `None` on the first hop, meaning "whoever the process already is".
#[async_trait]
pub trait RoleAssumer: fmt::Debug + Send + Sync {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
        prior: Option<&CredentialSet>,
    ) -> Result<CredentialSet>;
}

#[derive(Debug, Clone)]
pub enum AssumerBackend {
    Sts(StsRoleAssumer),
    InMemory(InMemoryAssumer),
}

#[async_trait]
impl RoleAssumer for AssumerBackend {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
        prior: Option<&CredentialSet>,
    ) -> Result<CredentialSet> {
        match self {
            AssumerBackend::Sts(assumer) => assumer.assume_role(request, prior).await,
            AssumerBackend::InMemory(assumer) => assumer.assume_role(request, prior).await,
        }
    }
}

/// 🪣 A storage backend bound to one chain walk's credentials. Cheap to clone,
/// shared by every upload until someone invalidates it.
#[derive(Debug, Clone)]
pub struct StorageClient {
    sink: Arc<SinkBackend>,
    expires_at: Option<SystemTime>,
}

impl StorageClient {
    pub async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.sink.put_object(key, body).await
    }

    /// 🪞 True when both handles point at the very same client.
    pub fn same_client_as(&self, other: &StorageClient) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }

    fn is_fresh_at(&self, now: SystemTime) -> bool {
        self.expires_at
            .is_none_or(|expiry| expiry > now + THE_EXPIRY_MARGIN)
    }
}

/// 🧵 An in-flight walk's outcome. The error is in an `Arc` because every waiter gets a copy.
type WalkOutcome = std::result::Result<StorageClient, Arc<anyhow::Error>>;
type InFlightWalk = Shared<BoxFuture<'static, WalkOutcome>>;

#[derive(Default)]
struct ClientState {
    cached: Option<StorageClient>,
    in_flight: Option<(u64, InFlightWalk)>,
    generation: u64,
}

struct ChainInner {
    config: CredentialsConfig,
    assumer: AssumerBackend,
    factory: SinkFactory,
    state: Mutex<ClientState>,
}

/// 💀 A failed walk, shared by every caller that was waiting on it.
#[derive(Debug, thiserror::Error)]
#[error("{0:#}")]
pub struct ChainWalkError(Arc<anyhow::Error>);

/// 🎭🔐 The injectable credential-chain manager.
#[derive(Clone)]
pub struct CredentialChain {
    inner: Arc<ChainInner>,
}

impl fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let the_state = self.state();
        f.debug_struct("CredentialChain")
            .field("roles", &self.inner.config.roles_to_assume.len())
            .field("cached", &the_state.cached.is_some())
            .field("in_flight", &the_state.in_flight.is_some())
            .finish()
    }
}

impl CredentialChain {
    pub fn new(config: CredentialsConfig, assumer: AssumerBackend, factory: SinkFactory) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                config,
                assumer,
                factory,
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    // -- a panic while holding this lock can't leave ClientState half-written, so poison is ignored
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 🔑 The cached client, or the outcome of the one walk currently in flight,
    /// or the outcome of a walk this call starts. `timestamp` only names the session.
    pub async fn get_client(&self, timestamp: u64) -> Result<StorageClient> {
        let (the_generation, the_walk) = {
            let mut the_state = self.state();
            let the_now = SystemTime::now();
            if let Some(client) = the_state.cached.as_ref().filter(|c| c.is_fresh_at(the_now)) {
                return Ok(client.clone());
            }
            if the_state.cached.take().is_some() {
                debug!("⏳ cached storage client is about to expire, walking the chain again");
            }
            match &the_state.in_flight {
                Some((generation, walk)) => (*generation, walk.clone()),
                None => {
                    the_state.generation += 1;
                    let the_generation = the_state.generation;
                    let the_walk = walk_chain(
                        self.inner.config.clone(),
                        self.inner.assumer.clone(),
                        self.inner.factory.clone(),
                        timestamp,
                    )
                    .map(|outcome| outcome.map_err(Arc::new))
                    .boxed()
                    .shared();
                    the_state.in_flight = Some((the_generation, the_walk.clone()));
                    (the_generation, the_walk)
                }
            }
        };

        let the_outcome = the_walk.await;

        {
            let mut the_state = self.state();
            let is_ours = matches!(
                &the_state.in_flight,
                Some((generation, _)) if *generation == the_generation
            );
            if is_ours {
                the_state.in_flight = None;
                if let Ok(client) = &the_outcome {
                    the_state.cached = Some(client.clone());
                }
            }
        }

        the_outcome.map_err(|err| anyhow::Error::new(ChainWalkError(err)))
    }

    /// 🗑️ Forget the cached client. The next `get_client` walks the chain again.
    pub fn invalidate(&self) {
        let mut the_state = self.state();
        if the_state.cached.take().is_some() {
            info!("🗑️ storage client invalidated, next upload rebuilds it");
        }
    }
}

async fn walk_chain(
    config: CredentialsConfig,
    assumer: AssumerBackend,
    factory: SinkFactory,
    timestamp: u64,
) -> Result<StorageClient> {
    let the_session_name = config.session_name(timestamp);
    let the_total = config.roles_to_assume.len();
    let mut the_credentials: Option<CredentialSet> = None;

    for (index, role_arn) in config.roles_to_assume.iter().enumerate() {
        debug!(hop = index + 1, of = the_total, role_arn = %role_arn, "🎭 assuming role");
        let the_request = AssumeRoleRequest {
            role_arn,
            session_name: &the_session_name,
            external_id: &config.external_id,
            duration_secs: config.session_duration_secs,
        };
        let the_next = assumer
            .assume_role(&the_request, the_credentials.as_ref())
            .await
            .with_context(|| {
                format!(
                    "💀 Hop {}/{} of the role chain ({role_arn}) failed. \
                     Every hop after it never happened.",
                    index + 1,
                    the_total
                )
            })?;
        the_credentials = Some(the_next);
    }

    let the_final = the_credentials.context(
        "💀 roles_to_assume is empty. A chain with no links cannot produce credentials.",
    )?;
    let the_sink = factory
        .build(&the_final)
        .await
        .context("💀 The role chain worked, then building the storage client did not.")?;

    info!(hops = the_total, session_name = %the_session_name, "🔐 storage client ready");

    Ok(StorageClient {
        sink: Arc::new(the_sink),
        expires_at: the_final.expiry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemorySink;

    fn two_hop_config() -> CredentialsConfig {
        CredentialsConfig {
            external_id: "the-external-id".into(),
            roles_to_assume: vec![
                "arn:aws:iam::111111111111:role/first".into(),
                "arn:aws:iam::222222222222:role/second".into(),
            ],
            ..CredentialsConfig::default()
        }
    }

    fn in_memory_chain(
        config: CredentialsConfig,
        assumer: &InMemoryAssumer,
        sink: &InMemorySink,
    ) -> CredentialChain {
        CredentialChain::new(
            config,
            AssumerBackend::InMemory(assumer.clone()),
            SinkFactory::InMemory(sink.clone()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_sixteen_callers_share_one_walk() -> Result<()> {
        let the_assumer = InMemoryAssumer::with_delay(Duration::from_millis(50));
        let the_sink = InMemorySink::new();
        let the_chain = in_memory_chain(two_hop_config(), &the_assumer, &the_sink);

        let the_handles: Vec<_> = (0..16u64)
            .map(|n| {
                let the_chain = the_chain.clone();
                tokio::spawn(async move { the_chain.get_client(1_000 + n).await })
            })
            .collect();
        let mut the_clients = Vec::new();
        for handle in the_handles {
            the_clients.push(handle.await.expect("💀 task panicked")?);
        }

        assert_eq!(the_assumer.hops().await.len(), 2, "exactly one walk of two hops");
        assert_eq!(the_sink.builds().await, 1);
        assert!(
            the_clients
                .iter()
                .all(|client| client.same_client_as(&the_clients[0]))
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_each_hop_wears_the_previous_hats() -> Result<()> {
        let the_assumer = InMemoryAssumer::new();
        let the_sink = InMemorySink::new();
        let the_chain = in_memory_chain(two_hop_config(), &the_assumer, &the_sink);

        the_chain.get_client(1_700_000_000_000).await?;

        let the_hops = the_assumer.hops().await;
        assert_eq!(the_hops[0].role_arn, "arn:aws:iam::111111111111:role/first");
        assert_eq!(the_hops[0].prior_access_key_id, None);
        assert_eq!(the_hops[1].role_arn, "arn:aws:iam::222222222222:role/second");
        assert_eq!(
            the_hops[1].prior_access_key_id.as_deref(),
            Some("ASIAMEM1"),
            "hop two must run as hop one"
        );
        for hop in &the_hops {
            assert_eq!(hop.session_name, "mevblocker-dune-sync-1700000000000");
            assert_eq!(hop.external_id, "the-external-id");
            assert_eq!(hop.duration_secs, 3_600);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_a_failed_walk_fails_everyone_then_clears() -> Result<()> {
        let the_assumer = InMemoryAssumer::with_delay(Duration::from_millis(50));
        the_assumer.fail_next("AccessDenied: not today").await;
        let the_sink = InMemorySink::new();
        let the_chain = in_memory_chain(two_hop_config(), &the_assumer, &the_sink);

        let the_handles: Vec<_> = (0..8u64)
            .map(|n| {
                let the_chain = the_chain.clone();
                tokio::spawn(async move { the_chain.get_client(n).await })
            })
            .collect();
        let mut the_errors = Vec::new();
        for handle in the_handles {
            let the_outcome = handle.await.expect("💀 task panicked");
            the_errors.push(format!("{:#}", the_outcome.expect_err("💀 the walk was scripted to fail")));
        }

        assert!(the_errors.iter().all(|err| err.contains("AccessDenied")));
        assert!(the_errors.iter().all(|err| err == &the_errors[0]), "everyone sees the same error");
        assert_eq!(the_sink.builds().await, 0);

        // -- 🔁 the failure is not cached; the next caller starts a fresh walk
        the_chain.get_client(99).await?;
        assert_eq!(the_sink.builds().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_invalidate_forces_a_rebuild() -> Result<()> {
        let the_assumer = InMemoryAssumer::new();
        let the_sink = InMemorySink::new();
        let the_chain = in_memory_chain(two_hop_config(), &the_assumer, &the_sink);

        let the_first = the_chain.get_client(1).await?;
        let the_cached = the_chain.get_client(2).await?;
        assert!(the_first.same_client_as(&the_cached));
        assert_eq!(the_sink.builds().await, 1);

        the_chain.invalidate();
        let the_rebuilt = the_chain.get_client(3).await?;

        assert!(!the_first.same_client_as(&the_rebuilt));
        assert_eq!(the_sink.builds().await, 2);
        assert_eq!(the_assumer.hops().await.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_nearly_expired_credentials_do_not_count() -> Result<()> {
        let the_assumer = InMemoryAssumer::new();
        let the_sink = InMemorySink::new();
        let the_config = CredentialsConfig {
            session_duration_secs: 30,
            ..two_hop_config()
        };
        let the_chain = in_memory_chain(the_config, &the_assumer, &the_sink);

        the_chain.get_client(1).await?;
        the_chain.get_client(2).await?;

        assert_eq!(the_sink.builds().await, 2, "a 30s session is inside the expiry margin");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_no_roles_means_no_client() {
        let the_assumer = InMemoryAssumer::new();
        let the_sink = InMemorySink::new();
        let the_chain = in_memory_chain(CredentialsConfig::default(), &the_assumer, &the_sink);

        let the_error = the_chain
            .get_client(1)
            .await
            .expect_err("💀 zero roles cannot produce a client");
        assert!(format!("{the_error:#}").contains("roles_to_assume is empty"));
    }

    #[test]
    fn the_one_where_secrets_stay_out_of_debug_output() {
        let the_debug = format!("{:?}", CredentialSet::for_tests("ASIAVISIBLE"));
        assert!(the_debug.contains("ASIAVISIBLE"));
        assert!(!the_debug.contains("test-secret"));
        assert!(!the_debug.contains("test-token"));
    }

    #[test]
    fn the_one_where_env_shaped_values_still_parse() {
        let the_config: CredentialsConfig = serde_json::from_str(
            r#"{"external_id": 123456, "roles_to_assume": "arn:a, arn:b,,"}"#,
        )
        .expect("💀 numeric external id and comma separated roles should parse");
        assert_eq!(the_config.external_id, "123456");
        assert_eq!(the_config.roles_to_assume, vec!["arn:a", "arn:b"]);

        let the_listed: CredentialsConfig =
            serde_json::from_str(r#"{"roles_to_assume": ["arn:x", "arn:y"]}"#)
                .expect("💀 a plain list of roles should parse");
        assert_eq!(the_listed.roles_to_assume, vec!["arn:x", "arn:y"]);
        assert_eq!(the_listed.session_name(7), "mevblocker-dune-sync-7");
    }
}
