//! 🔌 Backends: where the bytes finally leave the building.
//!
//! 🕳️ One job, one trait. An [`ObjectSink`] takes a key and a body and makes them
//! durable somewhere. It doesn't retry, it doesn't decide when a client is stale,
//! it doesn't serialize anything. The uploader does all of that. A sink is a
//! postal worker: it delivers the envelope without reading it.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait → concrete impls ([`S3Sink`], [`InMemorySink`]) → [`SinkBackend`] enum
//! - [`SinkFactory`]: turns a fresh [`CredentialSet`] into a [`SinkBackend`]. The credential
//!   chain calls it once per chain walk, never per upload.
//! - [`StorageConfig`]: the `[storage]` section lives here too, so callers can say
//!   `backends::StorageConfig` without spelunking.
//!
//! Ancient proverb: "He who puts retry logic in the sink, retries twice as often as he thinks."
//!
//! 🦆

use anyhow::Result;
use async_trait::async_trait;
use aws_config::Region;
use aws_config::meta::region::RegionProviderChain;
use bytes::Bytes;
use serde::Deserialize;

use crate::credentials::CredentialSet;

pub mod in_mem;
pub mod s3;

pub use in_mem::{InMemorySink, StoredObject};
pub use s3::S3Sink;

/// 🌍 Used by every AWS client we build.
const THE_FALLBACK_REGION: &str = "us-east-1";

/// 🌍 Explicit region, then the ambient provider chain (env, profile, IMDS), then `us-east-1`.
///
/// STS and S3 both resolve through this, so a deployment that never set `AWS_REGION`
/// still signs its requests.
pub(crate) fn region_chain(explicit: Option<&str>) -> RegionProviderChain {
    RegionProviderChain::first_try(explicit.map(|region| Region::new(region.to_string())))
        .or_default_provider()
        .or_else(Region::new(THE_FALLBACK_REGION))
}

/// 🕳️ Writes one object. I/O only.
///
/// # Contract 📜
/// - `put_object` is a single logical write of `body` at `key`. It either lands whole or errors.
/// - `&self`, not `&mut self`: one sink is shared by every in-flight upload.
/// - Errors carry the backend's full message. The uploader classifies them by text,
///   so swallowing detail here breaks client invalidation upstream.
#[async_trait]
pub trait ObjectSink: std::fmt::Debug + Send + Sync {
    /// 📡 Put `body` at `key`.
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;
}

/// 🎭 The many faces of a sink.
///
/// The enum dispatches `put_object` to whichever concrete sink is inside, keeping
/// the uploader blissfully ignorant of whether it's talking to S3 or to a Vec.
/// Ignorance is a feature. It's called "abstraction."
#[derive(Debug)]
pub enum SinkBackend {
    S3(S3Sink),
    InMemory(InMemorySink),
}

#[async_trait]
impl ObjectSink for SinkBackend {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        match self {
            SinkBackend::S3(sink) => sink.put_object(key, body).await,
            SinkBackend::InMemory(sink) => sink.put_object(key, body).await,
        }
    }
}

/// 🏭 Builds a [`SinkBackend`] bound to a specific set of credentials.
#[derive(Debug, Clone)]
pub enum SinkFactory {
    S3(StorageConfig),
    InMemory(InMemorySink),
}

impl SinkFactory {
    /// 🏗️ Pick the factory the config asks for. The in-memory flavor gets a fresh, empty sink.
    pub fn from_config(config: &StorageConfig) -> Self {
        match config.backend {
            StorageBackendKind::S3 => SinkFactory::S3(config.clone()),
            StorageBackendKind::InMemory => SinkFactory::InMemory(InMemorySink::new()),
        }
    }

    pub async fn build(&self, credentials: &CredentialSet) -> Result<SinkBackend> {
        match self {
            SinkFactory::S3(config) => Ok(SinkBackend::S3(
                S3Sink::connect(config, credentials).await?,
            )),
            SinkFactory::InMemory(sink) => {
                sink.record_build().await;
                Ok(SinkBackend::InMemory(sink.clone()))
            }
        }
    }
}

/// 🗂️ Which storage backend `[storage]` describes.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    S3,
    /// 🧪 Keeps objects in RAM. Tests and local runs only, unless you enjoy losing data.
    InMemory,
}

/// 🪣 The `[storage]` section: where bundles land and how hard we try to get them there.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default)]
    pub bucket_name: String,
    /// 🌍 `None` falls back to the ambient AWS region chain.
    #[serde(default)]
    pub region: Option<String>,
    /// 🔀 S3-compatible endpoint override (minio, localstack, a wiremock in a test).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    /// 🧩 Bodies above this size go multipart. S3 won't take parts under 5 MiB anyway.
    #[serde(default = "default_part_size_bytes")]
    pub part_size_bytes: usize,
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// 🔁 Transport-level retries inside the SDK. These stack with the uploader's own attempts.
    #[serde(default = "default_transport_max_attempts")]
    pub transport_max_attempts: u32,
}

fn default_part_size_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_part_concurrency() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_socket_timeout_ms() -> u64 {
    30_000
}

fn default_transport_max_attempts() -> u32 {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            bucket_name: String::new(),
            region: None,
            endpoint_url: None,
            force_path_style: false,
            part_size_bytes: default_part_size_bytes(),
            part_concurrency: default_part_concurrency(),
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            transport_max_attempts: default_transport_max_attempts(),
        }
    }
}
