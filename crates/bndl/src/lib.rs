//! 📦 bndl: takes `eth_sendBundle` requests, decodes the signed transactions, and
//! parks every bundle as one JSON object in S3 behind a chain of assumed roles.
//!
//! 🧠 Knowledge graph:
//! - `endpoint` answers fast and hands off to `pipeline`
//! - `pipeline` asks `governor` for a slot, then runs `converter` → `uploader` in its own task
//! - `converter` leans on `decoder` one batch at a time
//! - `uploader` gets its S3 client from `credentials`, which builds it through `backends`
//! - `monitor` watches memory on the side
//!
//! 🦆 The duck is in every module. You just haven't found it yet.

pub mod app_config;
pub mod backends;
pub mod common;
pub mod converter;
pub mod credentials;
pub mod decoder;
pub mod endpoint;
pub mod governor;
pub mod monitor;
pub mod pipeline;
pub mod uploader;

#[cfg(test)]
mod test_fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::backends::{InMemorySink, SinkFactory, StorageBackendKind};
use crate::credentials::{AssumerBackend, CredentialChain, InMemoryAssumer, StsRoleAssumer};
use crate::endpoint::{EndpointState, router};
use crate::governor::Governor;
use crate::monitor::MemoryMonitor;
use crate::pipeline::Pipeline;
use crate::uploader::Uploader;

/// 🎭 Role ARN used when the in-memory backend runs with no roles configured.
const LOCAL_PLACEHOLDER_ROLE: &str = "arn:aws:iam::000000000000:role/bndl-local";

/// 🏗️ Wire every piece together from the config. No sockets, no tasks.
pub fn build_pipeline(config: &AppConfig) -> Pipeline {
    let mut the_credentials = config.credentials.clone();
    let (the_factory, the_assumer) = match config.storage.backend {
        StorageBackendKind::S3 => (
            SinkFactory::from_config(&config.storage),
            AssumerBackend::Sts(StsRoleAssumer::new(
                config.storage.region.clone(),
                config.credentials.sts_endpoint_url.clone(),
            )),
        ),
        StorageBackendKind::InMemory => {
            if the_credentials.roles_to_assume.is_empty() {
                the_credentials.roles_to_assume = vec![LOCAL_PLACEHOLDER_ROLE.to_string()];
            }
            (
                SinkFactory::InMemory(InMemorySink::new()),
                AssumerBackend::InMemory(InMemoryAssumer::new()),
            )
        }
    };

    let the_chain = CredentialChain::new(the_credentials, the_assumer, the_factory);
    Pipeline::new(
        Governor::new(&config.admission),
        config.converter.clone(),
        Uploader::new(the_chain, &config.upload),
        Duration::from_millis(config.upload.upload_delay_ms),
    )
}

/// 🚀 Serve until ctrl-c, then give in-flight bundles a chance to land.
pub async fn run(config: AppConfig) -> Result<()> {
    let the_pipeline = build_pipeline(&config);
    let the_monitor = config
        .monitor
        .enabled
        .then(|| MemoryMonitor::start(&config.monitor, the_pipeline.governor().clone()));

    let the_listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("💀 could not bind '{}'. Is something else already on that port?", config.server.bind_addr))?;
    info!(
        addr = %config.server.bind_addr,
        backend = ?config.storage.backend,
        reject_threshold = config.admission.reject_threshold,
        "🌐 listening for eth_sendBundle"
    );

    let the_state = Arc::new(EndpointState {
        pipeline: the_pipeline.clone(),
        limits: config.server.clone(),
    });
    axum::serve(the_listener, router(the_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("💀 the HTTP server fell over")?;

    info!(
        in_flight = the_pipeline.governor().in_flight(),
        "🧹 no longer accepting bundles, draining"
    );
    let the_patience = Duration::from_secs(config.server.shutdown_drain_secs);
    if the_pipeline.drain(the_patience).await {
        info!("🧹 drained clean");
    }

    if let Some(monitor) = the_monitor {
        monitor.stop().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        // -- no signal handler means no graceful shutdown; keep serving
        warn!(error = %err, "⚠️ could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("🛑 shutdown requested");
}
