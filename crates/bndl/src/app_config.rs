//! 🔧 App Configuration: the sacred env-and-TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. In BUCKET_NAME. Nothing." said every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, layered lowest to highest:
//! 1. serde defaults (every section and knob has one)
//! 2. the flat env vars the service has always been deployed with
//!    (`BUCKET_NAME`, `EXTERNAL_ID`, `ROLES_TO_ASSUME`, `UPLOAD_DELAY`, `AWS_REGION`)
//! 3. `BNDL_*` env vars, nested with `__` (`BNDL_ADMISSION__REJECT_THRESHOLD=800`)
//! 4. the TOML file, if one was given. TOML wins.

use std::path::Path;

use anyhow::{Context, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{StorageBackendKind, StorageConfig};
use crate::converter::ConverterConfig;
use crate::credentials::CredentialsConfig;
use crate::endpoint::ServerConfig;
use crate::governor::AdmissionConfig;
use crate::monitor::MonitorConfig;
use crate::uploader::UploadConfig;

/// 🗺️ Flat legacy env var → figment key path. Values are taken verbatim as strings.
const LEGACY_STRING_ENV: [(&str, &str); 4] = [
    ("BUCKET_NAME", "storage.bucket_name"),
    ("EXTERNAL_ID", "credentials.external_id"),
    ("ROLES_TO_ASSUME", "credentials.roles_to_assume"),
    ("AWS_REGION", "storage.region"),
];

/// 🧩 S3 refuses any non-final multipart part smaller than this.
const MIN_S3_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// ⏱️ Milliseconds, the one legacy var that has to be a number.
const LEGACY_UPLOAD_DELAY_ENV: &str = "UPLOAD_DELAY";

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// 🚨 Catch the configs that parse fine and then fail at 3am.
    pub fn validate(&self) -> anyhow::Result<()> {
        let the_admission = &self.admission;
        if the_admission.warn_threshold == 0 || the_admission.reject_threshold == 0 {
            bail!("💀 admission thresholds must be above zero; a zero reject threshold rejects everything");
        }
        if the_admission.warn_threshold > the_admission.reject_threshold {
            bail!(
                "💀 admission.warn_threshold ({}) is above admission.reject_threshold ({}). \
                 You'd be rejecting before you ever warned.",
                the_admission.warn_threshold,
                the_admission.reject_threshold
            );
        }
        if self.converter.batch_size == 0 || self.converter.large_bundle_batch_size == 0 {
            bail!("💀 converter batch sizes must be above zero");
        }
        if self.upload.max_attempts == 0 {
            bail!("💀 upload.max_attempts must be at least 1, or nothing is ever uploaded");
        }
        if self.storage.backend == StorageBackendKind::S3 {
            if self.storage.bucket_name.trim().is_empty() {
                bail!("💀 storage.bucket_name (BUCKET_NAME) is required for the s3 backend");
            }
            if self.credentials.external_id.trim().is_empty() {
                bail!("💀 credentials.external_id (EXTERNAL_ID) is required for the s3 backend");
            }
            if self.credentials.roles_to_assume.is_empty() {
                bail!("💀 credentials.roles_to_assume (ROLES_TO_ASSUME) is required for the s3 backend");
            }
            if self.storage.part_size_bytes < MIN_S3_PART_SIZE_BYTES {
                bail!(
                    "💀 storage.part_size_bytes ({}) is under S3's 5 MiB minimum part size. \
                     Every multipart upload would fail at CompleteMultipartUpload.",
                    self.storage.part_size_bytes
                );
            }
        }
        Ok(())
    }
}

fn legacy_env() -> anyhow::Result<Figment> {
    let mut the_figment = Figment::new();
    for (name, key_path) in LEGACY_STRING_ENV {
        if let Ok(value) = std::env::var(name) {
            the_figment = the_figment.merge(Serialized::default(key_path, value));
        }
    }
    if let Ok(raw_delay) = std::env::var(LEGACY_UPLOAD_DELAY_ENV) {
        let the_delay: u64 = raw_delay.trim().parse().with_context(|| {
            format!("💀 {LEGACY_UPLOAD_DELAY_ENV}='{raw_delay}' is not a whole number of milliseconds")
        })?;
        the_figment = the_figment.merge(Serialized::default("upload.upload_delay_ms", the_delay));
    }
    Ok(the_figment)
}

/// 🚀 Load the config: env vars, then the optional TOML file on top, then validate.
///
/// 📐 If `config_file_name` is None → env vars only. If Some → env vars + TOML, TOML wins.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let the_figment = legacy_env()?.merge(Env::prefixed("BNDL_").split("__"));
    let the_figment = match config_file_name {
        Some(file_name) => the_figment.merge(Toml::file(file_name)),
        None => the_figment,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables. \
             The file exists in our hearts, but apparently not in a shape serde likes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables. \
                 No file was provided; this one's all on the environment. Classic."
            .to_string(),
    };

    let the_config: AppConfig = the_figment.extract().context(context_msg)?;
    the_config
        .validate()
        .context("💀 Configuration parsed, but it doesn't make sense.")?;
    Ok(the_config)
}
