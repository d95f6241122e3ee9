//! 🪣📡 S3 Sink: bundles go in, objects come out, ACL says the bucket owner gets to keep them.
//!
//! COLD OPEN. INT. CROSS-ACCOUNT BUCKET. 3:47 AM.
//!
//! The object landed. The bucket owner tried to read it. AccessDenied. The object
//! belonged to the writer, not the bucket. Somebody forgot `bucket-owner-full-control`.
//! Somebody will not forget again. Every write in this file sets it.
//!
//! 🧠 Knowledge graph:
//! - Client: built from a [`CredentialSet`] handed over by the credential chain, never from
//!   ambient creds. Region falls back through the default provider chain, then `us-east-1`.
//! - Transport: connect + read timeouts and an SDK retry budget from [`StorageConfig`]. The
//!   hyper pool inside the client keeps connections alive across uploads.
//! - Small bodies: one `PutObject`. Big bodies: `CreateMultipartUpload` → parts, at most
//!   `part_concurrency` in flight → `CompleteMultipartUpload`, or `AbortMultipartUpload` if a
//!   part falls over so we don't leave orphan parts billing us forever.
//! - Error text: rendered with `DisplayErrorContext` so "ExpiredToken" and "dispatch failure"
//!   survive all the way up to the uploader's classifier.

use std::ops::Range;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::backends::{ObjectSink, StorageConfig, region_chain};
use crate::credentials::CredentialSet;

const THE_CONTENT_TYPE: &str = "application/json";
const THE_PROVIDER_NAME: &str = "bndl-role-chain";

/// 🪣 An S3 client bound to one set of chained credentials, plus where to write.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    part_size_bytes: usize,
    part_concurrency: usize,
}

impl S3Sink {
    /// 🔧 Builds the client. No network I/O happens here beyond region resolution.
    pub async fn connect(config: &StorageConfig, credentials: &CredentialSet) -> Result<Self> {
        let the_region = region_chain(config.region.as_deref())
            .region()
            .await
            .context("💀 No AWS region from config, env, or profile. Not even the fallback stuck.")?;

        let the_credentials = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            Some(credentials.session_token.clone()),
            credentials.expiry,
            THE_PROVIDER_NAME,
        );

        let the_timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.socket_timeout_ms))
            .build();

        let mut the_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(the_region)
            .credentials_provider(the_credentials)
            .timeout_config(the_timeouts)
            .retry_config(
                RetryConfig::standard().with_max_attempts(config.transport_max_attempts.max(1)),
            )
            .force_path_style(config.force_path_style);
        if let Some(endpoint_url) = &config.endpoint_url {
            the_builder = the_builder.endpoint_url(endpoint_url);
        }

        debug!(bucket = %config.bucket_name, "🪣 S3 client built from chained credentials");

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(the_builder.build()),
            bucket: config.bucket_name.clone(),
            part_size_bytes: config.part_size_bytes.max(1),
            part_concurrency: config.part_concurrency.max(1),
        })
    }

    async fn put_single(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .content_type(THE_CONTENT_TYPE)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "💀 PutObject to s3://{}/{} failed: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&err)
                )
            })?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, body: Bytes) -> Result<()> {
        let the_created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .content_type(THE_CONTENT_TYPE)
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "💀 CreateMultipartUpload for s3://{}/{} failed: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&err)
                )
            })?;
        let the_upload_id = the_created
            .upload_id()
            .context("💀 S3 started a multipart upload and forgot to tell us its id")?
            .to_string();

        match self.upload_parts(key, &the_upload_id, &body).await {
            Ok(the_parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&the_upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(the_parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|err| {
                        anyhow!(
                            "💀 CompleteMultipartUpload for s3://{}/{} failed: {}",
                            self.bucket,
                            key,
                            DisplayErrorContext(&err)
                        )
                    })?;
                Ok(())
            }
            Err(err) => {
                // -- 🧹 orphaned parts are invisible and billable. clean up, then report the real failure.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&the_upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key,
                        upload_id = %the_upload_id,
                        error = %DisplayErrorContext(&abort_err),
                        "🧹 could not abort multipart upload; parts may linger until the lifecycle rule eats them"
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &Bytes,
    ) -> Result<Vec<CompletedPart>> {
        let the_ranges = part_ranges(body.len(), self.part_size_bytes);
        let the_total = the_ranges.len();

        let mut the_parts: Vec<CompletedPart> = futures::stream::iter(
            the_ranges.into_iter().enumerate(),
        )
        .map(|(index, range)| {
            // -- S3 part numbers start at 1. zero is not a part number, it is a cry for help.
            let the_part_number = (index + 1) as i32;
            let the_chunk = body.slice(range);
            async move {
                let the_output = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(the_part_number)
                    .body(ByteStream::from(the_chunk))
                    .send()
                    .await
                    .map_err(|err| {
                        anyhow!(
                            "💀 UploadPart {}/{} for s3://{}/{} failed: {}",
                            the_part_number,
                            the_total,
                            self.bucket,
                            key,
                            DisplayErrorContext(&err)
                        )
                    })?;
                Ok::<_, anyhow::Error>(
                    CompletedPart::builder()
                        .set_e_tag(the_output.e_tag().map(str::to_string))
                        .part_number(the_part_number)
                        .build(),
                )
            }
        })
        .buffer_unordered(self.part_concurrency)
        .try_collect()
        .await?;

        the_parts.sort_by_key(|part| part.part_number());
        Ok(the_parts)
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        if body.len() > self.part_size_bytes {
            debug!(key, bytes = body.len(), "🧩 body over part size, going multipart");
            self.put_multipart(key, body).await
        } else {
            self.put_single(key, body).await
        }
    }
}

/// 🔪 Byte ranges for each multipart part: all `part_size` long except possibly the last.
pub(crate) fn part_ranges(len: usize, part_size: usize) -> Vec<Range<usize>> {
    let the_part_size = part_size.max(1);
    (0..len)
        .step_by(the_part_size)
        .map(|start| start..(start + the_part_size).min(len))
        .collect()
}
