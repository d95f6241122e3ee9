//! 🎭☁️ The real STS: `AssumeRole`, one hop at a time.
//!
//! Hop 1 signs with whatever identity the process wakes up with (env vars,
//! `~/.aws`, an instance profile, a prayer). Every later hop signs with the
//! credentials the previous hop returned. The ambient config is loaded once and
//! reused; only the credentials provider changes between hops. With no region
//! configured anywhere the client signs for `us-east-1`, same as the S3 side.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_sts::config::Credentials;
use aws_sdk_sts::error::DisplayErrorContext;
use tokio::sync::OnceCell;

use crate::backends::region_chain;
use crate::credentials::{AssumeRoleRequest, CredentialSet, RoleAssumer};

const THE_PROVIDER_NAME: &str = "bndl-role-chain-hop";

#[derive(Debug, Clone)]
pub struct StsRoleAssumer {
    ambient: Arc<OnceCell<SdkConfig>>,
    region: Option<String>,
    endpoint_url: Option<String>,
}

impl StsRoleAssumer {
    /// ☁️ Lazily loads the ambient AWS config on the first hop.
    pub fn new(region: Option<String>, endpoint_url: Option<String>) -> Self {
        Self {
            ambient: Arc::new(OnceCell::new()),
            region,
            endpoint_url,
        }
    }

    /// 🧪 Uses `config` as the ambient identity instead of discovering one.
    pub fn with_ambient_config(config: SdkConfig) -> Self {
        Self {
            ambient: Arc::new(OnceCell::new_with(Some(config))),
            region: None,
            endpoint_url: None,
        }
    }

    async fn ambient(&self) -> &SdkConfig {
        self.ambient
            .get_or_init(|| async {
                let mut the_loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(region_chain(self.region.as_deref()));
                if let Some(endpoint_url) = &self.endpoint_url {
                    the_loader = the_loader.endpoint_url(endpoint_url);
                }
                the_loader.load().await
            })
            .await
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
        prior: Option<&CredentialSet>,
    ) -> Result<CredentialSet> {
        let the_ambient = self.ambient().await;
        let the_client = match prior {
            None => aws_sdk_sts::Client::new(the_ambient),
            Some(creds) => {
                let the_hop_credentials = Credentials::new(
                    creds.access_key_id.clone(),
                    creds.secret_access_key.clone(),
                    Some(creds.session_token.clone()),
                    creds.expiry,
                    THE_PROVIDER_NAME,
                );
                aws_sdk_sts::Client::from_conf(
                    aws_sdk_sts::config::Builder::from(the_ambient)
                        .credentials_provider(the_hop_credentials)
                        .build(),
                )
            }
        };

        let the_output = the_client
            .assume_role()
            .role_arn(request.role_arn)
            .role_session_name(request.session_name)
            .set_external_id(
                (!request.external_id.is_empty()).then(|| request.external_id.to_string()),
            )
            .duration_seconds(i32::try_from(request.duration_secs).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "💀 AssumeRole {} failed: {}",
                    request.role_arn,
                    DisplayErrorContext(&err)
                )
            })?;

        let the_credentials = the_output.credentials().with_context(|| {
            format!(
                "💀 AssumeRole {} succeeded and returned no credentials. Bold move, STS.",
                request.role_arn
            )
        })?;

        Ok(CredentialSet {
            access_key_id: the_credentials.access_key_id().to_string(),
            secret_access_key: the_credentials.secret_access_key().to_string(),
            session_token: the_credentials.session_token().to_string(),
            expiry: SystemTime::try_from(*the_credentials.expiration()).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header_regex, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use aws_sdk_sts::config::Region;

    use super::*;
    use crate::backends::{InMemorySink, SinkFactory};
    use crate::credentials::{AssumerBackend, CredentialChain, CredentialsConfig};

    fn assume_role_response(access_key_id: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("Content-Type", "text/xml")
            .set_body_string(format!(
                r#"<AssumeRoleResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleResult>
    <Credentials>
      <AccessKeyId>{access_key_id}</AccessKeyId>
      <SecretAccessKey>secret-of-{access_key_id}</SecretAccessKey>
      <SessionToken>token-of-{access_key_id}</SessionToken>
      <Expiration>2099-01-01T00:00:00Z</Expiration>
    </Credentials>
    <AssumedRoleUser>
      <AssumedRoleId>AROATEST:mevblocker-dune-sync</AssumedRoleId>
      <Arn>arn:aws:sts::111111111111:assumed-role/test/mevblocker-dune-sync</Arn>
    </AssumedRoleUser>
  </AssumeRoleResult>
  <ResponseMetadata>
    <RequestId>c6104cbe-af31-11e0-8154-cbc7ccf896c7</RequestId>
  </ResponseMetadata>
</AssumeRoleResponse>"#
            ))
    }

    async fn ambient_pointed_at(server: &MockServer) -> SdkConfig {
        aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                "AKIDAMBIENT",
                "ambient-secret",
                None,
                None,
                "test",
            ))
            .endpoint_url(server.uri())
            .load()
            .await
    }

    #[tokio::test]
    async fn the_one_where_two_hops_sign_with_two_different_hats() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=AssumeRole"))
            .and(body_string_contains("first"))
            .and(body_string_contains("ExternalId=the-external-id"))
            .and(body_string_contains("RoleSessionName=mevblocker-dune-sync-1700000000000"))
            .and(header_regex("authorization", "Credential=AKIDAMBIENT/"))
            .respond_with(assume_role_response("ASIAFIRST"))
            .expect(1)
            .mount(&the_server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=AssumeRole"))
            .and(body_string_contains("second"))
            .and(header_regex("authorization", "Credential=ASIAFIRST/"))
            .respond_with(assume_role_response("ASIASECOND"))
            .expect(1)
            .mount(&the_server)
            .await;

        let the_assumer = StsRoleAssumer::with_ambient_config(ambient_pointed_at(&the_server).await);
        let the_sink = InMemorySink::new();
        let the_chain = CredentialChain::new(
            CredentialsConfig {
                external_id: "the-external-id".into(),
                roles_to_assume: vec![
                    "arn:aws:iam::111111111111:role/first".into(),
                    "arn:aws:iam::222222222222:role/second".into(),
                ],
                ..CredentialsConfig::default()
            },
            AssumerBackend::Sts(the_assumer),
            SinkFactory::InMemory(the_sink.clone()),
        );

        the_chain.get_client(1_700_000_000_000).await?;

        assert_eq!(the_sink.builds().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_sts_says_no_and_we_say_which_role() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("Content-Type", "text/xml")
                    .set_body_string(
                        r#"<ErrorResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <Error><Type>Sender</Type><Code>AccessDenied</Code><Message>not authorized to perform sts:AssumeRole</Message></Error>
  <RequestId>r-403</RequestId>
</ErrorResponse>"#,
                    ),
            )
            .mount(&the_server)
            .await;

        let the_assumer = StsRoleAssumer::with_ambient_config(ambient_pointed_at(&the_server).await);
        let the_error = the_assumer
            .assume_role(
                &AssumeRoleRequest {
                    role_arn: "arn:aws:iam::111111111111:role/locked",
                    session_name: "mevblocker-dune-sync-1",
                    external_id: "",
                    duration_secs: 900,
                },
                None,
            )
            .await
            .expect_err("💀 a 403 is not a yes");

        let the_text = format!("{the_error:#}");
        assert!(the_text.contains("role/locked"));
        assert!(the_text.contains("AccessDenied"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_nobody_set_a_region_and_the_hop_still_signs() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=AssumeRole"))
            .and(header_regex(
                "authorization",
                r"Credential=ASIAPRIOR/\d{8}/[a-z0-9-]+/sts/aws4_request",
            ))
            .respond_with(assume_role_response("ASIANOREGION"))
            .expect(1)
            .mount(&the_server)
            .await;

        // -- no region and no ambient config: exactly what the old env-only deployment looks like
        let the_assumer = StsRoleAssumer::new(None, Some(the_server.uri()));
        let the_prior = CredentialSet {
            access_key_id: "ASIAPRIOR".into(),
            secret_access_key: "prior-secret".into(),
            session_token: "prior-token".into(),
            expiry: None,
        };

        let the_next = the_assumer
            .assume_role(
                &AssumeRoleRequest {
                    role_arn: "arn:aws:iam::222222222222:role/second",
                    session_name: "mevblocker-dune-sync-1",
                    external_id: "ext",
                    duration_secs: 3_600,
                },
                Some(&the_prior),
            )
            .await?;

        assert_eq!(the_next.access_key_id, "ASIANOREGION");
        Ok(())
    }
}
