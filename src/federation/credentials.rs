//! Credential-config document
//!
//! Google client libraries pick up `GOOGLE_APPLICATION_CREDENTIALS` and, for
//! an `external_account` document, exchange the projected Kubernetes token
//! for a federated token and then impersonate the GCP service account.

use serde::{Deserialize, Serialize};

use super::Membership;
use crate::{Error, CREDENTIAL_MOUNT_PATH, TOKEN_FILE_NAME};

/// Credential type understood by Google client libraries
pub const EXTERNAL_ACCOUNT: &str = "external_account";

/// Type of the token read from `credential_source.file`
pub const SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Security Token Service exchange endpoint
pub const TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";

/// `external_account` credential-config
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Always [`EXTERNAL_ACCOUNT`]
    #[serde(rename = "type")]
    pub type_: String,
    /// `identitynamespace:{pool}:{provider}`
    pub audience: String,
    /// IAM Credentials endpoint used to impersonate the GCP service account
    pub service_account_impersonation_url: String,
    /// Always [`SUBJECT_TOKEN_TYPE`]
    pub subject_token_type: String,
    /// Always [`TOKEN_URL`]
    pub token_url: String,
    /// Where the subject token is read from
    pub credential_source: CredentialSource,
}

/// File holding the subject token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSource {
    /// Absolute path of the projected service account token
    pub file: String,
}

impl CredentialConfig {
    /// Credential-config impersonating `gcp_service_account` through `membership`
    ///
    /// A membership missing its pool or provider cannot produce a usable
    /// audience and is rejected as a configuration error.
    pub fn new(membership: &Membership, gcp_service_account: &str) -> Result<Self, Error> {
        let pool = &membership.authority.workload_identity_pool;
        let provider = &membership.authority.identity_provider;

        if pool.is_empty() || provider.is_empty() {
            return Err(Error::configuration(format!(
                "membership {} is missing workloadIdentityPool or identityProvider",
                membership.name
            )));
        }

        Ok(Self {
            type_: EXTERNAL_ACCOUNT.to_string(),
            audience: format!("identitynamespace:{pool}:{provider}"),
            service_account_impersonation_url: format!(
                "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{gcp_service_account}:generateAccessToken"
            ),
            subject_token_type: SUBJECT_TOKEN_TYPE.to_string(),
            token_url: TOKEN_URL.to_string(),
            credential_source: CredentialSource {
                file: format!("{CREDENTIAL_MOUNT_PATH}/{TOKEN_FILE_NAME}"),
            },
        })
    }

    /// Render the document stored in the credential secret
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::serialization(format!("failed to encode credential config: {e}")))
    }
}
