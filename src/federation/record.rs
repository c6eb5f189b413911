//! Membership secret
//!
//! The membership registered for a cluster is stored in a singleton secret
//! inside that cluster. The identity reconciler and the webhook read their
//! workload identity pool and identity provider from it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;

use super::Membership;
use crate::{
    membership_secret_finalizer, Error, ANNOTATION_CREATED_BY, ANNOTATION_MANAGED_BY, MANAGED_BY,
    MEMBERSHIP_SECRET_NAME, SECRET_PAYLOAD_KEY,
};

/// Build the membership secret for `cluster` in `namespace`
///
/// The secret carries a finalizer so it is not removed while workloads depend
/// on it.
pub fn membership_secret(
    membership: &Membership,
    cluster: &str,
    namespace: &str,
) -> Result<Secret, Error> {
    let payload = serde_json::to_string(membership)
        .map_err(|e| Error::serialization(format!("failed to encode membership: {e}")))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(MEMBERSHIP_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([
                (ANNOTATION_CREATED_BY.to_string(), cluster.to_string()),
                (ANNOTATION_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            ])),
            finalizers: Some(vec![membership_secret_finalizer()]),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(SECRET_PAYLOAD_KEY.to_string(), payload)])),
        ..Default::default()
    })
}

/// Read the membership back out of its secret
///
/// Secrets read from the API server carry the payload in `data`; secrets that
/// were built locally and never stored only have `stringData`.
pub fn membership_from_secret(secret: &Secret) -> Result<Membership, Error> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SECRET_PAYLOAD_KEY))
        .map(|bytes| bytes.0.clone());
    let from_string_data = || {
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(SECRET_PAYLOAD_KEY))
            .map(|s| s.clone().into_bytes())
    };

    let payload = from_data.or_else(from_string_data).ok_or_else(|| {
        Error::serialization(format!(
            "secret {} has no {SECRET_PAYLOAD_KEY} entry",
            secret.metadata.name.as_deref().unwrap_or(MEMBERSHIP_SECRET_NAME)
        ))
    })?;

    serde_json::from_slice(&payload)
        .map_err(|e| Error::serialization(format!("invalid membership document: {e}")))
}
