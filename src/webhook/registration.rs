//! MutatingWebhookConfiguration for Pod injection

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::info;

use super::MUTATE_PODS_PATH;
use crate::{Error, LABEL_WORKLOAD_IDENTITY, LABEL_WORKLOAD_IDENTITY_ENABLED, MANAGED_BY};

/// Name of the configuration object and its single webhook
pub const WEBHOOK_CONFIGURATION_NAME: &str = "workload-identity-operator-gcp";

const WEBHOOK_NAME: &str = "pods.workload-identity.giantswarm.io";

/// Where the API server reaches the webhook
#[derive(Clone, Debug)]
pub struct WebhookRegistration {
    /// Service fronting the webhook server
    pub service_name: String,
    /// Namespace of that Service
    pub service_namespace: String,
    /// Service port
    pub port: i32,
    /// PEM bundle of the CA that signed the serving certificate
    pub ca_bundle: Vec<u8>,
    /// Seconds the API server waits for an answer
    pub timeout_seconds: i32,
}

/// Build the configuration routing Pod CREATE requests to the webhook
///
/// Only Pods labelled for workload identity are sent. Failures are fatal for
/// those Pods so credentials are never silently skipped.
pub fn webhook_configuration(registration: &WebhookRegistration) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIGURATION_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Equivalent".to_string()),
            timeout_seconds: Some(registration.timeout_seconds),
            object_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    LABEL_WORKLOAD_IDENTITY.to_string(),
                    LABEL_WORKLOAD_IDENTITY_ENABLED.to_string(),
                )])),
                ..Default::default()
            }),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: registration.service_name.clone(),
                    namespace: registration.service_namespace.clone(),
                    path: Some(MUTATE_PODS_PATH.to_string()),
                    port: Some(registration.port),
                }),
                ca_bundle: Some(k8s_openapi::ByteString(registration.ca_bundle.clone())),
                ..Default::default()
            },
            ..Default::default()
        }]),
    }
}

/// Server-side apply the webhook configuration
pub async fn ensure_webhook_config(
    client: &Client,
    registration: &WebhookRegistration,
) -> Result<(), Error> {
    let params = PatchParams::apply(MANAGED_BY).force();
    let webhooks: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    webhooks
        .patch(
            WEBHOOK_CONFIGURATION_NAME,
            &params,
            &Patch::Apply(&webhook_configuration(registration)),
        )
        .await?;

    info!(
        service = %registration.service_name,
        namespace = %registration.service_namespace,
        "Webhook configuration installed"
    );
    Ok(())
}
