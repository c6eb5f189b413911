//! Workload identity operator - GKE Hub federation for Cluster API clusters

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::future::{self, BoxFuture, FutureExt};
use kube::Client;

use workload_identity_operator::controller::{
    build_cluster_controller, build_identity_controller, ControllerFuture,
};
use workload_identity_operator::federation::gkehub::DEFAULT_ENDPOINT;
use workload_identity_operator::federation::{
    FederationClient, GkeHubClient, MetadataTokenSource, StaticTokenSource, TokenSource,
};
use workload_identity_operator::leader_election::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};
use workload_identity_operator::probe::{self, Readiness, DEFAULT_PROBE_ADDR};
use workload_identity_operator::telemetry::{init_logging, LogFormat};
use workload_identity_operator::webhook::pod::DEFAULT_ADMISSION_TIMEOUT;
use workload_identity_operator::webhook::registration::{webhook_configuration, WebhookRegistration};
use workload_identity_operator::webhook::server::{self, DEFAULT_CERT_DIR};
use workload_identity_operator::webhook::{
    ensure_webhook_config, CredentialInjector, IdentityPolicy, KubeAdmissionStore,
    WebhookServerConfig, WebhookState,
};
use workload_identity_operator::{DEFAULT_MEMBERSHIP_SECRET_NAMESPACE, DEFAULT_WEBHOOK_PORT};

/// Federates Cluster API GCP clusters with GKE Hub and injects workload identity credentials
#[derive(Parser, Debug)]
#[command(name = "workload-identity-operator", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run on the management cluster: register GCPClusters with GKE Hub
    Membership(MembershipArgs),

    /// Run on a workload cluster: credential secrets and the Pod webhook
    Workload(WorkloadArgs),

    /// Print the MutatingWebhookConfiguration as YAML and exit
    WebhookConfig(RegistrationArgs),
}

/// Flags shared by every long-running mode
#[derive(Args, Debug)]
struct CommonArgs {
    /// Maximum concurrent reconciliations per controller
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: u16,

    /// Only run controllers while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "LEASE_NAMESPACE", default_value = DEFAULT_MEMBERSHIP_SECRET_NAMESPACE)]
    lease_namespace: String,

    /// Address of the /healthz and /readyz server
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = DEFAULT_PROBE_ADDR)]
    health_probe_bind_address: SocketAddr,

    /// Namespace of the membership secret in workload clusters
    #[arg(long, env = "MEMBERSHIP_SECRET_NAMESPACE", default_value = DEFAULT_MEMBERSHIP_SECRET_NAMESPACE)]
    membership_secret_namespace: String,
}

/// GKE Hub access
#[derive(Args, Debug)]
struct FederationArgs {
    /// GKE Hub API base URL
    #[arg(long, env = "GKEHUB_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    gkehub_endpoint: String,

    /// Static OAuth access token; the metadata server is used when unset
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

#[derive(Args, Debug)]
struct MembershipArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    federation: FederationArgs,
}

#[derive(Args, Debug)]
struct WorkloadArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// HTTPS port of the admission webhook
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// Directory holding tls.crt and tls.key
    #[arg(long, env = "CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    cert_dir: PathBuf,

    /// How Pods naming a missing ServiceAccount are handled
    #[arg(long, env = "IDENTITY_POLICY", value_enum, default_value_t = IdentityPolicy::TrustReference)]
    identity_policy: IdentityPolicy,

    /// Deadline for a single admission decision
    #[arg(long, env = "ADMISSION_TIMEOUT_SECS", default_value_t = DEFAULT_ADMISSION_TIMEOUT.as_secs())]
    admission_timeout_secs: u64,

    /// Also run the GCPCluster controller in this process
    #[arg(long, env = "ENABLE_CLUSTER_RECONCILER")]
    enable_cluster_reconciler: bool,

    #[command(flatten)]
    federation: FederationArgs,

    /// PEM CA bundle of the serving certificate; installs the MutatingWebhookConfiguration when set
    #[arg(long = "ca-bundle", env = "WEBHOOK_CA_BUNDLE")]
    ca_bundle: Option<PathBuf>,

    #[command(flatten)]
    service: WebhookServiceArgs,
}

#[derive(Args, Debug)]
struct RegistrationArgs {
    /// PEM CA bundle that signed the webhook serving certificate
    #[arg(long = "ca-bundle", env = "WEBHOOK_CA_BUNDLE")]
    ca_bundle: PathBuf,

    #[command(flatten)]
    service: WebhookServiceArgs,
}

/// Where the API server reaches the webhook
#[derive(Args, Debug)]
struct WebhookServiceArgs {
    /// Service fronting the webhook
    #[arg(long, env = "WEBHOOK_SERVICE_NAME", default_value = "workload-identity-operator-gcp-webhook")]
    webhook_service_name: String,

    /// Namespace of that Service
    #[arg(long, env = "WEBHOOK_SERVICE_NAMESPACE", default_value = DEFAULT_MEMBERSHIP_SECRET_NAMESPACE)]
    webhook_service_namespace: String,
}

impl WebhookServiceArgs {
    async fn registration(
        &self,
        ca_bundle: &Path,
        timeout: Duration,
    ) -> anyhow::Result<WebhookRegistration> {
        let ca_bundle = tokio::fs::read(ca_bundle).await.map_err(|e| {
            anyhow::anyhow!("Failed to read CA bundle {}: {}", ca_bundle.display(), e)
        })?;
        Ok(WebhookRegistration {
            service_name: self.webhook_service_name.clone(),
            service_namespace: self.webhook_service_namespace.clone(),
            port: 443,
            ca_bundle,
            timeout_seconds: timeout.as_secs() as i32,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs both the webhook server and kube clients
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Commands::Membership(args) => run_membership(args).await,
        Commands::Workload(args) => run_workload(args).await,
        Commands::WebhookConfig(args) => {
            let registration = args
                .service
                .registration(&args.ca_bundle, DEFAULT_ADMISSION_TIMEOUT)
                .await?;
            let yaml = serde_yaml::to_string(&webhook_configuration(&registration))
                .map_err(|e| anyhow::anyhow!("Failed to serialize webhook configuration: {}", e))?;
            println!("{yaml}");
            Ok(())
        }
    }
}

fn federation_client(args: &FederationArgs) -> anyhow::Result<Arc<dyn FederationClient>> {
    let tokens: Arc<dyn TokenSource> = match &args.access_token {
        Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
        None => Arc::new(MetadataTokenSource::new()?),
    };
    Ok(Arc::new(GkeHubClient::new(args.gkehub_endpoint.clone(), tokens)?))
}

/// Run the management cluster mode
async fn run_membership(args: MembershipArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let readiness = start_probes(args.common.health_probe_bind_address);

    let federation = federation_client(&args.federation)?;
    // Readiness does not depend on holding the lease
    readiness.mark_ready();
    let mut guard = acquire_leadership(&client, &args.common).await?;

    tracing::info!("Starting workload identity controllers...");
    let controllers = vec![build_cluster_controller(
        client,
        federation,
        args.common.membership_secret_namespace.clone(),
        args.common.workers,
    )];

    run_until_done(controllers, None, guard.as_mut()).await?;
    release(guard).await;
    Ok(())
}

/// Run the workload cluster mode
async fn run_workload(args: WorkloadArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let readiness = start_probes(args.common.health_probe_bind_address);
    let timeout = Duration::from_secs(args.admission_timeout_secs);

    // Every replica serves the webhook; only the leader reconciles
    let store = Arc::new(KubeAdmissionStore::new(
        client.clone(),
        args.common.membership_secret_namespace.clone(),
    ));
    let injector = CredentialInjector::new(store, args.identity_policy).with_timeout(timeout);
    let server_config = WebhookServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], args.webhook_port)),
        cert_dir: args.cert_dir.clone(),
    };
    let webhook_server = server::start(server_config, Arc::new(WebhookState::new(injector)))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start webhook server: {}", e))?;
    let mut webhook_done: BoxFuture<'static, anyhow::Result<()>> = webhook_server
        .wait()
        .map(|r| r.map_err(|e| anyhow::anyhow!("Webhook server failed: {}", e)))
        .boxed();

    if let Some(ca_bundle) = &args.ca_bundle {
        let registration = args.service.registration(ca_bundle, timeout).await?;
        ensure_webhook_config(&client, &registration)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install webhook configuration: {}", e))?;
    }
    readiness.mark_ready();

    let mut guard = tokio::select! {
        guard = acquire_leadership(&client, &args.common) => guard?,
        result = &mut webhook_done => {
            result?;
            return Err(anyhow::anyhow!("Webhook server exited unexpectedly"));
        }
    };

    tracing::info!("Starting workload identity controllers...");
    let mut controllers = vec![build_identity_controller(
        client.clone(),
        args.common.membership_secret_namespace.clone(),
        args.common.workers,
    )];
    if args.enable_cluster_reconciler {
        controllers.push(build_cluster_controller(
            client,
            federation_client(&args.federation)?,
            args.common.membership_secret_namespace.clone(),
            args.common.workers,
        ));
    }

    run_until_done(controllers, Some(webhook_done), guard.as_mut()).await?;
    release(guard).await;
    Ok(())
}

fn start_probes(addr: SocketAddr) -> Readiness {
    let readiness = Readiness::new();
    let served = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = probe::serve(addr, served).await {
            tracing::error!(error = %e, "Probe server failed");
        }
    });
    readiness
}

/// Block until this replica leads, when leader election is enabled
async fn acquire_leadership(
    client: &Client,
    common: &CommonArgs,
) -> anyhow::Result<Option<LeaderGuard>> {
    if !common.leader_elect {
        return Ok(None);
    }

    let identity = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("workload-identity-operator-{}", uuid::Uuid::new_v4()));

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LEASE_NAME,
        &common.lease_namespace,
        &identity,
    ));
    let guard = elector
        .acquire()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to acquire leadership: {}", e))?;
    Ok(Some(guard))
}

/// Run controllers until they shut down on a signal
///
/// Losing leadership or a webhook failure ends the process with an error.
async fn run_until_done(
    controllers: Vec<ControllerFuture>,
    webhook: Option<BoxFuture<'static, anyhow::Result<()>>>,
    guard: Option<&mut LeaderGuard>,
) -> anyhow::Result<()> {
    let webhook = match webhook {
        Some(server) => server,
        None => future::pending().boxed(),
    };
    let leadership_lost = async move {
        match guard {
            Some(guard) => guard.lost().await,
            None => future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = future::join_all(controllers) => {
            tracing::info!("Controllers stopped");
            Ok(())
        }
        result = webhook => {
            result?;
            Err(anyhow::anyhow!("Webhook server exited unexpectedly"))
        }
        _ = leadership_lost => {
            tracing::error!("Leadership lost, exiting so a standby can take over");
            Err(anyhow::anyhow!("leadership lost"))
        }
    }
}

async fn release(guard: Option<LeaderGuard>) {
    if let Some(guard) = guard {
        if let Err(e) = guard.release_leadership().await {
            tracing::warn!(error = %e, "Failed to release leadership");
        }
    }
}
