//! Navigator Pilot - per-pod database process supervisor

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use navigator::cassandra::{CassandraStrategy, DEFAULT_ADMIN_PORT};
use navigator::controller::{KubePilotClient, PilotReconciler, PilotStrategy, WorkQueue};
use navigator::crd::Pilot;
use navigator::elasticsearch::{ElasticsearchStrategy, DEFAULT_HTTP_PORT};
use navigator::events::KubeEventPublisher;
use navigator::hook::Hooks;
use navigator::leader::LeaderElector;
use navigator::probe::{FnCheck, ProbeServer};
use navigator::process::SignalMap;
use navigator::retry::{retry_with_backoff, RetryConfig};
use navigator::Error;
use navigator::{
    DEFAULT_LEADER_LEASE_NAME, DEFAULT_LIVENESS_PORT, DEFAULT_READINESS_PORT,
    DEFAULT_RESYNC_PERIOD_SECS,
};

/// Navigator pilot - sidecar supervising one database process per pod
#[derive(Parser, Debug)]
#[command(name = "pilot", version, about, long_about = None)]
struct Cli {
    /// Generate the Pilot CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig file (defaults to in-cluster config)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<std::path::PathBuf>,

    /// Kubernetes API server URL override
    #[arg(long)]
    api_server: Option<String>,

    /// Name of the Pilot this sidecar manages (the pod name)
    #[arg(long, env = "POD_NAME")]
    pilot_name: Option<String>,

    /// Namespace of the Pilot this sidecar manages
    #[arg(long, env = "POD_NAMESPACE")]
    pilot_namespace: Option<String>,

    /// Seconds between scheduled re-evaluations of a synced Pilot
    #[arg(long, default_value_t = DEFAULT_RESYNC_PERIOD_SECS)]
    resync_period_secs: u64,

    /// Port for the liveness probe server
    #[arg(long, default_value_t = DEFAULT_LIVENESS_PORT)]
    liveness_port: u16,

    /// Port for the readiness probe server
    #[arg(long, default_value_t = DEFAULT_READINESS_PORT)]
    readiness_port: u16,

    /// Name of the leader-election Lease
    #[arg(long, default_value = DEFAULT_LEADER_LEASE_NAME)]
    leader_lease_name: String,

    /// Signal used to stop the database process (default SIGTERM)
    #[arg(long)]
    stop_signal: Option<nix::sys::signal::Signal>,

    /// Signal used to terminate the database process (default SIGKILL)
    #[arg(long)]
    terminate_signal: Option<nix::sys::signal::Signal>,

    /// Signal used to reload the database process (default SIGHUP)
    #[arg(long)]
    reload_signal: Option<nix::sys::signal::Signal>,

    #[command(subcommand)]
    database: Option<Database>,
}

#[derive(Subcommand, Debug)]
enum Database {
    /// Supervise a Cassandra node
    Cassandra {
        /// Base URL of the node's administrative interface
        #[arg(long)]
        admin_url: Option<String>,
    },
    /// Supervise an Elasticsearch node
    Elasticsearch {
        /// Base URL of the node's HTTP interface
        #[arg(long)]
        http_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Pilot::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_pilot(cli).await
}

/// Install the Pilot CRD using server-side apply so the installed version
/// always matches the running pilot.
async fn ensure_crd_installed(client: &Client) -> navigator::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("navigator-pilot").force();

    info!("Installing Pilot CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_pilot_crd", || {
        let crds = crds.clone();
        let params = params.clone();
        async move {
            crds.patch("pilots.navigator.dev", &params, &Patch::Apply(&Pilot::crd()))
                .await
                .map_err(Error::from)
        }
    })
    .await?;
    info!("Pilot CRD installed/updated");
    Ok(())
}

fn build_strategy(database: Option<Database>) -> anyhow::Result<Arc<dyn PilotStrategy>> {
    match database {
        Some(Database::Cassandra { admin_url }) => {
            let url = admin_url
                .unwrap_or_else(|| format!("http://127.0.0.1:{DEFAULT_ADMIN_PORT}"));
            info!(admin_url = %url, "Running as Cassandra pilot");
            Ok(Arc::new(CassandraStrategy::new(url)))
        }
        Some(Database::Elasticsearch { http_url }) => {
            let url =
                http_url.unwrap_or_else(|| format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"));
            info!(http_url = %url, "Running as Elasticsearch pilot");
            Ok(Arc::new(ElasticsearchStrategy::new(url)))
        }
        None => Err(anyhow::anyhow!(
            "a database subcommand is required (cassandra or elasticsearch)"
        )),
    }
}

/// Build a client from the CLI connection options, falling back to the
/// inferred (in-cluster or local) configuration.
async fn build_client(
    kubeconfig: Option<std::path::PathBuf>,
    api_server: Option<String>,
) -> anyhow::Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {path:?}: {e}"))?;
            kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await
                .map_err(|e| anyhow::anyhow!("Invalid kubeconfig {path:?}: {e}"))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to infer Kubernetes config: {e}"))?,
    };
    if let Some(url) = api_server {
        config.cluster_url = url
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid API server URL {url:?}: {e}"))?;
    }
    Client::try_from(config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))
}

async fn run_pilot(cli: Cli) -> anyhow::Result<()> {
    info!("Navigator pilot starting...");

    let pilot_name = cli
        .pilot_name
        .ok_or_else(|| anyhow::anyhow!("--pilot-name (or POD_NAME) is required"))?;
    let pilot_namespace = cli
        .pilot_namespace
        .ok_or_else(|| anyhow::anyhow!("--pilot-namespace (or POD_NAMESPACE) is required"))?;

    let strategy = build_strategy(cli.database)?;

    let mut signals = SignalMap::default();
    if let Some(signal) = cli.stop_signal {
        signals.stop = signal;
    }
    if let Some(signal) = cli.terminate_signal {
        signals.terminate = signal;
    }
    if let Some(signal) = cli.reload_signal {
        signals.reload = signal;
    }

    let client = build_client(cli.kubeconfig, cli.api_server).await?;

    ensure_crd_installed(&client).await?;

    // Watch Pilots in our namespace; every touched object lands on the queue.
    let queue = Arc::new(WorkQueue::new());
    let (pilot_client, watch_handle) =
        KubePilotClient::start(client.clone(), &pilot_namespace, queue.clone());

    // Reconciling against an unsynced cache would act on stale state.
    pilot_client
        .wait_for_cache_sync(Duration::from_secs(60))
        .await
        .map_err(|e| anyhow::anyhow!("Cache sync failed: {}", e))?;
    info!("Pilot cache synced");

    let events = Arc::new(KubeEventPublisher::new(client.clone(), "navigator-pilot"));

    let reconciler = Arc::new(PilotReconciler::new(
        pilot_namespace.clone(),
        pilot_name.clone(),
        Duration::from_secs(cli.resync_period_secs),
        signals,
        Arc::new(pilot_client),
        strategy,
        events,
        Hooks::new(),
        queue.clone(),
    ));

    // Make sure our own Pilot is evaluated even before watch traffic arrives.
    queue.add(&format!("{pilot_namespace}/{pilot_name}"));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // Liveness answers as long as the pilot itself is responsive; readiness
    // additionally requires the database process to be up.
    let liveness = ProbeServer::liveness();
    let readiness = {
        let reconciler = reconciler.clone();
        ProbeServer::readiness().add_check(Arc::new(FnCheck::new("process", move || {
            let reconciler = reconciler.clone();
            async move {
                if reconciler.process_running().await {
                    Ok(())
                } else {
                    Err(Error::process("database process is not running"))
                }
            }
        })))
    };

    let liveness_addr = SocketAddr::from(([0, 0, 0, 0], cli.liveness_port));
    let readiness_addr = SocketAddr::from(([0, 0, 0, 0], cli.readiness_port));
    let liveness_task = {
        let token = shutdown.clone();
        tokio::spawn(async move { liveness.serve(liveness_addr, token).await })
    };
    let readiness_task = {
        let token = shutdown.clone();
        tokio::spawn(async move { readiness.serve(readiness_addr, token).await })
    };

    spawn_leader_election(
        client,
        cli.leader_lease_name,
        pilot_namespace,
        pilot_name,
        shutdown.clone(),
    );

    // The worker loop runs until shutdown, then executes the stop sequence.
    let result = reconciler.run(shutdown.clone()).await;

    shutdown.cancel();
    watch_handle.abort();
    if let Err(e) = liveness_task.await.unwrap_or(Ok(())) {
        warn!(error = %e, "Liveness server exited with error");
    }
    if let Err(e) = readiness_task.await.unwrap_or(Ok(())) {
        warn!(error = %e, "Readiness server exited with error");
    }

    match result {
        Ok(()) => {
            info!("Navigator pilot shut down cleanly");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Pilot shutdown reported errors: {}", e)),
    }
}

/// Cancel the token on SIGTERM (kubelet) or Ctrl-C (local runs)
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                info!("Ctrl-C received");
            }
        }
        shutdown.cancel();
    });
}

/// Hold the cluster-wide leader lease in the background.
///
/// Leadership gates nothing in the sync path today; it marks which pilot
/// performs cluster-scoped duties and is released on shutdown for fast
/// failover.
fn spawn_leader_election(
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let elector = Arc::new(LeaderElector::new(
            client,
            &lease_name,
            &namespace,
            &identity,
        ));
        loop {
            let guard = tokio::select! {
                _ = shutdown.cancelled() => return,
                acquired = elector.clone().acquire() => match acquired {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(error = %e, "Leader election failed, retrying");
                        continue;
                    }
                },
            };

            let mut guard = guard;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = guard.release_leadership().await {
                        warn!(error = %e, "Failed to release leadership on shutdown");
                    }
                    return;
                }
                _ = guard.lost() => {
                    warn!("Leadership lost, rejoining election");
                }
            }
        }
    });
}
