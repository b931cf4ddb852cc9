//! Storage migrator - rewrites persisted objects under the current storage encoding

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_migrator::clients::{
    DynamicResourceClient, KubeApiServiceClient, KubeCrdClient, KubeMigrationClient,
    KubeStorageStateClient, KubeStorageVersionClient,
};
use storage_migrator::crd::{StorageState, StorageVersionMigration};
use storage_migrator::discovery::{KubeDiscoveryClient, MigratableDiscovery};
use storage_migrator::index::MigrationIndex;
use storage_migrator::initializer::Initializer;
use storage_migrator::leader_election::{
    default_resource_lock_namespace, LeaderElector, MIGRATOR_LEASE_NAME, TRIGGER_LEASE_NAME,
};
use storage_migrator::metrics;
use storage_migrator::migrator::KubeMigrator;
use storage_migrator::trigger::MigrationTrigger;

/// Storage migrator - controllers that migrate resources based on the
/// StorageVersionMigration API
#[derive(Parser, Debug)]
#[command(name = "storage-migrator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed the cluster: install the CRD and create one pending migration
    /// per migratable resource, then exit
    Initializer(InitializerArgs),

    /// Detect storage version changes and create migration requests
    Trigger(TriggerArgs),

    /// Execute migrations, one resource at a time
    Migrator(MigratorArgs),
}

/// Client connection arguments shared by every mode
#[derive(Args, Clone, Debug)]
struct ClientArgs {
    /// Path to the kubeconfig file specifying the apiserver instance.
    /// If unspecified, falls back to in-cluster configuration
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// QPS to use while talking with the kubernetes apiserver
    #[arg(long, default_value_t = 5.0)]
    kube_api_qps: f32,

    /// Burst to use while talking with the kubernetes apiserver
    #[arg(long, default_value_t = 10)]
    kube_api_burst: u32,
}

#[derive(Args, Debug)]
struct InitializerArgs {
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
struct TriggerArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Namespace to create the leader election lock in; defaults to this
    /// pod's namespace
    #[arg(long)]
    resource_lock_ns: Option<String>,

    /// Liveness endpoint listen address
    #[arg(long, default_value = "0.0.0.0:2113")]
    health_addr: SocketAddr,
}

#[derive(Args, Debug)]
struct MigratorArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Namespace to create the leader election lock in; defaults to this
    /// pod's namespace
    #[arg(long)]
    resource_lock_ns: Option<String>,

    /// Metrics and liveness endpoint listen address
    #[arg(long, default_value = "0.0.0.0:2112")]
    metrics_addr: SocketAddr,

    /// Concurrent object updates within one page of the sweep
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&StorageVersionMigration::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&StorageState::crd())?);
        return Ok(());
    }

    match cli.command {
        Some(Commands::Initializer(args)) => run_initializer(args).await,
        Some(Commands::Trigger(args)) => run_trigger(args).await,
        Some(Commands::Migrator(args)) => run_migrator(args).await,
        None => anyhow::bail!("specify a subcommand: initializer, trigger, or migrator"),
    }
}

/// Build a client from the kubeconfig flag or in-cluster config, throttled
/// to the configured QPS/burst
async fn build_client(args: &ClientArgs) -> anyhow::Result<Client> {
    let config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?
        }
        None => kube::Config::incluster()?,
    };

    let qps = f64::from(args.kube_api_qps.max(0.1));
    let burst = u64::from(args.kube_api_burst.max(1));
    // a rate limit of `burst` requests per `burst/qps` seconds averages to
    // the configured QPS while allowing short bursts
    let per = Duration::from_secs_f64(burst as f64 / qps);
    let throttle = tower::ServiceBuilder::new()
        .buffer::<http::Request<kube::client::Body>>(1024)
        .rate_limit(burst, per);

    let client = kube::client::ClientBuilder::try_from(config)?
        .with_layer(&throttle)
        .build();
    Ok(client)
}

async fn run_initializer(args: InitializerArgs) -> anyhow::Result<()> {
    info!("storage migration initializer starting");
    let client = build_client(&args.client).await?;
    let cancel = shutdown_token();

    let crds = Arc::new(KubeCrdClient::new(client.clone()));
    let discovery = MigratableDiscovery {
        discovery: Arc::new(KubeDiscoveryClient::new(client.clone())),
        crds: crds.clone(),
        apiservices: Arc::new(KubeApiServiceClient::new(client.clone())),
    };
    let migrations = Arc::new(KubeMigrationClient::new(client));

    Initializer::new(crds, discovery, migrations).run(&cancel).await?;
    info!("initialization complete");
    Ok(())
}

async fn run_trigger(args: TriggerArgs) -> anyhow::Result<()> {
    info!("storage migration trigger starting");
    let client = build_client(&args.client).await?;
    let cancel = shutdown_token();

    tokio::spawn(metrics::serve(
        args.health_addr,
        metrics::healthz_router(),
        cancel.clone(),
    ));

    let Some(mut guard) = acquire_leadership(
        client.clone(),
        TRIGGER_LEASE_NAME,
        args.resource_lock_ns,
        &cancel,
    )
    .await?
    else {
        return Ok(());
    };

    let trigger = MigrationTrigger::new(
        Arc::new(KubeMigrationClient::new(client.clone())),
        Arc::new(KubeStorageStateClient::new(client.clone())),
        Arc::new(KubeStorageVersionClient::new(client.clone())),
        Arc::new(KubeDiscoveryClient::new(client.clone())),
        Arc::new(RwLock::new(MigrationIndex::new())),
    );

    tokio::select! {
        _ = guard.lost() => {
            warn!("leader election lost");
            std::process::exit(0);
        }
        _ = trigger.run(client, cancel.clone()) => {}
    }
    Ok(())
}

async fn run_migrator(args: MigratorArgs) -> anyhow::Result<()> {
    info!("storage migrator starting");
    let client = build_client(&args.client).await?;
    let cancel = shutdown_token();

    tokio::spawn(metrics::serve(
        args.metrics_addr,
        metrics::migrator_router(),
        cancel.clone(),
    ));

    let Some(mut guard) = acquire_leadership(
        client.clone(),
        MIGRATOR_LEASE_NAME,
        args.resource_lock_ns,
        &cancel,
    )
    .await?
    else {
        return Ok(());
    };

    let migrator = KubeMigrator::new(
        Arc::new(KubeMigrationClient::new(client.clone())),
        Arc::new(DynamicResourceClient::new(client.clone())),
        Arc::new(RwLock::new(MigrationIndex::new())),
        args.concurrency,
    );

    tokio::select! {
        _ = guard.lost() => {
            warn!("leader election lost");
            std::process::exit(0);
        }
        _ = migrator.run(client, cancel.clone()) => {}
    }
    Ok(())
}

async fn acquire_leadership(
    client: Client,
    lease_name: &str,
    namespace: Option<String>,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<storage_migrator::leader_election::LeaderGuard>> {
    let namespace = namespace.unwrap_or_else(default_resource_lock_namespace);
    let elector = Arc::new(LeaderElector::new(
        client,
        lease_name,
        &namespace,
        &leader_identity(),
    ));
    Ok(elector.acquire(cancel).await?)
}

/// Hostname plus a random suffix, so restarted pods contend as new holders
fn leader_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "storage-migrator".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{host}_{suffix}")
}

/// A token cancelled by SIGINT or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        token.cancel();
    });
    cancel
}
