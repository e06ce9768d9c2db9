use anyhow::Context;
use image_repository_controller::clock::{Clock, SystemClock};
use image_repository_controller::config::{self, DEFAULT_CONFIG_PATH};
use image_repository_controller::controller;
use image_repository_controller::credentials::CredentialResolver;
use image_repository_controller::oci_registry::{self, OciRegistryClient};
use image_repository_controller::reconciler::{Reconciler, ReconcilerSettings};
use image_repository_controller::scan_cache::ScanCache;
use image_repository_controller::scanner::RegistryScanner;
use image_repository_controller::schedule::RequeuePolicy;
use image_repository_controller::state::ControllerContext;
use image_repository_controller::store::KubeStore;
use image_repository_controller::webserver::{self, ServerState};
use std::env;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting image-repository-controller {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let server_state = ServerState::new();
    let shutdown = CancellationToken::new();
    let app = webserver::create_app(server_state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    let kube_client = controller::create_client().await?;
    let http_client = oci_registry::create_client(&config)?;
    let credentials = CredentialResolver::from_config(&config.registries)
        .context("Invalid registry hostname pattern")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(ScanCache::new(clock.clone()));
    let scanner = RegistryScanner::new(
        Arc::new(OciRegistryClient::new(http_client)),
        clock.clone(),
        config.scan.default_timeout,
    );
    let reconciler = Reconciler::new(
        KubeStore::new(kube_client.clone()),
        cache.clone(),
        scanner,
        Arc::new(credentials),
        clock,
        ReconcilerSettings {
            default_interval: config.scan.default_interval,
            requeue: RequeuePolicy::new(config.scan.backoff_base),
            ..ReconcilerSettings::default()
        },
    );

    info!(
        "Sweeping the scan cache at cron schedule {}",
        config.cache_sweep_schedule
    );
    let mut scheduler = JobScheduler::new().await?;
    let job = Job::new_async(config.cache_sweep_schedule.clone(), move |_uuid, _l| {
        let cache = cache.clone();
        Box::pin(async move {
            let evicted = cache.sweep();
            info!("Scan cache sweep evicted {} entries, {} remain", evicted, cache.len());
        })
    })
    .context("Invalid cacheSweepSchedule")?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let ctx = Arc::new(ControllerContext {
        kube_client,
        reconciler: Arc::new(reconciler),
        reconcile_deadline: config.scan.reconcile_deadline,
        backoff_base: config.scan.backoff_base,
        shutdown: shutdown.clone(),
    });
    server_state.mark_ready();

    let result = controller::run(ctx).await;

    shutdown.cancel();
    scheduler.shutdown().await?;
    server.await??;
    result
}
