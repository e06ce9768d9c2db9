use crate::reconciler::ReconcileError;
use crate::resource::{ImageRepository, ResourceKey};
use crate::schedule::Requeue;
use crate::state::ControllerContext;
use anyhow::Context;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{self, Event, finalizer};
use kube::runtime::{Controller, watcher};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static FINALIZER: &str = "image.reflector.dev/finalizer";
static CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("ImageRepository without namespace or name")]
    MissingKey,
    #[error(transparent)]
    Finalizer(#[from] Box<finalizer::Error<ReconcileError>>),
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s controller");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Watches `ImageRepository` resources in all namespaces until SIGINT or
/// SIGTERM.
pub async fn run(ctx: Arc<ControllerContext>) -> anyhow::Result<()> {
    let repositories: Api<ImageRepository> = Api::all(ctx.kube_client.clone());
    repositories
        .list(&ListParams::default().limit(1))
        .await
        .context("Failed to list ImageRepository resources, is the CRD installed?")?;

    info!("Watching ImageRepository resources in all namespaces");
    Controller::new(repositories, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((object, _)) => debug!("Reconciled {}/{}", object.namespace.as_deref().unwrap_or_default(), object.name),
                Err(e) => debug!("Reconciliation did not complete: {}", e),
            }
            futures::future::ready(())
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

pub async fn reconcile(
    repository: Arc<ImageRepository>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ControllerError> {
    let key = ResourceKey::of(repository.as_ref()).ok_or(ControllerError::MissingKey)?;
    let api: Api<ImageRepository> = Api::namespaced(ctx.kube_client.clone(), &key.namespace);

    let key = &key;
    let ctx = &ctx;
    finalizer(&api, FINALIZER, repository, move |event| async move {
        match event {
            Event::Apply(_) => {
                let deadline = Deadline::start(&ctx.shutdown, ctx.reconcile_deadline);
                ctx.reconciler
                    .reconcile(key, deadline.token())
                    .await
                    .map(action)
            }
            Event::Cleanup(_) => {
                ctx.reconciler.forget(key);
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| ControllerError::Finalizer(Box::new(e)))
}

pub fn error_policy(
    repository: Arc<ImageRepository>,
    error: &ControllerError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let delay = retry_delay(error, ctx.backoff_base);
    warn!(
        "Reconciliation of {}/{} failed, retrying in {:?}: {}",
        repository.metadata.namespace.as_deref().unwrap_or_default(),
        repository.metadata.name.as_deref().unwrap_or("unknown"),
        delay,
        error
    );
    Action::requeue(delay)
}

fn retry_delay(error: &ControllerError, backoff_base: Duration) -> Duration {
    match error {
        ControllerError::Finalizer(e)
            if matches!(**e, finalizer::Error::ApplyFailed(ReconcileError::Conflict(_))) =>
        {
            CONFLICT_RETRY_DELAY
        }
        _ => backoff_base,
    }
}

fn action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::After(delay) => Action::requeue(delay),
        Requeue::AwaitChange => Action::await_change(),
    }
}

/// Cancellation token that fires once the deadline passes or the parent is
/// cancelled. The timer stops when this is dropped.
struct Deadline {
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn start(parent: &CancellationToken, deadline: Duration) -> Self {
        let token = parent.child_token();
        let timer = tokio::spawn({
            let token = token.clone();
            async move {
                if tokio::time::timeout(deadline, token.cancelled()).await.is_err() {
                    warn!("Reconciliation exceeded its deadline of {:?}, cancelling", deadline);
                    token.cancel();
                }
            }
        });
        Self { token, timer }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
