//! Drives a single `ImageRepository` from "just created" to "ready" and keeps
//! it scanning on its interval.
//!
//! Per invocation the reconciler performs at most one remote scan, one cache
//! write and one status write. Invoking it again for an unchanged resource
//! whose scan is still fresh performs no remote call and no write.

use crate::canonical::{canonicalize, split_canonical};
use crate::clock::Clock;
use crate::credentials::CredentialResolver;
use crate::duration::format_duration;
use crate::resource::{
    ConditionReason, ErrorClass, ImageRepository, ImageRepositoryStatus, LastScanError,
    ResourceKey, ScanSummary,
};
use crate::scan_cache::{ScanCache, ScanResult};
use crate::scanner::{RegistryScanner, ScanError};
use crate::schedule::{Outcome, Requeue, RequeuePolicy};
use crate::store::{ResourceStore, StoreError};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("status of {0} kept changing underneath the reconciler")]
    Conflict(ResourceKey),
    #[error("reconciliation of {0} was cancelled")]
    Cancelled(ResourceKey),
    #[error(transparent)]
    Store(StoreError),
}

/// Observed lifecycle stage, derived from status rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unresolved,
    AwaitingScan,
    Ready,
    Failing,
}

impl ResourceState {
    pub fn of(status: Option<&ImageRepositoryStatus>) -> Self {
        match status {
            None => ResourceState::Unresolved,
            Some(status) if status.canonical_image_name.is_empty() => ResourceState::Unresolved,
            Some(status) if status.last_scan_error.is_some() => ResourceState::Failing,
            Some(status) if status.is_ready() => ResourceState::Ready,
            Some(_) => ResourceState::AwaitingScan,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub default_interval: Duration,
    pub requeue: RequeuePolicy,
    pub max_conflict_retries: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(60),
            requeue: RequeuePolicy::new(Duration::from_secs(5)),
            max_conflict_retries: 3,
        }
    }
}

/// Desired state of a resource, validated.
struct Desired {
    canonical_name: String,
    interval: Duration,
    timeout: Option<Duration>,
    exclusions: Vec<Regex>,
}

pub struct Reconciler<S> {
    store: S,
    cache: Arc<ScanCache>,
    scanner: RegistryScanner,
    credentials: Arc<CredentialResolver>,
    clock: Arc<dyn Clock>,
    settings: ReconcilerSettings,
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(
        store: S,
        cache: Arc<ScanCache>,
        scanner: RegistryScanner,
        credentials: Arc<CredentialResolver>,
        clock: Arc<dyn Clock>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            cache,
            scanner,
            credentials,
            clock,
            settings,
        }
    }

    /// Reconciles the resource behind `key` and says when to come back.
    /// Status write conflicts restart from a fresh read and do not count as
    /// failures.
    pub async fn reconcile(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> Result<Requeue, ReconcileError> {
        for attempt in 0..=self.settings.max_conflict_retries {
            match self.reconcile_once(key, cancel).await {
                Err(ReconcileError::Conflict(_)) => {
                    debug!(%key, attempt, "status write conflicted, retrying from a fresh read");
                }
                other => return other,
            }
        }
        Err(ReconcileError::Conflict(key.clone()))
    }

    /// Stops tracking a deleted resource. Returns the canonical name whose
    /// cache entry went away because `key` was its last referrer.
    pub fn forget(&self, key: &ResourceKey) -> Option<String> {
        let evicted = self.cache.release(key);
        match &evicted {
            Some(canonical_name) => {
                info!(%key, %canonical_name, "Released last reference, evicted scan cache entry")
            }
            None => debug!(%key, "Released scan cache reference"),
        }
        evicted
    }

    async fn reconcile_once(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> Result<Requeue, ReconcileError> {
        let Some(repository) = self.store.get(key).await.map_err(ReconcileError::Store)? else {
            self.forget(key);
            return Ok(Requeue::AwaitChange);
        };

        let current = repository.status.clone().unwrap_or_default();
        let generation = repository.metadata.generation;
        debug!(
            %key,
            state = ?ResourceState::of(repository.status.as_ref()),
            ?generation,
            observed_generation = ?current.observed_generation,
            "Reconciling ImageRepository"
        );
        if current.observed_generation.is_some() && current.observed_generation != generation {
            info!(%key, "Spec changed since last reconciliation, re-resolving image {}", repository.spec.image);
        }

        let mut status = current.clone();
        status.observed_generation = generation;
        let now = self.clock.now();

        if repository.spec.suspend {
            self.cache.release(key);
            status.set_ready(false, ConditionReason::Suspended, "scanning is suspended", now);
            self.write_status(key, &repository, &current, &status).await?;
            return Ok(Requeue::AwaitChange);
        }

        let desired = match self.desired(&repository) {
            Ok(desired) => desired,
            Err((class, message)) => {
                warn!(%key, "Invalid ImageRepository spec: {}", message);
                self.cache.release(key);
                if class == ErrorClass::InvalidReference {
                    status.canonical_image_name.clear();
                }
                status.consecutive_failures = 0;
                status.last_scan_error = Some(LastScanError {
                    classification: class,
                    message: message.clone(),
                });
                status.set_ready(false, ConditionReason::InvalidSpec, message, now);
                self.write_status(key, &repository, &current, &status).await?;
                return Ok(self.settings.requeue.next_requeue(
                    Outcome::AwaitingSpecChange,
                    0,
                    self.settings.default_interval,
                ));
            }
        };
        status.canonical_image_name = desired.canonical_name.clone();

        self.cache.track(&desired.canonical_name, key, desired.interval);

        let requested_at = repository.requested_at().map(str::to_string);
        let forced = requested_at.is_some() && requested_at != current.last_handled_reconcile_at;
        let unchanged = current.observed_generation == generation
            && current.canonical_image_name == desired.canonical_name;
        if !forced && unchanged {
            if let Some(remaining) = self.retry_pending(&current, desired.interval, now) {
                debug!(%key, "Last scan failed, next attempt in {}", format_duration(remaining));
                return Ok(Requeue::After(remaining));
            }
        }

        let cached = if forced {
            info!(%key, "Scan requested through annotation, bypassing the scan cache");
            None
        } else {
            self.fresh_cached(key, &desired)
        };

        let outcome = match cached {
            Some(result) => {
                debug!(%key, canonical_name = %desired.canonical_name, "Using cached scan result");
                record_success(&mut status, &result, &desired.exclusions, now);
                Outcome::Succeeded
            }
            None => {
                let (host, _) = split_canonical(&desired.canonical_name).unwrap_or_default();
                let secret_ref = repository.spec.secret_ref.as_ref().map(|r| r.name.as_str());
                let credentials = self.credentials.resolve(host, secret_ref);

                let scanned = self
                    .scanner
                    .scan(&desired.canonical_name, credentials, desired.timeout, cancel)
                    .await;
                if cancel.is_cancelled() {
                    return Err(ReconcileError::Cancelled(key.clone()));
                }
                status.last_attempt_time = Some(now);

                match scanned {
                    Ok(result) => {
                        let result = Arc::new(result);
                        self.cache
                            .put(&desired.canonical_name, Arc::clone(&result), desired.interval);
                        info!(
                            %key,
                            canonical_name = %desired.canonical_name,
                            "Scan found {} tags",
                            result.tags.len()
                        );
                        record_success(&mut status, &result, &desired.exclusions, now);
                        Outcome::Succeeded
                    }
                    Err(ScanError::Cancelled) => return Err(ReconcileError::Cancelled(key.clone())),
                    Err(ScanError::Registry(error)) => {
                        let class = error.class();
                        warn!(%key, canonical_name = %desired.canonical_name, %class, "Scan failed: {}", error);
                        status.last_scan_error = Some(LastScanError {
                            classification: class,
                            message: error.to_string(),
                        });
                        status.set_ready(false, class.reason(), error.to_string(), now);
                        if class.is_transient() {
                            status.consecutive_failures = current.consecutive_failures.saturating_add(1);
                            Outcome::TransientFailure
                        } else {
                            status.consecutive_failures = 0;
                            Outcome::PermanentFailure
                        }
                    }
                }
            }
        };

        if forced {
            status.last_handled_reconcile_at = requested_at;
        }
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(key.clone()));
        }

        self.write_status(key, &repository, &current, &status).await?;

        let requeue = self.settings.requeue.next_requeue(
            outcome,
            status.consecutive_failures,
            desired.interval,
        );
        if let Requeue::After(delay) = requeue {
            debug!(%key, "Next reconciliation in {}", format_duration(delay));
        }
        Ok(requeue)
    }

    fn desired(&self, repository: &ImageRepository) -> Result<Desired, (ErrorClass, String)> {
        let canonical_name = canonicalize(&repository.spec.image)
            .map_err(|e| (ErrorClass::InvalidReference, e.to_string()))?;
        let interval = repository
            .spec
            .scan_interval_or(self.settings.default_interval)
            .map_err(|e| (ErrorClass::InvalidSpec, format!("scanInterval: {}", e)))?;
        let timeout = repository
            .spec
            .timeout()
            .map_err(|e| (ErrorClass::InvalidSpec, format!("timeout: {}", e)))?;
        let exclusions = repository
            .spec
            .exclusion_list
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| (ErrorClass::InvalidSpec, format!("exclusionList: {}", e)))?;

        Ok(Desired {
            canonical_name,
            interval,
            timeout,
            exclusions,
        })
    }

    /// Time left before a failed scan may be retried, `None` once it is due.
    fn retry_pending(
        &self,
        status: &ImageRepositoryStatus,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let class = status.last_scan_error.as_ref()?.classification;
        let outcome = match class {
            ErrorClass::InvalidReference | ErrorClass::InvalidSpec => return None,
            class if class.is_transient() => Outcome::TransientFailure,
            _ => Outcome::PermanentFailure,
        };
        let attempted = status.last_attempt_time?;
        let Requeue::After(window) =
            self.settings
                .requeue
                .next_requeue(outcome, status.consecutive_failures, interval)
        else {
            return None;
        };
        let elapsed = (now - attempted).to_std().unwrap_or(Duration::ZERO);
        window.checked_sub(elapsed).filter(|remaining| !remaining.is_zero())
    }

    fn fresh_cached(&self, key: &ResourceKey, desired: &Desired) -> Option<Arc<ScanResult>> {
        match self.cache.get(&desired.canonical_name) {
            Ok(Some(lookup)) if lookup.fresh => Some(lookup.result),
            Ok(_) => None,
            Err(error) => {
                warn!(%key, "Discarding scan cache entry and forcing a fresh scan: {}", error);
                self.cache.invalidate(&desired.canonical_name);
                None
            }
        }
    }

    async fn write_status(
        &self,
        key: &ResourceKey,
        repository: &ImageRepository,
        current: &ImageRepositoryStatus,
        status: &ImageRepositoryStatus,
    ) -> Result<(), ReconcileError> {
        if repository.status.is_some() && current == status {
            debug!(%key, "Status unchanged, skipping update");
            return Ok(());
        }
        self.store
            .update_status(key, repository.metadata.resource_version.as_deref(), status)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                StoreError::Conflict(key) => ReconcileError::Conflict(key),
                other => ReconcileError::Store(other),
            })
    }
}

fn record_success(
    status: &mut ImageRepositoryStatus,
    result: &ScanResult,
    exclusions: &[Regex],
    now: DateTime<Utc>,
) {
    let tags: Vec<String> = result
        .tags
        .iter()
        .filter(|tag| !exclusions.iter().any(|re| re.is_match(tag)))
        .cloned()
        .collect();
    let summary = ScanSummary::from_tags(&tags, result.scanned_at);
    let message = format!("successful scan, found {} tags", summary.tag_count);

    status.last_scan_result = Some(summary);
    status.last_scan_error = None;
    status.consecutive_failures = 0;
    status.set_ready(true, ConditionReason::Succeeded, message, now);
}
