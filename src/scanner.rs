use crate::clock::Clock;
use crate::credentials::RegistryCredentials;
use crate::oci_registry::{RegistryError, TagLister};
use crate::scan_cache::ScanResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("scan was cancelled")]
    Cancelled,
}

/// Runs one bounded tag listing. Never touches the scan cache; storing the
/// result is up to the caller.
#[derive(Clone)]
pub struct RegistryScanner {
    lister: Arc<dyn TagLister>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
}

impl RegistryScanner {
    pub fn new(lister: Arc<dyn TagLister>, clock: Arc<dyn Clock>, default_timeout: Duration) -> Self {
        Self {
            lister,
            clock,
            default_timeout,
        }
    }

    pub async fn scan(
        &self,
        canonical_name: &str,
        credentials: Option<&RegistryCredentials>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, ScanError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(canonical_name, ?timeout, "scanning repository");

        let listing = tokio::time::timeout(
            timeout,
            self.lister.list_tags(canonical_name, credentials, timeout),
        );
        let tags = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            outcome = listing => match outcome {
                Ok(listed) => listed?,
                Err(_) => {
                    warn!(canonical_name, ?timeout, "scan exceeded its timeout");
                    return Err(RegistryError::Timeout(timeout).into());
                }
            },
        };

        Ok(ScanResult {
            canonical_name: canonical_name.to_string(),
            tags,
            scanned_at: self.clock.now(),
        })
    }
}
