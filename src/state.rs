use crate::reconciler::Reconciler;
use crate::store::KubeStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ControllerContext {
    pub kube_client: kube::Client,
    pub reconciler: Arc<Reconciler<KubeStore>>,
    /// Upper bound for one reconciliation, status write included
    pub reconcile_deadline: Duration,
    pub backoff_base: Duration,
    pub shutdown: CancellationToken,
}
