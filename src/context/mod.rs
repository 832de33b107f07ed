//! The executor's local view of the cluster.
//!
//! [`KubeClusterContext`] owns the pod and node informers, the submitted-pods
//! cache bridging the gap between a create call and its informer
//! observation, and the staged-deletion machinery. Services consume it
//! through the [`ClusterContext`] trait so the construction DAG stays
//! acyclic and tests can script cluster behaviour.

mod deleted;
mod informer;
mod submitted;

pub use deleted::RecentlyDeletedCache;
pub use informer::{Informer, WatchSource};
pub use submitted::SubmittedPodCache;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::cluster::api::{ClusterApi, ObjectEvent, PodUsage};
use crate::error::Result;
use crate::metrics;
use crate::util::pod::{is_batch_pod, job_id, pod_name, pod_namespace, pod_uid};

#[async_trait]
pub trait ClusterContext: Send + Sync {
    /// Create `pod` on the cluster as `user`. On success the pod is held in
    /// the submitted-pods cache until the informer observes it.
    async fn submit_pod(&self, pod: &Pod, user: &str) -> Result<Pod>;

    /// Merge annotations onto a pod. Idempotent.
    async fn add_annotation(&self, pod: &Pod, annotations: &BTreeMap<String, String>)
        -> Result<()>;

    /// Stage pods for deletion. No cluster call happens until
    /// [`ClusterContext::process_pods_to_delete`].
    fn delete_pods(&self, pods: Vec<Pod>);

    /// Issue delete calls for staged pods, suppressing repeats within the
    /// minimum repeat period. NotFound counts as a successful delete.
    async fn process_pods_to_delete(&self) -> Result<()>;

    /// Union of informer-cached and submitted pods, deduplicated by name.
    fn get_all_pods(&self) -> Vec<Pod>;

    /// All pods carrying both batch labels, including transient ones.
    fn get_batch_pods(&self) -> Vec<Pod>;

    /// Batch pods from the informer only, excluding transient submissions.
    fn get_active_batch_pods(&self) -> Vec<Pod>;

    fn get_nodes(&self) -> Vec<Node>;

    /// Sample per-pod usage from the cluster metrics API.
    async fn get_pod_usage(&self) -> Result<Vec<PodUsage>>;

    /// Halt the informers. Pods submitted afterwards are never observed.
    fn stop(&self);
}

struct PodSource {
    api: Arc<dyn ClusterApi>,
}

#[async_trait]
impl WatchSource<Pod> for PodSource {
    async fn list(&self) -> Result<(Vec<Pod>, String)> {
        self.api.list_pods().await
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ObjectEvent<Pod>>>> {
        self.api.watch_pods(resource_version).await
    }

    fn key(&self, pod: &Pod) -> String {
        pod_name(pod).to_string()
    }
}

struct NodeSource {
    api: Arc<dyn ClusterApi>,
}

#[async_trait]
impl WatchSource<Node> for NodeSource {
    async fn list(&self) -> Result<(Vec<Node>, String)> {
        self.api.list_nodes().await
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ObjectEvent<Node>>>> {
        self.api.watch_nodes(resource_version).await
    }

    fn key(&self, node: &Node) -> String {
        node.metadata.name.clone().unwrap_or_default()
    }
}

pub struct KubeClusterContext {
    api: Arc<dyn ClusterApi>,
    pod_informer: Informer<Pod>,
    node_informer: Informer<Node>,
    submitted: Arc<SubmittedPodCache>,
    recently_deleted: RecentlyDeletedCache,
    pods_to_delete: Mutex<HashMap<String, Pod>>,
    minimum_repeat_delete_period: Duration,
}

impl KubeClusterContext {
    pub fn new(api: Arc<dyn ClusterApi>, minimum_repeat_delete_period: Duration) -> Self {
        let submitted = Arc::new(SubmittedPodCache::new());

        // The informer is authoritative: any observation of a job evicts its
        // transient submitted-pods entry.
        let eviction = submitted.clone();
        let pod_informer = Informer::start(
            PodSource { api: api.clone() },
            Some(Arc::new(move |event: &ObjectEvent<Pod>| {
                let pod = match event {
                    ObjectEvent::Applied(pod) | ObjectEvent::Deleted(pod) => pod,
                };
                if let Some(id) = job_id(pod) {
                    eviction.remove(id);
                }
            })),
        );

        let node_informer = Informer::start(NodeSource { api: api.clone() }, None);

        Self {
            api,
            pod_informer,
            node_informer,
            submitted,
            recently_deleted: RecentlyDeletedCache::new(),
            pods_to_delete: Mutex::new(HashMap::new()),
            minimum_repeat_delete_period,
        }
    }

    /// The transient-submission cache. Exposed so tests can assert on and
    /// perturb the informer/cache interplay directly.
    pub fn submitted_pods(&self) -> &SubmittedPodCache {
        &self.submitted
    }

    /// Identity used by the delete rate limiter: UID when the cluster has
    /// assigned one, pod name otherwise.
    fn delete_key(pod: &Pod) -> String {
        let uid = pod_uid(pod);
        if uid.is_empty() {
            pod_name(pod).to_string()
        } else {
            uid.to_string()
        }
    }
}

#[async_trait]
impl ClusterContext for KubeClusterContext {
    async fn submit_pod(&self, pod: &Pod, user: &str) -> Result<Pod> {
        let created = self.api.create_pod(pod, user).await?;
        self.submitted.add(&created);
        metrics::registry().inc(metrics::PODS_SUBMITTED);
        Ok(created)
    }

    async fn add_annotation(
        &self,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.api
            .patch_pod_annotations(pod_namespace(pod), pod_name(pod), annotations)
            .await
    }

    fn delete_pods(&self, pods: Vec<Pod>) {
        let mut staged = self.pods_to_delete.lock().unwrap();
        for pod in pods {
            staged.insert(pod_name(&pod).to_string(), pod);
        }
    }

    async fn process_pods_to_delete(&self) -> Result<()> {
        let staged: Vec<Pod> = {
            let mut pods = self.pods_to_delete.lock().unwrap();
            pods.drain().map(|(_, pod)| pod).collect()
        };

        self.recently_deleted
            .prune(self.minimum_repeat_delete_period);

        for pod in staged {
            let key = Self::delete_key(&pod);
            if self
                .recently_deleted
                .deleted_recently(&key, self.minimum_repeat_delete_period)
            {
                continue;
            }

            match self
                .api
                .delete_pod(pod_namespace(&pod), pod_name(&pod))
                .await
            {
                Ok(()) => {
                    self.recently_deleted.record(&key);
                    metrics::registry().inc(metrics::PODS_DELETED);
                }
                Err(e) if e.is_not_found() => {
                    // Already gone; remember it so repeats stay suppressed.
                    self.recently_deleted.record(&key);
                }
                Err(e) => {
                    tracing::warn!(pod = pod_name(&pod), error = %e, "Failed to delete pod");
                }
            }
        }
        Ok(())
    }

    fn get_all_pods(&self) -> Vec<Pod> {
        let mut pods = self.pod_informer.snapshot();
        let mut seen: std::collections::HashSet<String> =
            pods.iter().map(|pod| pod_name(pod).to_string()).collect();
        for pod in self.submitted.snapshot() {
            if seen.insert(pod_name(&pod).to_string()) {
                pods.push(pod);
            }
        }
        pods
    }

    fn get_batch_pods(&self) -> Vec<Pod> {
        self.get_all_pods()
            .into_iter()
            .filter(is_batch_pod)
            .collect()
    }

    fn get_active_batch_pods(&self) -> Vec<Pod> {
        self.pod_informer
            .snapshot()
            .into_iter()
            .filter(is_batch_pod)
            .collect()
    }

    fn get_nodes(&self) -> Vec<Node> {
        self.node_informer.snapshot()
    }

    async fn get_pod_usage(&self) -> Result<Vec<PodUsage>> {
        self.api.list_pod_usage().await
    }

    fn stop(&self) {
        self.pod_informer.stop();
        self.node_informer.stop();
    }
}
