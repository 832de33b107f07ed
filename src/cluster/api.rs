//! The surface of the Kubernetes API the executor touches.
//!
//! Everything above this layer talks to [`ClusterApi`]; the trait keeps the
//! informers and the cluster context testable against a scripted fake, the
//! same seam the services get from the context itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::cluster::client::KubeClientProvider;
use crate::error::{ExecutorError, Result};
use crate::util::pod::pod_namespace;
use crate::util::quantity::ComputeResources;

/// One observation from a cluster watch.
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    Applied(K),
    Deleted(K),
}

/// Sampled resource usage for one pod, from the cluster metrics API.
#[derive(Debug, Clone)]
pub struct PodUsage {
    pub name: String,
    pub namespace: String,
    pub usage: ComputeResources,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a pod as `user` (impersonated when configured). Returns the pod
    /// as accepted by the cluster.
    async fn create_pod(&self, pod: &Pod, user: &str) -> Result<Pod>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge-patch annotations onto a pod. Safe to repeat.
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// List all pods, returning the resource version the watch should resume
    /// from.
    async fn list_pods(&self) -> Result<(Vec<Pod>, String)>;

    async fn watch_pods(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ObjectEvent<Pod>>>>;

    async fn list_nodes(&self) -> Result<(Vec<Node>, String)>;

    async fn watch_nodes(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ObjectEvent<Node>>>>;

    /// Sample per-pod usage from the metrics API.
    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>>;
}

/// Production implementation over the real cluster.
pub struct KubeClusterApi {
    provider: KubeClientProvider,
}

impl KubeClusterApi {
    pub fn new(provider: KubeClientProvider) -> Self {
        Self { provider }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.provider.client(), namespace)
    }

    fn all_pods(&self) -> Api<Pod> {
        Api::all(self.provider.client())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.provider.client())
    }
}

fn convert_watch_event<K>(event: WatchEvent<K>) -> Option<Result<ObjectEvent<K>>> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Some(Ok(ObjectEvent::Applied(obj))),
        WatchEvent::Deleted(obj) => Some(Ok(ObjectEvent::Deleted(obj))),
        WatchEvent::Bookmark(_) => None,
        WatchEvent::Error(status) => Some(Err(ExecutorError::Internal(format!(
            "watch error: {}",
            status.message
        )))),
    }
}

/// Bridge one watch session into an owned stream. The forwarding task holds
/// the `Api` for the lifetime of the watch and ends when the server closes
/// the session or the consumer drops the stream; connection errors surface
/// as the first stream item.
fn watch_forwarded<K>(
    api: Api<K>,
    resource_version: String,
) -> BoxStream<'static, Result<ObjectEvent<K>>>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(128);
    tokio::spawn(async move {
        let stream = match api.watch(&WatchParams::default(), &resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(Err(ExecutorError::from(e))).await;
                return;
            }
        };
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            let item = match event {
                Ok(event) => match convert_watch_event(event) {
                    Some(item) => item,
                    None => continue,
                },
                Err(e) => Err(ExecutorError::from(e)),
            };
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });
    ReceiverStream::new(rx).boxed()
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_pod(&self, pod: &Pod, user: &str) -> Result<Pod> {
        let client = self.provider.client_for_user(user)?;
        let api: Api<Pod> = Api::namespaced(client, pod_namespace(pod));
        let created = api.create(&PostParams::default(), pod).await?;
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods(&self) -> Result<(Vec<Pod>, String)> {
        let list = self.all_pods().list(&ListParams::default()).await?;
        let version = list.metadata.resource_version.unwrap_or_default();
        Ok((list.items, version))
    }

    async fn watch_pods(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ObjectEvent<Pod>>>> {
        Ok(watch_forwarded(self.all_pods(), resource_version.to_string()))
    }

    async fn list_nodes(&self) -> Result<(Vec<Node>, String)> {
        let list = self.nodes().list(&ListParams::default()).await?;
        let version = list.metadata.resource_version.unwrap_or_default();
        Ok((list.items, version))
    }

    async fn watch_nodes(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ObjectEvent<Node>>>> {
        Ok(watch_forwarded(self.nodes(), resource_version.to_string()))
    }

    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>> {
        let request = http::Request::builder()
            .uri("/apis/metrics.k8s.io/v1beta1/pods")
            .body(Vec::new())
            .map_err(|e| ExecutorError::Internal(format!("metrics request: {}", e)))?;

        let metrics: PodMetricsList = self.provider.client().request(request).await?;
        Ok(metrics
            .items
            .into_iter()
            .map(|item| {
                let mut usage = ComputeResources::new();
                for container in item.containers {
                    if let Ok(sample) = ComputeResources::from_string_map(&container.usage) {
                        usage.add(&sample);
                    }
                }
                PodUsage {
                    name: item.metadata.name,
                    namespace: item.metadata.namespace,
                    usage,
                }
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetricsItem>,
}

#[derive(Deserialize)]
struct PodMetricsItem {
    metadata: PodMetricsMeta,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Deserialize)]
struct PodMetricsMeta {
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Deserialize)]
struct ContainerMetrics {
    #[serde(default)]
    usage: BTreeMap<String, String>,
}
