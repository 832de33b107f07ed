//! Cluster-level utilisation reporting.
//!
//! Aggregates what the tracked part of the cluster can hold and what each
//! queue is occupying, and publishes the report to the central usage
//! service every tick.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;

use crate::api::UsageApi;
use crate::context::ClusterContext;
use crate::error::Result;
use crate::proto;
use crate::service::queue_utilisation::QueueUtilisationService;
use crate::util::pod::{node_allocatable, node_is_available, pod_name, pod_requests, queue};
use crate::util::ComputeResources;

pub struct ClusterUtilisationService {
    cluster_id: String,
    pool: String,
    context: Arc<dyn ClusterContext>,
    queue_utilisation: Arc<QueueUtilisationService>,
    usage_api: Arc<dyn UsageApi>,
    tracked_node_labels: Vec<String>,
    tolerated_taints: Vec<String>,
    expose_queue_usage: bool,
}

impl ClusterUtilisationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster_id: &str,
        pool: &str,
        context: Arc<dyn ClusterContext>,
        queue_utilisation: Arc<QueueUtilisationService>,
        usage_api: Arc<dyn UsageApi>,
        tracked_node_labels: Vec<String>,
        tolerated_taints: Vec<String>,
        expose_queue_usage: bool,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            pool: pool.to_string(),
            context,
            queue_utilisation,
            usage_api,
            tracked_node_labels,
            tolerated_taints,
            expose_queue_usage,
        }
    }

    /// When tracked labels are configured, only nodes carrying at least one
    /// of them count towards reported capacity.
    fn is_tracked(&self, node: &Node) -> bool {
        if self.tracked_node_labels.is_empty() {
            return true;
        }
        node.metadata
            .labels
            .as_ref()
            .map(|labels| {
                self.tracked_node_labels
                    .iter()
                    .any(|key| labels.contains_key(key))
            })
            .unwrap_or(false)
    }

    pub async fn report_cluster_utilisation(&self) -> Result<()> {
        let mut capacity = ComputeResources::new();
        for node in self.context.get_nodes() {
            if self.is_tracked(&node) && node_is_available(&node, &self.tolerated_taints) {
                capacity.add(&node_allocatable(&node));
            }
        }

        let mut total_used = ComputeResources::new();
        let mut by_queue: HashMap<String, ComputeResources> = HashMap::new();
        let mut usage_by_queue: HashMap<String, ComputeResources> = HashMap::new();

        for pod in self.context.get_active_batch_pods() {
            let requests = pod_requests(&pod);
            total_used.add(&requests);

            let queue_name = queue(&pod).unwrap_or_default().to_string();
            if queue_name.is_empty() {
                continue;
            }
            by_queue
                .entry(queue_name.clone())
                .or_default()
                .add(&requests);

            if self.expose_queue_usage {
                if let Some(aggregate) = self.queue_utilisation.usage_for_pod(pod_name(&pod)) {
                    usage_by_queue
                        .entry(queue_name)
                        .or_default()
                        .add(&aggregate.current);
                }
            }
        }

        let available = capacity.sub(&total_used);

        let queues = by_queue
            .into_iter()
            .map(|(name, resources)| proto::QueueReport {
                resources_used: usage_by_queue
                    .remove(&name)
                    .map(|usage| usage.to_string_map().into_iter().collect())
                    .unwrap_or_default(),
                resources: resources.to_string_map().into_iter().collect(),
                name,
            })
            .collect();

        self.usage_api
            .report_usage(proto::ClusterUsageReport {
                cluster_id: self.cluster_id.clone(),
                pool: self.pool.clone(),
                report_time: Utc::now().to_rfc3339(),
                cluster_capacity: capacity.to_string_map().into_iter().collect(),
                cluster_available_capacity: available.to_string_map().into_iter().collect(),
                queues,
            })
            .await
    }
}
