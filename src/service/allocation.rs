//! Spare-capacity sizing and lease admission.
//!
//! Each tick measures what the cluster could still run, asks the central
//! queue for that much work, and admits the returned jobs as pods. The
//! server deduplicates lease requests by executor and job id, so a tick
//! racing a slow previous response cannot double-lease.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodSpec};

use crate::api::QueueApi;
use crate::context::ClusterContext;
use crate::error::Result;
use crate::job::ClusterJobContext;
use crate::metrics;
use crate::proto;
use crate::reporter::{EventMessage, EventSink, JobEventInfo, LeaseReturnedEvent, LeasedEvent};
use crate::util::pod::{
    node_allocatable, node_is_available, pod_requests, JOB_ID_LABEL, JOB_SET_ID_LABEL,
    POD_NUMBER_LABEL, QUEUE_ID_LABEL,
};
use crate::util::ComputeResources;

pub struct ClusterAllocationService {
    cluster_id: String,
    pool: String,
    context: Arc<dyn ClusterContext>,
    job_context: Arc<ClusterJobContext>,
    queue_api: Arc<dyn QueueApi>,
    events: Arc<dyn EventSink>,
    tolerated_taints: Vec<String>,
    minimum_job_size: ComputeResources,
    heartbeat_timeout: Duration,
}

impl ClusterAllocationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster_id: &str,
        pool: &str,
        context: Arc<dyn ClusterContext>,
        job_context: Arc<ClusterJobContext>,
        queue_api: Arc<dyn QueueApi>,
        events: Arc<dyn EventSink>,
        tolerated_taints: Vec<String>,
        minimum_job_size: ComputeResources,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            pool: pool.to_string(),
            context,
            job_context,
            queue_api,
            events,
            tolerated_taints,
            minimum_job_size,
            heartbeat_timeout,
        }
    }

    /// Compute spare capacity and admit new leases against it.
    pub async fn allocate_spare_capacity(&self) -> Result<()> {
        let spare = match self.spare_capacity() {
            Some(spare) => spare,
            None => return Ok(()),
        };

        metrics::registry().inc(metrics::LEASES_REQUESTED);
        let jobs = self
            .queue_api
            .lease_jobs(proto::JobLeaseRequest {
                cluster_id: self.cluster_id.clone(),
                pool: self.pool.clone(),
                resources: spare.to_string_map().into_iter().collect(),
                minimum_job_size: self.minimum_job_size.to_string_map().into_iter().collect(),
                heartbeat_timeout_seconds: self.heartbeat_timeout.as_secs() as u32,
            })
            .await?;

        if jobs.is_empty() {
            return Ok(());
        }
        tracing::info!(count = jobs.len(), "Leased jobs from queue");

        for job in jobs {
            self.admit_job(job).await;
        }
        Ok(())
    }

    /// Allocatable across available nodes minus requests of every known batch
    /// pod, including transient submissions still waiting for the informer.
    /// None when there is nothing worth requesting.
    fn spare_capacity(&self) -> Option<ComputeResources> {
        let mut total = ComputeResources::new();
        for node in self.context.get_nodes() {
            if node_is_available(&node, &self.tolerated_taints) {
                total.add(&node_allocatable(&node));
            }
        }
        if total.is_empty() {
            return None;
        }

        let mut used = ComputeResources::new();
        for pod in self.context.get_batch_pods() {
            used.add(&pod_requests(&pod));
        }

        let spare = total.sub(&used);
        if !spare.all_positive() {
            tracing::debug!("No spare capacity, skipping lease request");
            return None;
        }
        if !spare.covers(&self.minimum_job_size) {
            return None;
        }
        Some(spare)
    }

    /// Submit every pod of one leased job. A `leased` event follows success;
    /// any failure marks the job rejected (so its lease is returned rather
    /// than renewed) and emits `lease_returned` with the error text.
    async fn admit_job(&self, job: proto::Job) {
        let mut created: Vec<Pod> = Vec::new();
        let mut failure: Option<String> = None;

        for (pod_number, spec_json) in job.pod_specs.iter().enumerate() {
            let pod = match self.build_pod(&job, pod_number, spec_json) {
                Ok(pod) => pod,
                Err(e) => {
                    failure = Some(format!("invalid pod spec: {}", e));
                    break;
                }
            };
            match self.context.submit_pod(&pod, &job.owner).await {
                Ok(pod) => created.push(pod),
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let info = JobEventInfo {
            job_id: job.id.clone(),
            job_set_id: job.job_set_id.clone(),
            queue: job.queue.clone(),
            created_at: Utc::now(),
        };

        match failure {
            None => {
                self.events.report(EventMessage::Leased(LeasedEvent {
                    info,
                    cluster_id: self.cluster_id.clone(),
                }));
            }
            Some(reason) => {
                tracing::warn!(job_id = %job.id, reason = %reason, "Failed to admit leased job");
                metrics::registry().inc(metrics::LEASES_RETURNED);
                self.job_context
                    .register_submission_failure(&job.id, &reason);
                // Partially created pods cannot run as a complete job.
                if !created.is_empty() {
                    self.context.delete_pods(created);
                }
                self.events
                    .report(EventMessage::LeaseReturned(LeaseReturnedEvent {
                        info,
                        cluster_id: self.cluster_id.clone(),
                        reason,
                    }));
            }
        }
    }

    fn build_pod(&self, job: &proto::Job, pod_number: usize, spec_json: &str) -> Result<Pod> {
        let spec: PodSpec = serde_json::from_str(spec_json)?;

        let mut labels: BTreeMap<String, String> = job.labels.clone().into_iter().collect();
        labels.insert(JOB_ID_LABEL.to_string(), job.id.clone());
        labels.insert(POD_NUMBER_LABEL.to_string(), pod_number.to_string());
        labels.insert(QUEUE_ID_LABEL.to_string(), job.queue.clone());
        labels.insert(JOB_SET_ID_LABEL.to_string(), job.job_set_id.clone());

        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("convoy-{}-{}", job.id, pod_number));
        pod.metadata.namespace = Some(if job.namespace.is_empty() {
            "default".to_string()
        } else {
            job.namespace.clone()
        });
        pod.metadata.labels = Some(labels);
        if !job.annotations.is_empty() {
            pod.metadata.annotations = Some(job.annotations.clone().into_iter().collect());
        }
        pod.spec = Some(spec);
        Ok(pod)
    }
}
