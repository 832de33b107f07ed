//! Lease upkeep.
//!
//! One batched renewal per tick covers every active job. Jobs the cluster
//! rejected locally are returned instead of renewed, jobs the server no
//! longer recognizes are torn down, and finished jobs old enough to be safe
//! from event races are finalized.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::api::QueueApi;
use crate::context::ClusterContext;
use crate::error::Result;
use crate::job::{ClusterJobContext, RunningJob};
use crate::reporter::{event_info_for_pod, EventMessage, EventSink};
use crate::util::pod::{is_in_terminal_state, phase, terminal_time};

pub struct JobLeaseService {
    cluster_id: String,
    context: Arc<dyn ClusterContext>,
    job_context: Arc<ClusterJobContext>,
    queue_api: Arc<dyn QueueApi>,
    events: Arc<dyn EventSink>,
    minimum_pod_age: Duration,
    failed_pod_expiry: Duration,
}

impl JobLeaseService {
    pub fn new(
        cluster_id: &str,
        context: Arc<dyn ClusterContext>,
        job_context: Arc<ClusterJobContext>,
        queue_api: Arc<dyn QueueApi>,
        events: Arc<dyn EventSink>,
        minimum_pod_age: Duration,
        failed_pod_expiry: Duration,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            context,
            job_context,
            queue_api,
            events,
            minimum_pod_age,
            failed_pod_expiry,
        }
    }

    /// Give one lease back to the server. On RPC failure the rejection is
    /// re-registered so the next tick retries.
    pub async fn return_lease(&self, job_id: &str, reason: &str) {
        if let Err(e) = self
            .queue_api
            .return_lease(&self.cluster_id, job_id, reason)
            .await
        {
            tracing::warn!(job_id, error = %e, "Failed to return lease, will retry");
            self.job_context.register_submission_failure(job_id, reason);
        }
    }

    pub async fn manage_job_leases(&self) -> Result<()> {
        let rejected = self.job_context.drain_rejected();
        let rejected_ids: HashSet<String> =
            rejected.iter().map(|(job_id, _)| job_id.clone()).collect();
        for (job_id, reason) in rejected {
            self.return_lease(&job_id, &reason).await;
        }

        let jobs = self.job_context.get_jobs();
        self.renew_active_leases(&jobs, &rejected_ids).await;
        self.finalize_finished_jobs(&jobs).await;
        Ok(())
    }

    async fn renew_active_leases(&self, jobs: &[RunningJob], rejected_ids: &HashSet<String>) {
        let active: Vec<&RunningJob> = jobs
            .iter()
            .filter(|job| {
                job.is_active()
                    && !rejected_ids.contains(&job.job_id)
                    && !self.job_context.is_rejected(&job.job_id)
            })
            .collect();
        if active.is_empty() {
            return;
        }

        let ids: Vec<String> = active.iter().map(|job| job.job_id.clone()).collect();
        let renewed = match self.queue_api.renew_lease(&self.cluster_id, ids).await {
            Ok(renewed) => renewed.into_iter().collect::<HashSet<_>>(),
            Err(e) => {
                // Transient: the next tick renews again well inside the
                // server's expiry window.
                tracing::warn!(error = %e, "Lease renewal failed");
                return;
            }
        };

        for job in active {
            if renewed.contains(&job.job_id) {
                continue;
            }
            tracing::warn!(job_id = %job.job_id, "Lease no longer held, removing job");
            if let Some(pod) = job.pods.first() {
                self.events
                    .report_for_pod(EventMessage::LeaseExpired(event_info_for_pod(pod)), pod);
            }
            self.context.delete_pods(job.pods.clone());
        }
    }

    /// Report done and clean up jobs whose pods all reached a terminal phase
    /// long enough ago. Failed pods are kept around for `failed_pod_expiry`
    /// so their diagnostics stay inspectable; everything waits at least
    /// `minimum_pod_age` so late events still find the pod.
    async fn finalize_finished_jobs(&self, jobs: &[RunningJob]) {
        let now = Utc::now();
        let mut done_ids = Vec::new();
        let mut cleanup = Vec::new();

        for job in jobs {
            if job.is_active() || job.pods.is_empty() {
                continue;
            }

            let expired = job.pods.iter().all(|pod| {
                let expiry = if phase(pod) == "Failed" {
                    self.failed_pod_expiry.max(self.minimum_pod_age)
                } else {
                    self.minimum_pod_age
                };
                match terminal_time(pod) {
                    Some(finished) => {
                        now.signed_duration_since(finished).to_std().unwrap_or_default() >= expiry
                    }
                    None => false,
                }
            });
            if !expired {
                continue;
            }

            debug_assert!(job.pods.iter().all(is_in_terminal_state));
            done_ids.push(job.job_id.clone());
            cleanup.extend(job.pods.iter().cloned());
        }

        if done_ids.is_empty() {
            return;
        }

        match self.queue_api.report_done(&self.cluster_id, done_ids).await {
            Ok(acknowledged) => {
                tracing::info!(count = acknowledged.len(), "Finalized finished jobs");
                self.context.delete_pods(cleanup);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to report finished jobs");
            }
        }
    }
}
