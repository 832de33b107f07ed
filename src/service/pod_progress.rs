//! Stuck pod detection and resolution.
//!
//! A pod that has sat short of running past the configured expiry is driven
//! to a resolved state: recoverable causes give the lease back so the job
//! can run elsewhere, unrecoverable ones fail the job with the diagnostic.
//! Either way the pod is deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::context::ClusterContext;
use crate::error::Result;
use crate::reporter::{
    event_info_for_pod, has_reported, EventMessage, EventSink, FailedEvent, UnableToScheduleEvent,
};
use crate::service::lease::JobLeaseService;
use crate::util::pod::{diagnose_stuck_pod, is_in_terminal_state, job_id, phase, pod_age, pod_name};

pub struct PodProgressMonitor {
    cluster_id: String,
    context: Arc<dyn ClusterContext>,
    events: Arc<dyn EventSink>,
    lease_service: Arc<JobLeaseService>,
    stuck_pod_expiry: Duration,
}

impl PodProgressMonitor {
    pub fn new(
        cluster_id: &str,
        context: Arc<dyn ClusterContext>,
        events: Arc<dyn EventSink>,
        lease_service: Arc<JobLeaseService>,
        stuck_pod_expiry: Duration,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            context,
            events,
            lease_service,
            stuck_pod_expiry,
        }
    }

    pub async fn handle_stuck_pods(&self) -> Result<()> {
        let now = Utc::now();
        for pod in self.context.get_batch_pods() {
            if is_in_terminal_state(&pod) || phase(&pod) == "Running" {
                continue;
            }
            let stuck_for = match pod_age(&pod, now).and_then(|age| age.to_std().ok()) {
                Some(age) => age,
                None => continue,
            };
            if stuck_for < self.stuck_pod_expiry {
                continue;
            }

            let cause = diagnose_stuck_pod(&pod);
            let info = event_info_for_pod(&pod);

            if cause.retryable {
                if !has_reported(&pod, "unable_to_schedule") {
                    tracing::info!(
                        pod = pod_name(&pod),
                        reason = %cause.message,
                        "Stuck pod is recoverable, returning lease"
                    );
                    self.events.report_for_pod(
                        EventMessage::UnableToSchedule(UnableToScheduleEvent {
                            info,
                            cluster_id: self.cluster_id.clone(),
                            reason: cause.message.clone(),
                        }),
                        &pod,
                    );
                    if let Some(id) = job_id(&pod) {
                        self.lease_service.return_lease(id, &cause.message).await;
                    }
                }
            } else if !has_reported(&pod, "failed") {
                tracing::warn!(
                    pod = pod_name(&pod),
                    reason = %cause.message,
                    "Stuck pod is unrecoverable, failing job"
                );
                self.events.report_for_pod(
                    EventMessage::Failed(FailedEvent {
                        info,
                        cluster_id: self.cluster_id.clone(),
                        reason: cause.message.clone(),
                        exit_codes: Default::default(),
                        node_name: Default::default(),
                    }),
                    &pod,
                );
            }

            self.context.delete_pods(vec![pod]);
        }
        Ok(())
    }
}
