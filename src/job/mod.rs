//! Job-oriented view over raw pods.
//!
//! A job is one or more pods sharing a `job_id` label. The job context also
//! remembers jobs the cluster rejected locally (admission failures) so the
//! lease service returns those leases instead of renewing them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Pod;

use crate::context::ClusterContext;
use crate::util::pod::{is_in_terminal_state, job_id, job_set_id, queue};

/// One job as currently visible on the cluster.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job_id: String,
    pub queue: String,
    pub job_set_id: String,
    pub pods: Vec<Pod>,
}

impl RunningJob {
    /// A job is active while any of its pods has not reached a terminal
    /// phase.
    pub fn is_active(&self) -> bool {
        self.pods.iter().any(|pod| !is_in_terminal_state(pod))
    }
}

pub struct ClusterJobContext {
    context: Arc<dyn ClusterContext>,
    rejected: Mutex<HashMap<String, String>>,
}

impl ClusterJobContext {
    pub fn new(context: Arc<dyn ClusterContext>) -> Self {
        Self {
            context,
            rejected: Mutex::new(HashMap::new()),
        }
    }

    /// Group the batch pods into jobs. Pods missing the queue or job-set
    /// labels still group by job id; their event metadata is simply empty.
    pub fn get_jobs(&self) -> Vec<RunningJob> {
        let mut jobs: HashMap<String, RunningJob> = HashMap::new();
        for pod in self.context.get_batch_pods() {
            let id = match job_id(&pod) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let entry = jobs.entry(id.clone()).or_insert_with(|| RunningJob {
                job_id: id,
                queue: queue(&pod).unwrap_or_default().to_string(),
                job_set_id: job_set_id(&pod).unwrap_or_default().to_string(),
                pods: Vec::new(),
            });
            entry.pods.push(pod);
        }
        jobs.into_values().collect()
    }

    /// Record that the cluster refused this job before it started.
    pub fn register_submission_failure(&self, job_id: &str, reason: &str) {
        self.rejected
            .lock()
            .unwrap()
            .insert(job_id.to_string(), reason.to_string());
    }

    pub fn is_rejected(&self, job_id: &str) -> bool {
        self.rejected.lock().unwrap().contains_key(job_id)
    }

    /// Take the rejected jobs, leaving the record empty. Each entry is
    /// `(job_id, reason)`.
    pub fn drain_rejected(&self) -> Vec<(String, String)> {
        self.rejected.lock().unwrap().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::api::PodUsage;
    use crate::error::Result;
    use crate::util::pod::{JOB_ID_LABEL, POD_NUMBER_LABEL};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Node;
    use std::collections::BTreeMap;

    struct StubContext {
        pods: Vec<Pod>,
    }

    #[async_trait]
    impl ClusterContext for StubContext {
        async fn submit_pod(&self, pod: &Pod, _user: &str) -> Result<Pod> {
            Ok(pod.clone())
        }
        async fn add_annotation(
            &self,
            _pod: &Pod,
            _annotations: &BTreeMap<String, String>,
        ) -> Result<()> {
            Ok(())
        }
        fn delete_pods(&self, _pods: Vec<Pod>) {}
        async fn process_pods_to_delete(&self) -> Result<()> {
            Ok(())
        }
        fn get_all_pods(&self) -> Vec<Pod> {
            self.pods.clone()
        }
        fn get_batch_pods(&self) -> Vec<Pod> {
            self.pods.clone()
        }
        fn get_active_batch_pods(&self) -> Vec<Pod> {
            self.pods.clone()
        }
        fn get_nodes(&self) -> Vec<Node> {
            Vec::new()
        }
        async fn get_pod_usage(&self) -> Result<Vec<PodUsage>> {
            Ok(Vec::new())
        }
        fn stop(&self) {}
    }

    fn batch_pod(job: &str, number: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("{}-{}", job, number));
        pod.metadata.labels = Some(
            [
                (JOB_ID_LABEL.to_string(), job.to_string()),
                (POD_NUMBER_LABEL.to_string(), number.to_string()),
            ]
            .into(),
        );
        pod
    }

    #[test]
    fn test_pods_group_by_job_id() {
        let context = Arc::new(StubContext {
            pods: vec![
                batch_pod("j1", "0"),
                batch_pod("j1", "1"),
                batch_pod("j2", "0"),
            ],
        });
        let jobs = ClusterJobContext::new(context);

        let mut grouped = jobs.get_jobs();
        grouped.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].pods.len(), 2);
        assert_eq!(grouped[1].pods.len(), 1);
    }

    #[test]
    fn test_rejected_jobs_drain_once() {
        let jobs = ClusterJobContext::new(Arc::new(StubContext { pods: Vec::new() }));
        jobs.register_submission_failure("j1", "quota exceeded");
        assert!(jobs.is_rejected("j1"));

        let drained = jobs.drain_rejected();
        assert_eq!(drained, vec![("j1".to_string(), "quota exceeded".to_string())]);
        assert!(!jobs.is_rejected("j1"));
        assert!(jobs.drain_rejected().is_empty());
    }
}
