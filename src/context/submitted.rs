//! Cache of pods accepted by the cluster API but not yet observed through the
//! informer.
//!
//! Writers are `submit_pod` and the informer callback; readers take full
//! snapshots. The informer is authoritative: its first observation of a
//! job_id evicts the transient entry.

use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Pod;

use crate::util::pod::job_id;

#[derive(Default)]
pub struct SubmittedPodCache {
    pods: Mutex<HashMap<String, Pod>>,
}

impl SubmittedPodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pod keyed by its job_id label. Pods without the label are
    /// ignored; they can never be deduplicated by job and are not batch work.
    pub fn add(&self, pod: &Pod) {
        if let Some(id) = job_id(pod) {
            self.pods
                .lock()
                .unwrap()
                .insert(id.to_string(), pod.clone());
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(job_id).cloned()
    }

    pub fn remove(&self, job_id: &str) -> Option<Pod> {
        self.pods.lock().unwrap().remove(job_id)
    }

    pub fn snapshot(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pods.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::pod::JOB_ID_LABEL;

    fn batch_pod(job: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("pod-{}", job));
        pod.metadata.labels = Some([(JOB_ID_LABEL.to_string(), job.to_string())].into());
        pod
    }

    #[test]
    fn test_add_get_remove() {
        let cache = SubmittedPodCache::new();
        cache.add(&batch_pod("j1"));
        assert!(cache.get("j1").is_some());
        assert_eq!(cache.len(), 1);

        cache.remove("j1");
        assert!(cache.get("j1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unlabelled_pods_are_ignored() {
        let cache = SubmittedPodCache::new();
        cache.add(&Pod::default());
        assert!(cache.is_empty());
    }
}
