//! Accessors and predicates over cluster pods and nodes.
//!
//! Batch work is identified purely by labels: a pod carrying both `job_id`
//! and `pod_number` belongs to the executor, everything else is ignored.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::util::quantity::ComputeResources;

/// Mandatory label carrying the job identity.
pub const JOB_ID_LABEL: &str = "job_id";
/// Mandatory label carrying the 0-indexed pod position within the job.
pub const POD_NUMBER_LABEL: &str = "pod_number";
/// Label carrying the queue the job was submitted on.
pub const QUEUE_ID_LABEL: &str = "queue_id";
/// Label carrying the job-set grouping used for event subscription.
pub const JOB_SET_ID_LABEL: &str = "job_set_id";

/// Annotation prefix recording lifecycle stages already reported upstream.
pub const REPORTED_STAGE_ANNOTATION_PREFIX: &str = "executor.convoy.io/reported-";

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn job_id(pod: &Pod) -> Option<&str> {
    label(pod, JOB_ID_LABEL)
}

pub fn pod_number(pod: &Pod) -> Option<u32> {
    label(pod, POD_NUMBER_LABEL).and_then(|value| value.parse().ok())
}

pub fn queue(pod: &Pod) -> Option<&str> {
    label(pod, QUEUE_ID_LABEL)
}

pub fn job_set_id(pod: &Pod) -> Option<&str> {
    label(pod, JOB_SET_ID_LABEL)
}

pub fn is_batch_pod(pod: &Pod) -> bool {
    job_id(pod).is_some() && label(pod, POD_NUMBER_LABEL).is_some()
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn extract_names(pods: &[Pod]) -> Vec<String> {
    pods.iter().map(|pod| pod_name(pod).to_string()).collect()
}

pub fn extract_job_ids(pods: &[Pod]) -> Vec<String> {
    let mut seen = HashSet::new();
    pods.iter()
        .filter_map(|pod| job_id(pod))
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn creation_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
}

pub fn pod_age(pod: &Pod, now: DateTime<Utc>) -> Option<chrono::Duration> {
    creation_time(pod).map(|created| now - created)
}

/// Coarse pod phase, defaulting to "Unknown" when the cluster has not
/// reported one yet.
pub fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("Unknown")
}

pub fn is_in_terminal_state(pod: &Pod) -> bool {
    matches!(phase(pod), "Succeeded" | "Failed")
}

/// When the pod finished, taken from the latest container termination.
/// Falls back to the creation time for pods that died without container
/// state (evictions, admission rejections).
pub fn terminal_time(pod: &Pod) -> Option<DateTime<Utc>> {
    let finished = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|status| {
            status
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .and_then(|terminated| terminated.finished_at.as_ref())
                .map(|time| time.0)
        })
        .max();
    finished.or_else(|| creation_time(pod))
}

pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
}

/// Sum of container resource requests for one pod.
pub fn pod_requests(pod: &Pod) -> ComputeResources {
    let mut total = ComputeResources::new();
    let containers = match pod.spec.as_ref() {
        Some(spec) => &spec.containers,
        None => return total,
    };
    for container in containers {
        if let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref())
        {
            total.add(&ComputeResources::from_quantity_map(requests));
        }
    }
    total
}

pub fn node_allocatable(node: &Node) -> ComputeResources {
    node.status
        .as_ref()
        .and_then(|status| status.allocatable.as_ref())
        .map(ComputeResources::from_quantity_map)
        .unwrap_or_default()
}

/// A node counts towards spare capacity when it is schedulable and every
/// hard taint it carries is in the tolerated set.
pub fn node_is_available(node: &Node, tolerated_taints: &[String]) -> bool {
    if let Some(spec) = node.spec.as_ref() {
        if spec.unschedulable.unwrap_or(false) {
            return false;
        }
        if let Some(taints) = spec.taints.as_ref() {
            for taint in taints {
                if taint.effect == "NoSchedule" || taint.effect == "NoExecute" {
                    if !tolerated_taints.iter().any(|key| *key == taint.key) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Waiting reasons that cannot resolve without a new job spec.
const UNRECOVERABLE_WAITING_REASONS: &[&str] = &[
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "CrashLoopBackOff",
    "RunContainerError",
];

/// Diagnosis of a pod stuck short of running.
pub struct StuckCause {
    pub retryable: bool,
    pub message: String,
}

/// Inspect container statuses to decide whether a stuck pod can still start
/// elsewhere (resources free up, image becomes pullable) or is doomed.
pub fn diagnose_stuck_pod(pod: &Pod) -> StuckCause {
    if let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
    {
        for status in statuses {
            if let Some(waiting) = status
                .state
                .as_ref()
                .and_then(|state| state.waiting.as_ref())
            {
                let reason = waiting.reason.as_deref().unwrap_or_default();
                let message = waiting.message.as_deref().unwrap_or(reason);
                if UNRECOVERABLE_WAITING_REASONS.contains(&reason) {
                    return StuckCause {
                        retryable: false,
                        message: format!("{}: {}", reason, message),
                    };
                }
                if !reason.is_empty() {
                    return StuckCause {
                        retryable: true,
                        message: format!("{}: {}", reason, message),
                    };
                }
            }
        }
    }
    StuckCause {
        retryable: true,
        message: "unable to schedule pod within expiry".to_string(),
    }
}
