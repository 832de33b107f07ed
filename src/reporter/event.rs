//! Lifecycle event union and its partial order.
//!
//! The same shape travels two ways: outbound as protobuf to the event
//! service, and inbound as externally-tagged JSON on the event stream
//! (`{"running": {...}}`). Unknown inbound variants fail deserialization and
//! are dropped by the stream reader.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto;

/// Fields every lifecycle event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEventInfo {
    pub job_id: String,
    pub job_set_id: String,
    pub queue: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseReturnedEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnableToScheduleEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub exit_codes: BTreeMap<String, i32>,
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SucceededEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprioritizedEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub new_priority: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatedEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilisationEvent {
    #[serde(flatten)]
    pub info: JobEventInfo,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub max_resources: BTreeMap<String, String>,
    #[serde(default)]
    pub avg_resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventMessage {
    Submitted(JobEventInfo),
    Queued(JobEventInfo),
    Leased(LeasedEvent),
    LeaseReturned(LeaseReturnedEvent),
    LeaseExpired(JobEventInfo),
    Pending(PendingEvent),
    Running(RunningEvent),
    UnableToSchedule(UnableToScheduleEvent),
    Failed(FailedEvent),
    Succeeded(SucceededEvent),
    Reprioritized(ReprioritizedEvent),
    Cancelling(JobEventInfo),
    Cancelled(JobEventInfo),
    Terminated(TerminatedEvent),
    Utilisation(UtilisationEvent),
}

/// Points on the main lifecycle path, ordered. `lease_returned`,
/// `lease_expired`, cancellation and `utilisation` sit outside this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleStage {
    Submitted,
    Queued,
    Leased,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl LifecycleStage {
    /// Position in the partial order. Succeeded and Failed are both terminal
    /// and rank equal.
    pub fn rank(&self) -> u8 {
        match self {
            LifecycleStage::Submitted => 0,
            LifecycleStage::Queued => 1,
            LifecycleStage::Leased => 2,
            LifecycleStage::Pending => 3,
            LifecycleStage::Running => 4,
            LifecycleStage::Succeeded | LifecycleStage::Failed => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Submitted => "submitted",
            LifecycleStage::Queued => "queued",
            LifecycleStage::Leased => "leased",
            LifecycleStage::Pending => "pending",
            LifecycleStage::Running => "running",
            LifecycleStage::Succeeded => "succeeded",
            LifecycleStage::Failed => "failed",
        }
    }
}

impl EventMessage {
    pub fn info(&self) -> &JobEventInfo {
        match self {
            EventMessage::Submitted(info)
            | EventMessage::Queued(info)
            | EventMessage::LeaseExpired(info)
            | EventMessage::Cancelling(info)
            | EventMessage::Cancelled(info) => info,
            EventMessage::Leased(event) => &event.info,
            EventMessage::LeaseReturned(event) => &event.info,
            EventMessage::Pending(event) => &event.info,
            EventMessage::Running(event) => &event.info,
            EventMessage::UnableToSchedule(event) => &event.info,
            EventMessage::Failed(event) => &event.info,
            EventMessage::Succeeded(event) => &event.info,
            EventMessage::Reprioritized(event) => &event.info,
            EventMessage::Terminated(event) => &event.info,
            EventMessage::Utilisation(event) => &event.info,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            EventMessage::Submitted(_) => "submitted",
            EventMessage::Queued(_) => "queued",
            EventMessage::Leased(_) => "leased",
            EventMessage::LeaseReturned(_) => "lease_returned",
            EventMessage::LeaseExpired(_) => "lease_expired",
            EventMessage::Pending(_) => "pending",
            EventMessage::Running(_) => "running",
            EventMessage::UnableToSchedule(_) => "unable_to_schedule",
            EventMessage::Failed(_) => "failed",
            EventMessage::Succeeded(_) => "succeeded",
            EventMessage::Reprioritized(_) => "reprioritized",
            EventMessage::Cancelling(_) => "cancelling",
            EventMessage::Cancelled(_) => "cancelled",
            EventMessage::Terminated(_) => "terminated",
            EventMessage::Utilisation(_) => "utilisation",
        }
    }

    /// Where this event sits on the main lifecycle path, if it does.
    pub fn stage(&self) -> Option<LifecycleStage> {
        match self {
            EventMessage::Submitted(_) => Some(LifecycleStage::Submitted),
            EventMessage::Queued(_) => Some(LifecycleStage::Queued),
            EventMessage::Leased(_) => Some(LifecycleStage::Leased),
            EventMessage::Pending(_) => Some(LifecycleStage::Pending),
            EventMessage::Running(_) => Some(LifecycleStage::Running),
            EventMessage::Succeeded(_) => Some(LifecycleStage::Succeeded),
            EventMessage::Failed(_) => Some(LifecycleStage::Failed),
            _ => None,
        }
    }

    pub fn to_proto(&self) -> proto::EventMessage {
        use proto::event_message::Events;

        let info = self.info();
        let created_at = info.created_at.to_rfc3339();
        let (job_id, job_set_id, queue) = (
            info.job_id.clone(),
            info.job_set_id.clone(),
            info.queue.clone(),
        );

        let events = match self {
            EventMessage::Submitted(_) => Events::Submitted(proto::JobSubmittedEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
            }),
            EventMessage::Queued(_) => Events::Queued(proto::JobQueuedEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
            }),
            EventMessage::Leased(event) => Events::Leased(proto::JobLeasedEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
            }),
            EventMessage::LeaseReturned(event) => {
                Events::LeaseReturned(proto::JobLeaseReturnedEvent {
                    job_id,
                    job_set_id,
                    queue,
                    created_at,
                    cluster_id: event.cluster_id.clone(),
                    reason: event.reason.clone(),
                })
            }
            EventMessage::LeaseExpired(_) => Events::LeaseExpired(proto::JobLeaseExpiredEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
            }),
            EventMessage::Pending(event) => Events::Pending(proto::JobPendingEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
            }),
            EventMessage::Running(event) => Events::Running(proto::JobRunningEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
                node_name: event.node_name.clone(),
            }),
            EventMessage::UnableToSchedule(event) => {
                Events::UnableToSchedule(proto::JobUnableToScheduleEvent {
                    job_id,
                    job_set_id,
                    queue,
                    created_at,
                    cluster_id: event.cluster_id.clone(),
                    reason: event.reason.clone(),
                })
            }
            EventMessage::Failed(event) => Events::Failed(proto::JobFailedEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
                reason: event.reason.clone(),
                exit_codes: event.exit_codes.clone().into_iter().collect(),
                node_name: event.node_name.clone(),
            }),
            EventMessage::Succeeded(event) => Events::Succeeded(proto::JobSucceededEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
                node_name: event.node_name.clone(),
            }),
            EventMessage::Reprioritized(event) => {
                Events::Reprioritized(proto::JobReprioritizedEvent {
                    job_id,
                    job_set_id,
                    queue,
                    created_at,
                    new_priority: event.new_priority,
                })
            }
            EventMessage::Cancelling(_) => Events::Cancelling(proto::JobCancellingEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
            }),
            EventMessage::Cancelled(_) => Events::Cancelled(proto::JobCancelledEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
            }),
            EventMessage::Terminated(event) => Events::Terminated(proto::JobTerminatedEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
                reason: event.reason.clone(),
            }),
            EventMessage::Utilisation(event) => Events::Utilisation(proto::JobUtilisationEvent {
                job_id,
                job_set_id,
                queue,
                created_at,
                cluster_id: event.cluster_id.clone(),
                max_resources: event.max_resources.clone().into_iter().collect(),
                avg_resources: event.avg_resources.clone().into_iter().collect(),
            }),
        };

        proto::EventMessage {
            events: Some(events),
        }
    }
}
