//! Outbound event reporting.
//!
//! Producers enqueue events; a single flusher consumes the queue, which
//! preserves submission order per `(queue, job_set_id)`. Failed sends retry
//! with exponential backoff capped at 300 seconds. Reconciliation reads the
//! authoritative stream back per job set and re-emits anything the server
//! has not seen, skipping stages already recorded on the pod as annotations.

pub mod event;

pub use event::{
    EventMessage, FailedEvent, JobEventInfo, LeaseReturnedEvent, LeasedEvent, LifecycleStage,
    PendingEvent, RunningEvent, SucceededEvent, UnableToScheduleEvent, UtilisationEvent,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::event_stream::{EventStreamReader, StreamConnector};
use crate::api::EventApi;
use crate::context::ClusterContext;
use crate::error::Result;
use crate::metrics;
use crate::util::pod::{
    job_id, job_set_id, node_name, phase, pod_name, queue, REPORTED_STAGE_ANNOTATION_PREFIX,
};

const INITIAL_SEND_BACKOFF: Duration = Duration::from_secs(1);
const MAX_SEND_BACKOFF: Duration = Duration::from_secs(300);

/// Tolerated consecutive stream failures during a bounded reconciliation
/// read.
const RECONCILE_ERROR_TOLERANCE: u32 = 3;

/// Producers see the reporter through this seam.
pub trait EventSink: Send + Sync {
    /// Queue an event for delivery.
    fn report(&self, event: EventMessage);

    /// Queue an event and record its variant on `pod` once delivered, so
    /// reconciliation recognizes it as already reported.
    fn report_for_pod(&self, event: EventMessage, pod: &Pod);
}

struct QueuedEvent {
    event: EventMessage,
    annotate_pod: Option<Pod>,
}

pub struct JobEventReporter {
    cluster_id: String,
    context: Arc<dyn ClusterContext>,
    reader: EventStreamReader<Arc<dyn StreamConnector>>,
    tx: mpsc::UnboundedSender<QueuedEvent>,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl JobEventReporter {
    pub fn new(
        cluster_id: &str,
        context: Arc<dyn ClusterContext>,
        event_api: Arc<dyn EventApi>,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let flusher = tokio::spawn(flush_loop(
            rx,
            event_api,
            context.clone(),
            shutdown.clone(),
        ));

        Self {
            cluster_id: cluster_id.to_string(),
            context,
            reader: EventStreamReader::new(connector, RECONCILE_ERROR_TOLERANCE),
            tx,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Flush-then-stop: signal the flusher and wait for it to drain.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let flusher = self.flusher.lock().unwrap().take();
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                tracing::warn!(error = %e, "Event flusher ended abnormally");
            }
        }
    }

    /// Compare local pod state against the server's event stream and emit
    /// anything missing, in lifecycle order.
    pub async fn report_missing_job_events(&self) -> Result<()> {
        let mut groups: HashMap<(String, String), Vec<Pod>> = HashMap::new();
        for pod in self.context.get_batch_pods() {
            let queue_name = queue(&pod).unwrap_or_default().to_string();
            let job_set = job_set_id(&pod).unwrap_or_default().to_string();
            if queue_name.is_empty() || job_set.is_empty() {
                continue;
            }
            groups.entry((queue_name, job_set)).or_default().push(pod);
        }

        for ((queue_name, job_set), pods) in groups {
            let mut seen: HashMap<String, u8> = HashMap::new();
            self.reader
                .run(
                    &queue_name,
                    &job_set,
                    None,
                    false,
                    &self.shutdown,
                    |_, event| {
                        if let Some(stage) = event.stage() {
                            let rank = seen.entry(event.info().job_id.clone()).or_insert(0);
                            *rank = (*rank).max(stage.rank());
                        }
                    },
                )
                .await?;

            for pod in pods {
                let Some(stage) = current_stage(&pod) else {
                    continue;
                };
                let Some(id) = job_id(&pod) else { continue };

                let server_rank = seen.get(id).copied().unwrap_or(0);
                if stage.rank() <= server_rank || has_reported(&pod, stage.as_str()) {
                    continue;
                }

                let event = self.event_for_stage(&pod, stage);
                tracing::info!(
                    job_id = id,
                    stage = stage.as_str(),
                    "Reconciling missing event"
                );
                self.report_for_pod(event, &pod);
            }
        }
        Ok(())
    }

    fn event_for_stage(&self, pod: &Pod, stage: LifecycleStage) -> EventMessage {
        let info = event_info_for_pod(pod);
        let cluster_id = self.cluster_id.clone();
        let node = node_name(pod).unwrap_or_default().to_string();
        match stage {
            LifecycleStage::Running => EventMessage::Running(RunningEvent {
                info,
                cluster_id,
                node_name: node,
            }),
            LifecycleStage::Succeeded => EventMessage::Succeeded(SucceededEvent {
                info,
                cluster_id,
                node_name: node,
            }),
            LifecycleStage::Failed => {
                let (reason, exit_codes) = failure_details(pod);
                EventMessage::Failed(FailedEvent {
                    info,
                    cluster_id,
                    reason,
                    exit_codes,
                    node_name: node,
                })
            }
            // Submitted/Queued/Leased never originate here; anything not yet
            // running reconciles as pending.
            _ => EventMessage::Pending(PendingEvent { info, cluster_id }),
        }
    }
}

impl EventSink for JobEventReporter {
    fn report(&self, event: EventMessage) {
        metrics::registry().inc(metrics::EVENTS_QUEUED);
        if self
            .tx
            .send(QueuedEvent {
                event,
                annotate_pod: None,
            })
            .is_err()
        {
            tracing::warn!("Event dropped, reporter is closed");
        }
    }

    fn report_for_pod(&self, event: EventMessage, pod: &Pod) {
        metrics::registry().inc(metrics::EVENTS_QUEUED);
        if self
            .tx
            .send(QueuedEvent {
                event,
                annotate_pod: Some(pod.clone()),
            })
            .is_err()
        {
            tracing::warn!("Event dropped, reporter is closed");
        }
    }
}

/// Event metadata carried on every pod the executor created.
pub fn event_info_for_pod(pod: &Pod) -> JobEventInfo {
    JobEventInfo {
        job_id: job_id(pod).unwrap_or_default().to_string(),
        job_set_id: job_set_id(pod).unwrap_or_default().to_string(),
        queue: queue(pod).unwrap_or_default().to_string(),
        created_at: Utc::now(),
    }
}

/// The lifecycle stage a pod's current phase corresponds to.
pub fn current_stage(pod: &Pod) -> Option<LifecycleStage> {
    match phase(pod) {
        "Pending" => Some(LifecycleStage::Pending),
        "Running" => Some(LifecycleStage::Running),
        "Succeeded" => Some(LifecycleStage::Succeeded),
        "Failed" => Some(LifecycleStage::Failed),
        _ => None,
    }
}

/// Failure reason and per-container exit codes for a failed pod.
pub fn failure_details(pod: &Pod) -> (String, BTreeMap<String, i32>) {
    let mut exit_codes = BTreeMap::new();
    let mut reasons = Vec::new();

    if let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
    {
        for status in statuses {
            if let Some(terminated) = status
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
            {
                exit_codes.insert(status.name.clone(), terminated.exit_code);
                if let Some(message) = terminated
                    .message
                    .as_deref()
                    .or(terminated.reason.as_deref())
                {
                    reasons.push(format!("{}: {}", status.name, message));
                }
            }
        }
    }

    let reason = if reasons.is_empty() {
        pod.status
            .as_ref()
            .and_then(|status| status.message.clone())
            .unwrap_or_else(|| "pod failed".to_string())
    } else {
        reasons.join("; ")
    };

    (reason, exit_codes)
}

/// Whether this event variant was already delivered for `pod`, per the
/// annotations the flusher records.
pub fn has_reported(pod: &Pod, variant: &str) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| {
            annotations.contains_key(&format!("{}{}", REPORTED_STAGE_ANNOTATION_PREFIX, variant))
        })
        .unwrap_or(false)
}

async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<QueuedEvent>,
    event_api: Arc<dyn EventApi>,
    context: Arc<dyn ClusterContext>,
    shutdown: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => return,
            },
        };
        send_with_retry(queued, event_api.as_ref(), context.as_ref(), &shutdown).await;
    }

    // Shutdown drain: one attempt per remaining event.
    while let Ok(queued) = rx.try_recv() {
        if let Err(e) = event_api.report(queued.event.to_proto()).await {
            tracing::warn!(error = %e, "Dropping event during shutdown drain");
        } else {
            metrics::registry().inc(metrics::EVENTS_REPORTED);
        }
    }
    tracing::debug!("Event flusher stopped");
}

async fn send_with_retry(
    queued: QueuedEvent,
    event_api: &dyn EventApi,
    context: &dyn ClusterContext,
    shutdown: &CancellationToken,
) {
    let mut backoff = INITIAL_SEND_BACKOFF;
    loop {
        match event_api.report(queued.event.to_proto()).await {
            Ok(()) => {
                metrics::registry().inc(metrics::EVENTS_REPORTED);
                if let Some(pod) = queued.annotate_pod.as_ref() {
                    mark_reported(context, pod, queued.event.variant_name()).await;
                }
                return;
            }
            Err(e) => {
                metrics::registry().inc(metrics::EVENT_REPORT_ERRORS);
                tracing::warn!(
                    event = queued.event.variant_name(),
                    job_id = %queued.event.info().job_id,
                    error = %e,
                    "Failed to report event, retrying"
                );
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_SEND_BACKOFF);
    }
}

async fn mark_reported(context: &dyn ClusterContext, pod: &Pod, variant: &str) {
    let annotations: BTreeMap<String, String> = [(
        format!("{}{}", REPORTED_STAGE_ANNOTATION_PREFIX, variant),
        "true".to_string(),
    )]
    .into();
    if let Err(e) = context.add_annotation(pod, &annotations).await {
        // Best effort: reconciliation still read-checks the server stream.
        tracing::debug!(pod = pod_name(pod), error = %e, "Failed to record reported event");
    }
}
