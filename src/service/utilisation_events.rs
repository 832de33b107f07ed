//! Per-pod `utilisation` events.
//!
//! Runs only when queue usage metrics are enabled. Each running pod gets at
//! most one event per reporting interval, carrying the max and average usage
//! sampled so far.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::context::ClusterContext;
use crate::error::Result;
use crate::reporter::{event_info_for_pod, EventMessage, EventSink, UtilisationEvent};
use crate::service::queue_utilisation::QueueUtilisationService;
use crate::util::pod::{phase, pod_name};

pub struct UtilisationEventReporter {
    cluster_id: String,
    context: Arc<dyn ClusterContext>,
    queue_utilisation: Arc<QueueUtilisationService>,
    events: Arc<dyn EventSink>,
    reporting_interval: Duration,
    last_reported: Mutex<HashMap<String, Instant>>,
}

impl UtilisationEventReporter {
    pub fn new(
        cluster_id: &str,
        context: Arc<dyn ClusterContext>,
        queue_utilisation: Arc<QueueUtilisationService>,
        events: Arc<dyn EventSink>,
        reporting_interval: Duration,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            context,
            queue_utilisation,
            events,
            reporting_interval,
            last_reported: Mutex::new(HashMap::new()),
        }
    }

    pub async fn report_utilisation_events(&self) -> Result<()> {
        let pods = self.context.get_batch_pods();
        let mut last_reported = self.last_reported.lock().unwrap();

        for pod in &pods {
            if phase(pod) != "Running" {
                continue;
            }
            let name = pod_name(pod).to_string();
            if let Some(at) = last_reported.get(&name) {
                if at.elapsed() < self.reporting_interval {
                    continue;
                }
            }
            let Some(aggregate) = self.queue_utilisation.usage_for_pod(&name) else {
                continue;
            };

            self.events.report(EventMessage::Utilisation(UtilisationEvent {
                info: event_info_for_pod(pod),
                cluster_id: self.cluster_id.clone(),
                max_resources: aggregate.max.to_string_map(),
                avg_resources: aggregate.average().to_string_map(),
            }));
            last_reported.insert(name, Instant::now());
        }

        // Forget pods that no longer exist.
        let names: std::collections::HashSet<String> =
            pods.iter().map(|pod| pod_name(pod).to_string()).collect();
        last_reported.retain(|name, _| names.contains(name));
        Ok(())
    }
}
