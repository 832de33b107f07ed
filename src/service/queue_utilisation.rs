//! Per-pod usage sampling from the cluster metrics API.
//!
//! Samples are refreshed on their own task so readers (utilisation reports,
//! `utilisation` events) never block on a remote call. Max and average are
//! aggregated per pod across refreshes and pruned when the pod disappears.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::context::ClusterContext;
use crate::error::Result;
use crate::util::pod::extract_names;
use crate::util::ComputeResources;

#[derive(Debug, Clone, Default)]
pub struct PodUsageAggregate {
    pub current: ComputeResources,
    pub max: ComputeResources,
    sum: ComputeResources,
    samples: u64,
}

impl PodUsageAggregate {
    fn observe(&mut self, usage: ComputeResources) {
        self.max = self.max.max_with(&usage);
        self.sum.add(&usage);
        self.samples += 1;
        self.current = usage;
    }

    pub fn average(&self) -> ComputeResources {
        let mut avg = ComputeResources::new();
        if self.samples == 0 {
            return avg;
        }
        for (name, value) in self.sum.iter() {
            avg.add_value(name, value / self.samples as f64);
        }
        avg
    }
}

pub struct QueueUtilisationService {
    context: Arc<dyn ClusterContext>,
    usage: Mutex<HashMap<String, PodUsageAggregate>>,
}

impl QueueUtilisationService {
    pub fn new(context: Arc<dyn ClusterContext>) -> Self {
        Self {
            context,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the metrics API and fold it into the per-pod aggregates.
    pub async fn refresh_usage_data(&self) -> Result<()> {
        let samples = self.context.get_pod_usage().await?;
        let known: HashSet<String> = extract_names(&self.context.get_all_pods())
            .into_iter()
            .collect();

        let mut usage = self.usage.lock().unwrap();
        for sample in samples {
            usage
                .entry(sample.name.clone())
                .or_default()
                .observe(sample.usage);
        }
        // Aggregates for pods the cluster no longer knows are dead weight.
        usage.retain(|name, _| known.contains(name));
        Ok(())
    }

    pub fn usage_for_pod(&self, pod_name: &str) -> Option<PodUsageAggregate> {
        self.usage.lock().unwrap().get(pod_name).cloned()
    }
}
