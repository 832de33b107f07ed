//! Process-wide counters and the metrics endpoint.
//!
//! Counters are plain atomics behind a registry keyed by metric name and an
//! optional `task` label, rendered in the Prometheus text exposition format.
//! Registration happens implicitly on first increment; the registry is the
//! only global state in the crate besides signal handling.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;

pub const TASK_INVOCATIONS: &str = "convoy_executor_task_invocations_total";
pub const TASK_ERRORS: &str = "convoy_executor_task_errors_total";
pub const EVENTS_QUEUED: &str = "convoy_executor_events_queued_total";
pub const EVENTS_REPORTED: &str = "convoy_executor_events_reported_total";
pub const EVENT_REPORT_ERRORS: &str = "convoy_executor_event_report_errors_total";
pub const LEASES_REQUESTED: &str = "convoy_executor_job_leases_requested_total";
pub const LEASES_RETURNED: &str = "convoy_executor_job_leases_returned_total";
pub const PODS_SUBMITTED: &str = "convoy_executor_pods_submitted_total";
pub const PODS_DELETED: &str = "convoy_executor_pods_deleted_total";

#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<(String, Option<String>), Arc<AtomicU64>>>,
}

impl MetricsRegistry {
    fn counter(&self, name: &str, task: Option<&str>) -> Arc<AtomicU64> {
        let key = (name.to_string(), task.map(str::to_string));
        let mut counters = self.counters.lock().unwrap();
        counters.entry(key).or_default().clone()
    }

    pub fn inc(&self, name: &str) {
        self.counter(name, None).fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_task(&self, name: &str, task: &str) {
        self.counter(name, Some(task))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, name: &str, value: u64) {
        self.counter(name, None).fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self, name: &str, task: Option<&str>) -> u64 {
        self.counter(name, task).load(Ordering::Relaxed)
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters = self.counters.lock().unwrap();
        let mut output = String::new();
        let mut last_name = "";
        for ((name, task), value) in counters.iter() {
            if name != last_name {
                output.push_str(&format!("# TYPE {} counter\n", name));
                last_name = name;
            }
            match task {
                Some(task) => output.push_str(&format!(
                    "{}{{task=\"{}\"}} {}\n",
                    name,
                    task,
                    value.load(Ordering::Relaxed)
                )),
                None => {
                    output.push_str(&format!("{} {}\n", name, value.load(Ordering::Relaxed)))
                }
            }
        }
        output
    }
}

static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::default)
}

async fn metrics_handler() -> String {
    registry().render()
}

/// Serve the metrics endpoint until shutdown is signalled. Returns once the
/// listener is bound so startup failures surface before tasks start.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> crate::error::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Metrics endpoint listening");

    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Metrics endpoint failed");
        }
    });

    Ok(())
}
