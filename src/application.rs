//! Component construction and lifecycle.
//!
//! Builds the dependency DAG leaves-first, registers the periodic tasks, and
//! owns the ordered shutdown: cancel tasks, flush the event reporter, stop
//! the informers, then join workers with a timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::connection;
use crate::api::event_stream::{HttpStreamConnector, StreamConnector};
use crate::api::{EventApi, GrpcApiClient, QueueApi, UsageApi};
use crate::cluster::{KubeClientProvider, KubeClusterApi};
use crate::config::ExecutorConfig;
use crate::context::{ClusterContext, KubeClusterContext};
use crate::error::Result;
use crate::job::ClusterJobContext;
use crate::reporter::JobEventReporter;
use crate::service::{
    ClusterAllocationService, ClusterUtilisationService, JobLeaseService, PodProgressMonitor,
    QueueUtilisationService, UtilisationEventReporter,
};
use crate::task::TaskManager;
use crate::util::ComputeResources;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The heartbeat deadline sent with lease requests: the server should not
/// expire a lease before a few renewal intervals have been missed.
const HEARTBEAT_INTERVALS: u32 = 3;

pub struct Application {
    context: Arc<KubeClusterContext>,
    reporter: Arc<JobEventReporter>,
    task_manager: TaskManager,
}

impl Application {
    /// Connect to the cluster and the central services, wire the components
    /// and start the periodic tasks. Any error here is a startup failure the
    /// process exits on.
    pub async fn start(config: ExecutorConfig, shutdown: CancellationToken) -> Result<Self> {
        let provider = KubeClientProvider::new(config.kubernetes.impersonate_users).await?;
        let cluster_api = Arc::new(KubeClusterApi::new(provider));
        let context = Arc::new(KubeClusterContext::new(
            cluster_api,
            config.kubernetes.minimum_repeat_delete_period,
        ));
        let cluster_context: Arc<dyn ClusterContext> = context.clone();

        let channel = connection::connect(&config.api_connection).await?;
        let auth = connection::auth_header(&config.api_connection)?;

        let queue_api: Arc<dyn QueueApi> = Arc::new(GrpcApiClient::new(
            channel.clone(),
            auth.clone(),
            config.task.job_lease_renewal_interval / 2,
        ));
        let usage_api: Arc<dyn UsageApi> = Arc::new(GrpcApiClient::new(
            channel.clone(),
            auth.clone(),
            config.task.utilisation_reporting_interval / 2,
        ));
        let event_api: Arc<dyn EventApi> = Arc::new(GrpcApiClient::new(
            channel,
            auth,
            config.task.missing_event_reconciliation_interval / 2,
        ));

        let connector: Arc<dyn StreamConnector> = Arc::new(HttpStreamConnector::new(
            config.api_connection.event_stream_url(),
            &config.api_connection.auth_token,
        ));

        let cluster_id = config.application.cluster_id.as_str();
        let job_context = Arc::new(ClusterJobContext::new(cluster_context.clone()));
        let reporter = Arc::new(JobEventReporter::new(
            cluster_id,
            cluster_context.clone(),
            event_api,
            connector,
        ));

        let lease_service = Arc::new(JobLeaseService::new(
            cluster_id,
            cluster_context.clone(),
            job_context.clone(),
            queue_api.clone(),
            reporter.clone(),
            config.kubernetes.minimum_pod_age,
            config.kubernetes.failed_pod_expiry,
        ));

        let queue_utilisation = Arc::new(QueueUtilisationService::new(cluster_context.clone()));

        let cluster_utilisation = Arc::new(ClusterUtilisationService::new(
            cluster_id,
            &config.application.pool,
            cluster_context.clone(),
            queue_utilisation.clone(),
            usage_api,
            config.kubernetes.tracked_node_labels.clone(),
            config.kubernetes.tolerated_taints.clone(),
            config.metric.expose_queue_usage_metrics,
        ));

        let progress_monitor = Arc::new(PodProgressMonitor::new(
            cluster_id,
            cluster_context.clone(),
            reporter.clone(),
            lease_service.clone(),
            config.kubernetes.stuck_pod_expiry,
        ));

        let allocation_service = Arc::new(ClusterAllocationService::new(
            cluster_id,
            &config.application.pool,
            cluster_context.clone(),
            job_context,
            queue_api,
            reporter.clone(),
            config.kubernetes.tolerated_taints.clone(),
            ComputeResources::from_string_map(&config.kubernetes.minimum_job_size)?,
            config.task.job_lease_renewal_interval * HEARTBEAT_INTERVALS,
        ));

        let mut task_manager = TaskManager::new(shutdown.child_token());

        {
            let context = cluster_context.clone();
            task_manager.register("pod_deletion", config.task.pod_deletion_interval, move || {
                let context = context.clone();
                Box::pin(async move { context.process_pods_to_delete().await })
            });
        }
        {
            let service = cluster_utilisation.clone();
            task_manager.register(
                "utilisation_reporting",
                config.task.utilisation_reporting_interval,
                move || {
                    let service = service.clone();
                    Box::pin(async move { service.report_cluster_utilisation().await })
                },
            );
        }
        {
            let service = allocation_service.clone();
            task_manager.register(
                "job_lease_request",
                config.task.allocate_spare_capacity_interval,
                move || {
                    let service = service.clone();
                    Box::pin(async move { service.allocate_spare_capacity().await })
                },
            );
        }
        {
            let service = lease_service.clone();
            task_manager.register(
                "job_lease_renewal",
                config.task.job_lease_renewal_interval,
                move || {
                    let service = service.clone();
                    Box::pin(async move { service.manage_job_leases().await })
                },
            );
        }
        {
            let reporter = reporter.clone();
            task_manager.register(
                "event_reconciliation",
                config.task.missing_event_reconciliation_interval,
                move || {
                    let reporter = reporter.clone();
                    Box::pin(async move { reporter.report_missing_job_events().await })
                },
            );
        }
        {
            let monitor = progress_monitor.clone();
            task_manager.register(
                "stuck_pod",
                config.task.stuck_pod_scan_interval,
                move || {
                    let monitor = monitor.clone();
                    Box::pin(async move { monitor.handle_stuck_pods().await })
                },
            );
        }

        if config.metric.expose_queue_usage_metrics {
            {
                let service = queue_utilisation.clone();
                task_manager.register(
                    "pod_usage_data_refresh",
                    config.task.queue_usage_refresh_interval,
                    move || {
                        let service = service.clone();
                        Box::pin(async move { service.refresh_usage_data().await })
                    },
                );
            }

            if !config.task.utilisation_event_reporting_interval.is_zero() {
                let utilisation_events = Arc::new(UtilisationEventReporter::new(
                    cluster_id,
                    cluster_context.clone(),
                    queue_utilisation,
                    reporter.clone(),
                    config.task.utilisation_event_reporting_interval,
                ));
                task_manager.register(
                    "pod_utilisation_event_reporting",
                    config.task.utilisation_event_processing_interval,
                    move || {
                        let service = utilisation_events.clone();
                        Box::pin(async move { service.report_utilisation_events().await })
                    },
                );
            }
        }

        tracing::info!(
            cluster_id = %config.application.cluster_id,
            pool = %config.application.pool,
            "Executor started"
        );

        Ok(Self {
            context,
            reporter,
            task_manager,
        })
    }

    /// Ordered shutdown: flush outstanding events, halt the informers, then
    /// join the task workers with a timeout.
    pub async fn shutdown(self) {
        self.reporter.close().await;
        self.context.stop();
        if !self.task_manager.stop_all(SHUTDOWN_JOIN_TIMEOUT).await {
            tracing::warn!("Graceful shutdown timed out");
        }
        tracing::info!("Shutdown complete");
    }
}
