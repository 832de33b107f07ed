pub mod allocation;
pub mod cluster_utilisation;
pub mod lease;
pub mod pod_progress;
pub mod queue_utilisation;
pub mod utilisation_events;

pub use allocation::ClusterAllocationService;
pub use cluster_utilisation::ClusterUtilisationService;
pub use lease::JobLeaseService;
pub use pod_progress::PodProgressMonitor;
pub use queue_utilisation::QueueUtilisationService;
pub use utilisation_events::UtilisationEventReporter;
