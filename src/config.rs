use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExecutorError, Result};

/// Top-level executor configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub application: ApplicationConfig,
    pub kubernetes: KubernetesConfig,
    pub task: TaskConfig,
    pub metric: MetricConfig,
    pub api_connection: ApiConnectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplicationConfig {
    /// Opaque identity of the cluster this executor manages.
    pub cluster_id: String,
    /// Logical pool tag reported with leases and usage.
    pub pool: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default-cluster".to_string(),
            pool: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubernetesConfig {
    /// When true, each pod submission uses a client impersonating the job owner.
    pub impersonate_users: bool,
    /// Node label keys reported up in utilisation.
    pub tracked_node_labels: Vec<String>,
    /// Taint keys considered tolerable when computing spare capacity.
    pub tolerated_taints: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub minimum_pod_age: Duration,
    #[serde(with = "humantime_serde")]
    pub failed_pod_expiry: Duration,
    #[serde(with = "humantime_serde")]
    pub stuck_pod_expiry: Duration,
    /// Repeated delete calls for the same pod are spaced by at least this much.
    #[serde(with = "humantime_serde")]
    pub minimum_repeat_delete_period: Duration,
    /// Per-resource minimum a leased job must request, quantity strings.
    pub minimum_job_size: BTreeMap<String, String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            impersonate_users: false,
            tracked_node_labels: Vec::new(),
            tolerated_taints: Vec::new(),
            minimum_pod_age: Duration::from_secs(3 * 60),
            failed_pod_expiry: Duration::from_secs(10 * 60),
            stuck_pod_expiry: Duration::from_secs(3 * 60),
            minimum_repeat_delete_period: Duration::from_secs(2 * 60),
            minimum_job_size: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(with = "humantime_serde")]
    pub utilisation_reporting_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub missing_event_reconciliation_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub job_lease_renewal_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub allocate_spare_capacity_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stuck_pod_scan_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub pod_deletion_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub queue_usage_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub utilisation_event_processing_interval: Duration,
    /// How often a `utilisation` event may be emitted per pod. Zero disables
    /// utilisation event reporting entirely.
    #[serde(with = "humantime_serde")]
    pub utilisation_event_reporting_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            utilisation_reporting_interval: Duration::from_secs(60),
            missing_event_reconciliation_interval: Duration::from_secs(60),
            job_lease_renewal_interval: Duration::from_secs(15),
            allocate_spare_capacity_interval: Duration::from_secs(30),
            stuck_pod_scan_interval: Duration::from_secs(60),
            pod_deletion_interval: Duration::from_secs(15),
            queue_usage_refresh_interval: Duration::from_secs(30),
            utilisation_event_processing_interval: Duration::from_secs(60),
            utilisation_event_reporting_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricConfig {
    /// Port the metrics endpoint listens on.
    pub port: u16,
    /// When true, per-queue usage is sampled from the metrics API and
    /// exposed as metrics and `utilisation` events.
    pub expose_queue_usage_metrics: bool,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            port: 9001,
            expose_queue_usage_metrics: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConnectionConfig {
    /// gRPC endpoint of the central services, e.g. "http://convoy-server:50051".
    pub endpoint: String,
    /// HTTP endpoint serving the newline-delimited JSON event stream. Defaults
    /// to the gRPC host when empty.
    pub event_stream_endpoint: String,
    /// Bearer token presented on every call. Empty disables auth.
    pub auth_token: String,
    pub tls: TlsConfig,
}

impl Default for ApiConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".to_string(),
            event_stream_endpoint: String::new(),
            auth_token: String::new(),
            tls: TlsConfig::default(),
        }
    }
}

impl ApiConnectionConfig {
    /// Event stream base URL, falling back to the gRPC endpoint host.
    pub fn event_stream_url(&self) -> &str {
        if self.event_stream_endpoint.is_empty() {
            &self.endpoint
        } else {
            &self.event_stream_endpoint
        }
    }
}

/// Client TLS towards the central services.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Server name expected on the presented certificate.
    pub domain_name: Option<String>,
}

impl ExecutorConfig {
    /// Load configuration from a YAML file, falling back to defaults for any
    /// field the file omits.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ExecutorError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ExecutorConfig::default();
        assert_eq!(config.application.pool, "default");
        assert!(!config.kubernetes.impersonate_users);
        assert!(config.task.job_lease_renewal_interval < config.task.utilisation_reporting_interval);
        assert!(!config.api_connection.endpoint.is_empty());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
application:
  cluster_id: cluster-a
  pool: gpu
kubernetes:
  impersonate_users: true
  stuck_pod_expiry: 5m
  minimum_job_size:
    cpu: "1"
    memory: 1Gi
task:
  job_lease_renewal_interval: 10s
"#;
        let config: ExecutorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.application.cluster_id, "cluster-a");
        assert!(config.kubernetes.impersonate_users);
        assert_eq!(
            config.kubernetes.stuck_pod_expiry,
            Duration::from_secs(300)
        );
        assert_eq!(
            config.kubernetes.minimum_job_size.get("memory").unwrap(),
            "1Gi"
        );
        assert_eq!(
            config.task.job_lease_renewal_interval,
            Duration::from_secs(10)
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.metric.port, 9001);
    }

    #[test]
    fn test_event_stream_url_fallback() {
        let mut api = ApiConnectionConfig::default();
        assert_eq!(api.event_stream_url(), api.endpoint.as_str());
        api.event_stream_endpoint = "http://events:8080".to_string();
        assert_eq!(api.event_stream_url(), "http://events:8080");
    }
}
