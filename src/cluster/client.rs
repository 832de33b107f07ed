//! Kubernetes client construction, with optional per-user impersonation.

use kube::{Client, Config};

use crate::error::{ExecutorError, Result};

/// Issues authenticated Kubernetes clients. When impersonation is enabled,
/// each pod submission uses a client acting as the job owner so cluster-side
/// authorization and quota apply to the submitting user.
#[derive(Clone)]
pub struct KubeClientProvider {
    config: Config,
    client: Client,
    impersonate_users: bool,
}

impl KubeClientProvider {
    /// Connect using the inferred environment (in-cluster service account or
    /// local kubeconfig).
    pub async fn new(impersonate_users: bool) -> Result<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| ExecutorError::Config(format!("failed to infer kube config: {}", e)))?;
        let client = Client::try_from(config.clone())?;
        Ok(Self {
            config,
            client,
            impersonate_users,
        })
    }

    /// The executor's own client.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// A client acting as `user`, or the executor's own client when
    /// impersonation is disabled.
    pub fn client_for_user(&self, user: &str) -> Result<Client> {
        if !self.impersonate_users || user.is_empty() {
            return Ok(self.client.clone());
        }
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(user.to_string());
        Ok(Client::try_from(config)?)
    }
}
