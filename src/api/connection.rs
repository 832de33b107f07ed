//! Channel construction towards the central services.

use tokio::fs;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use crate::config::{ApiConnectionConfig, TlsConfig};
use crate::error::{ExecutorError, Result};

/// Build the client TLS configuration from file paths in the config.
async fn client_tls_config(config: &TlsConfig) -> Result<ClientTlsConfig> {
    let ca_cert_path = config
        .ca_cert_path
        .as_ref()
        .ok_or_else(|| ExecutorError::Config("tls enabled but ca_cert_path not set".into()))?;

    let ca_pem = fs::read(ca_cert_path).await?;
    let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_pem));

    if let Some(domain) = config.domain_name.as_ref() {
        tls = tls.domain_name(domain.clone());
    }

    // Present a client certificate when both halves are configured (mTLS).
    if let (Some(cert_path), Some(key_path)) = (config.cert_path.as_ref(), config.key_path.as_ref())
    {
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;
        tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
    }

    Ok(tls)
}

/// Connect the shared channel used by all three unary services. Fails fast so
/// startup can abort with a non-zero exit.
pub async fn connect(config: &ApiConnectionConfig) -> Result<Channel> {
    let mut endpoint = Channel::from_shared(config.endpoint.clone())
        .map_err(|e| ExecutorError::Config(format!("invalid api endpoint: {}", e)))?
        .connect_timeout(std::time::Duration::from_secs(10));

    if config.tls.enabled {
        endpoint = endpoint.tls_config(client_tls_config(&config.tls).await?)?;
    }

    Ok(endpoint.connect().await?)
}

/// Bearer token as request metadata, if one is configured.
pub fn auth_header(config: &ApiConnectionConfig) -> Result<Option<MetadataValue<tonic::metadata::Ascii>>> {
    if config.auth_token.is_empty() {
        return Ok(None);
    }
    MetadataValue::try_from(format!("Bearer {}", config.auth_token))
        .map(Some)
        .map_err(|_| ExecutorError::Config("auth token is not valid header ascii".into()))
}
