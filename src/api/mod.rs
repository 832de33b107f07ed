//! Clients for the three central services.
//!
//! Services consume the traits; the gRPC implementations wrap tonic clients
//! over one shared channel, attach the bearer token, and bound every call
//! with a deadline so a wedged server cannot stall a task past its interval.

pub mod connection;
pub mod event_stream;

use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Request;

use crate::error::Result;
use crate::proto;
use crate::proto::aggregated_queue_client::AggregatedQueueClient;
use crate::proto::event_client::EventClient;
use crate::proto::usage_client::UsageClient;

#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Request new job leases sized to the spare capacity in `request`.
    async fn lease_jobs(&self, request: proto::JobLeaseRequest) -> Result<Vec<proto::Job>>;

    /// Renew leases in one batch; returns the ids the server still considers
    /// leased to this executor.
    async fn renew_lease(&self, cluster_id: &str, job_ids: Vec<String>) -> Result<Vec<String>>;

    /// Give a lease back, e.g. after a local admission failure.
    async fn return_lease(&self, cluster_id: &str, job_id: &str, reason: &str) -> Result<()>;

    /// Report jobs finished; returns the ids the server acknowledged.
    async fn report_done(&self, cluster_id: &str, job_ids: Vec<String>) -> Result<Vec<String>>;
}

#[async_trait]
pub trait UsageApi: Send + Sync {
    async fn report_usage(&self, report: proto::ClusterUsageReport) -> Result<()>;
}

#[async_trait]
pub trait EventApi: Send + Sync {
    async fn report(&self, event: proto::EventMessage) -> Result<()>;
}

#[derive(Clone)]
pub struct GrpcApiClient {
    channel: Channel,
    auth: Option<MetadataValue<Ascii>>,
    deadline: Duration,
}

impl GrpcApiClient {
    pub fn new(channel: Channel, auth: Option<MetadataValue<Ascii>>, deadline: Duration) -> Self {
        Self {
            channel,
            auth,
            deadline,
        }
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.deadline);
        if let Some(token) = self.auth.as_ref() {
            request
                .metadata_mut()
                .insert("authorization", token.clone());
        }
        request
    }
}

#[async_trait]
impl QueueApi for GrpcApiClient {
    async fn lease_jobs(&self, request: proto::JobLeaseRequest) -> Result<Vec<proto::Job>> {
        let mut client = AggregatedQueueClient::new(self.channel.clone());
        let response = client.lease_jobs(self.request(request)).await?;
        Ok(response.into_inner().jobs)
    }

    async fn renew_lease(&self, cluster_id: &str, job_ids: Vec<String>) -> Result<Vec<String>> {
        let mut client = AggregatedQueueClient::new(self.channel.clone());
        let response = client
            .renew_lease(self.request(proto::RenewLeaseRequest {
                cluster_id: cluster_id.to_string(),
                ids: job_ids,
            }))
            .await?;
        Ok(response.into_inner().ids)
    }

    async fn return_lease(&self, cluster_id: &str, job_id: &str, reason: &str) -> Result<()> {
        let mut client = AggregatedQueueClient::new(self.channel.clone());
        client
            .return_lease(self.request(proto::ReturnLeaseRequest {
                cluster_id: cluster_id.to_string(),
                job_id: job_id.to_string(),
                reason: reason.to_string(),
            }))
            .await?;
        Ok(())
    }

    async fn report_done(&self, cluster_id: &str, job_ids: Vec<String>) -> Result<Vec<String>> {
        let mut client = AggregatedQueueClient::new(self.channel.clone());
        let response = client
            .report_done(self.request(proto::ReportDoneRequest {
                cluster_id: cluster_id.to_string(),
                ids: job_ids,
            }))
            .await?;
        Ok(response.into_inner().ids)
    }
}

#[async_trait]
impl UsageApi for GrpcApiClient {
    async fn report_usage(&self, report: proto::ClusterUsageReport) -> Result<()> {
        let mut client = UsageClient::new(self.channel.clone());
        client.report_usage(self.request(report)).await?;
        Ok(())
    }
}

#[async_trait]
impl EventApi for GrpcApiClient {
    async fn report(&self, event: proto::EventMessage) -> Result<()> {
        let mut client = EventClient::new(self.channel.clone());
        client.report(self.request(event)).await?;
        Ok(())
    }
}
