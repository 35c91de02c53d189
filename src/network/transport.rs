// # Inter-node Transport
//
// HTTP client side of node-to-node traffic: forwarded client operations,
// replication envelopes and cluster-wide events, all against peers'
// internal endpoints. Payloads are bincode; every request carries the
// origin node id and a correlation id so the receiving node's logs line up
// with ours.

use crate::cluster::events::EventEnvelope;
use crate::cluster::replication::ReplicationEnvelope;
use crate::cluster::router::{ForwardReply, ForwardRequest, OpOutcome};
use crate::error::{CacheError, Result};
use std::time::Duration;

pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
pub const HEADER_ORIGIN_NODE: &str = "x-origin-node";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

fn codec() -> bincode::config::Configuration {
    bincode::config::standard()
}

pub struct NodeTransport {
    client: reqwest::Client,
    local_id: String,
}

impl NodeTransport {
    pub fn new(local_id: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, local_id })
    }

    /// Proxy a client operation to `http_addr` and decode the outcome.
    pub async fn forward(&self, http_addr: &str, request: &ForwardRequest) -> Result<OpOutcome> {
        let body = bincode::serde::encode_to_vec(request, codec())?;
        let response = self
            .client
            .post(format!("http://{http_addr}/internal/forward"))
            .header(HEADER_CORRELATION_ID, request.correlation_id.as_str())
            .header(HEADER_ORIGIN_NODE, self.local_id.as_str())
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "forward to {http_addr} returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        let (reply, _): (ForwardReply, usize) =
            bincode::serde::decode_from_slice(&bytes, codec())?;
        reply.into_result()
    }

    /// Deliver one replication envelope.
    pub async fn replicate(&self, http_addr: &str, envelope: &ReplicationEnvelope) -> Result<()> {
        let body = bincode::serde::encode_to_vec(envelope, codec())?;
        let response = self
            .client
            .post(format!("http://{http_addr}/internal/replicate"))
            .header(HEADER_CORRELATION_ID, envelope.correlation_id.as_str())
            .header(HEADER_ORIGIN_NODE, self.local_id.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| CacheError::ReplicationFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::ReplicationFailed(format!(
                "peer {http_addr} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Fan a cluster-wide event envelope to one peer.
    pub async fn send_event(&self, http_addr: &str, envelope: &EventEnvelope) -> Result<()> {
        let body = bincode::serde::encode_to_vec(envelope, codec())?;
        let response = self
            .client
            .post(format!("http://{http_addr}/internal/events"))
            .header(HEADER_CORRELATION_ID, envelope.id.as_str())
            .header(HEADER_ORIGIN_NODE, self.local_id.as_str())
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "event fan-out to {http_addr} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
