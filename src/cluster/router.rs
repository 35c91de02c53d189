// # Request Router
//
// Entry point for every client operation. Looks up the key's owners on the
// current ring and decides: execute locally (this node is primary), hand
// RESP clients a MOVED redirect, or proxy HTTP requests to the primary
// with bounded retries against successive owners on transport failure.
//
// HTTP clients never see a redirect: the contacted node forwards and
// relays the response. Only the RESP surface redirects, Redis-style.
//
// Local mutations are written through persistence and handed to the
// replicator before the client is acknowledged; replication itself stays
// asynchronous.

use crate::cluster::coordinator::Coordinator;
use crate::cluster::events::ClusterEvent;
use crate::cluster::replication::{ReplicationEnvelope, Replicator};
use crate::common::now_millis;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::network::transport::NodeTransport;
use crate::persistence::{LogRecord, OpKind, PersistenceEngine};
use crate::store::EntryInfo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which protocol surface a request arrived on. Decides redirect vs proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Resp,
    Http,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub surface: Surface,
}

impl RequestContext {
    pub fn new(surface: Surface, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            surface,
        }
    }
}

/// A routable client operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Get {
        store: String,
        key: Vec<u8>,
    },
    Put {
        store: String,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    },
    Delete {
        store: String,
        key: Vec<u8>,
    },
    Exists {
        store: String,
        key: Vec<u8>,
    },
    Expire {
        store: String,
        key: Vec<u8>,
        ttl_secs: u64,
    },
}

impl Operation {
    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Get { key, .. }
            | Operation::Put { key, .. }
            | Operation::Delete { key, .. }
            | Operation::Exists { key, .. }
            | Operation::Expire { key, .. } => key,
        }
    }

    pub fn store(&self) -> &str {
        match self {
            Operation::Get { store, .. }
            | Operation::Put { store, .. }
            | Operation::Delete { store, .. }
            | Operation::Exists { store, .. }
            | Operation::Expire { store, .. } => store,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Put { .. } | Operation::Delete { .. } | Operation::Expire { .. }
        )
    }

    /// Safe to retry against another owner after a transport failure. PUT
    /// qualifies only because forwarding fails before any response is
    /// received; a half-applied PUT never reports a transport error.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Result of a routed operation, shaped for both protocol surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpOutcome {
    Value { value: Vec<u8>, info: EntryInfo },
    Missing,
    Stored { version: u64 },
    Deleted { removed: bool },
    Exists { exists: bool },
}

/// Wire form of a forwarded operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub operation: Operation,
    pub origin: String,
    pub correlation_id: String,
}

/// Wire form of the forward response; cache-level misses travel as data,
/// not transport errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForwardReply {
    Outcome(OpOutcome),
    Failure { kind: String, message: String },
}

impl ForwardReply {
    pub fn from_result(result: Result<OpOutcome>) -> Self {
        match result {
            Ok(outcome) => ForwardReply::Outcome(outcome),
            Err(e) => ForwardReply::Failure {
                kind: error_kind(&e).to_string(),
                message: e.to_string(),
            },
        }
    }

    pub fn into_result(self) -> Result<OpOutcome> {
        match self {
            ForwardReply::Outcome(outcome) => Ok(outcome),
            ForwardReply::Failure { kind, message } => Err(match kind.as_str() {
                "unknown_store" => CacheError::UnknownStore(message),
                "budget_exceeded" => CacheError::Internal(message),
                "filter_full" => CacheError::FilterFull,
                _ => CacheError::Internal(message),
            }),
        }
    }
}

fn error_kind(e: &CacheError) -> &'static str {
    match e {
        CacheError::UnknownStore(_) => "unknown_store",
        CacheError::BudgetExceeded { .. } => "budget_exceeded",
        CacheError::FilterFull => "filter_full",
        _ => "internal",
    }
}

pub struct RequestRouter {
    local_id: String,
    engine: Arc<CacheEngine>,
    coordinator: Arc<Coordinator>,
    replicator: Arc<Replicator>,
    persistence: Arc<PersistenceEngine>,
    transport: Arc<NodeTransport>,
    max_forward_attempts: usize,
}

impl RequestRouter {
    pub fn new(
        engine: Arc<CacheEngine>,
        coordinator: Arc<Coordinator>,
        replicator: Arc<Replicator>,
        persistence: Arc<PersistenceEngine>,
        transport: Arc<NodeTransport>,
    ) -> Self {
        Self {
            local_id: coordinator.local_id().to_string(),
            engine,
            coordinator,
            replicator,
            persistence,
            transport,
            max_forward_attempts: 3,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Route and execute one client operation.
    pub async fn execute(&self, operation: Operation, ctx: &RequestContext) -> Result<OpOutcome> {
        let owners = self.coordinator.owners(operation.key());
        let primary = owners.first().cloned();

        match primary {
            None => self.execute_local(operation, ctx).await,
            Some(primary) if primary == self.local_id => self.execute_local(operation, ctx).await,
            Some(primary) => match ctx.surface {
                Surface::Resp => {
                    let owner = self
                        .coordinator
                        .member(&primary)
                        .map(|m| m.resp_addr)
                        .unwrap_or(primary);
                    Err(CacheError::NotPrimary { owner })
                }
                Surface::Http => self.forward(operation, owners, ctx).await,
            },
        }
    }

    /// Execute on this node: the request path when we are primary, and the
    /// target path of a forwarded request.
    pub async fn execute_local(
        &self,
        operation: Operation,
        ctx: &RequestContext,
    ) -> Result<OpOutcome> {
        match operation {
            Operation::Get { store, key } => match self.engine.get(&store, &key) {
                Ok((value, info)) => Ok(OpOutcome::Value { value, info }),
                Err(e) if e.is_miss() => Ok(OpOutcome::Missing),
                Err(e) => Err(e),
            },
            Operation::Put {
                store,
                key,
                value,
                ttl_secs,
            } => {
                let version = match self.engine.put(&store, &key, value.clone(), ttl_secs) {
                    Ok(version) => version,
                    Err(e @ (CacheError::BudgetExceeded { .. } | CacheError::FilterFull)) => {
                        self.coordinator.bus().publish_cluster(ClusterEvent::StoreWarning {
                            store: store.clone(),
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
                let effective_ttl = match ttl_secs {
                    Some(ttl) => ttl,
                    None => self.engine.store(&store)?.default_ttl_secs(),
                };
                self.persist_and_replicate(
                    LogRecord::set(&store, &key, &value, effective_ttl, &self.local_id, version),
                    ctx,
                )
                .await?;
                Ok(OpOutcome::Stored { version })
            }
            Operation::Delete { store, key } => match self.engine.delete(&store, &key) {
                Ok(version) => {
                    self.persist_and_replicate(
                        LogRecord::del(&store, &key, &self.local_id, version),
                        ctx,
                    )
                    .await?;
                    Ok(OpOutcome::Deleted { removed: true })
                }
                Err(e) if e.is_miss() => Ok(OpOutcome::Deleted { removed: false }),
                Err(e) => Err(e),
            },
            Operation::Exists { store, key } => Ok(OpOutcome::Exists {
                exists: self.engine.exists(&store, &key)?,
            }),
            Operation::Expire {
                store,
                key,
                ttl_secs,
            } => match self.engine.expire(&store, &key, ttl_secs) {
                Ok(version) => {
                    self.persist_and_replicate(
                        LogRecord::expire(&store, &key, ttl_secs, &self.local_id, version),
                        ctx,
                    )
                    .await?;
                    Ok(OpOutcome::Stored { version })
                }
                Err(e) if e.is_miss() => Ok(OpOutcome::Missing),
                Err(e) => Err(e),
            },
        }
    }

    /// Clear a whole store on this node, write the tombstone record and
    /// fan the clear out to every other active member.
    pub async fn clear_store(&self, store: &str, ctx: &RequestContext) -> Result<usize> {
        let removed = self.engine.clear(store)?;
        let record = LogRecord::clear(store, &self.local_id);
        self.persistence.log_operation(&record)?;
        let envelope = ReplicationEnvelope {
            store: store.to_string(),
            key: Vec::new(),
            op: OpKind::Clear,
            value: None,
            ttl_secs: 0,
            version: 0,
            origin: self.local_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            timestamp_ms: now_millis(),
        };
        for member in self.coordinator.members() {
            if member.id == self.local_id || !member.status.is_active() {
                continue;
            }
            if let Err(e) = self.transport.replicate(&member.http_addr, &envelope).await {
                warn!(peer = %member.id, error = %e, "clear fan-out failed");
            }
        }
        Ok(removed)
    }

    async fn persist_and_replicate(&self, record: LogRecord, ctx: &RequestContext) -> Result<()> {
        self.persistence.log_operation(&record)?;
        let envelope = ReplicationEnvelope {
            store: record.store.clone(),
            key: record.key.clone(),
            op: record.op,
            value: record.value.clone(),
            ttl_secs: record.ttl_secs,
            version: record.version,
            origin: self.local_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            timestamp_ms: record.timestamp_ms,
        };
        self.replicator.replicate(envelope).await;
        Ok(())
    }

    async fn forward(
        &self,
        operation: Operation,
        owners: Vec<String>,
        ctx: &RequestContext,
    ) -> Result<OpOutcome> {
        let request = ForwardRequest {
            operation: operation.clone(),
            origin: self.local_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
        };

        let mut last_error = CacheError::Transport("no owners for key".into());
        for (attempt, owner) in owners.iter().take(self.max_forward_attempts).enumerate() {
            if owner == &self.local_id {
                return self.execute_local(operation.clone(), ctx).await;
            }
            let Some(member) = self.coordinator.member(owner) else {
                last_error = CacheError::Transport(format!("owner {owner} not in view"));
                continue;
            };
            match self.transport.forward(&member.http_addr, &request).await {
                Ok(outcome) => {
                    if attempt > 0 {
                        debug!(
                            correlation_id = %ctx.correlation_id,
                            owner = %owner,
                            attempt,
                            "forward succeeded after retry"
                        );
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_transport() && operation.is_retryable() => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        owner = %owner,
                        error = %e,
                        "forward attempt failed, trying next owner"
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}
