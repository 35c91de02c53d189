// # Cluster Coordination
//
// Everything that makes a set of symmetric nodes behave as one cache:
// gossip membership with failure detection, the consistent hash ring,
// the typed event bus, the coordinator binding them together, the
// replicator fanning mutations out to replicas, and the request router
// deciding local execution versus forward or redirect.

pub mod coordinator;
pub mod events;
pub mod membership;
pub mod replication;
pub mod ring;
pub mod router;

pub use coordinator::{ClusterHealth, Coordinator};
pub use events::{ClusterEvent, EventBus, EventEnvelope};
pub use membership::{Member, MemberStatus, Membership, MembershipConfig};
pub use replication::{ReplicationEnvelope, Replicator};
pub use ring::{HashRing, RingHandle};
pub use router::{OpOutcome, Operation, RequestContext, RequestRouter, Surface};
