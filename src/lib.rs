//! Public interface to the monaxos core library.
//!
//! monaxos is the consensus replication core of a distributed monitor
//! cluster: a single-decree Paxos state machine serializing a totally
//! ordered log of opaque values across a small quorum, with a time-bounded
//! read lease layered on top so every quorum member may serve local reads
//! without re-running agreement. Leader election and the services built on
//! the replicated log are external collaborators reached through the
//! control and service APIs of [`PaxosReplica`].

#[macro_use]
mod utils;

mod paxos;
mod server;

pub use paxos::{
    ElectionReason, PaxosPhase, PaxosReplica, PeerMsg, ProposalNum,
    ReplicaConfigPaxos, SharedState, Uncommitted, Version,
};
pub use server::{ReplicaId, Transaction};
pub use utils::{Bitmap, MonaxosError, Timer, UTime};
