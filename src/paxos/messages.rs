//! Paxos replica -- wire messages and peon-side handling.

use super::*;

use bincode::{Decode, Encode};

use serde::{Deserialize, Serialize};

/// An accepted-but-uncommitted value reported during the collect phase.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Encode, Decode,
)]
pub struct Uncommitted {
    /// Version the value was accepted at.
    pub v: Version,

    /// Proposal number the value was accepted under.
    pub pn: ProposalNum,

    /// The value itself.
    pub value: Vec<u8>,
}

/// Catch-up bundle bringing a lagging peer to parity: an optional stashed
/// consolidated snapshot, then in-order incremental log entries.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    Clone,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct SharedState {
    /// Incremental `(version, value)` entries, ascending and contiguous.
    pub entries: Vec<(Version, Vec<u8>)>,

    /// Stashed snapshot `(version, bytes)` for peers lagging beyond the
    /// retained log range.
    pub snapshot: Option<(Version, Vec<u8>)>,
}

impl SharedState {
    /// True if the bundle carries nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.snapshot.is_none()
    }
}

/// Peer-peer message type. Sender identity travels in the transport
/// envelope; every variant carries the sender's committed range.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Encode, Decode,
)]
pub enum PeerMsg {
    /// Collect (Paxos Prepare) from leader to peons.
    Collect {
        pn: ProposalNum,
        first_committed: Version,
        last_committed: Version,
    },

    /// Last (Paxos Promise) reply from peon to leader. Carries the pn the
    /// peon now stands at (ours if accepted, its higher one if rebuffing),
    /// any accepted-but-uncommitted value, and newer committed state if the
    /// leader trails the peon.
    Last {
        pn: ProposalNum,
        pn_from: ProposalNum,
        first_committed: Version,
        last_committed: Version,
        uncommitted: Option<Uncommitted>,
        shared: SharedState,
    },

    /// Begin (Paxos Accept-Request) from leader to peons.
    Begin {
        pn: ProposalNum,
        pn_from: ProposalNum,
        first_committed: Version,
        last_committed: Version,
        value: Vec<u8>,
    },

    /// Accept (Paxos Accepted) reply from peon to leader.
    Accept {
        pn: ProposalNum,
        first_committed: Version,
        last_committed: Version,
    },

    /// Commit from leader to peons, carrying the catch-up bundle covering
    /// everything past the receiver's reported committed range.
    Commit {
        pn: ProposalNum,
        first_committed: Version,
        last_committed: Version,
        shared: SharedState,
    },

    /// Lease grant from leader to peons.
    Lease {
        pn: ProposalNum,
        first_committed: Version,
        last_committed: Version,
        lease_expire: UTime,
        sent_at: UTime,
    },

    /// Lease acknowledgement from peon to leader.
    LeaseAck {
        pn: ProposalNum,
        first_committed: Version,
        last_committed: Version,
        sent_at: UTime,
    },
}

// PaxosReplica peer-peer messages handling
impl PaxosReplica {
    /// Handler of Collect message from leader. Accept the proposal number
    /// if it is higher than any we have promised, else rebuff with ours;
    /// either way report our committed range, any accepted-but-uncommitted
    /// value, and newer committed state if the leader trails us.
    pub(super) async fn handle_collect(
        &mut self,
        peer: ReplicaId,
        pn: ProposalNum,
        last_committed: Version,
    ) -> Result<(), MonaxosError> {
        pf_trace!(self.id; "received Collect <- {} pn {} lc {}",
                           peer, pn, last_committed);

        // a collect phase means a recovery is in progress
        self.phase = PaxosPhase::Recovering;

        let reply_pn = if pn > self.accepted_pn {
            // accept the leader's proposal number
            let mut txn = Transaction::new();
            txn.put_u64(KEY_ACCEPTED_PN, pn);
            if pn > self.last_pn {
                txn.put_u64(KEY_LAST_PN, pn);
            }
            self.commit_store(txn).await?;
            self.accepted_pn = pn;
            if pn > self.last_pn {
                self.last_pn = pn;
            }
            pn
        } else {
            // rebuff with the higher number we already promised; the
            // leader will retry its collect phase above it
            pf_debug!(self.id; "rebuffing Collect pn {} <- {} with pn {}",
                               pn, peer, self.accepted_pn);
            self.accepted_pn
        };

        // share newer committed state back if the leader trails us
        let shared = if last_committed < self.last_committed {
            self.share_state(last_committed)?
        } else {
            SharedState::default()
        };

        // report any accepted-but-uncommitted value we hold
        let uncommitted = self.load_uncommitted()?;
        let pn_from = self.store.get_u64(KEY_ACCEPTED_PN_FROM)?.unwrap_or(0);

        self.transport_hub.send_msg(
            PeerMsg::Last {
                pn: reply_pn,
                pn_from,
                first_committed: self.first_committed,
                last_committed: self.last_committed,
                uncommitted,
                shared,
            },
            peer,
        )?;
        Ok(())
    }

    /// Handler of Begin message from leader. Decline (by ignoring) if we
    /// have promised a different proposal number or have not caught up to
    /// the leader's committed point; else durably accept the value and
    /// reply.
    pub(super) async fn handle_begin(
        &mut self,
        peer: ReplicaId,
        pn: ProposalNum,
        last_committed: Version,
        value: Vec<u8>,
    ) -> Result<(), MonaxosError> {
        pf_trace!(self.id; "received Begin <- {} pn {} lc {}",
                           peer, pn, last_committed);

        if pn != self.accepted_pn {
            pf_debug!(self.id; "ignoring Begin pn {} != accepted_pn {}",
                               pn, self.accepted_pn);
            return Ok(());
        }
        if last_committed != self.last_committed {
            // we are behind (or the message is stale); let the catch-up
            // path converge first
            pf_debug!(self.id; "ignoring Begin at lc {} != ours {}",
                               last_committed, self.last_committed);
            return Ok(());
        }

        // accept: durably record the value at the pending version together
        // with the pn it was accepted under
        let v = self.last_committed + 1;
        let mut txn = Transaction::new();
        txn.put(key_of(v), value);
        txn.put_u64(KEY_ACCEPTED_PN_FROM, pn);
        self.commit_store(txn).await?;
        self.phase = PaxosPhase::Updating;

        self.transport_hub.send_msg(
            PeerMsg::Accept {
                pn,
                first_committed: self.first_committed,
                last_committed: self.last_committed,
            },
            peer,
        )?;
        Ok(())
    }

    /// Handler of Commit message from leader: apply the attached catch-up
    /// bundle atomically. The following Lease message moves us (back) to
    /// Active.
    pub(super) async fn handle_commit(
        &mut self,
        peer: ReplicaId,
        last_committed: Version,
        shared: SharedState,
    ) -> Result<(), MonaxosError> {
        pf_trace!(self.id; "received Commit <- {} lc {}",
                           peer, last_committed);

        self.store_state(&shared).await?;
        if self.last_committed < last_committed {
            pf_warn!(self.id; "still behind after shared state: {} < {}",
                              self.last_committed, last_committed);
        }
        Ok(())
    }

    /// Handler of Lease message from leader: adopt the lease deadline,
    /// become Active, and ack back with our clock.
    pub(super) fn handle_lease(
        &mut self,
        peer: ReplicaId,
        last_committed: Version,
        lease_expire: UTime,
        sent_at: UTime,
    ) -> Result<(), MonaxosError> {
        // sanity: only ever move the lease deadline forward
        if lease_expire > self.lease_expire {
            self.lease_expire = lease_expire;
        }
        self.phase = PaxosPhase::Active;
        pf_trace!(self.id; "received Lease <- {} lc {} until {}",
                           peer, last_committed, self.lease_expire);

        self.transport_hub.send_msg(
            PeerMsg::LeaseAck {
                pn: self.accepted_pn,
                first_committed: self.first_committed,
                last_committed: self.last_committed,
                sent_at: UTime::now(),
            },
            peer,
        )?;

        // if no renewal arrives, the timer fires at the deadline and we
        // force an election
        let dur = self
            .lease_expire
            .saturating_since(UTime::now())
            .max(Duration::from_millis(1));
        self.timers.schedule(TimerEvent::LeaseTimeout, dur)?;

        self.wake_on_activation();
        self.warn_on_future_time(sent_at, peer);
        Ok(())
    }

    /// The lease expired without a renewal from the leader: the leader is
    /// unresponsive, so force fresh elections.
    pub(super) fn lease_timeout(&mut self) -> Result<(), MonaxosError> {
        if self.is_leader() {
            return Ok(());
        }
        pf_warn!(self.id; "read lease expired without renewal");
        self.request_election(ElectionReason::LeaseTimeout);
        Ok(())
    }

    /// Synthesized handler of messages from peers. Routes by message kind
    /// and current role; messages meant for the opposite role are dropped.
    pub async fn dispatch(
        &mut self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<(), MonaxosError> {
        match msg {
            PeerMsg::Collect {
                pn,
                first_committed: _,
                last_committed,
            } => {
                if self.is_leader() {
                    pf_warn!(self.id; "dropping Collect <- {} as leader", peer);
                    Ok(())
                } else {
                    self.handle_collect(peer, pn, last_committed).await
                }
            }

            PeerMsg::Last {
                pn,
                pn_from: _,
                first_committed,
                last_committed,
                uncommitted,
                shared,
            } => {
                if !self.is_leader() {
                    pf_warn!(self.id; "dropping Last <- {} as peon", peer);
                    Ok(())
                } else {
                    self.handle_last(
                        peer,
                        pn,
                        first_committed,
                        last_committed,
                        uncommitted,
                        shared,
                    )
                    .await
                }
            }

            PeerMsg::Begin {
                pn,
                pn_from: _,
                first_committed: _,
                last_committed,
                value,
            } => {
                if self.is_leader() {
                    pf_warn!(self.id; "dropping Begin <- {} as leader", peer);
                    Ok(())
                } else {
                    self.handle_begin(peer, pn, last_committed, value).await
                }
            }

            PeerMsg::Accept {
                pn,
                first_committed: _,
                last_committed: _,
            } => {
                if !self.is_leader() {
                    pf_warn!(self.id; "dropping Accept <- {} as peon", peer);
                    Ok(())
                } else {
                    self.handle_accept(peer, pn).await
                }
            }

            PeerMsg::Commit {
                pn: _,
                first_committed: _,
                last_committed,
                shared,
            } => {
                if self.is_leader() {
                    pf_warn!(self.id; "dropping Commit <- {} as leader", peer);
                    Ok(())
                } else {
                    self.handle_commit(peer, last_committed, shared).await
                }
            }

            PeerMsg::Lease {
                pn: _,
                first_committed: _,
                last_committed,
                lease_expire,
                sent_at,
            } => {
                if self.is_leader() {
                    pf_warn!(self.id; "dropping Lease <- {} as leader", peer);
                    Ok(())
                } else {
                    self.handle_lease(peer, last_committed, lease_expire, sent_at)
                }
            }

            PeerMsg::LeaseAck {
                pn: _,
                first_committed: _,
                last_committed: _,
                sent_at,
            } => {
                if !self.is_leader() {
                    pf_warn!(self.id; "dropping LeaseAck <- {} as peon", peer);
                    Ok(())
                } else {
                    self.handle_lease_ack(peer, sent_at)
                }
            }
        }
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use crate::utils::WIRE_CONFIG;

    fn sample_msgs() -> Vec<PeerMsg> {
        vec![
            PeerMsg::Collect {
                pn: 101,
                first_committed: 1,
                last_committed: 7,
            },
            PeerMsg::Last {
                pn: 101,
                pn_from: 0,
                first_committed: 1,
                last_committed: 9,
                uncommitted: Some(Uncommitted {
                    v: 10,
                    pn: 77,
                    value: b"pending".to_vec(),
                }),
                shared: SharedState {
                    entries: vec![(8, b"v8".to_vec()), (9, b"v9".to_vec())],
                    snapshot: None,
                },
            },
            PeerMsg::Begin {
                pn: 201,
                pn_from: 201,
                first_committed: 1,
                last_committed: 9,
                value: b"the new value".to_vec(),
            },
            PeerMsg::Accept {
                pn: 201,
                first_committed: 1,
                last_committed: 9,
            },
            PeerMsg::Commit {
                pn: 201,
                first_committed: 1,
                last_committed: 10,
                shared: SharedState {
                    entries: vec![(10, b"the new value".to_vec())],
                    snapshot: Some((5, b"snap".to_vec())),
                },
            },
            PeerMsg::Lease {
                pn: 201,
                first_committed: 1,
                last_committed: 10,
                lease_expire: UTime::new(1000, 500),
                sent_at: UTime::new(999, 0),
            },
            PeerMsg::LeaseAck {
                pn: 201,
                first_committed: 1,
                last_committed: 10,
                sent_at: UTime::new(999, 42),
            },
        ]
    }

    #[test]
    fn codec_roundtrip_identity() -> Result<(), MonaxosError> {
        for msg in sample_msgs() {
            let bytes = bincode::encode_to_vec(&msg, WIRE_CONFIG)?;
            let (decoded, len): (PeerMsg, usize) =
                bincode::decode_from_slice(&bytes, WIRE_CONFIG)?;
            assert_eq!(len, bytes.len());
            assert_eq!(decoded, msg);

            // re-encoding must reproduce the exact same bytes
            let re_bytes = bincode::encode_to_vec(&decoded, WIRE_CONFIG)?;
            assert_eq!(re_bytes, bytes);
        }
        Ok(())
    }

    #[test]
    fn shared_state_emptiness() {
        assert!(SharedState::default().is_empty());
        let with_snap = SharedState {
            entries: vec![],
            snapshot: Some((3, vec![1, 2, 3])),
        };
        assert!(!with_snap.is_empty());
    }
}
