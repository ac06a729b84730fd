//! Paxos replica -- leader path: collect phase, proposals, commits, leases.

use super::*;

// PaxosReplica collect (recovery) phase logic
impl PaxosReplica {
    /// Starts the collect phase (Paxos Prepare) with a fresh proposal
    /// number greater than `oldpn`. Entered on `leader_init()` and again on
    /// every rebuff by a peon holding a higher number.
    pub(super) async fn collect(
        &mut self,
        oldpn: ProposalNum,
    ) -> Result<(), MonaxosError> {
        debug_assert!(self.is_leader());
        self.phase = PaxosPhase::Recovering;

        // reset per-round recovery state; count self immediately
        self.num_last = 1;
        self.uncommitted_v = 0;
        self.uncommitted_pn = 0;
        self.uncommitted_value = None;
        self.peer_first_committed.clear();
        self.peer_last_committed.clear();

        // pick up any value we accepted at last_committed+1 but never saw
        // committed; a peon may still override it with a higher-pn one
        if let Some(unc) = self.load_uncommitted()? {
            pf_debug!(self.id; "own uncommitted value at v {} pn {}",
                               unc.v, unc.pn);
            self.uncommitted_v = unc.v;
            self.uncommitted_pn = unc.pn;
            self.uncommitted_value = Some(unc.value);
        }

        // mint a new proposal number and take it as accepted
        let pn = self
            .get_new_proposal_number(self.accepted_pn.max(oldpn))
            .await?;
        let mut txn = Transaction::new();
        txn.put_u64(KEY_ACCEPTED_PN, pn);
        self.commit_store(txn).await?;
        self.accepted_pn = pn;
        pf_info!(self.id; "collect phase at pn {} lc {}",
                          pn, self.last_committed);

        self.transport_hub.bcast_msg(
            PeerMsg::Collect {
                pn,
                first_committed: self.first_committed,
                last_committed: self.last_committed,
            },
            Some(self.quorum.clone()),
        )?;
        self.timers.schedule(
            TimerEvent::CollectTimeout,
            Duration::from_millis(self.config.propose_timeout_ms),
        )?;
        Ok(())
    }

    /// Handler of Last reply from peon. Counts matching replies, adopts the
    /// highest-pn uncommitted value seen, retries above any higher number a
    /// peon rebuffs with, and finishes recovery once the whole quorum has
    /// answered.
    pub(super) async fn handle_last(
        &mut self,
        peer: ReplicaId,
        pn: ProposalNum,
        first_committed: Version,
        last_committed: Version,
        uncommitted: Option<Uncommitted>,
        shared: SharedState,
    ) -> Result<(), MonaxosError> {
        if self.phase != PaxosPhase::Recovering {
            pf_trace!(self.id; "ignoring Last <- {} outside recovery", peer);
            return Ok(());
        }
        pf_trace!(self.id; "received Last <- {} pn {} lc {}",
                           peer, pn, last_committed);

        // note the peer's committed range
        self.peer_first_committed.insert(peer, first_committed);
        self.peer_last_committed.insert(peer, last_committed);

        // absorb any newer committed state the peon shared with us
        if !shared.is_empty() {
            self.store_state(&shared).await?;
        }

        if pn > self.accepted_pn {
            // rebuffed: this peon promised someone a higher number; abort
            // this round and retry above it
            pf_debug!(self.id; "rebuffed by {} with pn {} > {}",
                               peer, pn, self.accepted_pn);
            return self.collect(pn).await;
        } else if pn < self.accepted_pn {
            // late reply to a stale collect of ours
            pf_trace!(self.id; "dropping stale Last <- {} pn {}", peer, pn);
            return Ok(());
        }

        // the peon stands behind our proposal number; if it knows an
        // uncommitted value from a newer round than ours, adopt it
        if let Some(unc) = uncommitted {
            if unc.pn > self.uncommitted_pn {
                pf_debug!(self.id; "adopting uncommitted v {} pn {} <- {}",
                                   unc.v, unc.pn, peer);
                self.uncommitted_v = unc.v;
                self.uncommitted_pn = unc.pn;
                self.uncommitted_value = Some(unc.value);
            }
        }

        self.num_last += 1;
        if self.num_last > self.quorum_cnt() {
            self.protocol_abort("more Last replies than quorum members");
        }
        if self.num_last == self.quorum_cnt() {
            // the whole quorum stands behind our proposal number
            self.timers.cancel(TimerEvent::CollectTimeout)?;

            // bring lagging peers up to date before moving on
            let lagging: Vec<(ReplicaId, Version, Version)> = self
                .peer_last_committed
                .iter()
                .filter(|(_, &lc)| lc < self.last_committed)
                .map(|(&p, &lc)| {
                    (p, *self.peer_first_committed.get(&p).unwrap_or(&0), lc)
                })
                .collect();
            for (p, peer_fc, peer_lc) in lagging {
                pf_debug!(self.id; "sharing state with {} (peer range {}..{})",
                                   p, peer_fc, peer_lc);
                let shared = self.share_state(peer_lc)?;
                self.transport_hub.send_msg(
                    PeerMsg::Commit {
                        pn: self.accepted_pn,
                        first_committed: self.first_committed,
                        last_committed: self.last_committed,
                        shared,
                    },
                    p,
                )?;
            }

            if self.uncommitted_v == self.last_committed + 1
                && self.uncommitted_value.is_some()
            {
                // a previous round left a value hanging at the next
                // version; finish the job by proposing it under our pn
                let value = self.uncommitted_value.take().unwrap();
                pf_info!(self.id; "recovering uncommitted value at v {} (pn {})",
                                  self.uncommitted_v, self.uncommitted_pn);
                self.uncommitted_v = 0;
                self.uncommitted_pn = 0;
                self.begin(value).await?;
            } else {
                // nothing (relevant) to recover; we are active
                self.uncommitted_v = 0;
                self.uncommitted_pn = 0;
                self.uncommitted_value = None;
                self.phase = PaxosPhase::Active;
                self.extend_lease()?;
                self.wake_on_activation();
            }
        }
        Ok(())
    }

    /// The collect phase timed out: a significant part of the quorum does
    /// not believe we are the leader, so trigger fresh elections.
    pub(super) fn collect_timeout(&mut self) -> Result<(), MonaxosError> {
        if !self.is_leader() || self.phase != PaxosPhase::Recovering {
            return Ok(());
        }
        pf_warn!(self.id; "collect phase at pn {} timed out ({}/{} replies)",
                          self.accepted_pn, self.num_last, self.quorum_cnt());
        self.request_election(ElectionReason::CollectTimeout);
        Ok(())
    }
}

// PaxosReplica proposal (updating) phase logic
impl PaxosReplica {
    /// Starts a new proposal (Paxos Accept-Request) with the intent of
    /// committing `value` at version `last_committed+1`. With a quorum of
    /// one we simply commit and stay Active.
    pub(super) async fn begin(
        &mut self,
        value: Vec<u8>,
    ) -> Result<(), MonaxosError> {
        debug_assert!(self.is_leader());
        let v = self.last_committed + 1;
        pf_debug!(self.id; "begin proposal at v {} pn {}", v, self.accepted_pn);

        // accept it ourselves, durably, before asking anyone else
        let mut txn = Transaction::new();
        txn.put(key_of(v), value.clone());
        txn.put_u64(KEY_ACCEPTED_PN_FROM, self.accepted_pn);
        self.commit_store(txn).await?;
        self.new_value = Some(value.clone());

        if self.quorum_cnt() == 1 {
            // alone in the quorum: no one else to ask
            self.commit().await?;
            self.phase = PaxosPhase::Active;
            return Ok(());
        }

        self.accepted.clear();
        self.accepted.set(self.id, true)?;
        self.phase = PaxosPhase::Updating;

        self.transport_hub.bcast_msg(
            PeerMsg::Begin {
                pn: self.accepted_pn,
                pn_from: self.accepted_pn,
                first_committed: self.first_committed,
                last_committed: self.last_committed,
                value,
            },
            Some(self.quorum.clone()),
        )?;
        self.timers.schedule(
            TimerEvent::AcceptTimeout,
            Duration::from_millis(self.config.propose_timeout_ms),
        )?;
        Ok(())
    }

    /// Handler of Accept reply from peon. A majority lets us commit; the
    /// full quorum lets us extend the lease and go back to Active.
    pub(super) async fn handle_accept(
        &mut self,
        peer: ReplicaId,
        pn: ProposalNum,
    ) -> Result<(), MonaxosError> {
        if pn != self.accepted_pn || self.phase != PaxosPhase::Updating {
            pf_trace!(self.id; "dropping Accept <- {} pn {}", peer, pn);
            return Ok(());
        }
        pf_trace!(self.id; "received Accept <- {} pn {}", peer, pn);

        if self.accepted.get(peer)? {
            return Ok(()); // spurious duplication
        }
        self.accepted.set(peer, true)?;

        if self.accepted.count() == self.majority() {
            // majority reached: the value is decided; make it durable and
            // known everywhere
            self.commit().await?;
        }
        if self.accepted.count() == self.quorum_cnt() {
            // full quorum accepted: every member holds the latest value,
            // so leases may be handed out again
            self.timers.cancel(TimerEvent::AcceptTimeout)?;
            self.phase = PaxosPhase::Active;
            self.extend_lease()?;
            self.wake_on_activation();
        }
        Ok(())
    }

    /// The proposal was not accepted by the full quorum in time. Commit may
    /// already have happened at the majority mark; what failed is the
    /// full-quorum condition leases require, so trigger fresh elections.
    pub(super) fn accept_timeout(&mut self) -> Result<(), MonaxosError> {
        if !self.is_leader() || self.phase != PaxosPhase::Updating {
            return Ok(());
        }
        pf_warn!(self.id; "proposal at pn {} timed out ({}/{} accepts)",
                          self.accepted_pn, self.accepted.count(),
                          self.quorum_cnt());
        self.request_election(ElectionReason::AcceptTimeout);
        Ok(())
    }

    /// Commits the value being proposed: persist it together with the
    /// version advance, instruct every quorum member to do the same, and
    /// wake commit waiters. The current lease covered the previous value,
    /// so it is cancelled here; a fresh one is handed out on full-quorum
    /// accept.
    pub(super) async fn commit(&mut self) -> Result<(), MonaxosError> {
        let Some(value) = self.new_value.take() else {
            self.protocol_abort("commit with no value in flight");
        };
        let v = self.last_committed + 1;
        pf_info!(self.id; "committing v {} pn {}", v, self.accepted_pn);

        let mut txn = Transaction::new();
        txn.put(key_of(v), value.clone());
        txn.put_u64(KEY_LAST_COMMITTED, v);
        if self.first_committed == 0 {
            txn.put_u64(KEY_FIRST_COMMITTED, 1);
        }
        self.commit_store(txn).await?;
        self.last_committed = v;
        if self.first_committed == 0 {
            self.first_committed = 1;
        }

        // cancel the current lease; it referenced the prior value
        self.lease_expire = UTime::ZERO;
        self.timers.cancel(TimerEvent::LeaseRenew)?;
        self.timers.cancel(TimerEvent::LeaseAckTimeout)?;

        self.transport_hub.bcast_msg(
            PeerMsg::Commit {
                pn: self.accepted_pn,
                first_committed: self.first_committed,
                last_committed: v,
                shared: SharedState {
                    entries: vec![(v, value)],
                    snapshot: None,
                },
            },
            Some(self.quorum.clone()),
        )?;

        self.wake_waiting_for_commit(v);
        Ok(())
    }
}

// PaxosReplica lease management logic
impl PaxosReplica {
    /// Extends the read lease: every quorum member now holds the latest
    /// committed value, so each may serve local reads until the new
    /// deadline once it acks.
    pub(super) fn extend_lease(&mut self) -> Result<(), MonaxosError> {
        debug_assert!(self.is_leader());
        debug_assert_eq!(self.phase, PaxosPhase::Active);

        let now = UTime::now();
        self.lease_expire =
            now + Duration::from_millis(self.config.lease_interval_ms);
        self.acked_lease.clear();
        self.acked_lease.set(self.id, true)?;

        if self.quorum_cnt() > 1 {
            pf_trace!(self.id; "extending lease until {} at lc {}",
                               self.lease_expire, self.last_committed);
            self.transport_hub.bcast_msg(
                PeerMsg::Lease {
                    pn: self.accepted_pn,
                    first_committed: self.first_committed,
                    last_committed: self.last_committed,
                    lease_expire: self.lease_expire,
                    sent_at: now,
                },
                Some(self.quorum.clone()),
            )?;
            self.timers.schedule(
                TimerEvent::LeaseAckTimeout,
                Duration::from_millis(self.config.propose_timeout_ms),
            )?;
        }
        self.timers.schedule(
            TimerEvent::LeaseRenew,
            Duration::from_millis(self.config.lease_renew_interval_ms),
        )?;
        Ok(())
    }

    /// Handler of LeaseAck from peon.
    pub(super) fn handle_lease_ack(
        &mut self,
        peer: ReplicaId,
        sent_at: UTime,
    ) -> Result<(), MonaxosError> {
        pf_trace!(self.id; "received LeaseAck <- {}", peer);
        self.warn_on_future_time(sent_at, peer);

        self.acked_lease.set(peer, true)?;
        if self.acked_lease.count() == self.quorum_cnt() {
            self.timers.cancel(TimerEvent::LeaseAckTimeout)?;
        }
        Ok(())
    }

    /// At least one peon did not ack our lease in time.
    pub(super) fn lease_ack_timeout(&mut self) -> Result<(), MonaxosError> {
        if !self.is_leader() {
            return Ok(());
        }
        pf_warn!(self.id; "lease acked by only {}/{} members in time",
                          self.acked_lease.count(), self.quorum_cnt());
        self.request_election(ElectionReason::LeaseAckTimeout);
        Ok(())
    }

    /// No new committed values meanwhile; just extend the lease again.
    pub(super) fn lease_renew_timeout(&mut self) -> Result<(), MonaxosError> {
        if !self.is_leader() || self.phase != PaxosPhase::Active {
            return Ok(());
        }
        self.extend_lease()
    }
}
