//! Paxos replica -- service interface: read/write gates and proposals.
//!
//! Higher services read committed values and submit new ones here; they
//! never reach into the state machine. Continuations are tokio oneshot
//! senders queued per predicate and drained in FIFO order when the
//! predicate opens.

use super::*;

// PaxosReplica read/write gate evaluation
impl PaxosReplica {
    /// True if we hold a valid read lease at this instant.
    #[inline]
    fn lease_valid(&self) -> bool {
        !self.lease_expire.is_zero() && UTime::now() < self.lease_expire
    }

    /// Check if we are recovering.
    pub fn is_recovering(&self) -> bool {
        self.phase == PaxosPhase::Recovering
    }

    /// Check if we are active.
    pub fn is_active(&self) -> bool {
        self.phase == PaxosPhase::Active
    }

    /// Check if we are updating.
    pub fn is_updating(&self) -> bool {
        self.phase == PaxosPhase::Updating
    }

    /// Latest committed version.
    pub fn get_version(&self) -> Version {
        self.last_committed
    }

    /// First committed (lowest retained) version.
    pub fn get_first_committed(&self) -> Version {
        self.first_committed
    }

    /// Checks if a given version is locally readable. A version may not be
    /// readable because we have no committed value yet, an election may be
    /// ongoing, our lease may have expired, or the version is ahead of our
    /// last committed one. `seen == 0` asks about the latest version.
    pub fn is_readable(&self, seen: Version) -> bool {
        self.last_committed > 0
            && (self.phase == PaxosPhase::Active
                || self.phase == PaxosPhase::Updating)
            && (self.quorum_cnt() == 1 || self.lease_valid())
            && (seen == 0 || seen <= self.last_committed)
    }

    /// Checks if we can initiate proposals: we are alone in the quorum, or
    /// we are the leader, Active, with a valid lease.
    pub fn is_writeable(&self) -> bool {
        self.quorum_cnt() == 1
            || (self.is_leader()
                && self.phase == PaxosPhase::Active
                && self.lease_valid())
    }

    /// Reads the value at version `v`. Returns `None` when the version is
    /// not currently readable or not retained; callers queue on
    /// `wait_for_readable` and retry.
    pub fn read(&self, v: Version) -> Option<Vec<u8>> {
        if !self.is_readable(v) {
            return None;
        }
        self.store.get(&key_of(v)).cloned()
    }

    /// Reads the latest committed version together with its number.
    pub fn read_current(&self) -> Option<(Version, Vec<u8>)> {
        if !self.is_readable(0) {
            return None;
        }
        self.store
            .get(&key_of(self.last_committed))
            .map(|bytes| (self.last_committed, bytes.clone()))
    }
}

// PaxosReplica waiter queues & proposals
impl PaxosReplica {
    /// Queues a continuation fired on the next entry to Active.
    pub fn wait_for_active(&mut self, cb: oneshot::Sender<()>) {
        self.waiting_for_active.push_back(cb);
    }

    /// Queues a continuation fired when local reads become possible.
    pub fn wait_for_readable(&mut self, cb: oneshot::Sender<()>) {
        self.waiting_for_readable.push_back(cb);
    }

    /// Queues a continuation fired when proposals become possible.
    pub fn wait_for_writeable(&mut self, cb: oneshot::Sender<()>) {
        self.waiting_for_writeable.push_back(cb);
    }

    /// Queues a continuation fired with the version of the next commit
    /// applied locally.
    pub fn wait_for_commit(&mut self, oncommit: oneshot::Sender<Version>) {
        self.waiting_for_commit.push_back(oncommit);
    }

    /// Proposes a new value for the next version. `oncommit` fires when the
    /// value (or a competing one, after leadership churn) commits locally.
    /// Returns false without starting a round when not writeable; the
    /// continuation stays queued, and the caller should retry after the
    /// next election settles.
    pub async fn propose_new_value(
        &mut self,
        value: Vec<u8>,
        oncommit: oneshot::Sender<Version>,
    ) -> Result<bool, MonaxosError> {
        self.waiting_for_commit.push_back(oncommit);
        if !self.is_writeable() {
            pf_debug!(self.id; "propose while not writeable; retry after election");
            return Ok(false);
        }
        self.begin(value).await?;
        Ok(true)
    }

    pub(super) fn wake_waiting_for_active(&mut self) {
        for cb in self.waiting_for_active.drain(..) {
            let _ = cb.send(()); // receiver may have given up
        }
    }

    pub(super) fn wake_waiting_for_readable(&mut self) {
        for cb in self.waiting_for_readable.drain(..) {
            let _ = cb.send(());
        }
    }

    pub(super) fn wake_waiting_for_writeable(&mut self) {
        for cb in self.waiting_for_writeable.drain(..) {
            let _ = cb.send(());
        }
    }

    pub(super) fn wake_waiting_for_commit(&mut self, v: Version) {
        for cb in self.waiting_for_commit.drain(..) {
            let _ = cb.send(v);
        }
    }

    /// Wakes the queues whose predicates just opened by entering Active.
    pub(super) fn wake_on_activation(&mut self) {
        self.wake_waiting_for_active();
        if self.is_readable(0) {
            self.wake_waiting_for_readable();
        }
        if self.is_writeable() {
            self.wake_waiting_for_writeable();
        }
    }
}
