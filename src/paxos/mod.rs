//! Consensus replication core: single-decree Paxos with read leases.
//!
//! This state machine varies from textbook Paxos in a few key ways:
//!   1. Only a single new value is in flight at a time, simplifying the
//!      recovery logic.
//!   2. Replicas track committed values and share them generously with
//!      lagging peers (catch-up bundles, optionally seeded by a stashed
//!      consolidated snapshot).
//!   3. A leasing mechanism is layered on top, letting every quorum member
//!      determine when it is safe to serve a local read of its copy of the
//!      last committed value without re-running agreement.
//!
//! Leader election is an external collaborator: it signals roles through
//! `leader_init()` / `peon_init()` and receives election requests through
//! the channel handed to `new_and_setup()`.

mod leadership;
mod messages;
mod recovery;
mod request;
mod timers;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;

use crate::server::{ReplicaId, StoreHub, Transaction, TransportHub};
use crate::utils::{Bitmap, MonaxosError, UTime};

use serde::Deserialize;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

pub use messages::{PeerMsg, SharedState, Uncommitted};
pub(crate) use timers::{TimerEvent, TimerHub};

/// Version number of a value in the log. 0 is the null version.
pub type Version = u64;

/// Proposal number of a Paxos round. 0 is the null proposal number.
pub type ProposalNum = u64;

// Store schema keys.
pub(crate) const KEY_FIRST_COMMITTED: &str = "first_committed";
pub(crate) const KEY_LAST_COMMITTED: &str = "last_committed";
pub(crate) const KEY_ACCEPTED_PN: &str = "accepted_pn";
pub(crate) const KEY_ACCEPTED_PN_FROM: &str = "accepted_pn_from";
pub(crate) const KEY_LAST_PN: &str = "last_pn";
pub(crate) const KEY_LATEST: &str = "latest";

/// Store key of the value at a version.
#[inline]
pub(crate) fn key_of(v: Version) -> String {
    format!("v/{}", v)
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigPaxos {
    /// Path to the backing store WAL file.
    pub backer_path: String,

    /// Whether to call `fdatasync()` on store WAL appends.
    pub logger_sync: bool,

    /// Collect / accept / lease-ack timeout in millisecs.
    pub propose_timeout_ms: u64,

    /// Read lease duration in millisecs.
    pub lease_interval_ms: u64,

    /// Lease renew cadence in millisecs; must be smaller than
    /// `lease_interval_ms`.
    pub lease_renew_interval_ms: u64,

    /// Clock drift threshold above which warnings are emitted, in millisecs.
    pub clock_drift_allowed_ms: u64,

    /// Exponential backoff base for repeated clock drift warnings, in secs.
    pub clock_drift_warn_backoff: f64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigPaxos {
    fn default() -> Self {
        ReplicaConfigPaxos {
            backer_path: "/tmp/monaxos.wal".into(),
            logger_sync: false,
            propose_timeout_ms: 10_000,
            lease_interval_ms: 5_000,
            lease_renew_interval_ms: 3_000,
            clock_drift_allowed_ms: 300,
            clock_drift_warn_backoff: 5.0,
        }
    }
}

/// Paxos state machine phase.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PaxosPhase {
    /// Recovering uncommitted state after an election (or awaiting the
    /// leader's collect phase).
    Recovering,

    /// Idle; a peon may or may not hold a valid lease.
    Active,

    /// A proposal for a new value is in flight.
    Updating,
}

/// Role assigned by the election layer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Role {
    Leader,
    Peon,
}

/// Reasons the core requests a fresh election from the election layer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ElectionReason {
    /// Collect phase did not hear from the full quorum in time.
    CollectTimeout,

    /// Proposal was not accepted by the full quorum in time.
    AcceptTimeout,

    /// Lease was not acked by the full quorum in time.
    LeaseAckTimeout,

    /// Peon lease expired without renewal.
    LeaseTimeout,

    /// A Paxos-critical store write failed.
    StoreFailure,
}

/// Paxos replica module.
pub struct PaxosReplica {
    /// My replica ID (rank within the cluster).
    id: ReplicaId,

    /// Total number of replicas in the cluster.
    population: u8,

    /// Members of the current quorum epoch, set by the election layer at
    /// `leader_init()` / `peon_init()` time.
    quorum: Bitmap,

    /// Configuration parameters struct.
    config: ReplicaConfigPaxos,

    /// Durable store module.
    store: StoreHub,

    /// TransportHub module.
    transport_hub: TransportHub<PeerMsg>,

    /// Protocol timers registry.
    timers: TimerHub,

    /// Sender side of the election request channel.
    tx_elect: mpsc::UnboundedSender<ElectionReason>,

    /// Current state machine phase.
    phase: PaxosPhase,

    /// Current role.
    role: Role,

    // mirrors of durable header state
    /// Lowest version still retained in the log.
    first_committed: Version,

    /// Highest committed version held locally.
    last_committed: Version,

    /// Highest proposal number this replica has ever accepted.
    accepted_pn: ProposalNum,

    /// Highest proposal number ever seen; seeds the generator.
    last_pn: ProposalNum,

    /// Version of the stashed consolidated snapshot (0 if none).
    latest_stashed: Version,

    // leader per-round transient state
    /// Number of Last replies collected this round (self included).
    num_last: u8,

    /// Version of the highest-pn accepted-but-uncommitted value seen during
    /// collect (0 if none).
    uncommitted_v: Version,

    /// Proposal number the uncommitted value was accepted under.
    uncommitted_pn: ProposalNum,

    /// The uncommitted value itself.
    uncommitted_value: Option<Vec<u8>>,

    /// Each collect-phase peer's reported first committed version.
    peer_first_committed: HashMap<ReplicaId, Version>,

    /// Each collect-phase peer's reported last committed version.
    peer_last_committed: HashMap<ReplicaId, Version>,

    /// Members (self included) that accepted the current proposal.
    accepted: Bitmap,

    /// Members (self included) that acked the current lease.
    acked_lease: Bitmap,

    /// The value being proposed this round.
    new_value: Option<Vec<u8>>,

    /// Wall-clock deadline of the current read lease (zero if none).
    lease_expire: UTime,

    // clock drift warning bookkeeping
    last_clock_drift_warn: UTime,
    clock_drift_warned: u32,

    // waiter queues, woken in FIFO order when their predicate opens
    waiting_for_active: VecDeque<oneshot::Sender<()>>,
    waiting_for_readable: VecDeque<oneshot::Sender<()>>,
    waiting_for_writeable: VecDeque<oneshot::Sender<()>>,
    waiting_for_commit: VecDeque<oneshot::Sender<Version>>,
}

// PaxosReplica common helpers
impl PaxosReplica {
    /// Creates a new Paxos replica: recovers durable header state from the
    /// backing store and binds the peer transport. The replica starts in
    /// Recovering phase as a peon; the election layer assigns roles.
    pub async fn new_and_setup(
        id: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
        tx_elect: mpsc::UnboundedSender<ElectionReason>,
        config_str: Option<&str>,
    ) -> Result<Self, MonaxosError> {
        if population == 0 || id >= population {
            return logged_err!(id; "invalid population {}", population);
        }

        let config = parsed_config!(config_str => ReplicaConfigPaxos;
                                    backer_path, logger_sync,
                                    propose_timeout_ms, lease_interval_ms,
                                    lease_renew_interval_ms,
                                    clock_drift_allowed_ms,
                                    clock_drift_warn_backoff)?;
        if config.propose_timeout_ms == 0 {
            return logged_err!(
                id;
                "invalid config.propose_timeout_ms '{}'",
                config.propose_timeout_ms
            );
        }
        if config.lease_interval_ms == 0 {
            return logged_err!(
                id;
                "invalid config.lease_interval_ms '{}'",
                config.lease_interval_ms
            );
        }
        if config.lease_renew_interval_ms >= config.lease_interval_ms {
            return logged_err!(
                id;
                "invalid config.lease_renew_interval_ms '{}'",
                config.lease_renew_interval_ms
            );
        }

        // setup durable store module and recover header state
        let store = StoreHub::new_and_setup(
            id,
            Path::new(&config.backer_path),
            config.logger_sync,
        )
        .await?;
        let first_committed =
            store.get_u64(KEY_FIRST_COMMITTED)?.unwrap_or(0);
        let last_committed = store.get_u64(KEY_LAST_COMMITTED)?.unwrap_or(0);
        let accepted_pn = store.get_u64(KEY_ACCEPTED_PN)?.unwrap_or(0);
        let last_pn = store.get_u64(KEY_LAST_PN)?.unwrap_or(0);
        let latest_stashed = match store.get(KEY_LATEST) {
            Some(raw) => recovery::decode_stash(raw)?.0,
            None => 0,
        };

        // setup transport hub module
        let transport_hub =
            TransportHub::new_and_setup(id, population, p2p_addr).await?;

        pf_info!(id; "replica {}/{} starting at version {} (pn {})",
                     id, population, last_committed, accepted_pn);
        Ok(PaxosReplica {
            id,
            population,
            quorum: Bitmap::new(population, true),
            config,
            store,
            transport_hub,
            timers: TimerHub::new(),
            tx_elect,
            phase: PaxosPhase::Recovering,
            role: Role::Peon,
            first_committed,
            last_committed,
            accepted_pn,
            last_pn,
            latest_stashed,
            num_last: 0,
            uncommitted_v: 0,
            uncommitted_pn: 0,
            uncommitted_value: None,
            peer_first_committed: HashMap::new(),
            peer_last_committed: HashMap::new(),
            accepted: Bitmap::new(population, false),
            acked_lease: Bitmap::new(population, false),
            new_value: None,
            lease_expire: UTime::ZERO,
            last_clock_drift_warn: UTime::ZERO,
            clock_drift_warned: 0,
            waiting_for_active: VecDeque::new(),
            waiting_for_readable: VecDeque::new(),
            waiting_for_writeable: VecDeque::new(),
            waiting_for_commit: VecDeque::new(),
        })
    }

    /// Connects to a peer replica proactively during cluster bring-up.
    pub async fn connect_to_peer(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), MonaxosError> {
        self.transport_hub.connect_to_peer(id, peer_addr).await
    }

    /// Waits until the whole cluster is connected with me.
    pub async fn wait_for_group(&self) -> Result<(), MonaxosError> {
        self.transport_hub.wait_for_group(self.population).await
    }

    /// Do I carry the leader role right now?
    #[inline]
    fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Number of members in the current quorum.
    #[inline]
    fn quorum_cnt(&self) -> u8 {
        self.quorum.count()
    }

    /// Majority threshold of the current quorum.
    #[inline]
    fn majority(&self) -> u8 {
        self.quorum.count() / 2 + 1
    }

    /// Mints a fresh proposal number strictly greater than `gt`, `last_pn`,
    /// and every number this replica has minted before. The low two decimal
    /// digits encode this replica's rank, so no two replicas ever mint the
    /// same number. Persists `last_pn` before returning.
    async fn get_new_proposal_number(
        &mut self,
        gt: ProposalNum,
    ) -> Result<ProposalNum, MonaxosError> {
        let base = self.last_pn.max(gt);
        let pn = (base / 100 + 1) * 100 + (self.id as u64 + 1);

        let mut txn = Transaction::new();
        txn.put_u64(KEY_LAST_PN, pn);
        self.commit_store(txn).await?;
        self.last_pn = pn;

        pf_debug!(self.id; "minted new pn {} (over {})", pn, base);
        Ok(pn)
    }

    /// Commits a transaction to the durable store. A failure here aborts
    /// the current round and forces a re-election: consistency over
    /// availability.
    async fn commit_store(
        &mut self,
        txn: Transaction,
    ) -> Result<(), MonaxosError> {
        if let Err(e) = self.store.commit(txn).await {
            pf_error!(self.id; "store commit failed: {}", e);
            let _ = self.restart();
            self.request_election(ElectionReason::StoreFailure);
            return Err(e);
        }
        Ok(())
    }

    /// Sends an election request to the election layer.
    fn request_election(&mut self, reason: ElectionReason) {
        pf_info!(self.id; "requesting new election: {:?}", reason);
        if let Err(e) = self.tx_elect.send(reason) {
            pf_error!(self.id; "error sending election request: {}", e);
        }
    }

    /// Logs diagnostic state and aborts the process. An impossible state
    /// can only mean local corruption, and halting beats diverging.
    fn protocol_abort(&self, why: &str) -> ! {
        pf_error!(self.id;
                  "protocol violation: {}; phase {:?} pn {} fc {} lc {} num_last {}",
                  why, self.phase, self.accepted_pn, self.first_committed,
                  self.last_committed, self.num_last);
        panic!("protocol violation: {}", why);
    }

    /// Warns (at a bounded rate) if a peer's clock stamp is too far in our
    /// future; large drift undermines lease safety margins.
    fn warn_on_future_time(&mut self, t: UTime, from: ReplicaId) {
        let now = UTime::now();
        let allowed =
            Duration::from_millis(self.config.clock_drift_allowed_ms);
        if t > now + allowed {
            // cap the exponent to keep the backoff duration finite
            let backoff = Duration::from_secs_f64(
                self.config
                    .clock_drift_warn_backoff
                    .powi(self.clock_drift_warned.min(16) as i32),
            );
            if self.last_clock_drift_warn.is_zero()
                || self.last_clock_drift_warn + backoff < now
            {
                pf_warn!(self.id;
                         "message from {} was stamped {:?} in the future, \
                          clocks not synchronized",
                         from, t.saturating_since(now));
                self.last_clock_drift_warn = now;
                self.clock_drift_warned += 1;
            }
        }
    }
}

// PaxosReplica control API (consumed by the election layer)
impl PaxosReplica {
    /// Initiates the leader after it wins an election. With a quorum of one
    /// there is nothing to recover and the leader jumps straight to Active;
    /// otherwise it starts the collect phase over the given quorum.
    pub async fn leader_init(
        &mut self,
        quorum: Bitmap,
    ) -> Result<(), MonaxosError> {
        if quorum.size() != self.population || !quorum.get(self.id)? {
            return logged_err!(self.id; "invalid quorum {:?} for leader_init",
                                        quorum);
        }
        self.role = Role::Leader;
        self.quorum = quorum;
        self.cancel_events()?;
        self.new_value = None;
        self.lease_expire = UTime::ZERO;

        if self.quorum_cnt() == 1 {
            self.phase = PaxosPhase::Active;
            pf_info!(self.id; "leader_init: quorum of one, active directly");
            self.wake_on_activation();
            return Ok(());
        }

        self.phase = PaxosPhase::Recovering;
        pf_info!(self.id; "leader_init: starting collect phase over {:?}",
                          self.quorum);
        let oldpn = self.accepted_pn;
        self.collect(oldpn).await
    }

    /// Initiates a peon after it loses an election. There is a leader about
    /// to start its collect phase, so just await it in Recovering.
    pub fn peon_init(&mut self, quorum: Bitmap) -> Result<(), MonaxosError> {
        if quorum.size() != self.population || !quorum.get(self.id)? {
            return logged_err!(self.id; "invalid quorum {:?} for peon_init",
                                        quorum);
        }
        self.role = Role::Peon;
        self.quorum = quorum;
        self.phase = PaxosPhase::Recovering;
        self.cancel_events()?;
        self.new_value = None;
        // no reads until a fresh lease arrives
        self.lease_expire = UTime::ZERO;
        pf_info!(self.id; "peon_init: awaiting collect");
        Ok(())
    }

    /// Clears per-round transient state, e.g., after a store failure or
    /// ahead of a new election round.
    pub fn restart(&mut self) -> Result<(), MonaxosError> {
        self.cancel_events()?;
        self.phase = PaxosPhase::Recovering;
        self.new_value = None;
        self.uncommitted_v = 0;
        self.uncommitted_pn = 0;
        self.uncommitted_value = None;
        self.lease_expire = UTime::ZERO;
        pf_info!(self.id; "restart: transient state cleared");
        Ok(())
    }

    /// Cancels all of the protocol's timeout/renew events.
    fn cancel_events(&mut self) -> Result<(), MonaxosError> {
        self.timers.cancel_all()
    }
}

// PaxosReplica event loop
impl PaxosReplica {
    /// Synthesized handler of timer events.
    async fn handle_timer_event(
        &mut self,
        event: TimerEvent,
    ) -> Result<(), MonaxosError> {
        match event {
            TimerEvent::CollectTimeout => self.collect_timeout(),
            TimerEvent::AcceptTimeout => self.accept_timeout(),
            TimerEvent::LeaseRenew => self.lease_renew_timeout(),
            TimerEvent::LeaseAckTimeout => self.lease_ack_timeout(),
            TimerEvent::LeaseTimeout => self.lease_timeout(),
        }
    }

    /// Services exactly one pending event: a message from a peer or a fired
    /// timer. Handlers never overlap; the only suspension points are store
    /// commits awaited inside them.
    pub async fn step(&mut self) -> Result<(), MonaxosError> {
        tokio::select! {
            msg = self.transport_hub.recv_msg() => {
                let (peer, msg) = msg?;
                self.dispatch(peer, msg).await
            },

            event = self.timers.get_event() => {
                self.handle_timer_event(event).await
            },
        }
    }

    /// Main event loop: services events until the termination signal flips.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), MonaxosError> {
        loop {
            tokio::select! {
                res = self.step() => {
                    if let Err(e) = res {
                        pf_error!(self.id; "error in event step: {}", e);
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!(self.id; "replica caught termination signal");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod paxos_tests {
    use super::*;

    /// Builds one replica with a fresh backing file on a loopback port.
    async fn setup_replica(
        id: ReplicaId,
        population: u8,
        port_base: u16,
        tag: &str,
    ) -> Result<
        (PaxosReplica, mpsc::UnboundedReceiver<ElectionReason>),
        MonaxosError,
    > {
        let path = format!("/tmp/test-paxos-{}-{}.wal", tag, id);
        let _ = tokio::fs::remove_file(&path).await;
        let (tx_elect, rx_elect) = mpsc::unbounded_channel();
        let addr: SocketAddr =
            format!("127.0.0.1:{}", port_base + id as u16).parse()?;
        let config = format!(
            "backer_path = '{}'\n\
             propose_timeout_ms = 5000\n\
             lease_interval_ms = 3000\n\
             lease_renew_interval_ms = 1000",
            path
        );
        let replica = PaxosReplica::new_and_setup(
            id,
            population,
            addr,
            tx_elect,
            Some(&config),
        )
        .await?;
        Ok((replica, rx_elect))
    }

    /// Builds a fully connected cluster of replicas.
    async fn setup_cluster(
        population: u8,
        port_base: u16,
        tag: &str,
    ) -> Result<
        Vec<(PaxosReplica, mpsc::UnboundedReceiver<ElectionReason>)>,
        MonaxosError,
    > {
        let mut nodes = Vec::with_capacity(population as usize);
        for id in 0..population {
            nodes.push(setup_replica(id, population, port_base, tag).await?);
        }
        for j in 1..population {
            for i in 0..j {
                let addr: SocketAddr =
                    format!("127.0.0.1:{}", port_base + i as u16).parse()?;
                nodes[j as usize].0.connect_to_peer(i, addr).await?;
            }
        }
        for (node, _) in &nodes {
            node.wait_for_group().await?;
        }
        Ok(nodes)
    }

    /// Receives one message from the replica's transport and services it.
    async fn pump(node: &mut PaxosReplica) -> Result<(), MonaxosError> {
        let (peer, msg) = node.transport_hub.recv_msg().await?;
        node.dispatch(peer, msg).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn happy_path_three_replicas() -> Result<(), MonaxosError> {
        let mut nodes = setup_cluster(3, 54900, "happy").await?;
        let quorum = Bitmap::new(3, true);

        // election outcome: 0 leads, 1 and 2 are peons
        nodes[1].0.peon_init(quorum.clone())?;
        nodes[2].0.peon_init(quorum.clone())?;
        nodes[0].0.leader_init(quorum.clone()).await?;

        // collect round trip
        pump(&mut nodes[1].0).await?; // Collect -> Last
        pump(&mut nodes[2].0).await?;
        pump(&mut nodes[0].0).await?; // Last x2 -> Active + Lease bcast
        pump(&mut nodes[0].0).await?;
        assert!(nodes[0].0.is_active());
        assert!(nodes[0].0.is_writeable());

        // propose a value
        let (tx, mut rx) = oneshot::channel();
        assert!(nodes[0]
            .0
            .propose_new_value(b"x".to_vec(), tx)
            .await?);
        assert!(nodes[0].0.is_updating());

        // peons service Lease then Begin, in FIFO order
        for i in [1usize, 2] {
            pump(&mut nodes[i].0).await?; // Lease -> LeaseAck
            assert!(nodes[i].0.is_active());
            pump(&mut nodes[i].0).await?; // Begin -> Accept
            assert!(nodes[i].0.is_updating());
        }

        // leader services two LeaseAcks and two Accepts; majority commits,
        // full quorum re-activates and re-extends the lease
        for _ in 0..4 {
            pump(&mut nodes[0].0).await?;
        }
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(nodes[0].0.is_active());
        assert!(nodes[0].0.is_writeable());
        assert_eq!(nodes[0].0.get_version(), 1);
        assert_eq!(nodes[0].0.read(1), Some(b"x".to_vec()));

        // peons service Commit then the fresh Lease
        for i in [1usize, 2] {
            pump(&mut nodes[i].0).await?; // Commit
            pump(&mut nodes[i].0).await?; // Lease -> LeaseAck
            assert!(nodes[i].0.is_active());
            assert_eq!(nodes[i].0.get_version(), 1);
            assert_eq!(nodes[i].0.read(1), Some(b"x".to_vec()));
            assert_eq!(
                nodes[i].0.read_current(),
                Some((1, b"x".to_vec()))
            );
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leader_loss_mid_update_recovers_value(
    ) -> Result<(), MonaxosError> {
        let mut nodes = setup_cluster(3, 54920, "loss").await?;
        let quorum = Bitmap::new(3, true);

        nodes[1].0.peon_init(quorum.clone())?;
        nodes[2].0.peon_init(quorum.clone())?;
        nodes[0].0.leader_init(quorum.clone()).await?;
        pump(&mut nodes[1].0).await?;
        pump(&mut nodes[2].0).await?;
        pump(&mut nodes[0].0).await?;
        pump(&mut nodes[0].0).await?;

        // leader 0 proposes "x"...
        let (tx, _rx) = oneshot::channel();
        assert!(nodes[0]
            .0
            .propose_new_value(b"x".to_vec(), tx)
            .await?);

        // ...1 accepts it, but 2 never sees the Begin (message lost), and
        // 0 dies before committing
        pump(&mut nodes[1].0).await?; // Lease
        pump(&mut nodes[1].0).await?; // Begin -> accepted durably
        assert!(nodes[1].0.is_updating());
        pump(&mut nodes[2].0).await?; // Lease
        let (_peer, lost) = nodes[2].0.transport_hub.recv_msg().await?;
        assert!(matches!(lost, PeerMsg::Begin { .. }));

        // a new election makes 1 the leader of the surviving quorum {1, 2}
        let survivors = Bitmap::from(3, vec![1, 2]);
        nodes[2].0.peon_init(survivors.clone())?;
        nodes[1].0.leader_init(survivors).await?;

        pump(&mut nodes[2].0).await?; // Collect -> Last (no uncommitted)
        pump(&mut nodes[1].0).await?; // Last -> adopts own pending, Begin
        assert!(nodes[1].0.is_updating());
        pump(&mut nodes[2].0).await?; // Begin -> Accept
        pump(&mut nodes[1].0).await?; // Accept -> commit + Active + Lease

        assert_eq!(nodes[1].0.get_version(), 1);
        assert_eq!(nodes[1].0.read(1), Some(b"x".to_vec()));

        pump(&mut nodes[2].0).await?; // Commit
        pump(&mut nodes[2].0).await?; // Lease
        assert_eq!(nodes[2].0.get_version(), 1);
        assert_eq!(nodes[2].0.read(1), Some(b"x".to_vec()));

        // the dead leader never committed anything
        assert_eq!(nodes[0].0.get_version(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rebuff_restarts_collect_above() -> Result<(), MonaxosError> {
        let (mut a, _rx_a) = setup_replica(0, 3, 54940, "rebuff").await?;
        let (mut b, _rx_b) = setup_replica(1, 3, 54940, "rebuff").await?;
        let addr0: SocketAddr = "127.0.0.1:54940".parse()?;
        b.connect_to_peer(0, addr0).await?;
        a.transport_hub.wait_for_group(2).await?;
        b.transport_hub.wait_for_group(2).await?;

        let quorum = Bitmap::from(3, vec![0, 1]);
        b.peon_init(quorum.clone())?;

        // b has promised a high pn to a prior leader (member 2, silent now)
        b.dispatch(
            2,
            PeerMsg::Collect {
                pn: 50003,
                first_committed: 0,
                last_committed: 0,
            },
        )
        .await?;
        assert_eq!(b.accepted_pn, 50003);

        // a collects with a smaller pn and gets rebuffed, then retries
        a.leader_init(quorum).await?;
        assert!(a.accepted_pn < 50003);
        pump(&mut b).await?; // Collect -> rebuffing Last
        pump(&mut a).await?; // rebuffed -> re-collect above 50003
        assert!(a.accepted_pn > 50003);
        pump(&mut b).await?; // Collect -> accepting Last
        assert_eq!(b.accepted_pn, a.accepted_pn);
        pump(&mut a).await?; // full quorum -> Active
        assert!(a.is_active());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn majority_commits_but_timeout_reelects(
    ) -> Result<(), MonaxosError> {
        // five members; only the leader is actually wired up, the peons'
        // replies are injected by hand
        let (mut a, mut rx_elect) =
            setup_replica(0, 5, 54960, "majority").await?;
        a.leader_init(Bitmap::new(5, true)).await?;
        for p in 1..5 {
            a.dispatch(
                p,
                PeerMsg::Last {
                    pn: a.accepted_pn,
                    pn_from: 0,
                    first_committed: 0,
                    last_committed: 0,
                    uncommitted: None,
                    shared: SharedState::default(),
                },
            )
            .await?;
        }
        assert!(a.is_active());

        let (tx, mut rx) = oneshot::channel();
        assert!(a.propose_new_value(b"x".to_vec(), tx).await?);

        // accepts from 1 and 2 (plus self) reach majority: commit happens
        for p in 1..3 {
            a.dispatch(
                p,
                PeerMsg::Accept {
                    pn: a.accepted_pn,
                    first_committed: 0,
                    last_committed: 0,
                },
            )
            .await?;
        }
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(a.get_version(), 1);
        assert!(a.is_updating()); // 3 and 4 still silent

        // the full-quorum window closes: new election, but the committed
        // value stays durable for the next leader to find
        a.accept_timeout()?;
        assert_eq!(
            rx_elect.try_recv().unwrap(),
            ElectionReason::AcceptTimeout
        );
        assert_eq!(a.store.get(&key_of(1)), Some(&b"x".to_vec()));
        assert_eq!(a.get_version(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peon_lease_expiry_calls_election() -> Result<(), MonaxosError> {
        let (mut p, mut rx_elect) =
            setup_replica(1, 3, 54980, "lease-exp").await?;
        p.peon_init(Bitmap::new(3, true))?;

        // a short lease arrives from the leader; no renewal will follow
        p.dispatch(
            0,
            PeerMsg::Lease {
                pn: 101,
                first_committed: 0,
                last_committed: 0,
                lease_expire: UTime::now()
                    + Duration::from_millis(150),
                sent_at: UTime::now(),
            },
        )
        .await?;
        assert!(p.is_active());

        // the lease timer fires and requests an election
        tokio::time::timeout(Duration::from_secs(2), p.step())
            .await
            .expect("lease timeout should fire")?;
        assert_eq!(
            rx_elect.recv().await.unwrap(),
            ElectionReason::LeaseTimeout
        );

        p.peon_init(Bitmap::new(3, true))?;
        assert!(p.is_recovering());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn proposal_numbers_unique_monotone() -> Result<(), MonaxosError> {
        let (mut r, _rx) = setup_replica(2, 3, 54990, "pn").await?;
        let pn1 = r.get_new_proposal_number(0).await?;
        assert_eq!(pn1, 103); // rank 2 in the low digits
        let pn2 = r.get_new_proposal_number(0).await?;
        assert_eq!(pn2, 203);
        let pn3 = r.get_new_proposal_number(777).await?;
        assert_eq!(pn3, 803);
        assert!(pn1 < pn2 && pn2 < pn3);
        assert_eq!(r.store.get_u64(KEY_LAST_PN)?, Some(803));
        Ok(())
    }
}
