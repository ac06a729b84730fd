//! Paxos replica -- state sharing, catch-up application, stash, trimming.

use super::*;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Encodes a stashed snapshot as the value of the `latest` store key.
pub(super) fn encode_stash(
    v: Version,
    bytes: &[u8],
) -> Result<Vec<u8>, MonaxosError> {
    Ok(encode_to_vec(&(v, bytes.to_vec()))?)
}

/// Decodes the value of the `latest` store key.
pub(super) fn decode_stash(
    raw: &[u8],
) -> Result<(Version, Vec<u8>), MonaxosError> {
    Ok(decode_from_slice(raw)?)
}

// PaxosReplica state sharing & catch-up logic
impl PaxosReplica {
    /// Loads the accepted-but-uncommitted value at `last_committed+1` from
    /// the store, if one exists, together with the pn it was accepted
    /// under.
    pub(super) fn load_uncommitted(
        &self,
    ) -> Result<Option<Uncommitted>, MonaxosError> {
        let v = self.last_committed + 1;
        let Some(value) = self.store.get(&key_of(v)) else {
            return Ok(None);
        };
        let pn = self.store.get_u64(KEY_ACCEPTED_PN_FROM)?.unwrap_or(0);
        Ok(Some(Uncommitted {
            v,
            pn,
            value: value.clone(),
        }))
    }

    /// Builds a catch-up bundle for a peer whose log ends at
    /// `peer_last_committed`. A peer lagging beyond our retained log range
    /// gets the stashed consolidated snapshot first, then the incremental
    /// entries above it.
    pub(super) fn share_state(
        &self,
        peer_last_committed: Version,
    ) -> Result<SharedState, MonaxosError> {
        let mut shared = SharedState::default();
        let mut start = peer_last_committed + 1;

        if peer_last_committed + 1 < self.first_committed {
            match self.get_stashed()? {
                Some((sv, bytes)) => {
                    start = start.max(sv + 1);
                    shared.snapshot = Some((sv, bytes));
                }
                None => {
                    return logged_err!(
                        self.id;
                        "peer at lc {} predates retained log {} with no snapshot",
                        peer_last_committed,
                        self.first_committed
                    );
                }
            }
        }

        for v in start..=self.last_committed {
            match self.store.get(&key_of(v)) {
                Some(bytes) => shared.entries.push((v, bytes.clone())),
                None => {
                    return logged_err!(
                        self.id;
                        "version {} missing from retained log",
                        v
                    );
                }
            }
        }
        Ok(shared)
    }

    /// Applies a catch-up bundle atomically: snapshot first (when it is
    /// ahead of us), then in-order incremental entries. Re-applying an
    /// already-present version is a no-op. Wakes commit waiters when
    /// `last_committed` advances.
    pub(super) async fn store_state(
        &mut self,
        shared: &SharedState,
    ) -> Result<(), MonaxosError> {
        let mut txn = Transaction::new();
        let mut new_first = self.first_committed;
        let mut new_last = self.last_committed;
        let mut snap_applied = 0;

        if let Some((sv, bytes)) = &shared.snapshot {
            if *sv > new_last {
                // the snapshot consolidates everything up to its version;
                // individual versions below it are not retained locally
                txn.put(KEY_LATEST, encode_stash(*sv, bytes)?);
                new_first = *sv;
                new_last = *sv;
                snap_applied = *sv;
            }
        }

        for (v, bytes) in &shared.entries {
            if *v <= new_last {
                continue; // already present
            }
            if *v != new_last + 1 {
                pf_warn!(self.id; "skipping non-contiguous shared version {} (at {})",
                                  v, new_last);
                continue;
            }
            txn.put(key_of(*v), bytes.clone());
            if new_first == 0 {
                new_first = *v;
            }
            new_last = *v;
        }

        if new_last == self.last_committed
            && new_first == self.first_committed
        {
            return Ok(()); // nothing new in the bundle
        }
        txn.put_u64(KEY_FIRST_COMMITTED, new_first);
        txn.put_u64(KEY_LAST_COMMITTED, new_last);
        self.commit_store(txn).await?;

        pf_debug!(self.id; "applied shared state: lc {} -> {}, fc {} -> {}",
                           self.last_committed, new_last,
                           self.first_committed, new_first);
        self.first_committed = new_first;
        self.last_committed = new_last;
        if snap_applied > self.latest_stashed {
            self.latest_stashed = snap_applied;
        }

        self.wake_waiting_for_commit(self.last_committed);
        Ok(())
    }
}

// PaxosReplica stash & trim service interface
impl PaxosReplica {
    /// Stashes a consolidated snapshot of the state at version `v`. Keeping
    /// the latest full copy at a fixed key lets peers lagging beyond the
    /// retained log range catch up after trims.
    pub async fn stash_latest(
        &mut self,
        v: Version,
        bytes: Vec<u8>,
    ) -> Result<(), MonaxosError> {
        if v > self.last_committed {
            return logged_err!(self.id; "stash version {} beyond last_committed {}",
                                        v, self.last_committed);
        }
        let mut txn = Transaction::new();
        txn.put(KEY_LATEST, encode_stash(v, &bytes)?);
        self.commit_store(txn).await?;
        self.latest_stashed = v;
        pf_debug!(self.id; "stashed latest at v {}", v);
        Ok(())
    }

    /// Gets the latest stashed snapshot, if any.
    pub fn get_stashed(
        &self,
    ) -> Result<Option<(Version, Vec<u8>)>, MonaxosError> {
        match self.store.get(KEY_LATEST) {
            None => Ok(None),
            Some(raw) => Ok(Some(decode_stash(raw)?)),
        }
    }

    /// Gets the latest stashed snapshot's version (0 if none).
    pub fn get_stashed_version(&self) -> Version {
        self.latest_stashed
    }

    /// Erases log entries strictly below `first`. Trimming past
    /// `last_committed` is rejected unless `force`d with a stashed snapshot
    /// at or above `first`; without `force`, trimming stops at the stashed
    /// version so the stash keeps a log anchor.
    pub async fn trim_to(
        &mut self,
        first: Version,
        force: bool,
    ) -> Result<(), MonaxosError> {
        if first > self.last_committed
            && !(force && self.latest_stashed >= first)
        {
            return logged_err!(self.id; "trim_to {} beyond last_committed {}",
                                        first, self.last_committed);
        }
        pf_debug!(self.id; "trimming to {} (from {}, force {})",
                           first, self.first_committed, force);

        let mut txn = Transaction::new();
        let mut new_first = self.first_committed;
        while new_first < first {
            if !force
                && self.latest_stashed != 0
                && new_first == self.latest_stashed
            {
                break;
            }
            txn.erase(key_of(new_first));
            new_first += 1;
        }
        if new_first == self.first_committed {
            return Ok(());
        }
        txn.put_u64(KEY_FIRST_COMMITTED, new_first);
        self.commit_store(txn).await?;
        self.first_committed = new_first;
        Ok(())
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Builds a standalone replica (no peer connections) with a seeded log.
    async fn seeded_replica(
        port: u16,
        tag: &str,
        first: Version,
        last: Version,
    ) -> Result<PaxosReplica, MonaxosError> {
        let path = format!("/tmp/test-recovery-{}.wal", tag);
        let _ = tokio::fs::remove_file(&path).await;
        let (tx_elect, _rx_elect) = mpsc::unbounded_channel();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
        let config = format!("backer_path = '{}'", path);
        let mut replica =
            PaxosReplica::new_and_setup(0, 3, addr, tx_elect, Some(&config))
                .await?;

        if last > 0 {
            let mut txn = Transaction::new();
            for v in first..=last {
                txn.put(key_of(v), format!("value@{}", v).into_bytes());
            }
            txn.put_u64(KEY_FIRST_COMMITTED, first);
            txn.put_u64(KEY_LAST_COMMITTED, last);
            replica.store.commit(txn).await?;
            replica.first_committed = first;
            replica.last_committed = last;
        }
        Ok(replica)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn share_state_incremental() -> Result<(), MonaxosError> {
        let leader = seeded_replica(54860, "share-inc", 1, 6).await?;
        let shared = leader.share_state(4)?;
        assert!(shared.snapshot.is_none());
        assert_eq!(
            shared.entries,
            vec![
                (5, b"value@5".to_vec()),
                (6, b"value@6".to_vec()),
            ]
        );
        // peer already at parity gets an empty bundle
        assert!(leader.share_state(6)?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn share_state_with_snapshot() -> Result<(), MonaxosError> {
        let mut leader = seeded_replica(54861, "share-snap", 50, 60).await?;
        leader.stash_latest(55, b"consolidated@55".to_vec()).await?;

        // peer at lc 10 predates the retained log; snapshot plus 56..=60
        let shared = leader.share_state(10)?;
        assert_eq!(
            shared.snapshot,
            Some((55, b"consolidated@55".to_vec()))
        );
        assert_eq!(shared.entries.len(), 5);
        assert_eq!(shared.entries[0].0, 56);
        assert_eq!(shared.entries[4].0, 60);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_state_snapshot_then_entries() -> Result<(), MonaxosError>
    {
        let mut leader = seeded_replica(54862, "apply-src", 50, 60).await?;
        leader.stash_latest(55, b"consolidated@55".to_vec()).await?;
        let shared = leader.share_state(10)?;

        let mut peer = seeded_replica(54863, "apply-dst", 1, 10).await?;
        peer.store_state(&shared).await?;
        assert_eq!(peer.last_committed, 60);
        assert_eq!(peer.first_committed, 55);
        assert_eq!(peer.latest_stashed, 55);
        assert_eq!(
            peer.get_stashed()?,
            Some((55, b"consolidated@55".to_vec()))
        );
        assert_eq!(
            peer.store.get(&key_of(58)),
            Some(&b"value@58".to_vec())
        );
        assert!(!peer.store.contains(&key_of(54)));

        // applying the same bundle twice is a no-op
        let (fc, lc) = (peer.first_committed, peer.last_committed);
        peer.store_state(&shared).await?;
        assert_eq!((peer.first_committed, peer.last_committed), (fc, lc));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_state_fresh_replica() -> Result<(), MonaxosError> {
        let leader = seeded_replica(54864, "fresh-src", 1, 3).await?;
        let shared = leader.share_state(0)?;

        let mut peer = seeded_replica(54865, "fresh-dst", 0, 0).await?;
        peer.store_state(&shared).await?;
        assert_eq!(peer.first_committed, 1);
        assert_eq!(peer.last_committed, 3);
        assert_eq!(
            peer.store.get(&key_of(1)),
            Some(&b"value@1".to_vec())
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trim_boundaries() -> Result<(), MonaxosError> {
        let mut replica = seeded_replica(54866, "trim", 1, 5).await?;

        // plain trim below a version
        replica.trim_to(3, false).await?;
        assert_eq!(replica.first_committed, 3);
        assert!(!replica.store.contains(&key_of(1)));
        assert!(!replica.store.contains(&key_of(2)));
        assert!(replica.store.contains(&key_of(3)));

        // trimming beyond last_committed is rejected
        assert!(replica.trim_to(10, false).await.is_err());
        assert!(replica.trim_to(10, true).await.is_err());

        // an unforced trim stops at the stashed version
        replica.stash_latest(4, b"snap@4".to_vec()).await?;
        replica.trim_to(5, false).await?;
        assert_eq!(replica.first_committed, 4);
        assert!(replica.store.contains(&key_of(4)));

        // a forced trim does not
        replica.trim_to(5, true).await?;
        assert_eq!(replica.first_committed, 5);
        assert!(!replica.store.contains(&key_of(4)));
        assert!(replica.store.contains(&key_of(5)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stash_bounds() -> Result<(), MonaxosError> {
        let mut replica = seeded_replica(54867, "stash", 1, 5).await?;
        assert_eq!(replica.get_stashed_version(), 0);
        assert!(replica
            .stash_latest(6, b"too-new".to_vec())
            .await
            .is_err());
        replica.stash_latest(5, b"ok".to_vec()).await?;
        assert_eq!(replica.get_stashed_version(), 5);
        assert_eq!(replica.get_stashed()?, Some((5, b"ok".to_vec())));
        Ok(())
    }
}
