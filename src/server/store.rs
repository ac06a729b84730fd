//! Durable key-value store module implementation.
//!
//! The store is a string-key -> bytes map with atomic multi-key
//! transactions. Durability comes from a write-ahead log file owned by a
//! background writer task: a transaction is acknowledged only after its
//! record has been appended (and optionally fdatasync'ed), and only then is
//! it applied to the in-memory map. Reads are plain map lookups on the
//! caller's task.

use std::collections::HashMap;
use std::path::Path;

use crate::server::ReplicaId;
use crate::utils::MonaxosError;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A single operation within a transaction.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum TxnOp {
    /// Set key to value.
    Put { key: String, value: Vec<u8> },

    /// Remove key if present.
    Erase { key: String },
}

/// An atomic batch of store operations. All operations in a transaction
/// become durable and visible together or not at all.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Transaction { ops: Vec::new() }
    }

    /// Queues a put of raw bytes.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(TxnOp::Put {
            key: key.into(),
            value,
        });
    }

    /// Queues a put of a u64 encoded as little-endian fixed-width bytes.
    pub fn put_u64(&mut self, key: impl Into<String>, value: u64) {
        self.put(key, value.to_le_bytes().to_vec());
    }

    /// Queues an erase.
    pub fn erase(&mut self, key: impl Into<String>) {
        self.ops.push(TxnOp::Erase { key: key.into() });
    }

    /// True if no operations queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations queued.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Durable key-value store module.
pub(crate) struct StoreHub {
    /// My replica ID.
    me: ReplicaId,

    /// Current visible state; updated only after durability acks.
    map: HashMap<String, Vec<u8>>,

    /// Sender side of the transaction channel.
    tx_txn: mpsc::UnboundedSender<Transaction>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<Result<(), String>>,

    /// Join handle of the WAL writer task.
    _writer_handle: JoinHandle<()>,
}

// StoreHub public API implementation
impl StoreHub {
    /// Creates a new durable store hub. Replays the write-ahead log at
    /// `path` (creating it if absent) to reconstruct the map, then spawns
    /// the WAL writer task. A torn record at the tail of the log (crash
    /// mid-append) is discarded.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        path: &Path,
        sync_writes: bool,
    ) -> Result<Self, MonaxosError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!(me; "created backer file '{}'", path.display());
        } else {
            pf_info!(me; "backer file '{}' already exists", path.display());
        }
        let mut backer_file =
            OpenOptions::new().read(true).write(true).open(path).await?;

        let (map, valid_len) = Self::replay_wal(me, &mut backer_file).await?;
        backer_file.set_len(valid_len).await?;
        backer_file.seek(SeekFrom::End(0)).await?;

        let (tx_txn, rx_txn) = mpsc::unbounded_channel::<Transaction>();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(Self::writer_task(
            me,
            backer_file,
            sync_writes,
            rx_txn,
            tx_ack,
        ));

        Ok(StoreHub {
            me,
            map,
            tx_txn,
            rx_ack,
            _writer_handle: writer_handle,
        })
    }

    /// Gets the value bytes at key, if present.
    #[inline]
    pub(crate) fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.map.get(key)
    }

    /// Gets the value at key decoded as a little-endian u64.
    pub(crate) fn get_u64(
        &self,
        key: &str,
    ) -> Result<Option<u64>, MonaxosError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(
                    |_| {
                        MonaxosError(format!(
                            "key '{}' holds {} bytes, not a u64",
                            key,
                            bytes.len()
                        ))
                    },
                )?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
        }
    }

    /// True if key is present.
    #[inline]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Commits a transaction: appends it durably to the WAL, then applies
    /// it to the visible map. Returns only after the transaction is
    /// durable, so any message or callback issued after a successful
    /// `commit()` can rely on the written state surviving a crash.
    pub(crate) async fn commit(
        &mut self,
        txn: Transaction,
    ) -> Result<(), MonaxosError> {
        if txn.is_empty() {
            return Ok(());
        }

        self.tx_txn
            .send(txn.clone())
            .map_err(MonaxosError::msg)?;
        match self.rx_ack.recv().await {
            Some(Ok(())) => {
                for op in txn.ops {
                    match op {
                        TxnOp::Put { key, value } => {
                            self.map.insert(key, value);
                        }
                        TxnOp::Erase { key } => {
                            self.map.remove(&key);
                        }
                    }
                }
                Ok(())
            }
            Some(Err(e)) => logged_err!(self.me; "WAL append failed: {}", e),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }
}

// StoreHub writer task & recovery implementation
impl StoreHub {
    /// Reads the whole WAL and folds it into a map. Returns the map and the
    /// length of the valid prefix of the file; anything beyond it is a torn
    /// or corrupt tail record to be truncated away.
    async fn replay_wal(
        me: ReplicaId,
        backer: &mut File,
    ) -> Result<(HashMap<String, Vec<u8>>, u64), MonaxosError> {
        let mut raw = Vec::new();
        backer.seek(SeekFrom::Start(0)).await?;
        backer.read_to_end(&mut raw).await?;

        let mut map = HashMap::new();
        let mut pos: usize = 0;
        let mut txn_cnt: usize = 0;
        while pos + 8 <= raw.len() {
            let rec_len =
                u64::from_le_bytes(raw[pos..pos + 8].try_into().unwrap())
                    as usize;
            let rec_end = pos + 8 + rec_len;
            if rec_end > raw.len() {
                pf_warn!(me; "torn WAL record at offset {}, discarding tail",
                             pos);
                break;
            }
            let txn: Transaction =
                match decode_from_slice(&raw[pos + 8..rec_end]) {
                    Ok(txn) => txn,
                    Err(e) => {
                        pf_warn!(me; "corrupt WAL record at offset {}: {}",
                                     pos, e);
                        break;
                    }
                };
            for op in txn.ops {
                match op {
                    TxnOp::Put { key, value } => {
                        map.insert(key, value);
                    }
                    TxnOp::Erase { key } => {
                        map.remove(&key);
                    }
                }
            }
            txn_cnt += 1;
            pos = rec_end;
        }
        if pos + 8 > raw.len() && pos < raw.len() {
            pf_warn!(me; "torn WAL length header at offset {}, discarding",
                         pos);
        }

        pf_debug!(me; "replayed {} transactions, {} keys live",
                      txn_cnt, map.len());
        Ok((map, pos as u64))
    }

    /// WAL writer task function.
    async fn writer_task(
        me: ReplicaId,
        mut backer_file: File,
        sync_writes: bool,
        mut rx_txn: mpsc::UnboundedReceiver<Transaction>,
        tx_ack: mpsc::UnboundedSender<Result<(), String>>,
    ) {
        pf_debug!(me; "WAL writer task spawned");

        while let Some(txn) = rx_txn.recv().await {
            let res = Self::append_record(
                &mut backer_file,
                sync_writes,
                &txn,
            )
            .await
            .map_err(|e| e.to_string());
            if let Err(e) = tx_ack.send(res) {
                pf_error!(me; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "WAL writer task exited");
    }

    /// Appends one length-prefixed transaction record.
    async fn append_record(
        backer: &mut File,
        sync_writes: bool,
        txn: &Transaction,
    ) -> Result<(), MonaxosError> {
        let rec_bytes = encode_to_vec(txn)?;
        backer
            .write_all(&(rec_bytes.len() as u64).to_le_bytes())
            .await?;
        backer.write_all(&rec_bytes).await?;
        if sync_writes {
            backer.sync_data().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    async fn fresh_hub(path: &str) -> Result<StoreHub, MonaxosError> {
        let path = Path::new(path);
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
        }
        StoreHub::new_and_setup(0, path, false).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn put_get_erase() -> Result<(), MonaxosError> {
        let mut hub = fresh_hub("/tmp/test-store-0.wal").await?;
        let mut txn = Transaction::new();
        txn.put("v/7", b"value seven".to_vec());
        txn.put_u64("last_committed", 7);
        hub.commit(txn).await?;
        assert_eq!(hub.get("v/7"), Some(&b"value seven".to_vec()));
        assert_eq!(hub.get_u64("last_committed")?, Some(7));
        assert!(!hub.contains("v/8"));

        let mut txn = Transaction::new();
        txn.erase("v/7");
        hub.commit(txn).await?;
        assert!(!hub.contains("v/7"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn atomic_batch_visible_together() -> Result<(), MonaxosError> {
        let mut hub = fresh_hub("/tmp/test-store-1.wal").await?;
        let mut txn = Transaction::new();
        txn.put("v/1", b"one".to_vec());
        txn.put("v/2", b"two".to_vec());
        txn.put_u64("last_committed", 2);
        txn.erase("nonexistent");
        assert_eq!(txn.len(), 4);
        hub.commit(txn).await?;
        assert_eq!(hub.get("v/1"), Some(&b"one".to_vec()));
        assert_eq!(hub.get("v/2"), Some(&b"two".to_vec()));
        assert_eq!(hub.get_u64("last_committed")?, Some(2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_after_reopen() -> Result<(), MonaxosError> {
        let path = "/tmp/test-store-2.wal";
        {
            let mut hub = fresh_hub(path).await?;
            let mut txn = Transaction::new();
            txn.put_u64("accepted_pn", 101);
            txn.put("v/1", b"first".to_vec());
            hub.commit(txn).await?;
            let mut txn = Transaction::new();
            txn.put_u64("accepted_pn", 205);
            txn.erase("v/1");
            hub.commit(txn).await?;
        }
        let hub = StoreHub::new_and_setup(0, Path::new(path), false).await?;
        assert_eq!(hub.get_u64("accepted_pn")?, Some(205));
        assert!(!hub.contains("v/1"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn torn_tail_discarded() -> Result<(), MonaxosError> {
        let path = "/tmp/test-store-3.wal";
        {
            let mut hub = fresh_hub(path).await?;
            let mut txn = Transaction::new();
            txn.put_u64("last_pn", 301);
            hub.commit(txn).await?;
        }
        {
            // simulate a crash mid-append: a length header promising more
            // bytes than the file holds
            let mut file = OpenOptions::new()
                .append(true)
                .open(path)
                .await?;
            file.write_all(&1000u64.to_le_bytes()).await?;
            file.write_all(b"partial").await?;
            file.sync_data().await?;
        }
        let mut hub =
            StoreHub::new_and_setup(0, Path::new(path), false).await?;
        assert_eq!(hub.get_u64("last_pn")?, Some(301));

        // the hub should still be able to append cleanly after truncation
        let mut txn = Transaction::new();
        txn.put_u64("last_pn", 405);
        hub.commit(txn).await?;
        drop(hub);
        let hub = StoreHub::new_and_setup(0, Path::new(path), false).await?;
        assert_eq!(hub.get_u64("last_pn")?, Some(405));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_txn_is_noop() -> Result<(), MonaxosError> {
        let mut hub = fresh_hub("/tmp/test-store-4.wal").await?;
        assert!(Transaction::new().is_empty());
        hub.commit(Transaction::new()).await?;
        Ok(())
    }
}
