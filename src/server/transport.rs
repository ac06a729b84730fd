//! Internal TCP transport module implementation.
//!
//! NOTE: In concept, all messages are sent through unstable communication
//! channels, and are retried if the sender did not receive an ACK in a timely
//! manner. Here, we use TCP as the communication protocol to get the same
//! effect of "every message a sender wants to send will be retried until
//! eventually delivered"; messages from any single peer arrive in the order
//! sent, which the consensus core relies on.

use std::fmt;
use std::net::SocketAddr;

use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, Bitmap, MonaxosError,
};

use bincode::{Decode, Encode};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Internal TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of replicas in the quorum.
    population: u8,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ReplicaId, Msg)>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends: flashmap::ReadHandle<ReplicaId, mpsc::UnboundedSender<Msg>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ReplicaId, SocketAddr)>,

    /// Receiver side of the connack channel, used when proactively connecting
    /// to some peer.
    rx_connack: mpsc::UnboundedReceiver<ReplicaId>,

    /// Map from peer ID -> peer messenger task join handles, shared with
    /// the peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<ReplicaId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Encode
        + Decode<()>
        + Send
        + Sync
        + 'static,
{
    /// Creates a new internal TCP transport hub. Spawns the peer acceptor
    /// task. Creates a recv channel for listening on peers' messages.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
    ) -> Result<Self, MonaxosError> {
        if population <= me {
            return logged_err!(me; "invalid population {}", population);
        }

        let (tx_recv, rx_recv) =
            mpsc::unbounded_channel::<(ReplicaId, Msg)>();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<ReplicaId, mpsc::UnboundedSender<Msg>>();

        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<ReplicaId, JoinHandle<()>>();

        // the connect & connack channels are used to notify the peer
        // acceptor task to proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = AcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            population,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer replica proactively, and spawns the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), MonaxosError> {
        self.tx_connect
            .send((id, peer_addr))
            .map_err(MonaxosError::msg)?;
        match self.rx_connack.recv().await {
            Some(ack_id) => {
                if ack_id != id {
                    logged_err!(self.me; "peer ID mismatch: expected {}, got {}",
                                         id, ack_id)
                } else {
                    Ok(())
                }
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Waits for at least enough number of peers to have been connected to
    /// me to form a group of specified size.
    pub(crate) async fn wait_for_group(
        &self,
        group: u8,
    ) -> Result<(), MonaxosError> {
        if group == 0 {
            logged_err!(self.me; "invalid group size {}", group)
        } else {
            while self.current_peers()?.count() + 1 < group {
                time::sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        }
    }

    /// Gets a bitmap where currently connected peers are set true.
    pub(crate) fn current_peers(&self) -> Result<Bitmap, MonaxosError> {
        let tx_sends_guard = self.tx_sends.guard();
        let mut peers = Bitmap::new(self.population, false);
        for &id in tx_sends_guard.keys() {
            if let Err(e) = peers.set(id, true) {
                return logged_err!(self.me; "error setting peer {}: {}", id, e);
            }
        }
        Ok(peers)
    }

    /// Sends a message to a specified peer by sending to the send channel.
    /// Sending to a peer that is not (yet) connected is a silent no-op;
    /// the protocol's timeouts own liveness.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: ReplicaId,
    ) -> Result<(), MonaxosError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            if tx_send.send(msg).is_err() {
                pf_debug!(self.me; "dropping message to disconnected peer {}",
                                   peer);
            }
        }
        Ok(())
    }

    /// Broadcasts a message to specified peers by sending to the send
    /// channels. If `target` is `None`, broadcasts to all current peers.
    pub(crate) fn bcast_msg(
        &mut self,
        msg: Msg,
        target: Option<Bitmap>,
    ) -> Result<(), MonaxosError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            if let Some(ref target) = target {
                if peer >= target.size() || !target.get(peer)? {
                    continue;
                }
            }

            // not skipped
            if tx_sends_guard.get(&peer).unwrap().send(msg.clone()).is_err()
            {
                pf_debug!(self.me; "dropping message to disconnected peer {}",
                                   peer);
            }
        }
        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of peer ID and the message received.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ReplicaId, Msg), MonaxosError> {
        match self.rx_recv.recv().await {
            Some((peer, msg)) => Ok((peer, msg)),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }
}

/// TransportHub peer acceptor task.
struct AcceptorTask<Msg> {
    me: ReplicaId,
    tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
    peer_listener: TcpListener,
    tx_sends: flashmap::WriteHandle<ReplicaId, mpsc::UnboundedSender<Msg>>,
    peer_messenger_handles: flashmap::WriteHandle<ReplicaId, JoinHandle<()>>,
    rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<ReplicaId>,
}

impl<Msg> AcceptorTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Encode
        + Decode<()>
        + Send
        + Sync
        + 'static,
{
    fn new(
        me: ReplicaId,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            ReplicaId,
            mpsc::UnboundedSender<Msg>,
        >,
        peer_messenger_handles: flashmap::WriteHandle<
            ReplicaId,
            JoinHandle<()>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        AcceptorTask {
            me,
            tx_recv,
            peer_listener,
            tx_sends,
            peer_messenger_handles,
            rx_connect,
            tx_connack,
        }
    }

    /// Registers an established peer connection by spawning its messenger
    /// task and publishing its send channel.
    fn register_peer(&mut self, id: ReplicaId, stream: TcpStream) {
        let (tx_send, rx_send) = mpsc::unbounded_channel::<Msg>();
        let (read_half, write_half) = stream.into_split();
        let me = self.me;
        let tx_recv = self.tx_recv.clone();
        let handle = tokio::spawn(Self::messenger_task(
            me, id, read_half, write_half, rx_send, tx_recv,
        ));

        self.tx_sends.guard().insert(id, tx_send);
        self.peer_messenger_handles.guard().insert(id, handle);
        pf_debug!(self.me; "peer {} connected", id);
    }

    /// Handles an incoming connection: the connecting side sends its ID
    /// first as the identity handshake.
    async fn handle_accepted(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), MonaxosError> {
        let id = stream.read_u8().await?;
        self.register_peer(id, stream);
        Ok(())
    }

    /// Proactively connects to a peer at the given address, sending my own
    /// ID as the identity handshake.
    async fn handle_connect(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), MonaxosError> {
        let mut stream = tcp_connect_with_retry(peer_addr, 10).await?;
        stream.write_u8(self.me).await?;
        self.register_peer(id, stream);
        self.tx_connack.send(id).map_err(MonaxosError::msg)?;
        Ok(())
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer acceptor task spawned");

        loop {
            tokio::select! {
                // accepting a new peer connection
                accepted = self.peer_listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.handle_accepted(stream).await {
                                pf_error!(self.me; "error accepting peer: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_error!(self.me; "error accepting connection: {}", e);
                        }
                    }
                },

                // proactively connecting to a peer
                to_connect = self.rx_connect.recv() => {
                    match to_connect {
                        Some((id, peer_addr)) => {
                            if let Err(e) = self.handle_connect(id, peer_addr).await {
                                pf_error!(self.me; "error connecting to peer {}: {}",
                                                   id, e);
                            }
                        }
                        None => break, // hub has been dropped
                    }
                },
            }
        }

        pf_debug!(self.me; "peer acceptor task exited");
    }

    /// Per-peer messenger task function. Moves outbound messages from the
    /// send channel onto the socket and inbound frames onto the shared recv
    /// channel; FIFO per peer follows from TCP ordering plus the per-peer
    /// channel.
    async fn messenger_task(
        me: ReplicaId,
        peer: ReplicaId,
        mut conn_read: OwnedReadHalf,
        conn_write: OwnedWriteHalf,
        mut rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
    ) {
        pf_debug!(me; "messenger task for peer {} spawned", peer);

        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf_cursor: usize = 0;

        loop {
            tokio::select! {
                // outgoing message to peer
                msg = rx_send.recv() => {
                    let Some(msg) = msg else {
                        break; // hub has been dropped
                    };
                    match safe_tcp_write(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        Some(&msg),
                    ) {
                        Ok(true) => {}
                        Ok(false) => {
                            // socket full; wait for writability and retry
                            // until this message is fully on the wire
                            let mut sent = false;
                            while !sent {
                                if let Err(e) =
                                    conn_write.as_ref().writable().await
                                {
                                    pf_error!(me; "error waiting writable -> {}: {}",
                                                  peer, e);
                                    return;
                                }
                                match safe_tcp_write::<Msg, _>(
                                    &mut write_buf,
                                    &mut write_buf_cursor,
                                    &conn_write,
                                    None,
                                ) {
                                    Ok(done) => sent = done,
                                    Err(e) => {
                                        pf_error!(me; "error retrying send -> {}: {}",
                                                      peer, e);
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            pf_error!(me; "error sending -> {}: {}", peer, e);
                            return;
                        }
                    }
                },

                // incoming message from peer
                msg = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            if tx_recv.send((peer, msg)).is_err() {
                                break; // hub has been dropped
                            }
                        }
                        Err(_) => {
                            pf_debug!(me; "connection from peer {} closed", peer);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!(me; "messenger task for peer {} exited", peer);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(
        Debug,
        PartialEq,
        Eq,
        Clone,
        Serialize,
        Deserialize,
        Encode,
        Decode,
    )]
    struct TestMsg(String, u64);

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn hub_send_recv() -> Result<(), MonaxosError> {
        let addr0: SocketAddr = "127.0.0.1:54800".parse()?;
        let addr1: SocketAddr = "127.0.0.1:54801".parse()?;
        let mut hub0: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 2, addr0).await?;
        let mut hub1: TransportHub<TestMsg> =
            TransportHub::new_and_setup(1, 2, addr1).await?;

        hub1.connect_to_peer(0, addr0).await?;
        hub0.wait_for_group(2).await?;
        hub1.wait_for_group(2).await?;

        hub0.send_msg(TestMsg("hello".into(), 7), 1)?;
        assert_eq!(hub1.recv_msg().await?, (0, TestMsg("hello".into(), 7)));

        hub1.send_msg(TestMsg("world".into(), 8), 0)?;
        assert_eq!(hub0.recv_msg().await?, (1, TestMsg("world".into(), 8)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn hub_bcast_fifo() -> Result<(), MonaxosError> {
        let addr0: SocketAddr = "127.0.0.1:54810".parse()?;
        let addr1: SocketAddr = "127.0.0.1:54811".parse()?;
        let addr2: SocketAddr = "127.0.0.1:54812".parse()?;
        let mut hub0: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 3, addr0).await?;
        let mut hub1: TransportHub<TestMsg> =
            TransportHub::new_and_setup(1, 3, addr1).await?;
        let mut hub2: TransportHub<TestMsg> =
            TransportHub::new_and_setup(2, 3, addr2).await?;

        hub1.connect_to_peer(0, addr0).await?;
        hub2.connect_to_peer(0, addr0).await?;
        hub2.connect_to_peer(1, addr1).await?;
        hub0.wait_for_group(3).await?;
        hub1.wait_for_group(3).await?;
        hub2.wait_for_group(3).await?;

        // unconnected-peer send is a silent no-op
        hub0.send_msg(TestMsg("ghost".into(), 0), 5)?;

        for i in 0..5 {
            hub0.bcast_msg(TestMsg("seq".into(), i), None)?;
        }
        for i in 0..5 {
            assert_eq!(hub1.recv_msg().await?, (0, TestMsg("seq".into(), i)));
            assert_eq!(hub2.recv_msg().await?, (0, TestMsg("seq".into(), i)));
        }

        // targeted broadcast
        hub0.bcast_msg(
            TestMsg("only2".into(), 9),
            Some(Bitmap::from(3, vec![2])),
        )?;
        assert_eq!(hub2.recv_msg().await?, (0, TestMsg("only2".into(), 9)));
        Ok(())
    }
}
