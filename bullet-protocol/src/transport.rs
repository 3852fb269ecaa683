//! TCP transport for Bullet nodes.
//!
//! The threading model:
//!
//! - **Listener thread**: accepts connections until the transport is shut down
//! - **Connection handler threads**: short-lived, one per accepted connection
//! - **Caller threads**: outbound sends run on whichever thread asks for them
//!
//! Every connection carries exactly one framed message. The handler decodes and
//! verifies it, applies it to the [`ClusterState`] under the state mutex,
//! answers with a single ACK or NACK byte and closes the connection. Replies the
//! protocol calls for (a promise for a prepare, an accepted for an accept) go
//! back on a fresh outbound connection after the ACK.
//!
//! The state mutex is never held across network I/O. A handler that sends a
//! reply while the requester is still waiting for its own ACK would otherwise
//! deadlock the two nodes against each other.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::{debug, info, warn};

use crate::codec::{self, Message, MessageKind};
use crate::config::NodeConfig;
use crate::error::{BulletError, TransportError};
use crate::state::{AcceptorId, ClusterState, Term};

pub const ACK: u8 = 0x00;
pub const NACK: u8 = 0x01;

/// How often the idle accept loop checks for a shutdown signal.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Promise notifications buffered for a waiting `request_leadership`.
const PROMISE_QUEUE_DEPTH: usize = 64;

/// A promise that arrived from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromiseNotice {
    pub from: AcceptorId,
    pub term: Term,
}

/// State shared between the caller and every handler thread.
struct Shared {
    node_id: AcceptorId,
    state: Mutex<ClusterState>,
    peers: BTreeMap<AcceptorId, String>,
    send_timeout: Duration,
    promise_tx: Sender<PromiseNotice>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_to(&self, peer: AcceptorId, message: &Message) -> Result<(), TransportError> {
        let bytes = codec::encode(message)?;
        self.send_bytes(peer, &bytes)
    }

    fn send_bytes(&self, peer: AcceptorId, bytes: &[u8]) -> Result<(), TransportError> {
        let addr = self.resolve(peer)?;
        let io_err = |source| TransportError::Io { peer, source };

        let mut stream = TcpStream::connect_timeout(&addr, self.send_timeout).map_err(io_err)?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(io_err)?;
        stream
            .set_read_timeout(Some(self.send_timeout))
            .map_err(io_err)?;
        codec::write_frame(&mut stream, bytes).map_err(io_err)?;

        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).map_err(io_err)?;
        if reply[0] == ACK {
            Ok(())
        } else {
            Err(TransportError::Rejected(peer))
        }
    }

    fn resolve(&self, peer: AcceptorId) -> Result<SocketAddr, TransportError> {
        let addr = self
            .peers
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        addr.to_socket_addrs()
            .map_err(|source| TransportError::Io { peer, source })?
            .next()
            .ok_or_else(|| TransportError::Unresolvable {
                peer,
                addr: addr.clone(),
            })
    }

    /// Applies a verified message and decides the ACK byte and any reply.
    fn apply(&self, message: Message) -> Disposition {
        let mut state = self.lock();
        // Accepts enter the audit log only once they are taken, so a refused
        // decree never shows up as a conflicting accept.
        if message.kind != MessageKind::Accept {
            state.observe(message.clone());
        }

        match message.kind {
            MessageKind::Prepare => {
                if !state.grant_promise(message.sender, message.term) {
                    debug!(from = message.sender, term = message.term, "refusing prepare");
                    return Disposition::nack();
                }
                state.promise(self.node_id, message.term);
                let log = state
                    .acceptor(self.node_id)
                    .map(|me| me.log.clone())
                    .unwrap_or_default();
                Disposition::ack_with(
                    message.sender,
                    Message::promise(self.node_id, message.term, log),
                )
            }
            MessageKind::Promise => {
                let counted = state.record_promise(message.sender, message.term);
                drop(state);
                if counted {
                    let notice = PromiseNotice {
                        from: message.sender,
                        term: message.term,
                    };
                    // A full queue means nobody is waiting; the promise is
                    // already recorded in the state.
                    let _ = self.promise_tx.try_send(notice);
                }
                Disposition::ack()
            }
            MessageKind::Accept => {
                if !state.accept_replica(self.node_id, &message) {
                    debug!(
                        from = message.sender,
                        term = message.term,
                        local_term = state.term(),
                        "refusing accept"
                    );
                    return Disposition::nack();
                }
                state.observe(message.clone());
                Disposition::ack_with(
                    message.sender,
                    Message::accepted(self.node_id, message.term, message.values),
                )
            }
            MessageKind::Accepted => Disposition::ack(),
        }
    }
}

/// What a handler does after applying a message.
struct Disposition {
    reply_byte: u8,
    follow_up: Option<(AcceptorId, Message)>,
}

impl Disposition {
    fn ack() -> Self {
        Self {
            reply_byte: ACK,
            follow_up: None,
        }
    }

    fn nack() -> Self {
        Self {
            reply_byte: NACK,
            follow_up: None,
        }
    }

    fn ack_with(to: AcceptorId, message: Message) -> Self {
        Self {
            reply_byte: ACK,
            follow_up: Some((to, message)),
        }
    }
}

/// How a round of sends to the quorum went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumReport {
    pub acks: usize,
    pub needed: usize,
    /// Peers that answered NACK, as opposed to ones that could not be reached.
    pub rejected: Vec<AcceptorId>,
}

impl QuorumReport {
    pub fn has_majority(&self) -> bool {
        self.acks >= self.needed
    }
}

/// A running Bullet node's network endpoint and the state it guards.
pub struct Transport {
    shared: Arc<Shared>,
    promise_rx: Receiver<PromiseNotice>,
    local_addr: SocketAddr,
    shutdown_tx: Sender<()>,
    listener: Option<JoinHandle<()>>,
}

impl Transport {
    /// Binds `config.listen` and starts accepting connections.
    ///
    /// Failing to bind is the one fatal error a node can hit.
    pub fn bind(config: NodeConfig) -> Result<Self, BulletError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen).map_err(|source| BulletError::Bind {
            addr: config.listen.clone(),
            source,
        })?;
        Self::start(listener, config)
    }

    /// Starts accepting connections on an already bound listener.
    pub fn start(listener: TcpListener, config: NodeConfig) -> Result<Self, BulletError> {
        config.validate()?;
        let state = ClusterState::new(config.cluster_size).ok_or_else(|| {
            BulletError::Config(format!("invalid cluster size {}", config.cluster_size))
        })?;
        let bind_err = |source| BulletError::Bind {
            addr: config.listen.clone(),
            source,
        };
        let local_addr = listener.local_addr().map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        let (promise_tx, promise_rx) = bounded(PROMISE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let shared = Arc::new(Shared {
            node_id: config.id,
            state: Mutex::new(state),
            peers: config.peers,
            send_timeout: config.send_timeout,
            promise_tx,
        });

        let accept_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("bullet-listener-{}", config.id))
            .spawn(move || run_accept_loop(listener, accept_shared, shutdown_rx))
            .map_err(bind_err)?;

        info!(node = config.id, %local_addr, "bullet node listening");
        Ok(Self {
            shared,
            promise_rx,
            local_addr,
            shutdown_tx,
            listener: Some(handle),
        })
    }

    pub fn node_id(&self) -> AcceptorId {
        self.shared.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.shared
            .peers
            .keys()
            .filter(|id| **id != self.shared.node_id)
            .count()
    }

    /// Runs `f` with exclusive access to the cluster state.
    ///
    /// Do not perform network I/O inside `f`.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.shared.lock())
    }

    /// Runs `f` against a consistent snapshot of the cluster state.
    pub fn view<R>(&self, f: impl FnOnce(&ClusterState) -> R) -> R {
        f(&self.shared.lock())
    }

    pub(crate) fn promises(&self) -> &Receiver<PromiseNotice> {
        &self.promise_rx
    }

    /// Sends one message to a peer and waits for its ACK.
    pub fn send_to(&self, peer: AcceptorId, message: &Message) -> Result<(), TransportError> {
        self.shared.send_to(peer, message)
    }

    /// Sends `message` to every quorum member in turn and reports who
    /// acknowledged it.
    ///
    /// This node counts as an acknowledgement when it is itself a quorum
    /// member. Only encoding errors fail the call; unreachable or refusing
    /// peers are logged and tallied.
    ///
    /// # Parameters
    /// - `message`: encoded once and sent unchanged to every member
    ///
    /// # Why report NACKs separately?
    ///
    /// A NACK to a prepare means the peer already gave that term away, while
    /// a dead peer says nothing about the term. Candidates only move to a
    /// higher term on the first.
    pub fn send_to_quorum(&self, message: &Message) -> Result<QuorumReport, TransportError> {
        let bytes = codec::encode(message)?;
        let quorum: Vec<AcceptorId> = self.view(|state| state.quorum().iter().copied().collect());
        let mut report = QuorumReport {
            acks: 0,
            needed: quorum.len() / 2 + 1,
            rejected: Vec::new(),
        };

        for peer in quorum {
            if peer == self.shared.node_id {
                report.acks += 1;
                continue;
            }
            match self.shared.send_bytes(peer, &bytes) {
                Ok(()) => report.acks += 1,
                Err(TransportError::Rejected(peer)) => {
                    debug!(peer, kind = ?message.kind, term = message.term, "quorum member refused");
                    report.rejected.push(peer);
                }
                Err(err) => warn!(peer, error = %err, kind = ?message.kind, "quorum send failed"),
            }
        }
        Ok(report)
    }

    /// Like [`send_to_quorum`](Self::send_to_quorum), but fails unless a
    /// strict majority of the quorum acknowledged. Returns the ACK count.
    pub fn broadcast_to_quorum(&self, message: &Message) -> Result<usize, TransportError> {
        let report = self.send_to_quorum(message)?;
        if report.has_majority() {
            Ok(report.acks)
        } else {
            Err(TransportError::NoMajority {
                acks: report.acks,
                needed: report.needed,
            })
        }
    }

    /// Stops the accept loop and waits for the listener thread to exit.
    ///
    /// Handler threads already running finish their single message on their own.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.listener.take() {
            let _ = self.shutdown_tx.try_send(());
            if handle.join().is_err() {
                warn!(node = self.shared.node_id, "listener thread panicked");
            }
            info!(node = self.shared.node_id, "bullet node stopped");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown_rx: Receiver<()>) {
    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }

        match listener.accept() {
            Ok((stream, peer)) => spawn_handler(stream, peer, &shared),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match shutdown_rx.recv_timeout(ACCEPT_POLL_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn spawn_handler(stream: TcpStream, peer: SocketAddr, shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("bullet-conn-{peer}"))
        .spawn(move || {
            if let Err(err) = handle_connection(stream, &shared) {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    if let Err(err) = spawned {
        warn!(%peer, error = %err, "failed to spawn connection handler");
    }
}

/// Reads one frame, applies it, answers ACK or NACK, then sends any reply.
fn handle_connection(mut stream: TcpStream, shared: &Shared) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(shared.send_timeout))?;
    stream.set_write_timeout(Some(shared.send_timeout))?;

    let frame = match codec::read_frame(&mut stream) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "dropping unreadable frame");
            // The peer may already be gone; the read error is what matters.
            let _ = stream.write_all(&[NACK]).and_then(|()| stream.flush());
            return Err(err);
        }
    };
    let disposition = match codec::decode(&frame) {
        Ok(message) if message.verify() => shared.apply(message),
        Ok(message) => {
            warn!(
                from = message.sender,
                kind = ?message.kind,
                tag = %message.tag(),
                "dropping message with bad integrity tag"
            );
            Disposition::nack()
        }
        Err(err) => {
            warn!(error = %err, "dropping malformed message");
            Disposition::nack()
        }
    };

    stream.write_all(&[disposition.reply_byte])?;
    stream.flush()?;
    drop(stream);

    if let Some((to, reply)) = disposition.follow_up {
        if let Err(err) = shared.send_to(to, &reply) {
            warn!(to, kind = ?reply.kind, error = %err, "reply not delivered");
        }
    }
    Ok(())
}
