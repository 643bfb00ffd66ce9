/*! The link manager: owns every open connection, routes control messages
and datagrams by router identity, and establishes connections on demand.

Messages submitted while a connection is still being established park in a
per-peer FIFO queue and are drained in submission order once the link opens.
*/

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc as futures_mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;

use veil_packet::contact::{AddressPolicy, RouterContact, RC_LIFETIME};
use veil_packet::gossip::{serialize_body, FetchRcs, GossipRc, RcBundle, RidBundle, BootstrapFetch};
use veil_packet::gossip::{FETCH_BOOTSTRAP_ENDPOINT, FETCH_RCS_ENDPOINT, FETCH_RIDS_ENDPOINT, GOSSIP_RC_ENDPOINT};
use veil_packet::link::{ControlRequest, Packet, PingRequest, PongResponse};
use veil_packet::onion::OnionFrame;
use veil_packet::RouterId;
use veil_binary_io::FromBytes;

use crate::error::{CloseHook, ConnectHook, ControlHook, ControlResult, ErrorKind};
use crate::link::codec::{Codec, DecodeError};
use crate::link::connection::{Connection, CONNECTION_CHANNEL_SIZE};
use crate::link::errors::{HandlerError, SendError};
use crate::link::handshake::{make_client_handshake, make_server_handshake, PeerRole};
use crate::link::secure::Channel;
use crate::node_db::NodeDb;
use crate::stats::Stats;
use crate::time::*;
use crate::utils::DecayingSet;
use crate::LocalIdentity;

/// How long a dial may take before it fails with a timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a control reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence interval after which a relay link gets pinged.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Silence interval after which a link is considered dead.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle interval after which a client-originated link is torn down.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often `tick` should run.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long the set of recently seen client ids keeps entries.
const RECENT_CLIENTS_TIMEOUT: Duration = Duration::from_secs(1200);

/// Packet handed to the owner's dispatch loop.
#[derive(Debug)]
pub enum IncomingPacket {
    /// Control request to dispatch by endpoint name.
    Request(ControlRequest),
    /// Onion datagram to route through the path context.
    Datagram(OnionFrame),
}

type RespondFn = Box<dyn FnOnce(Result<Vec<u8>, String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One-shot reply capability of a control request. Clones share the same
/// slot; the first respond wins and the rest are no-ops.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<StdMutex<Option<RespondFn>>>,
}

impl Responder {
    /// Wrap a raw respond function.
    pub fn new(f: RespondFn) -> Responder {
        Responder {
            inner: Arc::new(StdMutex::new(Some(f))),
        }
    }

    /// Respond on the stream of the originating request.
    pub fn from_connection(conn: &Connection, request_id: u64) -> Responder {
        let conn = conn.clone();
        Responder::new(Box::new(move |result| {
            Box::pin(async move {
                let res = match result {
                    Ok(body) => conn.send_response(request_id, body).await,
                    Err(message) => conn.send_error_response(request_id, message).await,
                };
                if res.is_err() {
                    trace!("Connection closed before a response could be sent");
                }
            })
        }))
    }

    /// Send a successful response body.
    pub async fn respond(&self, body: Vec<u8>) {
        let f = self.inner.lock().expect("responder poisoned").take();
        if let Some(f) = f {
            f(Ok(body)).await;
        }
    }

    /// Send a taxonomised error string.
    pub async fn respond_error(&self, message: String) {
        let f = self.inner.lock().expect("responder poisoned").take();
        if let Some(f) = f {
            f(Err(message)).await;
        }
    }
}

/// Handler of one named control endpoint. Returning an error sends an error
/// response on the same stream unless the handler already responded.
pub type CommandHandler =
    Arc<dyn Fn(RouterId, Vec<u8>, Responder) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Sink for inbound onion datagrams.
pub type DatagramHandler = Arc<dyn Fn(RouterId, OnionFrame) -> BoxFuture<'static, ()> + Send + Sync>;

/// Typed completion of a contact fetch.
pub type FetchRcsHook = Box<dyn FnOnce(Result<Vec<RouterContact>, ErrorKind>) + Send + Sync + 'static>;

/// Typed completion of a router-id fetch.
pub type FetchRidsHook = Box<dyn FnOnce(Result<Vec<RouterId>, ErrorKind>) + Send + Sync + 'static>;

enum PendingMessage {
    Control {
        endpoint: String,
        body: Vec<u8>,
        hook: Option<ControlHook>,
        timeout: Duration,
    },
    Data(OnionFrame),
}

#[derive(Default)]
struct PendingConn {
    on_open: Vec<ConnectHook>,
    on_close: Vec<CloseHook>,
}

/// Owns the set of open links and routes messages by router identity.
#[derive(Clone)]
pub struct LinkManager {
    local: Arc<LocalIdentity>,
    local_rc: Arc<RwLock<RouterContact>>,
    role: PeerRole,
    node_db: NodeDb,
    stats: Stats,
    service_conns: Arc<RwLock<HashMap<RouterId, Connection>>>,
    client_conns: Arc<RwLock<HashMap<RouterId, Connection>>>,
    pending_conns: Arc<RwLock<HashMap<RouterId, PendingConn>>>,
    pending_msgs: Arc<RwLock<HashMap<RouterId, VecDeque<PendingMessage>>>>,
    persisting: Arc<RwLock<HashMap<RouterId, Instant>>>,
    rids_pending_verification: Arc<RwLock<HashMap<RouterId, RouterContact>>>,
    recent_clients: Arc<RwLock<DecayingSet<RouterId>>>,
    gossiped: Arc<RwLock<DecayingSet<(RouterId, u64)>>>,
    handlers: Arc<RwLock<HashMap<String, CommandHandler>>>,
    datagram_handler: Arc<RwLock<Option<DatagramHandler>>>,
    incoming_tx: futures_mpsc::UnboundedSender<(Connection, IncomingPacket)>,
    address_policy: Arc<StdMutex<AddressPolicy>>,
}

impl LinkManager {
    /// Create new `LinkManager`. The returned receiver yields every control
    /// request and datagram that needs dispatch; feed it to
    /// [`LinkManager::handle_incoming`].
    pub fn new(
        local: Arc<LocalIdentity>,
        local_rc: RouterContact,
        role: PeerRole,
        node_db: NodeDb,
    ) -> (LinkManager, futures_mpsc::UnboundedReceiver<(Connection, IncomingPacket)>) {
        let (incoming_tx, incoming_rx) = futures_mpsc::unbounded();
        let manager = LinkManager {
            local,
            local_rc: Arc::new(RwLock::new(local_rc)),
            role,
            node_db,
            stats: Stats::new(),
            service_conns: Arc::new(RwLock::new(HashMap::new())),
            client_conns: Arc::new(RwLock::new(HashMap::new())),
            pending_conns: Arc::new(RwLock::new(HashMap::new())),
            pending_msgs: Arc::new(RwLock::new(HashMap::new())),
            persisting: Arc::new(RwLock::new(HashMap::new())),
            rids_pending_verification: Arc::new(RwLock::new(HashMap::new())),
            recent_clients: Arc::new(RwLock::new(DecayingSet::new(RECENT_CLIENTS_TIMEOUT))),
            gossiped: Arc::new(RwLock::new(DecayingSet::new(RC_LIFETIME))),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            datagram_handler: Arc::new(RwLock::new(None)),
            incoming_tx,
            address_policy: Arc::new(StdMutex::new(AddressPolicy::RejectBogons)),
        };
        (manager, incoming_rx)
    }

    /// Change the address screening applied to relay peers. Relays reject
    /// non-routable contacts by default.
    pub fn set_address_policy(&self, policy: AddressPolicy) {
        *self.address_policy.lock().expect("address policy poisoned") = policy;
    }

    /// Current address screening for relay peers.
    pub fn address_policy(&self) -> AddressPolicy {
        *self.address_policy.lock().expect("address policy poisoned")
    }

    /// Identity of this node.
    pub fn local_rid(&self) -> RouterId {
        self.local.rid()
    }

    /// Our current signed contact.
    pub async fn local_rc(&self) -> RouterContact {
        self.local_rc.read().await.clone()
    }

    /// Shared packet counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Register a handler for a named control endpoint.
    pub async fn register_handler(&self, endpoint: &str, handler: CommandHandler) {
        self.handlers.write().await.insert(endpoint.to_owned(), handler);
    }

    /// Install the sink for inbound onion datagrams.
    pub async fn set_datagram_handler(&self, handler: DatagramHandler) {
        *self.datagram_handler.write().await = Some(handler);
    }

    /// Dispatch a request body to the handler registered under `endpoint`.
    /// Handler failures turn into error responses unless the handler already
    /// responded.
    pub async fn dispatch_named(&self, endpoint: &str, from: RouterId, body: Vec<u8>, responder: Responder) {
        let handler = self.handlers.read().await.get(endpoint).cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = (*handler)(from, body, responder.clone()).await {
                    debug!("Handler {} failed: {}", endpoint, e);
                    responder.respond_error(e.to_string()).await;
                }
            }
            None => {
                debug!("Request for unknown endpoint {}", endpoint);
                responder
                    .respond_error(HandlerError::UnknownEndpoint.to_string())
                    .await;
            }
        }
    }

    /// Dispatch one incoming packet. Run this from a single loop so control
    /// requests of one peer are handled in arrival order.
    pub async fn handle_incoming(&self, conn: Connection, packet: IncomingPacket) {
        match packet {
            IncomingPacket::Request(request) => {
                let responder = Responder::from_connection(&conn, request.request_id);
                self.dispatch_named(&request.endpoint, conn.rid, request.body, responder).await;
            }
            IncomingPacket::Datagram(frame) => {
                let handler = self.datagram_handler.read().await.clone();
                match handler {
                    Some(handler) => (*handler)(conn.rid, frame).await,
                    None => {
                        self.stats.counter_dropped();
                        trace!("Datagram dropped: no handler installed");
                    }
                }
            }
        }
    }

    /// Deliver a control request to `remote`, establishing a connection
    /// first if none is open. The hook fires with the response, a timeout,
    /// or the reason the request could not be delivered.
    pub async fn send_control(
        &self,
        remote: RouterId,
        endpoint: &str,
        body: Vec<u8>,
        hook: Option<ControlHook>,
    ) -> Result<(), SendError> {
        self.send_control_with_timeout(remote, endpoint, body, hook, REPLY_TIMEOUT).await
    }

    /// [`LinkManager::send_control`] with an explicit reply deadline.
    pub async fn send_control_with_timeout(
        &self,
        remote: RouterId,
        endpoint: &str,
        body: Vec<u8>,
        hook: Option<ControlHook>,
        timeout: Duration,
    ) -> Result<(), SendError> {
        if remote == self.local.rid() {
            return Err(SendError::SelfSend);
        }

        if let Some(conn) = self.get_conn(&remote).await {
            // on a dead connection send_request has already completed the
            // hook with a link-closed marker
            conn.send_request(endpoint, body, hook, timeout).await.ok();
            return Ok(());
        }

        self.pending_msgs
            .write()
            .await
            .entry(remote)
            .or_insert_with(VecDeque::new)
            .push_back(PendingMessage::Control {
                endpoint: endpoint.to_owned(),
                body,
                hook,
                timeout,
            });
        self.ensure_connection(remote).await;
        Ok(())
    }

    /// Best-effort datagram send. Returns `Ok(false)` when the frame was
    /// dropped on a full queue.
    pub async fn send_data(&self, remote: RouterId, frame: OnionFrame) -> Result<bool, SendError> {
        if remote == self.local.rid() {
            return Err(SendError::SelfSend);
        }

        if let Some(conn) = self.get_conn(&remote).await {
            return match conn.try_send_packet(Packet::Datagram(frame)) {
                Ok(()) => Ok(true),
                Err(_) => {
                    self.stats.counter_dropped();
                    Ok(false)
                }
            };
        }

        self.pending_msgs
            .write()
            .await
            .entry(remote)
            .or_insert_with(VecDeque::new)
            .push_back(PendingMessage::Data(frame));
        self.ensure_connection(remote).await;
        Ok(true)
    }

    /// Dial a router by id, resolving its contact through the node DB.
    pub async fn connect_to_rid(&self, rid: RouterId, on_open: Option<ConnectHook>, on_close: Option<CloseHook>) {
        match self.node_db.get_rc(&rid).await {
            Some(rc) => self.connect_to(rc, on_open, on_close).await,
            None => {
                if let Some(on_close) = on_close {
                    on_close(Some(ErrorKind::RouterNotFound));
                }
            }
        }
    }

    /// Dial the router a contact describes. Idempotent: a second call while
    /// an attempt is in flight attaches the callbacks to that attempt.
    pub async fn connect_to(&self, rc: RouterContact, on_open: Option<ConnectHook>, on_close: Option<CloseHook>) {
        let rid = rc.rid;
        if rid == self.local.rid() {
            if let Some(on_close) = on_close {
                on_close(Some(ErrorKind::InvalidRouter));
            }
            return;
        }

        if self.get_conn(&rid).await.is_some() {
            if let Some(on_open) = on_open {
                on_open();
            }
            return;
        }

        {
            let mut pending = self.pending_conns.write().await;
            if let Some(entry) = pending.get_mut(&rid) {
                entry.on_open.extend(on_open);
                entry.on_close.extend(on_close);
                return;
            }
            let mut entry = PendingConn::default();
            entry.on_open.extend(on_open);
            entry.on_close.extend(on_close);
            pending.insert(rid, entry);
        }
        self.rids_pending_verification.write().await.insert(rid, rc.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.dial(rc).await;
        });
    }

    async fn dial(&self, rc: RouterContact) {
        let rid = rc.rid;
        debug!("Establishing connection to {:?} at {}", rid, rc.addr);

        // the handshake is pinned against the contact recorded when the dial
        // was requested
        let expected = self
            .rids_pending_verification
            .read()
            .await
            .get(&rid)
            .cloned()
            .unwrap_or_else(|| rc.clone());

        let result = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let socket = TcpStream::connect(expected.addr)
                .await
                .map_err(|_| ErrorKind::NoLink)?;
            let local_rc = self.local_rc().await;
            make_client_handshake(socket, &local_rc, &self.local.enc_sk, self.role, &expected)
                .await
                .map_err(|e| {
                    warn!("Handshake with {:?} failed: {}", rid, e);
                    e.kind()
                })
        })
        .await
        .unwrap_or(Err(ErrorKind::Timeout));

        self.rids_pending_verification.write().await.remove(&rid);

        match result {
            Ok((socket, channel, peer_rc)) => {
                let entry = self.pending_conns.write().await.remove(&rid).unwrap_or_default();
                let conn = self.spawn_connection(socket, channel, &peer_rc, PeerRole::Relay, false, entry.on_close);
                self.service_conns.write().await.insert(rid, conn.clone());
                self.node_db.put_rc(peer_rc).await;
                for on_open in entry.on_open {
                    on_open();
                }
                self.drain_pending_msgs(&conn).await;
            }
            Err(kind) => {
                let entry = self.pending_conns.write().await.remove(&rid).unwrap_or_default();
                for on_close in entry.on_close {
                    on_close(Some(kind));
                }
                self.fail_pending_msgs(&rid, kind).await;
            }
        }
    }

    /// Accept loop for inbound links. Runs until the listener dies.
    pub async fn listen(&self, listener: TcpListener) {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            trace!("Inbound connection from {}", addr);

            let manager = self.clone();
            tokio::spawn(async move {
                let local_rc = manager.local_rc().await;
                let policy = manager.address_policy();
                match make_server_handshake(socket, &local_rc, &manager.local.enc_sk, policy).await {
                    Ok((socket, channel, peer_rc, role)) => {
                        manager.accept_connection(socket, channel, peer_rc, role).await;
                    }
                    Err(e) => {
                        manager.stats.counter_dropped();
                        debug!("Inbound handshake from {} rejected: {}", addr, e);
                    }
                }
            });
        }
    }

    async fn accept_connection(&self, socket: TcpStream, channel: Channel, peer_rc: RouterContact, role: PeerRole) {
        let rid = peer_rc.rid;
        let conn = self.spawn_connection(socket, channel, &peer_rc, role, true, Vec::new());

        match role {
            PeerRole::Relay => {
                self.node_db.put_rc(peer_rc).await;
                self.service_conns.write().await.insert(rid, conn.clone());
            }
            PeerRole::Client => {
                self.recent_clients.write().await.insert(rid);
                self.client_conns.write().await.insert(rid, conn.clone());
            }
        }
        self.drain_pending_msgs(&conn).await;
    }

    fn spawn_connection(
        &self,
        socket: TcpStream,
        channel: Channel,
        peer_rc: &RouterContact,
        role: PeerRole,
        inbound: bool,
        close_hooks: Vec<CloseHook>,
    ) -> Connection {
        let (tx, mut rx) = mpsc::channel(CONNECTION_CHANNEL_SIZE);
        let conn = Connection::new(peer_rc.rid, peer_rc.addr, role, inbound, tx);

        let framed = Framed::new(socket, Codec::new(channel, self.stats.clone()));
        let (mut sink, mut stream) = framed.split();

        let manager = self.clone();
        let pump_conn = conn.clone();
        tokio::spawn(async move {
            let conn = pump_conn;
            let writer = async {
                while let Some(packet) = rx.recv().await {
                    sink.send(packet).await.map_err(|_| ErrorKind::NoLink)?;
                }
                Ok(())
            };
            let reader = async {
                while let Some(packet) = stream.next().await {
                    let packet = packet.map_err(|e| match e {
                        DecodeError::Decrypt | DecodeError::Deserialize | DecodeError::FrameTooBig { .. } => {
                            manager.stats.counter_dropped();
                            ErrorKind::Malformed
                        }
                        DecodeError::Io(_) => ErrorKind::NoLink,
                    })?;
                    conn.mark_activity().await;
                    match packet {
                        Packet::PingRequest(ping) => {
                            conn.try_send_packet(Packet::PongResponse(PongResponse { ping_id: ping.ping_id })).ok();
                        }
                        Packet::PongResponse(_) => {}
                        Packet::ControlResponse(response) => conn.handle_response(response).await,
                        Packet::ControlRequest(request) => {
                            manager
                                .incoming_tx
                                .clone()
                                .send((conn.clone(), IncomingPacket::Request(request)))
                                .await
                                .map_err(|_| ErrorKind::NoLink)?;
                        }
                        Packet::Datagram(frame) => {
                            manager
                                .incoming_tx
                                .clone()
                                .send((conn.clone(), IncomingPacket::Datagram(frame)))
                                .await
                                .map_err(|_| ErrorKind::NoLink)?;
                        }
                    }
                }
                Err(ErrorKind::NoLink)
            };

            let shutdown = conn.closed_signal();
            let result: Result<(), ErrorKind> = futures::select! {
                res = reader.fuse() => res,
                res = writer.fuse() => res,
                _ = shutdown.fuse() => Ok(()),
            };
            let reason = result.err();
            debug!("Connection to {:?} closed ({:?})", conn.rid, reason);
            manager.remove_connection(&conn).await;
            conn.cancel_pending().await;
            for on_close in close_hooks {
                on_close(reason);
            }
        });

        conn
    }

    async fn remove_connection(&self, conn: &Connection) {
        match conn.role {
            PeerRole::Relay => self.service_conns.write().await.remove(&conn.rid),
            PeerRole::Client => self.client_conns.write().await.remove(&conn.rid),
        };
    }

    async fn drain_pending_msgs(&self, conn: &Connection) {
        let queued = self.pending_msgs.write().await.remove(&conn.rid);
        if let Some(queued) = queued {
            for msg in queued {
                match msg {
                    PendingMessage::Control { endpoint, body, hook, timeout } => {
                        conn.send_request(&endpoint, body, hook, timeout).await.ok();
                    }
                    PendingMessage::Data(frame) => {
                        conn.send_packet(Packet::Datagram(frame)).await.ok();
                    }
                }
            }
        }
    }

    async fn fail_pending_msgs(&self, rid: &RouterId, kind: ErrorKind) {
        let queued = self.pending_msgs.write().await.remove(rid);
        if let Some(queued) = queued {
            for msg in queued {
                if let PendingMessage::Control { hook: Some(hook), .. } = msg {
                    hook(ControlResult::Failed(kind));
                }
            }
        }
    }

    async fn ensure_connection(&self, rid: RouterId) {
        if self.get_conn(&rid).await.is_some() || self.pending_conns.read().await.contains_key(&rid) {
            return;
        }
        match self.node_db.get_rc(&rid).await {
            Some(rc) => self.connect_to(rc, None, None).await,
            None => {
                debug!("No contact for {:?}; failing queued messages", rid);
                self.fail_pending_msgs(&rid, ErrorKind::RouterNotFound).await;
            }
        }
    }

    async fn get_conn(&self, rid: &RouterId) -> Option<Connection> {
        if let Some(conn) = self.service_conns.read().await.get(rid) {
            return Some(conn.clone());
        }
        self.client_conns.read().await.get(rid).cloned()
    }

    /// Tear down any live or pending connection to `rid`.
    pub async fn close(&self, rid: RouterId) {
        let service = self.service_conns.write().await.remove(&rid);
        let client = self.client_conns.write().await.remove(&rid);
        for conn in service.into_iter().chain(client) {
            conn.cancel_pending().await;
            conn.initiate_close();
        }

        let entry = self.pending_conns.write().await.remove(&rid);
        if let Some(entry) = entry {
            for on_close in entry.on_close {
                on_close(None);
            }
        }
        self.fail_pending_msgs(&rid, ErrorKind::NoLink).await;
    }

    /// Forward a fresh contact to every connected relay peer except the one
    /// we got it from. Re-gossip of the same contact version is suppressed.
    pub async fn gossip_rc(&self, last_sender: RouterId, rc: RouterContact) {
        if !self.gossiped.write().await.insert((rc.rid, rc.timestamp)) {
            return;
        }

        let body = match serialize_body(&GossipRc {
            sender: self.local.rid(),
            rc: rc.clone(),
        }) {
            Ok(body) => body,
            Err(_) => return,
        };

        let peers: Vec<RouterId> = self.service_conns.read().await.keys().cloned().collect();
        for peer in peers {
            if peer == last_sender || peer == rc.rid {
                continue;
            }
            self.send_control(peer, GOSSIP_RC_ENDPOINT, body.clone(), None).await.ok();
        }
    }

    /// Fetch contacts of `explicit_ids` newer than `since` from `via`.
    pub async fn fetch_rcs(&self, via: RouterId, since: u64, explicit_ids: Vec<RouterId>, hook: FetchRcsHook) {
        let body = match serialize_body(&FetchRcs { since, explicit_ids }) {
            Ok(body) => body,
            Err(_) => return hook(Err(ErrorKind::Malformed)),
        };
        let wrapped: ControlHook = Box::new(move |result| {
            hook(result.into_response().and_then(|body| match RcBundle::from_bytes(&body) {
                Ok((_, bundle)) => Ok(bundle.rcs),
                Err(_) => Err(ErrorKind::Malformed),
            }))
        });
        self.send_control(via, FETCH_RCS_ENDPOINT, body, Some(wrapped)).await.ok();
    }

    /// Fetch the ids of every router `via` knows.
    pub async fn fetch_router_ids(&self, via: RouterId, hook: FetchRidsHook) {
        let wrapped: ControlHook = Box::new(move |result| {
            hook(result.into_response().and_then(|body| match RidBundle::from_bytes(&body) {
                Ok((_, bundle)) => Ok(bundle.rids),
                Err(_) => Err(ErrorKind::Malformed),
            }))
        });
        self.send_control(via, FETCH_RIDS_ENDPOINT, Vec::new(), Some(wrapped)).await.ok();
    }

    /// Fetch up to `quantity` contacts from a bootstrap seed, introducing
    /// our own contact when we are a relay.
    pub async fn fetch_bootstrap_rcs(&self, seed: RouterContact, quantity: u16, hook: FetchRcsHook) {
        let local = if self.role == PeerRole::Relay {
            Some(self.local_rc().await)
        } else {
            None
        };
        let body = match serialize_body(&BootstrapFetch { local, quantity }) {
            Ok(body) => body,
            Err(_) => return hook(Err(ErrorKind::Malformed)),
        };
        let rid = seed.rid;
        self.node_db.put_rc(seed).await;
        let wrapped: ControlHook = Box::new(move |result| {
            hook(result.into_response().and_then(|body| match RcBundle::from_bytes(&body) {
                Ok((_, bundle)) => Ok(bundle.rcs),
                Err(_) => Err(ErrorKind::Malformed),
            }))
        });
        self.send_control(rid, FETCH_BOOTSTRAP_ENDPOINT, body, Some(wrapped)).await.ok();
    }

    /// Dial up to `n` random routers from the node DB, restricted to peers
    /// recently seen in a client role when `clients_only` is set. Does not
    /// filter against current peers; duplicate dials resolve idempotently.
    pub async fn connect_to_random(&self, n: usize, clients_only: bool) {
        let local_rid = self.local.rid();
        let recent_clients = self.recent_clients.read().await.clone();
        let rcs = self
            .node_db
            .random_rcs(n, |rc| {
                rc.rid != local_rid && (!clients_only || recent_clients.contains(&rc.rid))
            })
            .await;
        for rc in rcs {
            self.connect_to(rc, None, None).await;
        }
    }

    /// Keep a connection open until `until` even when idle.
    pub async fn set_conn_persist(&self, rid: RouterId, until: Instant) {
        self.persisting.write().await.insert(rid, until);
    }

    /// Visit a snapshot of every open connection.
    pub async fn for_each_connection<F: FnMut(&Connection)>(&self, mut f: F) {
        for conn in self.service_conns.read().await.values() {
            f(conn);
        }
        for conn in self.client_conns.read().await.values() {
            f(conn);
        }
    }

    /// Numbers of inbound and outbound connections.
    pub async fn num_in_out(&self) -> (usize, usize) {
        let mut inbound = 0;
        let mut outbound = 0;
        self.for_each_connection(|conn| {
            if conn.inbound {
                inbound += 1;
            } else {
                outbound += 1;
            }
        })
        .await;
        (inbound, outbound)
    }

    /// Number of connected peers, optionally counting only clients.
    pub async fn num_connected(&self, clients_only: bool) -> usize {
        let clients = self.client_conns.read().await.len();
        if clients_only {
            clients
        } else {
            clients + self.service_conns.read().await.len()
        }
    }

    /// Check for an open connection to a relay or client peer.
    pub async fn have_conn(&self, rid: &RouterId) -> bool {
        self.get_conn(rid).await.is_some()
    }

    /// Check for an open connection to a client peer.
    pub async fn have_client_conn(&self, rid: &RouterId) -> bool {
        self.client_conns.read().await.contains_key(rid)
    }

    /// Whether `rid` was recently seen as a client peer.
    pub async fn is_recent_client(&self, rid: &RouterId) -> bool {
        self.recent_clients.read().await.contains(rid)
    }

    /// Periodic maintenance: reply timeouts, keep-alives, dead and idle
    /// link cleanup, decay of the gossip and client sets.
    pub async fn tick(&self) {
        let mut conns = Vec::new();
        self.for_each_connection(|conn| conns.push(conn.clone())).await;

        let persisting = self.persisting.read().await.clone();
        let now = clock_now();

        for conn in conns {
            conn.sweep_timed_out().await;

            let idle = conn.idle_time().await;
            if idle >= LINK_TIMEOUT {
                debug!("Link to {:?} dead after {:?} silence", conn.rid, idle);
                self.close(conn.rid).await;
                continue;
            }
            let persisted = persisting.get(&conn.rid).map_or(false, |until| *until > now);
            if conn.role == PeerRole::Client && idle >= CLIENT_IDLE_TIMEOUT && !persisted {
                debug!("Closing idle client link to {:?}", conn.rid);
                self.close(conn.rid).await;
                continue;
            }
            if conn.role == PeerRole::Relay && idle >= KEEP_ALIVE_INTERVAL {
                conn.try_send_packet(Packet::PingRequest(PingRequest {
                    ping_id: crate::utils::gen_request_id(),
                }))
                .ok();
            }
        }

        self.persisting.write().await.retain(|_, until| *until > now);
        self.recent_clients.write().await.decay();
        self.gossiped.write().await.decay();
    }

    /// Run periodic maintenance until the manager is dropped.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}
