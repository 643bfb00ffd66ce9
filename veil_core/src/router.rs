/*! The router: wires the link manager, the node DB and the path registry
together, registers every command handler, and routes inbound onion frames.

A relay accepts links and transit traffic; a client only originates paths.
Both run the same dispatch: control requests resolve through one named
handler table (whether they arrive directly on a link or inside a peeled
path frame at the pivot), datagrams resolve through the path registry.
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use log::{debug, trace, warn};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use veil_binary_io::FromBytes;
use veil_crypto::dh_server;
use veil_packet::contact::{unix_now, AddressPolicy, RouterContact};
use veil_packet::dht::{
    FindIntro, FindName, IntroResponse, NameResponse, PublishIntro, FIND_INTRO_ENDPOINT, FIND_NAME_ENDPOINT,
    PUBLISH_INTRO_ENDPOINT,
};
use veil_packet::exit::{
    ExitFlowRequest, ExitStatus, ObtainExit, CLOSE_EXIT_ENDPOINT, OBTAIN_EXIT_ENDPOINT, UPDATE_EXIT_ENDPOINT,
};
use veil_packet::gossip::{
    serialize_body, BootstrapFetch, FetchRcs, GossipRc, RcBundle, RidBundle, FETCH_BOOTSTRAP_ENDPOINT,
    FETCH_RCS_ENDPOINT, FETCH_RIDS_ENDPOINT, GOSSIP_RC_ENDPOINT, MAX_FETCH_RCS, MAX_FETCH_RIDS,
};
use veil_packet::onion::{
    BuildRecord, BuildReply, BuildRequestFrame, BuildStatus, InnerMessage, LatencyProbe, OnionFrame, PathTransfer,
    PATH_BUILD_ENDPOINT, PATH_CONTROL_ENDPOINT, PATH_LATENCY_ENDPOINT, PATH_TRANSFER_ENDPOINT,
};
use veil_packet::{RouterId, SessionTag};

use crate::error::{ControlHook, ControlResult, ErrorKind};
use crate::link::errors::HandlerError;
use crate::link::manager::{IncomingPacket, LinkManager, Responder};
use crate::link::{Connection, PeerRole};
use crate::node_db::NodeDb;
use crate::path::{BuildHook, Path, PathContext, PathError, TransitHop, BUILD_TIMEOUT, DEFAULT_LIFETIME};
use crate::time::clock_now;
use crate::LocalIdentity;

/// How often the path registry is driven.
const PATH_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// In-process service endpoint: datagrams land on a channel the embedding
/// application reads.
#[derive(Clone)]
pub struct EmbeddedEndpoint {
    incoming: futures_mpsc::UnboundedSender<(RouterId, Vec<u8>)>,
}

impl EmbeddedEndpoint {
    /// Create the endpoint and the receiving half of its delivery channel.
    pub fn new() -> (EmbeddedEndpoint, futures_mpsc::UnboundedReceiver<(RouterId, Vec<u8>)>) {
        let (incoming, rx) = futures_mpsc::unbounded();
        (EmbeddedEndpoint { incoming }, rx)
    }
}

/// Exit endpoint: tracks granted flows and swallows their traffic on behalf
/// of the host network stack.
#[derive(Clone, Default)]
pub struct ExitEndpoint {
    flows: Arc<RwLock<HashMap<SessionTag, RouterId>>>,
}

impl ExitEndpoint {
    pub async fn grant(&self, tx_id: SessionTag, owner: RouterId) {
        self.flows.write().await.insert(tx_id, owner);
    }

    pub async fn owner_of(&self, tx_id: &SessionTag) -> Option<RouterId> {
        self.flows.read().await.get(tx_id).copied()
    }

    pub async fn close(&self, tx_id: &SessionTag) -> bool {
        self.flows.write().await.remove(tx_id).is_some()
    }

    pub async fn flow_count(&self) -> usize {
        self.flows.read().await.len()
    }
}

/// Local delivery targets for traffic that terminates at this router.
pub enum Endpoint {
    /// In-process service endpoint.
    Embedded(EmbeddedEndpoint),
    /// Exit endpoint handing traffic to the network stack.
    Exit(ExitEndpoint),
}

impl Endpoint {
    /// Deliver a datagram that terminated here.
    pub fn accept_data_message(&self, sender: RouterId, body: Vec<u8>) {
        match self {
            Endpoint::Embedded(endpoint) => {
                endpoint.incoming.unbounded_send((sender, body)).ok();
            }
            Endpoint::Exit(_) => {
                // traffic accounting only; the host stack owns delivery
                trace!("Exit endpoint swallowed {:?} datagram", sender);
            }
        }
    }

    /// Note a freshly established path terminating at this endpoint.
    pub fn on_path_built(&self, path: &Path) {
        debug!("{} endpoint serving path to {:?}", self.describe(), path.pivot_rid());
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Endpoint::Embedded(_) => "embedded",
            Endpoint::Exit(_) => "exit",
        }
    }
}

/// One node of the overlay: client or relay.
#[derive(Clone)]
pub struct Router {
    local: Arc<LocalIdentity>,
    rc: RouterContact,
    role: PeerRole,
    node_db: NodeDb,
    link_manager: LinkManager,
    path_context: PathContext,
    endpoint: Arc<RwLock<Option<Endpoint>>>,
    exit: ExitEndpoint,
    names: Arc<RwLock<HashMap<String, RouterId>>>,
    intros: Arc<RwLock<HashMap<[u8; 32], Vec<u8>>>>,
    incoming_rx: Arc<StdMutex<Option<futures_mpsc::UnboundedReceiver<(Connection, IncomingPacket)>>>>,
}

impl Router {
    fn new(local: LocalIdentity, rc: RouterContact, role: PeerRole) -> Router {
        let local = Arc::new(local);
        let node_db = NodeDb::new();
        let (link_manager, incoming_rx) = LinkManager::new(local.clone(), rc.clone(), role, node_db.clone());
        let path_context = PathContext::new(local.rid());

        Router {
            local,
            rc,
            role,
            node_db,
            link_manager,
            path_context,
            endpoint: Arc::new(RwLock::new(None)),
            exit: ExitEndpoint::default(),
            names: Arc::new(RwLock::new(HashMap::new())),
            intros: Arc::new(RwLock::new(HashMap::new())),
            incoming_rx: Arc::new(StdMutex::new(Some(incoming_rx))),
        }
    }

    /// Create a relay advertising `public_addr`. Transit is enabled.
    pub fn relay(local: LocalIdentity, public_addr: std::net::SocketAddr) -> Router {
        let rc = local.make_rc(public_addr, unix_now());
        let router = Router::new(local, rc, PeerRole::Relay);
        router.path_context.allow_transit();
        router
    }

    /// Create a client. Its contact is never published and transit stays
    /// refused.
    pub fn client(local: LocalIdentity) -> Router {
        let rc = local.make_rc("127.0.0.1:0".parse().unwrap(), unix_now());
        Router::new(local, rc, PeerRole::Client)
    }

    pub fn rid(&self) -> RouterId {
        self.local.rid()
    }

    /// Our signed contact.
    pub fn rc(&self) -> &RouterContact {
        &self.rc
    }

    pub fn node_db(&self) -> &NodeDb {
        &self.node_db
    }

    pub fn link_manager(&self) -> &LinkManager {
        &self.link_manager
    }

    pub fn path_context(&self) -> &PathContext {
        &self.path_context
    }

    pub fn exit_endpoint(&self) -> &ExitEndpoint {
        &self.exit
    }

    /// Install the local delivery target for terminating traffic.
    pub async fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.write().await = Some(endpoint);
    }

    /// Register handlers and spawn the dispatch, maintenance and accept
    /// loops. `listener` carries inbound links and is required for relays.
    pub async fn start(&self, listener: Option<TcpListener>) {
        self.register_handlers().await;

        let router = self.clone();
        self.link_manager
            .set_datagram_handler(Arc::new(move |from, frame| {
                let router = router.clone();
                Box::pin(async move { router.handle_datagram(from, frame).await })
            }))
            .await;

        let mut incoming_rx = self
            .incoming_rx
            .lock()
            .expect("incoming receiver poisoned")
            .take()
            .expect("router started twice");
        let manager = self.link_manager.clone();
        tokio::spawn(async move {
            while let Some((conn, packet)) = incoming_rx.next().await {
                manager.handle_incoming(conn, packet).await;
            }
        });

        let manager = self.link_manager.clone();
        tokio::spawn(async move { manager.run().await });

        let context = self.path_context.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PATH_TICK_INTERVAL);
            loop {
                interval.tick().await;
                context.tick().await;
            }
        });

        if let Some(listener) = listener {
            let manager = self.link_manager.clone();
            tokio::spawn(async move { manager.listen(listener).await });
        }
    }

    /// Build a path over `rcs`, first hop first. The hook fires once the
    /// build succeeds or fails; a stale hop contact fails it before any
    /// frame is sent.
    pub async fn build_path(&self, rcs: Vec<RouterContact>, on_built: Option<BuildHook>) -> Result<Path, PathError> {
        let (path, outer) = Path::prepare(rcs, DEFAULT_LIFETIME, self.link_manager.clone())?;
        match path.start_build(outer, self.path_context.clone(), on_built).await {
            Ok(()) | Err(PathError::NotReady) => Ok(path),
            Err(e) => Err(e),
        }
    }

    /// Build a fresh path over the same relays as `path`, with new ids and
    /// keys at every hop.
    pub async fn rebuild_path(&self, path: &Path, on_built: Option<BuildHook>) -> Result<Path, PathError> {
        let (rebuilt, outer) = path.rebuild()?;
        match rebuilt.start_build(outer, self.path_context.clone(), on_built).await {
            Ok(()) | Err(PathError::NotReady) => Ok(rebuilt),
            Err(e) => Err(e),
        }
    }

    /// Verify a batch of contacts off the dispatch loop and store the valid
    /// ones. Returns how many were stored.
    pub async fn ingest_rcs(&self, rcs: Vec<RouterContact>, policy: AddressPolicy) -> usize {
        let verified = tokio::task::spawn_blocking(move || {
            let now = unix_now();
            rcs.into_iter()
                .filter(|rc| RouterContact::parse(&rc.serialize(), now, policy).is_ok())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        let mut stored = 0;
        for rc in verified {
            if self.node_db.put_rc(rc).await {
                stored += 1;
            }
        }
        stored
    }

    async fn register_handlers(&self) {
        macro_rules! handler {
            ($router:expr, $name:expr, $method:ident) => {{
                let captured = $router.clone();
                $router
                    .link_manager
                    .register_handler(
                        $name,
                        Arc::new(move |from, body, responder| {
                            let router = captured.clone();
                            Box::pin(async move { router.$method(from, body, responder).await })
                        }),
                    )
                    .await;
            }};
        }

        handler!(self, PATH_BUILD_ENDPOINT, handle_path_build);
        handler!(self, PATH_CONTROL_ENDPOINT, handle_path_control);
        handler!(self, PATH_LATENCY_ENDPOINT, handle_path_latency);
        handler!(self, PATH_TRANSFER_ENDPOINT, handle_path_transfer);
        handler!(self, GOSSIP_RC_ENDPOINT, handle_gossip_rc);
        handler!(self, FETCH_RCS_ENDPOINT, handle_fetch_rcs);
        handler!(self, FETCH_RIDS_ENDPOINT, handle_fetch_rids);
        handler!(self, FETCH_BOOTSTRAP_ENDPOINT, handle_fetch_bootstrap);
        handler!(self, FIND_NAME_ENDPOINT, handle_find_name);
        handler!(self, FIND_INTRO_ENDPOINT, handle_find_intro);
        handler!(self, PUBLISH_INTRO_ENDPOINT, handle_publish_intro);
        handler!(self, OBTAIN_EXIT_ENDPOINT, handle_obtain_exit);
        handler!(self, UPDATE_EXIT_ENDPOINT, handle_update_exit);
        handler!(self, CLOSE_EXIT_ENDPOINT, handle_close_exit);
    }

    /// Pass an onward reply back to the requester, forwarding error strings
    /// untouched.
    fn chain_to_responder(responder: Responder) -> ControlHook {
        Box::new(move |result| {
            tokio::spawn(async move {
                match result {
                    ControlResult::Response(body) => responder.respond(body).await,
                    ControlResult::Error(body) => {
                        responder
                            .respond_error(String::from_utf8_lossy(&body).into_owned())
                            .await
                    }
                    ControlResult::TimedOut => responder.respond_error("timeout".to_owned()).await,
                    _ => responder.respond_error("no link".to_owned()).await,
                }
            });
        })
    }

    async fn respond_build_status(&self, responder: Responder, status: BuildStatus) -> Result<(), HandlerError> {
        responder.respond(BuildReply { status }.serialize()).await;
        Ok(())
    }

    async fn handle_path_build(&self, from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, frame) = BuildRequestFrame::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        if !self.path_context.is_transit_allowed() {
            return self.respond_build_status(responder, BuildStatus::TransitNotAllowed).await;
        }

        let record: BuildRecord = match frame.get_record(&self.local.enc_sk) {
            Ok(record) => record,
            Err(_) => {
                debug!("Build record from {:?} failed to open", from);
                return self.respond_build_status(responder, BuildStatus::Rejected).await;
            }
        };

        let shared = dh_server(&self.local.enc_sk, &frame.ephemeral_pk, &frame.nonce);
        let nonce_xor = shared.derive_nonce_xor();
        let lifetime = Duration::from_secs(record.lifetime).min(DEFAULT_LIFETIME);
        let hop = TransitHop {
            rx: frame.rx,
            tx: record.tx,
            shared,
            nonce_xor,
            downstream: from,
            upstream: record.upstream,
            expires_at: clock_now() + lifetime,
        };
        let terminal = hop.is_terminal();

        if self.path_context.put_transit(hop).is_err() {
            debug!("Build from {:?} reuses a known hop id", from);
            return self.respond_build_status(responder, BuildStatus::Rejected).await;
        }

        if terminal {
            return self.respond_build_status(responder, BuildStatus::Ok).await;
        }

        // forward the next layer and relay whatever verdict comes back
        self.link_manager
            .send_control_with_timeout(
                record.upstream,
                PATH_BUILD_ENDPOINT,
                record.inner,
                Some(Router::chain_to_responder(responder)),
                BUILD_TIMEOUT,
            )
            .await
            .map_err(|_| HandlerError::Refused("unroutable next hop".to_owned()))?;
        Ok(())
    }

    async fn handle_path_control(&self, from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, frame) = OnionFrame::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        let hop = match self.path_context.get_transit(frame.hop_id) {
            Some(hop) => hop,
            None => return Err(HandlerError::Refused("unknown hop".to_owned())),
        };
        if hop.is_expired(clock_now()) {
            return Err(HandlerError::Refused("expired hop".to_owned()));
        }

        let peeled = hop.peel_forward(&frame);

        if hop.is_terminal() {
            let (_, inner) = InnerMessage::from_bytes(&peeled.payload).map_err(|_| HandlerError::Malformed)?;
            match inner {
                InnerMessage::Control { endpoint, body } => {
                    let reply_hop = hop.clone();
                    let outer = responder;
                    // wrap successful replies in our layer; each hop back to
                    // the originator adds its own
                    let inner_responder = Responder::new(Box::new(move |result| {
                        Box::pin(async move {
                            match result {
                                Ok(body) => {
                                    let reply = reply_hop.wrap_reply(body);
                                    match reply.serialize() {
                                        Ok(bytes) => outer.respond(bytes).await,
                                        Err(_) => outer.respond_error("reply too large".to_owned()).await,
                                    }
                                }
                                Err(message) => outer.respond_error(message).await,
                            }
                        })
                    }));
                    self.link_manager
                        .dispatch_named(&endpoint, from, body, inner_responder)
                        .await;
                    Ok(())
                }
                InnerMessage::Data { sender, body } => {
                    self.deliver_local_data(sender, body).await;
                    let reply = hop.wrap_reply(Vec::new());
                    let bytes = reply.serialize().map_err(|_| HandlerError::Malformed)?;
                    responder.respond(bytes).await;
                    Ok(())
                }
            }
        } else {
            match hop.direction_of(frame.hop_id) {
                Some(crate::path::HopDirection::ToPivot) => {}
                _ => return Err(HandlerError::Refused("wrong direction".to_owned())),
            }

            let onward = peeled.serialize().map_err(|_| HandlerError::Malformed)?;
            let hop_c = hop.clone();
            let outer = responder;
            // rewrap the reply on its way back
            let hook: ControlHook = Box::new(move |result| {
                tokio::spawn(async move {
                    match result {
                        ControlResult::Response(body) => match OnionFrame::from_bytes(&body) {
                            Ok((_, reply)) => {
                                let wrapped = hop_c.wrap_backward(&reply);
                                match wrapped.serialize() {
                                    Ok(bytes) => outer.respond(bytes).await,
                                    Err(_) => outer.respond_error("reply too large".to_owned()).await,
                                }
                            }
                            Err(_) => outer.respond_error("malformed reply".to_owned()).await,
                        },
                        ControlResult::Error(body) => {
                            outer.respond_error(String::from_utf8_lossy(&body).into_owned()).await
                        }
                        ControlResult::TimedOut => outer.respond_error("timeout".to_owned()).await,
                        _ => outer.respond_error("no link".to_owned()).await,
                    }
                });
            });
            self.link_manager
                .send_control(hop.upstream, PATH_CONTROL_ENDPOINT, onward, Some(hook))
                .await
                .map_err(|_| HandlerError::Refused("unroutable next hop".to_owned()))?;
            Ok(())
        }
    }

    async fn handle_path_latency(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, probe) = LatencyProbe::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;
        responder.respond(probe.serialize()).await;
        Ok(())
    }

    async fn handle_path_transfer(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, transfer) = PathTransfer::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;
        let frame = transfer.frame;

        let hop = match self.path_context.get_transit(frame.hop_id) {
            Some(hop) if hop.is_terminal() => hop,
            _ => return Err(HandlerError::Refused("no such path".to_owned())),
        };

        // hand the frame down the destination path as a datagram
        let wrapped = hop.wrap_backward(&frame);
        self.link_manager.send_data(hop.downstream, wrapped).await.ok();
        responder.respond(Vec::new()).await;
        Ok(())
    }

    async fn handle_gossip_rc(&self, from: RouterId, body: Vec<u8>, _responder: Responder) -> Result<(), HandlerError> {
        let (_, gossip) = GossipRc::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        let stored = self.ingest_rcs(vec![gossip.rc.clone()], AddressPolicy::RejectBogons).await;
        if stored > 0 {
            debug!("Gossiping fresh contact of {:?}", gossip.rc.rid);
            self.link_manager.gossip_rc(from, gossip.rc).await;
        }
        Ok(())
    }

    async fn handle_fetch_rcs(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, fetch) = FetchRcs::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        let mut rcs = self.node_db.rcs_newer_than(fetch.since, &fetch.explicit_ids).await;
        rcs.truncate(MAX_FETCH_RCS);
        let body = serialize_body(&RcBundle { rcs }).map_err(|_| HandlerError::Refused("bundle too large".to_owned()))?;
        responder.respond(body).await;
        Ok(())
    }

    async fn handle_fetch_rids(&self, _from: RouterId, _body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let mut rids = self.node_db.rids().await;
        rids.truncate(MAX_FETCH_RIDS);
        let body = serialize_body(&RidBundle { rids }).map_err(|_| HandlerError::Refused("bundle too large".to_owned()))?;
        responder.respond(body).await;
        Ok(())
    }

    async fn handle_fetch_bootstrap(&self, from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, fetch) = BootstrapFetch::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        if let Some(rc) = fetch.local {
            if rc.rid == from {
                self.ingest_rcs(vec![rc], AddressPolicy::RejectBogons).await;
            }
        }

        let local_rid = self.rid();
        let mut rcs = self
            .node_db
            .random_rcs(fetch.quantity.min(MAX_FETCH_RCS as u16) as usize, |rc| rc.rid != local_rid)
            .await;
        rcs.truncate(MAX_FETCH_RCS);
        let body = serialize_body(&RcBundle { rcs }).map_err(|_| HandlerError::Refused("bundle too large".to_owned()))?;
        responder.respond(body).await;
        Ok(())
    }

    async fn handle_find_name(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, find) = FindName::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;
        let rid = self.names.read().await.get(&find.name).copied();
        let body = serialize_body(&NameResponse { rid }).map_err(|_| HandlerError::Malformed)?;
        responder.respond(body).await;
        Ok(())
    }

    async fn handle_find_intro(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, find) = FindIntro::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;
        let introset = self.intros.read().await.get(&find.location).cloned();
        let body = serialize_body(&IntroResponse { introset }).map_err(|_| HandlerError::Malformed)?;
        responder.respond(body).await;
        Ok(())
    }

    async fn handle_publish_intro(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, publish) = PublishIntro::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;
        self.intros.write().await.insert(publish.location, publish.introset);
        responder.respond(Vec::new()).await;
        Ok(())
    }

    async fn handle_obtain_exit(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, obtain) = ObtainExit::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        let status = if obtain.verify() {
            self.exit.grant(obtain.tx_id, obtain.pubkey).await;
            ExitStatus::Granted
        } else {
            warn!("Exit request with a bad signature from {:?}", obtain.pubkey);
            ExitStatus::Rejected
        };
        responder.respond(status.serialize()).await;
        Ok(())
    }

    async fn handle_update_exit(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, update) = ExitFlowRequest::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        let status = match self.exit.owner_of(&update.tx_id).await {
            Some(owner) if update.verify(&owner) => ExitStatus::Updated,
            _ => ExitStatus::Rejected,
        };
        responder.respond(status.serialize()).await;
        Ok(())
    }

    async fn handle_close_exit(&self, _from: RouterId, body: Vec<u8>, responder: Responder) -> Result<(), HandlerError> {
        let (_, close) = ExitFlowRequest::from_bytes(&body).map_err(|_| HandlerError::Malformed)?;

        let status = match self.exit.owner_of(&close.tx_id).await {
            Some(owner) if close.verify(&owner) => {
                self.exit.close(&close.tx_id).await;
                ExitStatus::Closed
            }
            _ => ExitStatus::Rejected,
        };
        responder.respond(status.serialize()).await;
        Ok(())
    }

    async fn deliver_local_data(&self, sender: RouterId, body: Vec<u8>) {
        let endpoint = self.endpoint.read().await;
        match endpoint.as_ref() {
            Some(endpoint) => endpoint.accept_data_message(sender, body),
            None => {
                self.link_manager.stats().counter_dropped();
                trace!("Terminating datagram from {:?} with no endpoint installed", sender);
            }
        }
    }

    /// Route one inbound onion datagram: relay it as a transit hop, deliver
    /// it to the owning local path, or drop it.
    pub async fn handle_datagram(&self, from: RouterId, frame: OnionFrame) {
        if let Some(hop) = self.path_context.get_transit(frame.hop_id) {
            if hop.is_expired(clock_now()) {
                self.link_manager.stats().counter_dropped();
                return;
            }

            if hop.is_terminal() {
                let peeled = hop.peel_forward(&frame);
                match InnerMessage::from_bytes(&peeled.payload) {
                    Ok((_, InnerMessage::Data { sender, body })) => {
                        self.deliver_local_data(sender, body).await;
                    }
                    Ok((_, InnerMessage::Control { endpoint, body })) => {
                        // respond over a reverse datagram along the same path
                        let manager = self.link_manager.clone();
                        let reply_hop = hop.clone();
                        let responder = Responder::new(Box::new(move |result| {
                            Box::pin(async move {
                                if let Ok(body) = result {
                                    let reply = reply_hop.wrap_reply(body);
                                    manager.send_data(reply_hop.downstream, reply).await.ok();
                                }
                            })
                        }));
                        self.link_manager.dispatch_named(&endpoint, from, body, responder).await;
                    }
                    Err(_) => {
                        self.link_manager.stats().counter_dropped();
                        trace!("Undecodable inner payload at the pivot");
                    }
                }
                return;
            }

            match hop.direction_of(frame.hop_id) {
                Some(crate::path::HopDirection::ToPivot) => {
                    let peeled = hop.peel_forward(&frame);
                    self.link_manager.send_data(hop.upstream, peeled).await.ok();
                }
                Some(crate::path::HopDirection::ToOriginator) => {
                    let wrapped = hop.wrap_backward(&frame);
                    self.link_manager.send_data(hop.downstream, wrapped).await.ok();
                }
                None => {}
            }
            return;
        }

        if let Some(path) = self.path_context.get_path(frame.hop_id) {
            path.handle_inbound_frame(&frame);
            return;
        }

        self.link_manager.stats().counter_dropped();
        trace!("Datagram from {:?} matches no hop and no path", from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_crypto::identity::SigningKey;

    fn test_router() -> Router {
        Router::relay(LocalIdentity::new_random(), "203.0.113.1:9000".parse().unwrap())
    }

    fn responder_capture() -> (Responder, Arc<StdMutex<Option<Result<Vec<u8>, String>>>>) {
        let captured = Arc::new(StdMutex::new(None));
        let captured_c = captured.clone();
        let responder = Responder::new(Box::new(move |result| {
            Box::pin(async move {
                *captured_c.lock().unwrap() = Some(result);
            })
        }));
        (responder, captured)
    }

    #[tokio::test]
    async fn exit_flow_lifecycle() {
        let router = test_router();
        let client_sk = SigningKey::generate();
        let tx_id = SessionTag::random(&mut rand::thread_rng());

        // obtain
        let body = serialize_body(&ObtainExit::new_signed(&client_sk, 0, tx_id)).unwrap();
        let (responder, captured) = responder_capture();
        router.handle_obtain_exit(router.rid(), body, responder).await.unwrap();
        assert_eq!(captured.lock().unwrap().clone().unwrap().unwrap(), ExitStatus::Granted.serialize());
        assert_eq!(router.exit_endpoint().flow_count().await, 1);

        // update by the owner
        let body = serialize_body(&ExitFlowRequest::new_signed(&client_sk, tx_id)).unwrap();
        let (responder, captured) = responder_capture();
        router.handle_update_exit(router.rid(), body, responder).await.unwrap();
        assert_eq!(captured.lock().unwrap().clone().unwrap().unwrap(), ExitStatus::Updated.serialize());

        // update by an imposter
        let body = serialize_body(&ExitFlowRequest::new_signed(&SigningKey::generate(), tx_id)).unwrap();
        let (responder, captured) = responder_capture();
        router.handle_update_exit(router.rid(), body, responder).await.unwrap();
        assert_eq!(captured.lock().unwrap().clone().unwrap().unwrap(), ExitStatus::Rejected.serialize());

        // close
        let body = serialize_body(&ExitFlowRequest::new_signed(&client_sk, tx_id)).unwrap();
        let (responder, captured) = responder_capture();
        router.handle_close_exit(router.rid(), body, responder).await.unwrap();
        assert_eq!(captured.lock().unwrap().clone().unwrap().unwrap(), ExitStatus::Closed.serialize());
        assert_eq!(router.exit_endpoint().flow_count().await, 0);
    }

    #[tokio::test]
    async fn name_and_intro_stores() {
        let router = test_router();
        let rid = RouterId::from_bytes_exact([5; 32]);
        router.names.write().await.insert("mnemonic.veil".to_owned(), rid);

        let body = serialize_body(&FindName { name: "mnemonic.veil".to_owned() }).unwrap();
        let (responder, captured) = responder_capture();
        router.handle_find_name(router.rid(), body, responder).await.unwrap();
        let reply = captured.lock().unwrap().clone().unwrap().unwrap();
        assert_eq!(NameResponse::from_bytes(&reply).unwrap().1, NameResponse { rid: Some(rid) });

        // publish then find an introset
        let location = [9; 32];
        let body = serialize_body(&PublishIntro { location, introset: vec![1, 2, 3] }).unwrap();
        let (responder, _captured) = responder_capture();
        router.handle_publish_intro(router.rid(), body, responder).await.unwrap();

        let body = serialize_body(&FindIntro { location }).unwrap();
        let (responder, captured) = responder_capture();
        router.handle_find_intro(router.rid(), body, responder).await.unwrap();
        let reply = captured.lock().unwrap().clone().unwrap().unwrap();
        assert_eq!(
            IntroResponse::from_bytes(&reply).unwrap().1,
            IntroResponse { introset: Some(vec![1, 2, 3]) }
        );
    }

    #[tokio::test]
    async fn build_refused_when_transit_disallowed() {
        let client = Router::client(LocalIdentity::new_random());

        let relay = LocalIdentity::new_random();
        let relay_rc = relay.make_rc("203.0.113.1:9000".parse().unwrap(), unix_now());
        let (_, outer) = Path::prepare(vec![relay_rc], DEFAULT_LIFETIME, client.link_manager().clone()).unwrap();

        let (responder, captured) = responder_capture();
        client
            .handle_path_build(client.rid(), outer.serialize().unwrap(), responder)
            .await
            .unwrap();
        let reply = captured.lock().unwrap().clone().unwrap().unwrap();
        assert_eq!(
            BuildReply::from_bytes(&reply).unwrap().1.status,
            BuildStatus::TransitNotAllowed
        );
    }

    #[tokio::test]
    async fn terminal_build_installs_pivot_state() {
        let relay_local = LocalIdentity::new_random();
        let relay = Router::relay(relay_local, "203.0.113.1:9000".parse().unwrap());

        // a single-hop path terminates at the relay itself
        let (path, outer) = Path::prepare(
            vec![relay.rc().clone()],
            DEFAULT_LIFETIME,
            relay.link_manager().clone(),
        )
        .unwrap();

        let from = RouterId::from_bytes_exact([3; 32]);
        let (responder, captured) = responder_capture();
        relay
            .handle_path_build(from, outer.serialize().unwrap(), responder)
            .await
            .unwrap();
        let reply = captured.lock().unwrap().clone().unwrap().unwrap();
        assert_eq!(BuildReply::from_bytes(&reply).unwrap().1.status, BuildStatus::Ok);

        let hop = relay.path_context().get_transit(path.upstream_rxid()).unwrap();
        assert!(hop.is_terminal());
        assert_eq!(hop.downstream, from);
        assert_eq!(hop.shared, path.hops()[0].shared);
    }

    #[tokio::test]
    async fn duplicate_build_rejected() {
        let relay = test_router();
        let (_, outer) = Path::prepare(
            vec![relay.rc().clone()],
            DEFAULT_LIFETIME,
            relay.link_manager().clone(),
        )
        .unwrap();
        let body = outer.serialize().unwrap();
        let from = RouterId::from_bytes_exact([3; 32]);

        let (responder, captured) = responder_capture();
        relay.handle_path_build(from, body.clone(), responder).await.unwrap();
        assert_eq!(
            BuildReply::from_bytes(&captured.lock().unwrap().clone().unwrap().unwrap()).unwrap().1.status,
            BuildStatus::Ok
        );

        let (responder, captured) = responder_capture();
        relay.handle_path_build(from, body, responder).await.unwrap();
        assert_eq!(
            BuildReply::from_bytes(&captured.lock().unwrap().clone().unwrap().unwrap()).unwrap().1.status,
            BuildStatus::Rejected
        );
    }

    #[tokio::test]
    async fn latency_probe_echoes() {
        let router = test_router();
        let probe = LatencyProbe { id: 42 };

        let (responder, captured) = responder_capture();
        router
            .handle_path_latency(router.rid(), probe.serialize(), responder)
            .await
            .unwrap();
        assert_eq!(captured.lock().unwrap().clone().unwrap().unwrap(), probe.serialize());
    }
}
