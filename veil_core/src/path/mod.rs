/*! Paths: fixed-length onion circuits owned by this node.

A path owns one hop config per relay. The originator wraps outgoing
payloads innermost-first, so each relay removes exactly one layer as the
frame moves towards the pivot; responses gain one layer per relay on the
way back and are peeled here in forward hop order.
*/

mod build;
pub mod context;
pub mod errors;
pub mod transit;

pub use self::build::*;
pub use self::context::PathContext;
pub use self::errors::{ContextError, PathError};
pub use self::transit::{HopDirection, TransitHop};

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::thread_rng;

use veil_binary_io::FromBytes;
use veil_crypto::{onion_peel, onion_step, SharedSecret, SymmNonce};
use veil_packet::contact::RouterContact;
use veil_packet::exit::{ExitFlowRequest, ObtainExit, CLOSE_EXIT_ENDPOINT, OBTAIN_EXIT_ENDPOINT, UPDATE_EXIT_ENDPOINT};
use veil_packet::dht::{FindIntro, FindName, PublishIntro, FIND_INTRO_ENDPOINT, FIND_NAME_ENDPOINT, PUBLISH_INTRO_ENDPOINT};
use veil_packet::gossip::serialize_body;
use veil_packet::onion::{InnerMessage, LatencyProbe, OnionFrame, PATH_CONTROL_ENDPOINT, PATH_LATENCY_ENDPOINT};
use veil_packet::{HopId, RouterId, SessionTag};
use veil_crypto::identity::SigningKey;

use crate::error::{ControlHook, ControlResult, ErrorKind};
use crate::link::manager::LinkManager;
use crate::time::*;
use crate::utils::gen_request_id;

/// Canonical number of hops in a path.
pub const DEFAULT_PATH_LEN: usize = 4;

/// How long a path lives after it is established.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(1200);

/// Deadline for the whole build round-trip.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle interval after which an established path gets a latency probe.
pub const LATENCY_INTERVAL: Duration = Duration::from_secs(20);

/// Silence interval after which an established path is considered dead.
pub const ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the originator holds about one hop of its path.
#[derive(Clone)]
pub struct PathHopConfig {
    /// Contact of the relay at this hop.
    pub rc: RouterContact,
    /// Id this hop is addressed by on frames towards the pivot.
    pub rx: HopId,
    /// Id this hop forwards under towards the pivot.
    pub tx: HopId,
    /// Session key agreed with this hop during build.
    pub shared: SharedSecret,
    /// Nonce mutator derived from the session key.
    pub nonce_xor: SymmNonce,
    /// Nonce the key was derived with.
    pub nonce: SymmNonce,
    /// Router id of the next hop; the hop's own id at the pivot.
    pub upstream: RouterId,
    /// Lifetime requested for this hop's state.
    pub lifetime: Duration,
}

impl PartialEq for PathHopConfig {
    fn eq(&self, other: &PathHopConfig) -> bool {
        self.rc == other.rc
            && self.upstream == other.upstream
            && self.tx == other.tx
            && self.rx == other.rx
            && self.lifetime == other.lifetime
    }
}

impl Eq for PathHopConfig {}

/// Lifecycle of a path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathStatus {
    /// Build request sent, no reply yet.
    Building,
    /// Build reply received; the path carries traffic.
    Established,
    /// Build failed or timed out.
    Failed,
    /// Path passed its deadline or went silent.
    Expired,
}

/// Address record other peers use to reach this path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PathIntro {
    /// Router id of the pivot.
    pub pivot_rid: RouterId,
    /// Id the pivot answers to for this path.
    pub pivot_rx: HopId,
}

/// Callback receiving datagrams that arrive on a path.
pub type DatagramCallback = Box<dyn Fn(Vec<u8>) + Send + Sync + 'static>;

/// Completion of a path build.
pub type BuildHook = Box<dyn FnOnce(Result<(), ErrorKind>) + Send + Sync + 'static>;

type HookSlot = Arc<Mutex<Option<ControlHook>>>;

/// A fixed-length onion circuit owned by this node.
#[derive(Clone)]
pub struct Path {
    hops: Arc<Vec<PathHopConfig>>,
    manager: LinkManager,
    intro: PathIntro,
    build_started: Instant,
    status: Arc<RwLock<PathStatus>>,
    expires_at: Arc<RwLock<Option<Instant>>>,
    last_recv: Arc<RwLock<Instant>>,
    latency: Arc<RwLock<Option<Duration>>>,
    latency_probe: Arc<RwLock<Option<(u64, Instant)>>>,
    recv_dgram: Arc<RwLock<Option<Arc<DatagramCallback>>>>,
    pending: Arc<Mutex<Vec<HookSlot>>>,
}

impl PartialEq for Path {
    fn eq(&self, other: &Path) -> bool {
        *self.hops == *other.hops
    }
}

impl Eq for Path {}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path").finish_non_exhaustive()
    }
}

impl Path {
    pub(crate) fn from_hops(hops: Vec<PathHopConfig>, manager: LinkManager) -> Path {
        assert!(!hops.is_empty(), "a path needs at least one hop");
        let intro = PathIntro {
            pivot_rid: hops[hops.len() - 1].rc.rid,
            pivot_rx: hops[hops.len() - 1].rx,
        };
        Path {
            hops: Arc::new(hops),
            manager,
            intro,
            build_started: clock_now(),
            status: Arc::new(RwLock::new(PathStatus::Building)),
            expires_at: Arc::new(RwLock::new(None)),
            last_recv: Arc::new(RwLock::new(clock_now())),
            latency: Arc::new(RwLock::new(None)),
            latency_probe: Arc::new(RwLock::new(None)),
            recv_dgram: Arc::new(RwLock::new(None)),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The hop configs, first hop first.
    pub fn hops(&self) -> &[PathHopConfig] {
        &self.hops
    }

    /// Contacts of the hops, in traversal order.
    pub fn hop_rcs(&self) -> Vec<RouterContact> {
        self.hops.iter().map(|hop| hop.rc.clone()).collect()
    }

    /// Router id of the first hop.
    pub fn upstream_rid(&self) -> RouterId {
        self.hops[0].rc.rid
    }

    /// Id this path is registered under locally.
    pub fn upstream_rxid(&self) -> HopId {
        self.hops[0].rx
    }

    /// Id the first hop forwards under.
    pub fn upstream_txid(&self) -> HopId {
        self.hops[0].tx
    }

    /// Router id of the terminal hop.
    pub fn pivot_rid(&self) -> RouterId {
        self.intro.pivot_rid
    }

    /// Address record peers can reach this path by.
    pub fn intro(&self) -> PathIntro {
        self.intro
    }

    pub fn status(&self) -> PathStatus {
        *self.status.read()
    }

    pub fn when_built(&self) -> Instant {
        self.build_started
    }

    /// Established and not past the deadline.
    pub fn is_ready(&self) -> bool {
        *self.status.read() == PathStatus::Established && !self.is_expired(clock_now())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match *self.expires_at.read() {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }

    /// Last measured round-trip time, if a probe completed.
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.read()
    }

    pub(crate) fn set_established(&self) {
        *self.status.write() = PathStatus::Established;
        *self.expires_at.write() = Some(clock_now() + self.hops[0].lifetime);
        debug!("Path {} established", self.name());
    }

    pub(crate) fn set_failed(&self) {
        *self.status.write() = PathStatus::Failed;
    }

    pub(crate) fn set_expired(&self) {
        *self.status.write() = PathStatus::Expired;
    }

    /// Record traffic received over this path.
    pub fn mark_recv(&self) {
        *self.last_recv.write() = clock_now();
    }

    /// Attach the datagram receiver of a session.
    pub fn link_session(&self, callback: DatagramCallback) {
        *self.recv_dgram.write() = Some(Arc::new(callback));
    }

    /// Detach the session receiver. Returns whether one was attached.
    pub fn unlink_session(&self) -> bool {
        self.recv_dgram.write().take().is_some()
    }

    fn name(&self) -> String {
        format!(
            "TX={} RX={}",
            hex::encode(&self.upstream_txid().as_bytes()[..4]),
            hex::encode(&self.upstream_rxid().as_bytes()[..4]),
        )
    }

    /// Wrap a payload in one onion layer per hop, innermost first, and
    /// address it at the first hop.
    fn make_path_message(&self, mut payload: Vec<u8>) -> OnionFrame {
        let mut nonce = SymmNonce::random(&mut thread_rng());
        for hop in self.hops.iter().rev() {
            nonce = onion_step(&mut payload, &hop.shared, &nonce, &hop.nonce_xor);
        }
        OnionFrame {
            hop_id: self.upstream_rxid(),
            nonce,
            payload,
        }
    }

    /// Remove every hop's layer from an inbound frame, forward hop order.
    fn decrypt_inbound(&self, frame: &OnionFrame) -> Vec<u8> {
        let mut payload = frame.payload.clone();
        let mut nonce = frame.nonce;
        for hop in self.hops.iter() {
            nonce = onion_peel(&mut payload, &hop.shared, &nonce, &hop.nonce_xor);
        }
        payload
    }

    fn translate_response(&self, result: ControlResult) -> ControlResult {
        match result {
            ControlResult::Response(body) => match OnionFrame::from_bytes(&body) {
                Ok((_, frame)) => {
                    self.mark_recv();
                    ControlResult::Response(self.decrypt_inbound(&frame))
                }
                Err(_) => ControlResult::Failed(ErrorKind::Malformed),
            },
            other => other,
        }
    }

    /// Send a control request to the pivot. The hook fires exactly once:
    /// with the decrypted response, a timeout marker, or a cancellation when
    /// the path is dropped first.
    pub async fn send_path_control(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        hook: Option<ControlHook>,
    ) -> Result<(), PathError> {
        self.check_ready()?;

        let inner = InnerMessage::control(endpoint, body)
            .serialize()
            .map_err(|_| PathError::Serialize)?;
        let frame = self.make_path_message(inner);
        let frame_bytes = frame.serialize().map_err(|_| PathError::Serialize)?;

        let wrapped = hook.map(|hook| {
            let slot: HookSlot = Arc::new(Mutex::new(Some(hook)));
            self.pending.lock().push(slot.clone());
            let path = self.clone();
            let wrapped: ControlHook = Box::new(move |result| {
                let user = slot.lock().take();
                if let Some(user) = user {
                    user(path.translate_response(result));
                }
            });
            wrapped
        });

        self.prune_pending();
        self.manager
            .send_control(self.upstream_rid(), PATH_CONTROL_ENDPOINT, frame_bytes, wrapped)
            .await
            .map_err(|_| PathError::LinkFailed)
    }

    /// Send a datagram along the path. Returns `false` when the frame was
    /// dropped on a full queue.
    pub async fn send_path_data(&self, body: Vec<u8>) -> Result<bool, PathError> {
        self.check_ready()?;

        let inner = InnerMessage::data(self.manager.local_rid(), body)
            .serialize()
            .map_err(|_| PathError::Serialize)?;
        let frame = self.make_path_message(inner);
        self.manager
            .send_data(self.upstream_rid(), frame)
            .await
            .map_err(|_| PathError::LinkFailed)
    }

    /// Deliver an inbound frame addressed to this path: peel every layer
    /// and hand datagrams to the linked session.
    pub fn handle_inbound_frame(&self, frame: &OnionFrame) {
        self.mark_recv();
        let payload = self.decrypt_inbound(frame);
        match InnerMessage::from_bytes(&payload) {
            Ok((_, InnerMessage::Data { sender, body })) => {
                let callback = self.recv_dgram.read().clone();
                match callback {
                    Some(callback) => (*callback)(body),
                    None => warn!("Path {} has no session to receive a datagram from {:?}", self.name(), sender),
                }
            }
            Ok((_, InnerMessage::Control { endpoint, .. })) => {
                trace!("Unsolicited control message {} on path {}", endpoint, self.name());
            }
            Err(_) => {
                trace!("Undecodable inbound frame on path {}", self.name());
            }
        }
    }

    fn check_ready(&self) -> Result<(), PathError> {
        match *self.status.read() {
            PathStatus::Established => {
                if self.is_expired(clock_now()) {
                    Err(PathError::Expired)
                } else {
                    Ok(())
                }
            }
            PathStatus::Expired => Err(PathError::Expired),
            PathStatus::Building | PathStatus::Failed => Err(PathError::NotReady),
        }
    }

    fn prune_pending(&self) {
        self.pending.lock().retain(|slot| slot.lock().is_some());
    }

    /// Cancel every in-flight control request of this path. Their hooks are
    /// invoked exactly once with a cancellation marker.
    pub fn cancel_pending(&self) {
        let hooks: Vec<ControlHook> = {
            let mut pending = self.pending.lock();
            pending.drain(..).filter_map(|slot| slot.lock().take()).collect()
        };
        for hook in hooks {
            hook(ControlResult::Cancelled);
        }
    }

    /// Number of control requests still awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.prune_pending();
        self.pending.lock().len()
    }

    /// Send a latency probe and record the round-trip on its echo.
    pub async fn probe_latency(&self) -> Result<(), PathError> {
        let id = gen_request_id();
        let sent = clock_now();
        *self.latency_probe.write() = Some((id, sent));

        let path = self.clone();
        let hook: ControlHook = Box::new(move |result| {
            let expected = *path.latency_probe.read();
            match (result, expected) {
                (ControlResult::Response(body), Some((id, sent))) => match LatencyProbe::from_bytes(&body) {
                    Ok((_, probe)) if probe.id == id => {
                        *path.latency.write() = Some(clock_elapsed(sent));
                        *path.latency_probe.write() = None;
                    }
                    _ => debug!("Latency probe came back mangled on {}", path.name()),
                },
                (other, _) => trace!("Latency probe did not complete: {:?}", other),
            }
        });
        self.send_path_control(PATH_LATENCY_ENDPOINT, LatencyProbe { id }.serialize(), Some(hook))
            .await
    }

    /// Drive per-path upkeep. Returns `false` once the path is dead and
    /// should be dropped from the registry.
    pub async fn tick(&self) -> bool {
        if !self.is_ready() {
            if *self.status.read() == PathStatus::Established {
                // established but past the deadline
                self.set_expired();
                return false;
            }
            return *self.status.read() == PathStatus::Building;
        }

        let idle = clock_elapsed(*self.last_recv.read());
        if idle >= ALIVE_TIMEOUT {
            debug!("Path {} looks dead after {:?} silence", self.name(), idle);
            self.set_expired();
            return false;
        }
        let probe_outstanding = self
            .latency_probe
            .read()
            .map_or(false, |(_, sent)| clock_elapsed(sent) < LATENCY_INTERVAL);
        if idle >= LATENCY_INTERVAL && !probe_outstanding {
            self.probe_latency().await.ok();
        }
        true
    }

    /// Ask the pivot to open an exit flow for our identity.
    pub async fn obtain_exit(
        &self,
        sk: &SigningKey,
        flag: u64,
        tx_id: SessionTag,
        hook: Option<ControlHook>,
    ) -> Result<(), PathError> {
        let body = serialize_body(&ObtainExit::new_signed(sk, flag, tx_id)).map_err(|_| PathError::Serialize)?;
        self.send_path_control(OBTAIN_EXIT_ENDPOINT, body, hook).await
    }

    /// Refresh an exit flow at the pivot.
    pub async fn update_exit(&self, sk: &SigningKey, tx_id: SessionTag, hook: Option<ControlHook>) -> Result<(), PathError> {
        let body = serialize_body(&ExitFlowRequest::new_signed(sk, tx_id)).map_err(|_| PathError::Serialize)?;
        self.send_path_control(UPDATE_EXIT_ENDPOINT, body, hook).await
    }

    /// Close an exit flow at the pivot.
    pub async fn close_exit(&self, sk: &SigningKey, tx_id: SessionTag, hook: Option<ControlHook>) -> Result<(), PathError> {
        let body = serialize_body(&ExitFlowRequest::new_signed(sk, tx_id)).map_err(|_| PathError::Serialize)?;
        self.send_path_control(CLOSE_EXIT_ENDPOINT, body, hook).await
    }

    /// Resolve a service name through the pivot.
    pub async fn resolve_ons(&self, name: String, hook: Option<ControlHook>) -> Result<(), PathError> {
        let body = serialize_body(&FindName { name }).map_err(|_| PathError::Serialize)?;
        self.send_path_control(FIND_NAME_ENDPOINT, body, hook).await
    }

    /// Publish our client contact blob at a location key.
    pub async fn publish_client_contact(
        &self,
        location: [u8; 32],
        introset: Vec<u8>,
        hook: Option<ControlHook>,
    ) -> Result<(), PathError> {
        let body = serialize_body(&PublishIntro { location, introset }).map_err(|_| PathError::Serialize)?;
        self.send_path_control(PUBLISH_INTRO_ENDPOINT, body, hook).await
    }

    /// Look up a client contact blob at a location key.
    pub async fn find_client_contact(&self, location: [u8; 32], hook: Option<ControlHook>) -> Result<(), PathError> {
        let body = serialize_body(&FindIntro { location }).map_err(|_| PathError::Serialize)?;
        self.send_path_control(FIND_INTRO_ENDPOINT, body, hook).await
    }
}
