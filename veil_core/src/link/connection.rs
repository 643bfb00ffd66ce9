/*! Live state of one established link: the sender towards the peer and the
table of control requests awaiting replies.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use tokio::sync::mpsc;
use tokio::sync::{Notify, RwLock};

use veil_packet::link::{ControlRequest, ControlResponse, Packet};
use veil_packet::RouterId;

use crate::error::{ControlHook, ControlResult};
use crate::link::errors::SendPacketError;
use crate::link::handshake::PeerRole;
use crate::time::*;
use crate::utils::gen_request_id;

/// Buffer size (in packets) for outgoing packets. Kept small so a stalled
/// peer backpressures control traffic quickly and datagrams drop instead of
/// queueing up.
pub const CONNECTION_CHANNEL_SIZE: usize = 8;

struct PendingReply {
    deadline: Instant,
    hook: ControlHook,
}

/// Handle to one established connection.
#[derive(Clone)]
pub struct Connection {
    /// Certified identity of the peer.
    pub rid: RouterId,
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Role the peer introduced itself with.
    pub role: PeerRole,
    /// Whether the peer dialled us.
    pub inbound: bool,
    tx: mpsc::Sender<Packet>,
    pending_replies: Arc<RwLock<HashMap<u64, PendingReply>>>,
    last_activity: Arc<RwLock<Instant>>,
    connected_at: Instant,
    shutdown: Arc<Notify>,
}

impl Connection {
    /// Create new `Connection` around the sender half of its packet pump.
    pub fn new(rid: RouterId, addr: SocketAddr, role: PeerRole, inbound: bool, tx: mpsc::Sender<Packet>) -> Connection {
        Connection {
            rid,
            addr,
            role,
            inbound,
            tx,
            pending_replies: Arc::new(RwLock::new(HashMap::new())),
            last_activity: Arc::new(RwLock::new(clock_now())),
            connected_at: clock_now(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Ask the connection pump to shut the socket down.
    pub fn initiate_close(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once [`Connection::initiate_close`] has been called.
    pub async fn closed_signal(&self) {
        self.shutdown.notified().await;
    }

    /// Send a packet on the reliable lane, waiting for queue space.
    pub async fn send_packet(&self, packet: Packet) -> Result<(), SendPacketError> {
        self.tx.send(packet).await.map_err(|_| SendPacketError::Closed)
    }

    /// Send a packet best-effort: a full queue drops it.
    pub fn try_send_packet(&self, packet: Packet) -> Result<(), SendPacketError> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendPacketError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendPacketError::Closed,
        })
    }

    /// Submit a control request. The hook, if any, is parked until the
    /// response, the deadline, or connection close.
    pub async fn send_request(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        hook: Option<ControlHook>,
        timeout: Duration,
    ) -> Result<u64, SendPacketError> {
        let request_id = {
            let mut pending = self.pending_replies.write().await;
            let mut request_id = gen_request_id();
            while pending.contains_key(&request_id) {
                request_id = gen_request_id();
            }
            if let Some(hook) = hook {
                pending.insert(
                    request_id,
                    PendingReply {
                        deadline: clock_now() + timeout,
                        hook,
                    },
                );
            }
            request_id
        };

        let packet = Packet::ControlRequest(ControlRequest {
            request_id,
            endpoint: endpoint.to_owned(),
            body,
        });

        match self.send_packet(packet).await {
            Ok(()) => Ok(request_id),
            Err(e) => {
                if let Some(reply) = self.pending_replies.write().await.remove(&request_id) {
                    (reply.hook)(ControlResult::LinkClosed);
                }
                Err(e)
            }
        }
    }

    /// Send a successful response on the control stream.
    pub async fn send_response(&self, request_id: u64, body: Vec<u8>) -> Result<(), SendPacketError> {
        self.send_packet(Packet::ControlResponse(ControlResponse {
            request_id,
            is_error: false,
            body,
        }))
        .await
    }

    /// Send an error response on the control stream.
    pub async fn send_error_response(&self, request_id: u64, message: String) -> Result<(), SendPacketError> {
        self.send_packet(Packet::ControlResponse(ControlResponse {
            request_id,
            is_error: true,
            body: message.into_bytes(),
        }))
        .await
    }

    /// Resolve a pending request with the peer's response.
    pub async fn handle_response(&self, response: ControlResponse) {
        let reply = self.pending_replies.write().await.remove(&response.request_id);
        match reply {
            Some(reply) => {
                let result = if response.is_error {
                    ControlResult::Error(response.body)
                } else {
                    ControlResult::Response(response.body)
                };
                (reply.hook)(result);
            }
            None => trace!("Response to unknown or timed out request {}", response.request_id),
        }
    }

    /// Time out overdue requests, invoking their hooks.
    pub async fn sweep_timed_out(&self) {
        let now = clock_now();
        let overdue: Vec<u64> = self
            .pending_replies
            .read()
            .await
            .iter()
            .filter(|(_, reply)| reply.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        if overdue.is_empty() {
            return;
        }

        let mut pending = self.pending_replies.write().await;
        for id in overdue {
            if let Some(reply) = pending.remove(&id) {
                (reply.hook)(ControlResult::TimedOut);
            }
        }
    }

    /// Fail every pending request; called when the connection goes away.
    pub async fn cancel_pending(&self) {
        let mut pending = self.pending_replies.write().await;
        for (_, reply) in pending.drain() {
            (reply.hook)(ControlResult::LinkClosed);
        }
    }

    /// Record traffic from the peer.
    pub async fn mark_activity(&self) {
        *self.last_activity.write().await = clock_now();
    }

    /// How long the peer has been silent.
    pub async fn idle_time(&self) -> Duration {
        clock_elapsed(*self.last_activity.read().await)
    }

    /// When the connection was established.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Number of requests awaiting replies.
    pub async fn pending_count(&self) -> usize {
        self.pending_replies.read().await.len()
    }
}
