/*! Path construction on the originator side.

For every hop the builder draws a fresh rx id, an ephemeral keypair and a
nonce, derives the session key against the hop's static encryption key, and
chains the tx ids so that `hop[i].tx == hop[i+1].rx` with the pivot's pair
self-looped. The build request nests one sealed record per hop, innermost
for the pivot.
*/

use std::time::Duration;

use log::{debug, warn};
use rand::thread_rng;

use veil_binary_io::FromBytes;
use veil_crypto::{dh_client, SecretKey, SymmNonce};
use veil_packet::contact::{unix_now, RouterContact};
use veil_packet::onion::{BuildRecord, BuildReply, BuildRequestFrame, BuildStatus, PATH_BUILD_ENDPOINT};
use veil_packet::HopId;

use crate::error::{ControlHook, ControlResult, ErrorKind};
use crate::link::manager::LinkManager;
use crate::path::context::PathContext;
use crate::path::errors::PathError;
use crate::path::{BuildHook, Path, PathHopConfig, BUILD_TIMEOUT};

impl Path {
    /// Allocate hop state over `rcs` and assemble the nested build request.
    /// No frame leaves this function.
    pub fn prepare(rcs: Vec<RouterContact>, lifetime: Duration, manager: LinkManager) -> Result<(Path, BuildRequestFrame), PathError> {
        assert!(!rcs.is_empty(), "a path needs at least one hop");

        let mut rng = thread_rng();
        let n = rcs.len();

        let rx: Vec<HopId> = (0..n).map(|_| HopId::random(&mut rng)).collect();
        let mut hops = Vec::with_capacity(n);
        for (i, rc) in rcs.iter().enumerate() {
            let tx = if i + 1 < n { rx[i + 1] } else { rx[i] };
            let upstream = if i + 1 < n { rcs[i + 1].rid } else { rc.rid };

            let ephemeral_sk = SecretKey::generate(&mut rng);
            let nonce = SymmNonce::random(&mut rng);
            let shared = dh_client(&ephemeral_sk, &rc.enc_pk, &nonce);
            let nonce_xor = shared.derive_nonce_xor();

            hops.push((
                ephemeral_sk,
                PathHopConfig {
                    rc: rc.clone(),
                    rx: rx[i],
                    tx,
                    shared,
                    nonce_xor,
                    nonce,
                    upstream,
                    lifetime,
                },
            ));
        }

        // nest the records innermost-first so every hop only ever sees the
        // layer addressed to it
        let mut inner = Vec::new();
        let mut outer = None;
        for (ephemeral_sk, hop) in hops.iter().rev() {
            let record = BuildRecord {
                tx: hop.tx,
                upstream: hop.upstream,
                lifetime: hop.lifetime.as_secs(),
                inner,
            };
            let frame = BuildRequestFrame::new(ephemeral_sk, &hop.rc.enc_pk, hop.rx, hop.nonce, &record)
                .map_err(|_| PathError::Serialize)?;
            inner = frame.serialize().map_err(|_| PathError::Serialize)?;
            outer = Some(frame);
        }

        let hops = hops.into_iter().map(|(_, hop)| hop).collect();
        // the loop ran at least once
        Ok((Path::from_hops(hops, manager), outer.unwrap()))
    }

    /// Rebuild over the same relays with fresh ids and keys.
    pub fn rebuild(&self) -> Result<(Path, BuildRequestFrame), PathError> {
        Path::prepare(self.hop_rcs(), self.hops()[0].lifetime, self.manager_handle())
    }

    pub(crate) fn manager_handle(&self) -> LinkManager {
        self.manager.clone()
    }

    /// Check every hop contact against the clock; a stale contact fails the
    /// build before any frame is sent.
    pub fn check_hop_contacts(&self) -> Result<(), ErrorKind> {
        let now = unix_now();
        for hop in self.hops() {
            if hop.rc.is_expired(now) {
                warn!("Refusing to build through expired contact {:?}", hop.rc.rid);
                return Err(ErrorKind::Expired);
            }
        }
        Ok(())
    }

    /// Submit the build request to the first hop. On a successful reply the
    /// path turns established and registers itself in `context`.
    pub async fn start_build(&self, outer: BuildRequestFrame, context: PathContext, on_built: Option<BuildHook>) -> Result<(), PathError> {
        if let Err(kind) = self.check_hop_contacts() {
            self.set_failed();
            if let Some(on_built) = on_built {
                on_built(Err(kind));
            }
            return Err(PathError::NotReady);
        }

        let body = outer.serialize().map_err(|_| PathError::Serialize)?;
        let path = self.clone();
        let hook: ControlHook = Box::new(move |result| {
            let outcome = match result {
                ControlResult::Response(body) => match BuildReply::from_bytes(&body) {
                    Ok((_, reply)) if reply.status == BuildStatus::Ok => Ok(()),
                    Ok((_, reply)) => {
                        debug!("Build rejected: {:?}", reply.status);
                        Err(ErrorKind::InvalidRouter)
                    }
                    Err(_) => Err(ErrorKind::Malformed),
                },
                other => Err(other.into_response().err().unwrap_or(ErrorKind::NoLink)),
            };

            match outcome {
                Ok(()) => {
                    path.set_established();
                    path.mark_recv();
                    if context.add_path(path.clone()).is_err() {
                        warn!("Built path collided with a registered upstream rx id");
                    }
                    if let Some(on_built) = on_built {
                        on_built(Ok(()));
                    }
                }
                Err(kind) => {
                    path.set_failed();
                    if let Some(on_built) = on_built {
                        on_built(Err(kind));
                    }
                }
            }
        });

        self.manager_handle()
            .send_control_with_timeout(self.upstream_rid(), PATH_BUILD_ENDPOINT, body, Some(hook), BUILD_TIMEOUT)
            .await
            .map_err(|_| PathError::LinkFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use veil_crypto::dh_server;
    use veil_packet::onion::InnerMessage;

    use crate::node_db::NodeDb;
    use crate::link::handshake::PeerRole;
    use crate::path::transit::TransitHop;
    use crate::path::DEFAULT_LIFETIME;
    use crate::time::clock_now;
    use crate::LocalIdentity;

    fn test_manager() -> LinkManager {
        let local = Arc::new(LocalIdentity::new_random());
        let rc = local.make_rc("127.0.0.1:1".parse().unwrap(), unix_now());
        let (manager, _rx) = LinkManager::new(local, rc, PeerRole::Client, NodeDb::new());
        manager
    }

    struct Relay {
        identity: LocalIdentity,
        rc: RouterContact,
    }

    fn relays(n: usize) -> Vec<Relay> {
        (0..n)
            .map(|i| {
                let identity = LocalIdentity::new_random();
                let rc = identity.make_rc(format!("203.0.113.{}:9000", i + 1).parse().unwrap(), unix_now());
                Relay { identity, rc }
            })
            .collect()
    }

    /// Walk the nested build request the way the relays would, deriving each
    /// hop's transit state.
    fn process_build(relays: &[Relay], outer: BuildRequestFrame, originator: veil_packet::RouterId) -> Vec<TransitHop> {
        let mut hops = Vec::new();
        let mut frame = outer;
        for (i, relay) in relays.iter().enumerate() {
            let record = frame.get_record(&relay.identity.enc_sk).unwrap();
            let shared = dh_server(&relay.identity.enc_sk, &frame.ephemeral_pk, &frame.nonce);
            let nonce_xor = shared.derive_nonce_xor();
            let downstream = if i == 0 { originator } else { relays[i - 1].rc.rid };
            hops.push(TransitHop {
                rx: frame.rx,
                tx: record.tx,
                shared,
                nonce_xor,
                downstream,
                upstream: record.upstream,
                expires_at: clock_now() + Duration::from_secs(record.lifetime),
            });
            if i + 1 < relays.len() {
                frame = BuildRequestFrame::from_bytes(&record.inner).unwrap().1;
            } else {
                assert!(record.inner.is_empty());
            }
        }
        hops
    }

    #[test]
    fn hop_ids_chain() {
        let relays = relays(4);
        let rcs: Vec<_> = relays.iter().map(|r| r.rc.clone()).collect();
        let (path, _outer) = Path::prepare(rcs, DEFAULT_LIFETIME, test_manager()).unwrap();

        let hops = path.hops();
        assert_eq!(hops.len(), 4);
        for i in 0..hops.len() - 1 {
            assert_eq!(hops[i].tx, hops[i + 1].rx);
            assert_eq!(hops[i].upstream, hops[i + 1].rc.rid);
        }
        let pivot = &hops[hops.len() - 1];
        assert_eq!(pivot.tx, pivot.rx);
        assert_eq!(pivot.upstream, pivot.rc.rid);
        assert_eq!(path.intro().pivot_rid, pivot.rc.rid);
        assert_eq!(path.intro().pivot_rx, pivot.rx);
    }

    #[test]
    fn relays_derive_matching_keys() {
        let relays = relays(3);
        let rcs: Vec<_> = relays.iter().map(|r| r.rc.clone()).collect();
        let manager = test_manager();
        let originator = manager.local_rid();
        let (path, outer) = Path::prepare(rcs, DEFAULT_LIFETIME, manager).unwrap();

        let transit = process_build(&relays, outer, originator);
        for (hop, config) in transit.iter().zip(path.hops()) {
            assert_eq!(hop.shared, config.shared);
            assert_eq!(hop.rx, config.rx);
            assert_eq!(hop.tx, config.tx);
        }
        assert!(transit[2].is_terminal());
        assert_eq!(transit[0].downstream, originator);
        assert_eq!(transit[1].downstream, relays[0].rc.rid);
    }

    #[test]
    fn onion_roundtrip_through_relays() {
        let relays = relays(4);
        let rcs: Vec<_> = relays.iter().map(|r| r.rc.clone()).collect();
        let manager = test_manager();
        let originator = manager.local_rid();
        let (path, outer) = Path::prepare(rcs, DEFAULT_LIFETIME, manager).unwrap();
        let transit = process_build(&relays, outer, originator);

        // forward: every relay peels one layer, the pivot sees cleartext
        let inner = InnerMessage::control("ping", &b"hello"[..]).serialize().unwrap();
        let mut frame = path_frame(&path, inner.clone());
        for hop in &transit {
            assert_eq!(frame.hop_id, hop.rx);
            if hop.is_terminal() {
                break;
            }
            assert_ne!(frame.payload, inner);
            frame = hop.peel_forward(&frame);
        }
        let pivot = &transit[transit.len() - 1];
        let peeled = pivot.peel_forward(&frame);
        assert_eq!(peeled.payload, inner);

        // backward: the pivot wraps a reply, every relay adds a layer, the
        // originator strips them all
        let reply_body = b"pong".to_vec();
        let mut reply = pivot.wrap_reply(reply_body.clone());
        for hop in transit.iter().rev().skip(1) {
            assert_ne!(reply.payload, reply_body);
            reply = hop.wrap_backward(&reply);
        }
        assert_eq!(reply.hop_id, path.upstream_rxid());
        let mut recovered = reply.payload.clone();
        let mut nonce = reply.nonce;
        for hop in path.hops() {
            nonce = veil_crypto::onion_peel(&mut recovered, &hop.shared, &nonce, &hop.nonce_xor);
        }
        assert_eq!(recovered, reply_body);
    }

    fn path_frame(path: &Path, payload: Vec<u8>) -> veil_packet::onion::OnionFrame {
        // the private wrapper, reproduced through the public send surface is
        // network-bound; drive the layering directly instead
        let mut body = payload;
        let mut nonce = SymmNonce::random(&mut thread_rng());
        for hop in path.hops().iter().rev() {
            nonce = veil_crypto::onion_step(&mut body, &hop.shared, &nonce, &hop.nonce_xor);
        }
        veil_packet::onion::OnionFrame {
            hop_id: path.upstream_rxid(),
            nonce,
            payload: body,
        }
    }

    #[test]
    fn same_plaintext_yields_independent_ciphertexts() {
        // a fresh nonce per send keeps the wire frame at any single hop
        // unlinkable to the plaintext
        let relays = relays(3);
        let rcs: Vec<_> = relays.iter().map(|r| r.rc.clone()).collect();
        let (path, _outer) = Path::prepare(rcs, DEFAULT_LIFETIME, test_manager()).unwrap();

        let plaintext = InnerMessage::control("ping", &b"hello"[..]).serialize().unwrap();
        let frame_1 = path_frame(&path, plaintext.clone());
        let frame_2 = path_frame(&path, plaintext.clone());

        assert_ne!(frame_1.nonce, frame_2.nonce);
        assert_ne!(frame_1.payload, frame_2.payload);
        assert_eq!(frame_1.payload.len(), frame_2.payload.len());
        assert_ne!(frame_1.payload, plaintext);

        // equal-length payloads do not leak equality either
        let other = InnerMessage::control("ping", &b"hellp"[..]).serialize().unwrap();
        let frame_3 = path_frame(&path, other);
        assert_eq!(frame_3.payload.len(), frame_1.payload.len());
        assert_ne!(frame_3.payload, frame_1.payload);
    }

    #[test]
    fn rebuild_keeps_relays_refreshes_secrets() {
        let relays = relays(4);
        let rcs: Vec<_> = relays.iter().map(|r| r.rc.clone()).collect();
        let (path, _outer) = Path::prepare(rcs, DEFAULT_LIFETIME, test_manager()).unwrap();
        let (rebuilt, _outer) = path.rebuild().unwrap();

        for (old, new) in path.hops().iter().zip(rebuilt.hops()) {
            assert_eq!(old.rc.rid, new.rc.rid);
            assert_ne!(old.rx, new.rx);
            assert_ne!(old.tx, new.tx);
            assert_ne!(old.shared, new.shared);
        }
        assert_ne!(path, rebuilt);
    }

    #[test]
    fn expired_contact_refused() {
        let identity = LocalIdentity::new_random();
        let stale = RouterContact::new_signed(
            &identity.signing_key,
            identity.enc_sk.public_key(),
            "203.0.113.1:9000".parse().unwrap(),
            unix_now() - 3601 - 3600,
        );
        let (path, _outer) = Path::prepare(vec![stale], DEFAULT_LIFETIME, test_manager()).unwrap();

        assert_eq!(path.check_hop_contacts(), Err(ErrorKind::Expired));
    }
}
