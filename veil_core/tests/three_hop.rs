/*! End-to-end scenarios over loopback TCP: three relays and a client
exchanging onion-routed control requests and datagrams.
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use veil_core::error::{ControlHook, ControlResult, ErrorKind};
use veil_core::link::manager::Responder;
use veil_core::path::{Path, PathStatus};
use veil_core::router::{EmbeddedEndpoint, Endpoint, Router};
use veil_core::LocalIdentity;
use veil_packet::contact::{unix_now, AddressPolicy, RouterContact};

async fn spawn_relay() -> Router {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::relay(LocalIdentity::new_random(), addr);
    router.link_manager().set_address_policy(AddressPolicy::AllowBogons);
    router.start(Some(listener)).await;
    router
}

async fn spawn_client() -> Router {
    let router = Router::client(LocalIdentity::new_random());
    router.link_manager().set_address_policy(AddressPolicy::AllowBogons);
    router.start(None).await;
    router
}

/// Three relays that all know each other, plus a client that knows the
/// first relay.
async fn test_network() -> (Router, Vec<Router>) {
    let relays = vec![spawn_relay().await, spawn_relay().await, spawn_relay().await];
    for a in &relays {
        for b in &relays {
            if a.rid() != b.rid() {
                a.node_db().put_rc(b.rc().clone()).await;
            }
        }
    }

    let client = spawn_client().await;
    client.node_db().put_rc(relays[0].rc().clone()).await;
    (client, relays)
}

async fn build_established_path(client: &Router, relays: &[Router]) -> Path {
    let rcs: Vec<RouterContact> = relays.iter().map(|r| r.rc().clone()).collect();
    let (built_tx, built_rx) = oneshot::channel();
    let path = client
        .build_path(
            rcs,
            Some(Box::new(move |result| {
                built_tx.send(result).ok();
            })),
        )
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), built_rx)
        .await
        .expect("build timed out")
        .expect("build hook dropped");
    result.expect("build failed");
    assert!(path.is_ready());
    path
}

#[tokio::test]
async fn build_and_ping_through_three_hops() {
    // construct the network, build client -> A -> B -> C, then ask C's
    // `ping` endpoint for a pong
    let (client, relays) = test_network().await;

    let pivot = &relays[2];
    pivot
        .link_manager()
        .register_handler(
            "ping",
            Arc::new(move |_from, body, responder: Responder| {
                Box::pin(async move {
                    assert_eq!(body, b"hello".to_vec());
                    responder.respond(b"pong".to_vec()).await;
                    Ok(())
                })
            }),
        )
        .await;

    let path = build_established_path(&client, &relays).await;
    assert_eq!(path.pivot_rid(), pivot.rid());

    let (reply_tx, reply_rx) = oneshot::channel();
    let hook: ControlHook = Box::new(move |result| {
        reply_tx.send(result).ok();
    });
    path.send_path_control("ping", b"hello".to_vec(), Some(hook)).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(10), reply_rx)
        .await
        .expect("reply timed out")
        .expect("reply hook dropped");
    match reply {
        ControlResult::Response(body) => assert_eq!(body, b"pong".to_vec()),
        other => panic!("unexpected reply: {:?}", other),
    }

    // every relay holds exactly one transit record for this path
    for relay in &relays {
        let (_paths, transit) = relay.path_context().len();
        assert_eq!(transit, 1);
    }
}

#[tokio::test]
async fn build_with_expired_pivot_contact_fails_early() {
    // the last hop's contact expired an hour ago: the build must fail
    // locally, before any frame reaches the first relay
    let (client, relays) = test_network().await;

    let stale_identity = LocalIdentity::new_random();
    let stale_rc = RouterContact::new_signed(
        &stale_identity.signing_key,
        stale_identity.enc_sk.public_key(),
        "203.0.113.9:9000".parse().unwrap(),
        unix_now() - 2 * 3600 - 60,
    );

    let rcs = vec![relays[0].rc().clone(), relays[1].rc().clone(), stale_rc];
    let (built_tx, built_rx) = oneshot::channel();
    let path = client
        .build_path(
            rcs,
            Some(Box::new(move |result| {
                built_tx.send(result).ok();
            })),
        )
        .await
        .unwrap();

    let result = built_rx.await.expect("build hook dropped");
    assert_eq!(result, Err(ErrorKind::Expired));
    assert_eq!(path.status(), PathStatus::Failed);

    // nothing was dialled
    assert!(!client.link_manager().have_conn(&relays[0].rid()).await);
}

#[tokio::test]
async fn rebuild_keeps_relays_and_works() {
    let (client, relays) = test_network().await;
    let path = build_established_path(&client, &relays).await;

    let (built_tx, built_rx) = oneshot::channel();
    let rebuilt = client
        .rebuild_path(
            &path,
            Some(Box::new(move |result| {
                built_tx.send(result).ok();
            })),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), built_rx)
        .await
        .expect("rebuild timed out")
        .expect("rebuild hook dropped")
        .expect("rebuild failed");

    assert!(rebuilt.is_ready());
    for (old, new) in path.hops().iter().zip(rebuilt.hops()) {
        assert_eq!(old.rc.rid, new.rc.rid);
        assert_ne!(old.rx, new.rx);
        assert_ne!(old.tx, new.tx);
        assert_ne!(old.shared, new.shared);
    }

    // both paths stay routable
    let (_paths, transit) = relays[0].path_context().len();
    assert_eq!(transit, 2);
}

#[tokio::test]
async fn datagrams_reach_the_pivot_endpoint() {
    let (client, relays) = test_network().await;

    let (endpoint, mut delivered_rx) = EmbeddedEndpoint::new();
    relays[2].set_endpoint(Endpoint::Embedded(endpoint)).await;

    let path = build_established_path(&client, &relays).await;

    assert!(path.send_path_data(b"through the onion".to_vec()).await.unwrap());

    let (sender, body) = tokio::time::timeout(Duration::from_secs(10), delivered_rx.next())
        .await
        .expect("datagram timed out")
        .expect("endpoint channel closed");
    assert_eq!(sender, client.rid());
    assert_eq!(body, b"through the onion".to_vec());
}

#[tokio::test]
async fn latency_probe_round_trips() {
    let (client, relays) = test_network().await;
    let path = build_established_path(&client, &relays).await;

    assert!(path.latency().is_none());
    path.probe_latency().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while path.latency().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("probe never completed");
}

#[tokio::test]
async fn dropping_a_path_cancels_inflight_requests_once() {
    let (client, relays) = test_network().await;

    // an endpoint that accepts requests and never answers
    relays[2]
        .link_manager()
        .register_handler(
            "blackhole",
            Arc::new(move |_from, _body, _responder: Responder| Box::pin(async move { Ok(()) })),
        )
        .await;

    let path = build_established_path(&client, &relays).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_c = fired.clone();
    let hook: ControlHook = Box::new(move |result| {
        assert!(matches!(result, ControlResult::Cancelled));
        fired_c.fetch_add(1, Ordering::SeqCst);
    });
    path.send_path_control("blackhole", b"x".to_vec(), Some(hook)).await.unwrap();

    // let the request reach the pivot, then drop the path under it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(path.pending_count(), 1);
    client.path_context().drop_path(&path);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(path.pending_count(), 0);

    // a late reply or timeout must not fire the hook again
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unestablished_path_refuses_traffic() {
    let (client, relays) = test_network().await;
    let rcs: Vec<RouterContact> = relays.iter().map(|r| r.rc().clone()).collect();

    let (path, _outer) = Path::prepare(
        rcs,
        veil_core::path::DEFAULT_LIFETIME,
        client.link_manager().clone(),
    )
    .unwrap();

    let res = path.send_path_control("ping", Vec::new(), None).await;
    assert!(res.is_err());
    let res = path.send_path_data(Vec::new()).await;
    assert!(res.is_err());
}
