mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{FakeNetwork, Reply, client, client_with, seeded_backend, seeded_backend_with_offset};
use ferry_client::{ConnectionState, InvocationError, SessionBackend};
use ferry_tl::mtproto::Ping;
use ferry_tl::{Blob, RawRequest};
use tokio::time::{Instant, sleep};

fn request() -> RawRequest {
    RawRequest(0x0badf00du32.to_le_bytes().to_vec())
}

fn answer() -> Vec<u8> {
    0x997275b5u32.to_le_bytes().to_vec()
}

/// Answers `request()` with `script[n]` on its n-th arrival, then with `answer()`.
fn scripted(script: Vec<Reply>) -> (Arc<FakeNetwork>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let script = std::sync::Mutex::new(script.into_iter());
    let network = FakeNetwork::new(move |_, body| {
        if body != request().0 {
            return Reply::Silent;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        script.lock().unwrap().next().unwrap_or(Reply::Ok(answer()))
    });
    (network, calls)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    while !done() {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn stored_key_reaches_ready_and_answers_pings() {
    let network = FakeNetwork::new(|_, _| Reply::Silent);
    let client = client(network, seeded_backend()).await;

    let pong = client.invoke(&Ping { ping_id: 42 }).await.unwrap();
    assert_eq!(pong.ping_id, 42);
    assert_eq!(client.connection_state(1).await, Some(ConnectionState::Ready));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn flood_wait_is_slept_and_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let network = FakeNetwork::new(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Reply::Err(420, "FLOOD_WAIT_5")
        } else {
            Reply::Ok(answer())
        }
    });
    let client = client(network, seeded_backend()).await;

    let start = Instant::now();
    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_secs(5));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn consecutive_short_flood_waits_are_all_slept() {
    let (network, calls) = scripted(vec![
        Reply::Err(420, "FLOOD_WAIT_5"),
        Reply::Err(420, "FLOOD_WAIT_5"),
    ]);
    let client = client(network, seeded_backend()).await;

    let start = Instant::now();
    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_secs(10));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn flood_threshold_comes_from_config() {
    let (network, calls) = scripted(vec![Reply::Err(420, "FLOOD_WAIT_90")]);
    let client = client_with(network, seeded_backend(), |config| {
        config.flood_sleep_threshold = Duration::from_secs(120);
    })
    .await;

    let start = Instant::now();
    client.invoke(&request()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_secs(90));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn zero_threshold_returns_every_flood_wait() {
    let (network, calls) = scripted(vec![Reply::Err(420, "FLOOD_WAIT_5")]);
    let client = client_with(network, seeded_backend(), |config| {
        config.flood_sleep_threshold = Duration::ZERO;
    })
    .await;

    let err = client.invoke(&request()).await.unwrap_err();
    assert_eq!(err.flood_wait_seconds(), Some(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn long_flood_wait_is_returned() {
    let network = FakeNetwork::new(|_, _| Reply::Err(420, "FLOOD_WAIT_3600"));
    let client = client(network.clone(), seeded_backend()).await;

    let err = client.invoke(&request()).await.unwrap_err();
    assert_eq!(err.flood_wait_seconds(), Some(3600));
    assert_eq!(network.seen(), 1);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn phone_migration_moves_home_and_persists_it() {
    let network = FakeNetwork::new(|addr, _| match addr {
        "dc1" => Reply::Err(303, "PHONE_MIGRATE_2"),
        _ => Reply::Ok(answer()),
    });
    let backend = seeded_backend();
    let client = client(network.clone(), backend.clone()).await;

    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(client.home_dc_id().await, 2);
    assert_eq!(backend.load().unwrap().unwrap().home_dc_id, 2);

    // Later calls go straight to the new home.
    client.invoke(&request()).await.unwrap();
    let addrs: Vec<String> = network.log().into_iter().map(|s| s.addr).collect();
    assert_eq!(addrs, ["dc1", "dc2", "dc2"]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn file_migration_leaves_home_alone() {
    let network = FakeNetwork::new(|addr, _| match addr {
        "dc1" => Reply::Err(303, "FILE_MIGRATE_2"),
        _ => Reply::Ok(answer()),
    });
    let client = client(network, seeded_backend()).await;

    client.invoke(&request()).await.unwrap();
    assert_eq!(client.home_dc_id().await, 1);
    assert_eq!(client.connection_state(2).await, Some(ConnectionState::Ready));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn other_rpc_errors_surface_verbatim() {
    let network = FakeNetwork::new(|_, _| Reply::Err(400, "PEER_ID_INVALID"));
    let client = client(network, seeded_backend()).await;

    match client.invoke(&request()).await {
        Err(InvocationError::Rpc(rpc)) => {
            assert_eq!(rpc.code, 400);
            assert_eq!(rpc.name, "PEER_ID_INVALID");
            assert_eq!(rpc.value, None);
        }
        other => panic!("unexpected {other:?}"),
    }
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_all_get_their_answers() {
    let network = FakeNetwork::new(|_, body| Reply::Ok(body.to_vec()));
    let client = client(network, seeded_backend()).await;

    let handles: Vec<_> = (0u32..8)
        .map(|i| client.call(&RawRequest(i.to_le_bytes().to_vec())))
        .collect();
    for (i, handle) in (0u32..).zip(handles) {
        let Blob(body) = handle.await.unwrap();
        assert_eq!(body, i.to_le_bytes());
    }
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_every_pending_call() {
    let network = FakeNetwork::new(|_, _| Reply::Silent);
    let client = client(network.clone(), seeded_backend()).await;

    let handles: Vec<_> = (0..3).map(|_| client.call(&request())).collect();
    wait_until(|| network.seen() == 3).await;

    client.disconnect().await;
    for handle in handles {
        assert!(matches!(handle.await, Err(InvocationError::ConnectionClosed)));
    }
    assert_eq!(client.connection_state(1).await, Some(ConnectionState::Closed));
    assert!(matches!(client.invoke(&request()).await, Err(InvocationError::ConnectionClosed)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_and_timed_out_calls_leave_the_connection_usable() {
    let network = FakeNetwork::new(|_, body| {
        if body == 1u32.to_le_bytes() { Reply::Ok(answer()) } else { Reply::Silent }
    });
    let client = client(network.clone(), seeded_backend()).await;

    let stuck = client.call(&request());
    wait_until(|| network.seen() == 1).await;
    client.cancel(&stuck);
    assert!(matches!(stuck.await, Err(InvocationError::Cancelled)));

    let slow = client.call_with_timeout(&request(), Duration::from_secs(2));
    assert!(matches!(slow.await, Err(InvocationError::Timeout)));

    let Blob(body) = client.invoke(&RawRequest(1u32.to_le_bytes().to_vec())).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(client.connection_state(1).await, Some(ConnectionState::Ready));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_dc_is_an_error() {
    let network = FakeNetwork::new(|_, _| Reply::Silent);
    let client = client(network, seeded_backend()).await;

    assert!(matches!(
        client.invoke_on_dc(7, &request()).await,
        Err(InvocationError::UnknownDc(7))
    ));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn bad_server_salt_is_resent_with_the_new_salt() {
    let (network, calls) = scripted(vec![Reply::BadSalt(0x777)]);
    let client = client(network.clone(), seeded_backend()).await;

    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let salts: Vec<i64> = network.log().into_iter().map(|s| s.salt).collect();
    assert_eq!(salts, [0x1234, 0x777]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn msg_id_too_low_is_resent() {
    let (network, calls) = scripted(vec![Reply::BadMsg(16)]);
    let client = client(network, seeded_backend()).await;

    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_bad_msg_fails_the_call() {
    let (network, _) = scripted(vec![Reply::BadMsg(64)]);
    let client = client(network, seeded_backend()).await;

    assert!(matches!(
        client.invoke(&request()).await,
        Err(InvocationError::BadMessage { code: 64 })
    ));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn new_session_resends_earlier_calls() {
    let (network, calls) = scripted(vec![Reply::NewSession]);
    let client = client(network, seeded_backend()).await;

    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_link_replays_the_call_after_reconnecting() {
    let (network, calls) = scripted(vec![Reply::HangUp]);
    let client = client(network.clone(), seeded_backend()).await;

    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(network.connects(), 2);
    assert_eq!(client.connection_state(1).await, Some(ConnectionState::Ready));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn stale_stored_clock_is_resynced() {
    let (network, calls) = scripted(Vec::new());
    let client = client_with(network, seeded_backend_with_offset(-60), |config| {
        config.request_timeout = Some(Duration::from_secs(30));
    })
    .await;

    let Blob(body) = client.invoke(&request()).await.unwrap();
    assert_eq!(body, answer());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let offset = client.session().await.dc(1).unwrap().time_offset;
    assert!(offset.abs() <= 1, "offset {offset}");
    client.disconnect().await;
}
