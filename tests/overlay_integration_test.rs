/// Integration tests for the overlay transport
///
/// Covers the following scenarios over loopback TCP, with channel-backed
/// fakes standing in for the TUN device:
/// 1. Route learning from heartbeats and packet delivery in both directions
/// 2. NoRoute before the first heartbeat
/// 3. Key mismatch closing streams without delivering anything
/// 4. Two clients sharing a VIP, with failover to the survivor
/// 5. Bounded outbound queueing against a peer that stops reading
/// 6. Malformed envelopes leaving the stream open
/// 7. Server stop halting the accept loop

use async_trait::async_trait;
use overtun::client::{ClientDispatch, ClientPool};
use overtun::codec::envelope::Envelope;
use overtun::config::Config;
use overtun::crypto::make_cipher;
use overtun::device::PacketIo;
use overtun::server::routes::RouteTable;
use overtun::server::{Server, ServerDispatch};
use overtun::transport::{Dispatch, StreamEndpoint};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;

/// TUN stand-in: everything "written to the device" comes out of a
/// channel, and reads pend forever (the pump is not under test here).
struct FakeTun {
    written_tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl PacketIo for FakeTun {
    async fn recv(&self, _buf: &mut [u8]) -> overtun::Result<usize> {
        std::future::pending().await
    }

    async fn send(&self, buf: &[u8]) -> overtun::Result<usize> {
        let _ = self.written_tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn name(&self) -> &str {
        "tun-fake"
    }
}

struct NoopDispatch;

#[async_trait]
impl Dispatch for NoopDispatch {
    async fn on_envelope(&self, _data: &[u8], _from: &Arc<StreamEndpoint>) {}
}

fn start_server(
    listen: &str,
    key: &str,
) -> (Arc<Server>, Arc<RouteTable>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let config = Config {
        listen: listen.to_string(),
        key: key.to_string(),
        server_mode: true,
        ..Config::default()
    };
    let routes = Arc::new(RouteTable::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatch: Arc<dyn Dispatch> = Arc::new(ServerDispatch::new(
        routes.clone(),
        Arc::new(FakeTun { written_tx: tx }),
    ));
    let server = Arc::new(Server::new(&config, make_cipher(key), dispatch, routes.clone()));
    overtun::server::spawn_sweeper(routes.clone(), server.shutdown_token());
    let acceptor = server.clone();
    tokio::spawn(async move {
        if let Err(e) = acceptor.listen_and_serve().await {
            tracing::error!("test server exited: {}", e);
        }
    });
    (server, routes, rx)
}

async fn start_client(
    remote: &str,
    vip_cidr: &str,
    key: &str,
    threads: usize,
) -> (Arc<ClientPool>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let config = Config {
        remote_addrs: remote.to_string(),
        ip: vip_cidr.to_string(),
        key: key.to_string(),
        transport_threads: threads,
        ..Config::default()
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatch: Arc<dyn Dispatch> = Arc::new(ClientDispatch::new(Arc::new(FakeTun {
        written_tx: tx,
    })));
    let pool = ClientPool::new(&config, make_cipher(key)).unwrap();
    pool.start(dispatch);
    pool.connect_wait().await;
    (pool, rx)
}

/// Polls `predicate` until it holds or the deadline passes.
async fn wait_for(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    predicate()
}

/// A minimal IPv4 packet with the given destination.
fn ipv4_packet(dst: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 20 + body.len()];
    pkt[0] = 0x45;
    pkt[12..16].copy_from_slice(&[10, 4, 4, 3]);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..].copy_from_slice(body);
    pkt
}

#[tokio::test]
async fn test_route_learning_and_delivery() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (_server, routes, mut server_tun) = start_server("127.0.0.1:18081", "shared-key");
    sleep(Duration::from_millis(100)).await;

    let (pool, mut client_tun) =
        start_client("127.0.0.1:18081", "10.4.4.3/24", "shared-key", 1).await;

    // before the first heartbeat the server has no route to the client
    assert_eq!(routes.endpoint_count(), 0);
    assert!(routes.lookup("10.4.4.3").is_none());

    // client -> server works regardless: the payload lands on the server TUN
    let outbound = ipv4_packet([10, 4, 4, 2], b"client to server");
    pool.send_packet(&outbound).await;
    let delivered = tokio::time::timeout(Duration::from_secs(1), server_tun.recv())
        .await
        .expect("packet did not reach server tun")
        .unwrap();
    assert_eq!(delivered, outbound);

    // heartbeat registers the stream; server -> client then succeeds
    pool.spawn_heartbeat();
    assert!(wait_for(Duration::from_secs(2), || routes.endpoint_count() == 1).await);

    let endpoint = routes.lookup("10.4.4.3").expect("route learned from ping");
    let inbound = ipv4_packet([10, 4, 4, 3], b"server to client");
    endpoint
        .send(Envelope::encode_packet(&inbound))
        .await
        .unwrap();
    let delivered = tokio::time::timeout(Duration::from_millis(500), client_tun.recv())
        .await
        .expect("packet did not reach client tun")
        .unwrap();
    assert_eq!(delivered, inbound);

    pool.stop();
}

#[tokio::test]
async fn test_key_mismatch_registers_nothing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (_server, routes, mut server_tun) = start_server("127.0.0.1:18082", "server-key");
    sleep(Duration::from_millis(100)).await;

    let (pool, _client_tun) =
        start_client("127.0.0.1:18082", "10.4.4.3/24", "client-key", 1).await;
    pool.spawn_heartbeat();
    pool.send_packet(&ipv4_packet([10, 4, 4, 2], b"opaque")).await;

    // every record fails authentication, so nothing is ever learned or
    // delivered, while the client keeps reconnecting
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(routes.endpoint_count(), 0);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), server_tun.recv())
            .await
            .is_err()
    );

    pool.stop();
}

#[tokio::test]
async fn test_shared_vip_failover() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (_server, routes, _server_tun) = start_server("127.0.0.1:18083", "shared-key");
    sleep(Duration::from_millis(100)).await;

    // two clients announce the same VIP, e.g. one config on two machines
    let (pool_a, mut tun_a) =
        start_client("127.0.0.1:18083", "10.4.4.3/24", "shared-key", 1).await;
    let (pool_b, mut tun_b) =
        start_client("127.0.0.1:18083", "10.4.4.3/24", "shared-key", 1).await;
    pool_a.spawn_heartbeat();
    pool_b.spawn_heartbeat();
    assert!(wait_for(Duration::from_secs(2), || routes.endpoint_count() == 2).await);

    pool_a.stop();
    assert!(wait_for(Duration::from_secs(3), || routes.endpoint_count() == 1).await);

    // every lookup must return the survivor, and delivery must succeed
    for _ in 0..16 {
        let endpoint = routes.lookup("10.4.4.3").expect("survivor stays routable");
        assert!(!endpoint.is_closed());
    }
    let inbound = ipv4_packet([10, 4, 4, 3], b"to the survivor");
    routes
        .lookup("10.4.4.3")
        .unwrap()
        .send(Envelope::encode_packet(&inbound))
        .await
        .unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(1), tun_b.recv())
        .await
        .expect("packet did not reach surviving client")
        .unwrap();
    assert_eq!(delivered, inbound);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), tun_a.recv())
            .await
            .map(|m| m.is_none())
            .unwrap_or(true)
    );

    pool_b.stop();
}

#[tokio::test]
async fn test_outbound_queue_is_bounded() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    // a peer that accepts the connection and then never reads
    let listener = TcpListener::bind("127.0.0.1:18084").await.unwrap();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(60)).await;
    });

    let stream = TcpStream::connect("127.0.0.1:18084").await.unwrap();
    let (endpoint, _done) = StreamEndpoint::spawn(stream, None, Arc::new(NoopDispatch)).unwrap();

    let sent = Arc::new(AtomicUsize::new(0));
    let counter = sent.clone();
    tokio::spawn(async move {
        loop {
            if endpoint.send(vec![0u8; 60_000]).await.is_err() {
                break;
            }
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    // once the socket buffers fill, sends must stall on the bounded
    // queue instead of accumulating envelopes in memory
    sleep(Duration::from_millis(800)).await;
    let plateau = sent.load(Ordering::Relaxed);
    assert!(plateau < 1000, "queue absorbed {} records", plateau);
    sleep(Duration::from_millis(400)).await;
    let after = sent.load(Ordering::Relaxed);
    assert!(
        after <= plateau + overtun::transport::stream::OUTBOUND_QUEUE + 4,
        "sends kept completing: {} -> {}",
        plateau,
        after
    );
}

#[tokio::test]
async fn test_malformed_envelope_keeps_stream_open() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (_server, routes, _server_tun) = start_server("127.0.0.1:18085", "");
    sleep(Duration::from_millis(100)).await;

    let stream = TcpStream::connect("127.0.0.1:18085").await.unwrap();
    let (endpoint, _done) = StreamEndpoint::spawn(stream, None, Arc::new(NoopDispatch)).unwrap();

    // garbage that frames fine but does not parse as an envelope
    endpoint.send(vec![0xff, 0xff, 0xff, 0xff]).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(!endpoint.is_closed());

    // the same stream still registers with a valid ping afterwards
    endpoint
        .send(Envelope::encode_ping(overtun::codec::envelope::Ping {
            timestamp: 1,
            local_addr: "10.4.4.3:55555".to_string(),
            local_private_addr: "not_use".to_string(),
            dc: "client".to_string(),
            ip: "10.4.4.3".to_string(),
        }))
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(1), || routes.endpoint_count() == 1).await);

    endpoint.close();
}

#[tokio::test]
async fn test_server_stop_halts_accepting() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (server, _routes, _server_tun) = start_server("127.0.0.1:18086", "shared-key");
    sleep(Duration::from_millis(100)).await;

    // accepting before stop
    let stream = TcpStream::connect("127.0.0.1:18086").await.unwrap();
    drop(stream);

    server.stop();

    // once the accept loop exits the listener is released, so new
    // connections are refused
    let start = tokio::time::Instant::now();
    let mut refused = false;
    while start.elapsed() < Duration::from_secs(2) {
        if TcpStream::connect("127.0.0.1:18086").await.is_err() {
            refused = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(refused, "listener still accepting after stop");
}
