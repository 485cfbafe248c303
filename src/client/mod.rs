//! Client side: the stream pool, reconnect loops, heartbeats, and the
//! client's envelope dispatcher.
//!
//! The pool opens `transport_threads` parallel streams to the server
//! and spreads user traffic across them round-robin. Each slot runs its
//! own connect loop: when a stream dies its endpoint is discarded,
//! queued envelopes with it, and a fresh endpoint is dialed after a
//! short delay. The heartbeat task announces every live stream to the
//! server once per interval, which is what makes the client routable.

use crate::codec::envelope::{Envelope, Ping, envelope::Type};
use crate::config::Config;
use crate::crypto::Cipher;
use crate::device::PacketIo;
use crate::transport::{Dispatch, StreamEndpoint};
use async_trait::async_trait;
use prost::Message;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay between reconnect attempts of one slot.
const RECONNECT_DELAY: Duration = Duration::from_millis(1000);
/// Startup budget: how many times to poll for all slots being up.
const CONNECT_WAIT_ATTEMPTS: usize = 10;
const CONNECT_WAIT_DELAY: Duration = Duration::from_millis(500);
/// How often every live stream announces itself to the server.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

#[inline]
fn now_timestamp_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// One pool slot: a stream to the server that is re-dialed whenever it
/// dies, until the slot is shut down.
pub struct ClientStream {
    index: usize,
    remote_addr: String,
    nodelay: bool,
    cipher: Option<Cipher>,
    current: Mutex<Option<Arc<StreamEndpoint>>>,
    shutdown: CancellationToken,
}

impl ClientStream {
    fn new(index: usize, remote_addr: String, nodelay: bool, cipher: Option<Cipher>) -> Self {
        Self {
            index,
            remote_addr,
            nodelay,
            cipher,
            current: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// The slot's live endpoint, if it is connected and not closed.
    pub fn endpoint(&self) -> Option<Arc<StreamEndpoint>> {
        let guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().filter(|ep| !ep.is_closed()).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint().is_some()
    }

    fn set_current(&self, endpoint: Option<Arc<StreamEndpoint>>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = endpoint;
    }

    async fn run(self: Arc<Self>, dispatch: Arc<dyn Dispatch>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let connect = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = TcpStream::connect(&self.remote_addr) => result,
            };

            match connect {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(self.nodelay) {
                        tracing::warn!("thread {} set nodelay fail: {}", self.index, e);
                    }
                    match StreamEndpoint::spawn(stream, self.cipher.clone(), dispatch.clone()) {
                        Ok((endpoint, mut done)) => {
                            tracing::info!(
                                "thread {} connected to {} from {}",
                                self.index,
                                self.remote_addr,
                                endpoint.local_addr()
                            );
                            self.set_current(Some(endpoint.clone()));
                            tokio::select! {
                                _ = self.shutdown.cancelled() => {
                                    endpoint.close();
                                    let _ = (&mut done).await;
                                }
                                _ = &mut done => {}
                            }
                            self.set_current(None);
                            tracing::warn!(
                                "thread {} disconnected from {}",
                                self.index,
                                self.remote_addr
                            );
                        }
                        Err(e) => {
                            tracing::warn!("thread {} endpoint setup fail: {}", self.index, e)
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "thread {} connect {} fail: {}",
                        self.index,
                        self.remote_addr,
                        e
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        if let Some(endpoint) = self.endpoint() {
            endpoint.close();
        }
        tracing::debug!("thread {} stopped", self.index);
    }
}

/// The pool of parallel streams to one server.
pub struct ClientPool {
    streams: Vec<Arc<ClientStream>>,
    serial: AtomicU64,
    vip: Ipv4Addr,
    shutdown: CancellationToken,
}

impl ClientPool {
    pub fn new(config: &Config, cipher: Option<Cipher>) -> crate::Result<Arc<ClientPool>> {
        let vip = config.vip()?;
        let threads = config.transport_threads.max(1);
        let streams = (0..threads)
            .map(|index| {
                Arc::new(ClientStream::new(
                    index,
                    config.remote_addrs.clone(),
                    config.nodelay,
                    cipher.clone(),
                ))
            })
            .collect();
        Ok(Arc::new(ClientPool {
            streams,
            serial: AtomicU64::new(0),
            vip,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Spawns every slot's connect loop.
    pub fn start(&self, dispatch: Arc<dyn Dispatch>) {
        for stream in &self.streams {
            tokio::spawn(stream.clone().run(dispatch.clone()));
        }
    }

    /// Waits up to the startup budget for all slots to connect. Slots
    /// still down afterwards keep retrying in the background; traffic
    /// round-robined onto them is dropped until they come up.
    pub async fn connect_wait(&self) {
        for _ in 0..CONNECT_WAIT_ATTEMPTS {
            if self.streams.iter().all(|s| s.is_connected()) {
                return;
            }
            tokio::time::sleep(CONNECT_WAIT_DELAY).await;
        }
        for stream in &self.streams {
            if !stream.is_connected() {
                tracing::warn!(
                    "thread {} still not connected to {}, will keep retrying",
                    stream.index,
                    stream.remote_addr
                );
            }
        }
    }

    fn next_slot(&self) -> usize {
        self.serial.fetch_add(1, Ordering::Relaxed) as usize % self.streams.len()
    }

    /// Queues an encoded envelope on the next slot in round-robin
    /// order. A slot without a live stream drops the envelope; the
    /// following send picks the next slot.
    pub async fn send(&self, data: Vec<u8>) {
        let slot = self.next_slot();
        match self.streams[slot].endpoint() {
            Some(endpoint) => {
                if let Err(e) = endpoint.send(data).await {
                    tracing::warn!("thread {} send fail: {}", slot, e);
                }
            }
            None => tracing::debug!("thread {} not connected, packet dropped", slot),
        }
    }

    /// Wraps one IP packet in a `Packet` envelope and sends it.
    pub async fn send_packet(&self, packet: &[u8]) {
        self.send(Envelope::encode_packet(packet)).await;
    }

    /// Announces every live stream to the server, identifying each by
    /// `"{vip}:{local-port}"` so parallel streams of one client stay
    /// distinguishable on the server.
    async fn send_ping(&self) {
        for stream in &self.streams {
            let Some(endpoint) = stream.endpoint() else {
                continue;
            };
            let data = Envelope::encode_ping(Ping {
                timestamp: now_timestamp_ns(),
                local_addr: format!("{}:{}", self.vip, endpoint.local_addr().port()),
                local_private_addr: "not_use".to_string(),
                dc: "client".to_string(),
                ip: self.vip.to_string(),
            });
            if let Err(e) = endpoint.send_now(&data).await {
                tracing::warn!("thread {} heartbeat fail: {}", stream.index, e);
            }
        }
    }

    /// Runs the heartbeat ticker until the pool is stopped. The first
    /// ping goes out immediately, which is what registers the client's
    /// routes on the server.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.send_ping().await,
                }
            }
        })
    }

    /// Stops heartbeats, reconnect loops, and every live endpoint.
    pub fn stop(&self) {
        self.shutdown.cancel();
        for stream in &self.streams {
            stream.shutdown.cancel();
            if let Some(endpoint) = stream.endpoint() {
                endpoint.close();
            }
        }
    }
}

/// The client's envelope handler: Packets go to the local TUN device,
/// Pings are ignored since the server owns the route table.
pub struct ClientDispatch {
    device: Arc<dyn PacketIo>,
}

impl ClientDispatch {
    pub fn new(device: Arc<dyn PacketIo>) -> ClientDispatch {
        ClientDispatch { device }
    }
}

#[async_trait]
impl Dispatch for ClientDispatch {
    async fn on_envelope(&self, data: &[u8], from: &Arc<StreamEndpoint>) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("proto unmarshal err from {}: {}", from.peer_addr(), e);
                return;
            }
        };

        match envelope.r#type {
            Some(Type::Packet(packet)) => {
                if let Err(e) = self.device.send(&packet.payload).await {
                    tracing::error!("write device fail: {}", e);
                }
            }
            Some(Type::Ping(_)) => {}
            None => tracing::warn!("envelope without type from {}", from.peer_addr()),
        }
    }
}
