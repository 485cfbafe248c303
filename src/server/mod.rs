//! Server side: the acceptor loop and the server's envelope dispatcher.
//!
//! Accepted streams become stream endpoints immediately, but only enter
//! the route table once the client's first Ping identifies which VIP
//! (and which of its parallel streams) the connection belongs to.

pub mod routes;

use crate::codec::envelope::{Envelope, envelope::Type};
use crate::config::Config;
use crate::crypto::Cipher;
use crate::device::PacketIo;
use crate::server::routes::{RouteTable, SWEEP_INTERVAL};
use crate::transport::{Dispatch, StreamEndpoint};
use async_trait::async_trait;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Server {
    listen_addr: String,
    nodelay: bool,
    cipher: Option<Cipher>,
    dispatch: Arc<dyn Dispatch>,
    routes: Arc<RouteTable>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(
        config: &Config,
        cipher: Option<Cipher>,
        dispatch: Arc<dyn Dispatch>,
        routes: Arc<RouteTable>,
    ) -> Server {
        Server {
            listen_addr: config.listen.clone(),
            nodelay: config.nodelay,
            cipher,
            dispatch,
            routes,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token observed by the accept loop and the sweeper; hand it to
    /// `spawn_sweeper` so `stop` tears both down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting connections and releases the bound address. Live
    /// endpoints are untouched; they die with their streams.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Binds the listen address and accepts connections until `stop` is
    /// called. Each accepted stream gets its own endpoint; when the
    /// endpoint's tasks terminate it is pulled out of the route table.
    pub async fn listen_and_serve(&self) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("server listening on {}", self.listen_addr);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(
                        "server new accept from {}, {} endpoints registered",
                        peer,
                        self.routes.endpoint_count()
                    );
                    if let Err(e) = stream.set_nodelay(self.nodelay) {
                        tracing::warn!("set nodelay for {} fail: {}", peer, e);
                    }
                    match StreamEndpoint::spawn(stream, self.cipher.clone(), self.dispatch.clone())
                    {
                        Ok((endpoint, done)) => {
                            let routes = self.routes.clone();
                            let id = endpoint.id();
                            tokio::spawn(async move {
                                let _ = done.await;
                                let removed = routes.remove(id);
                                tracing::info!(
                                    "conn from {} closed, removed from route table: {}, {} endpoints left",
                                    peer,
                                    removed,
                                    routes.endpoint_count()
                                );
                            });
                        }
                        Err(e) => tracing::warn!("conn from {} setup fail: {}", peer, e),
                    }
                }
                Err(e) => {
                    tracing::warn!("server accept fail: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        tracing::info!("server listener on {} stopped", self.listen_addr);
        Ok(())
    }
}

/// Periodically drops closed endpoints from the route table, bounding
/// how long a stale entry can linger after lazy eviction misses it.
/// Runs until `shutdown` is cancelled.
pub fn spawn_sweeper(routes: Arc<RouteTable>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::info!("start to clean route");
                    let removed = routes.sweep();
                    if removed > 0 {
                        tracing::info!(
                            "swept {} dead endpoints, {} remain",
                            removed,
                            routes.endpoint_count()
                        );
                    }
                }
            }
        }
        tracing::debug!("route sweeper stopped");
    })
}

/// The server's envelope handler: Pings teach the route table, Packets
/// go to the local TUN device.
pub struct ServerDispatch {
    routes: Arc<RouteTable>,
    device: Arc<dyn PacketIo>,
}

impl ServerDispatch {
    pub fn new(routes: Arc<RouteTable>, device: Arc<dyn PacketIo>) -> ServerDispatch {
        ServerDispatch { routes, device }
    }
}

#[async_trait]
impl Dispatch for ServerDispatch {
    async fn on_envelope(&self, data: &[u8], from: &Arc<StreamEndpoint>) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                // framing was valid, so the stream stays open
                tracing::error!("proto unmarshal err from {}: {}", from.peer_addr(), e);
                return;
            }
        };

        match envelope.r#type {
            Some(Type::Ping(ping)) => {
                let fresh = self.routes.register(&ping.ip, &ping.local_addr, from.clone());
                if fresh {
                    tracing::info!(
                        "route learned: {} via {} ({}), {} endpoints total",
                        ping.ip,
                        ping.local_addr,
                        from.peer_addr(),
                        self.routes.endpoint_count()
                    );
                }
                tracing::debug!("ping from {} ({})", ping.local_addr, ping.ip);
                tracing::debug!("route table: {:?}", self.routes.snapshot());
            }
            Some(Type::Packet(packet)) => {
                if let Err(e) = self.device.send(&packet.payload).await {
                    tracing::error!("write device fail: {}", e);
                }
            }
            None => tracing::warn!("envelope without type from {}", from.peer_addr()),
        }
    }
}
