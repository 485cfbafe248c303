//! Process wiring and the TUN pump.
//!
//! Brings up the cipher, the TUN device, and either the server stack
//! (acceptor, route table, sweeper) or the client stack (stream pool,
//! heartbeat), then runs the pump workers that move packets between the
//! TUN device and the transport.

use crate::client::{ClientDispatch, ClientPool};
use crate::codec::envelope::Envelope;
use crate::config::Config;
use crate::crypto;
use crate::device::packet::PacketIp;
use crate::device::{PacketIo, TunDevice};
use crate::server::routes::RouteTable;
use crate::server::{self, Server, ServerDispatch};
use crate::transport::Dispatch;
use std::sync::Arc;

/// Concurrent readers on the TUN device. More than one so a single
/// slow downstream write does not stall ingress.
const TUN_WORKERS: usize = 10;

#[derive(Clone)]
enum Forward {
    Server(Arc<RouteTable>),
    Client(Arc<ClientPool>),
}

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> App {
        App { config }
    }

    pub async fn run(&self) -> crate::Result<()> {
        let cipher = crypto::make_cipher(&self.config.key);
        if cipher.is_none() {
            tracing::warn!("encryption disabled, records travel in the clear");
        }

        let device: Arc<dyn PacketIo> = Arc::new(TunDevice::open(&self.config)?);

        let forward = if self.config.server_mode {
            let routes = Arc::new(RouteTable::new());
            let dispatch: Arc<dyn Dispatch> =
                Arc::new(ServerDispatch::new(routes.clone(), device.clone()));
            let acceptor = Server::new(&self.config, cipher, dispatch, routes.clone());
            server::spawn_sweeper(routes.clone(), acceptor.shutdown_token());
            tokio::spawn(async move {
                if let Err(e) = acceptor.listen_and_serve().await {
                    tracing::error!("server listen error: {}", e);
                }
            });
            Forward::Server(routes)
        } else {
            let dispatch: Arc<dyn Dispatch> = Arc::new(ClientDispatch::new(device.clone()));
            let pool = ClientPool::new(&self.config, cipher)?;
            pool.start(dispatch);
            pool.connect_wait().await;
            pool.spawn_heartbeat();
            Forward::Client(pool)
        };

        let mtu = self.config.mtu as usize;
        tracing::info!("pumping {} with {} workers", device.name(), TUN_WORKERS);
        let mut workers = Vec::new();
        for worker in 0..TUN_WORKERS - 1 {
            workers.push(tokio::spawn(pump_worker(
                worker,
                mtu,
                device.clone(),
                forward.clone(),
            )));
        }

        // the last worker runs inline so a dead TUN device fails the process
        let result = pump_worker(TUN_WORKERS - 1, mtu, device, forward).await;
        for worker in workers {
            worker.abort();
        }
        result
    }
}

/// One pump worker: read an IP packet from the TUN device, pick the
/// outbound stream, enqueue the encapsulated packet. Per-stream errors
/// drop the packet; a TUN read error is fatal.
async fn pump_worker(
    worker: usize,
    mtu: usize,
    device: Arc<dyn PacketIo>,
    forward: Forward,
) -> crate::Result<()> {
    let mut pkt = PacketIp::new(mtu);
    loop {
        let n = match device.recv(pkt.buf_mut()).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("worker {} read tun fail: {}", worker, e);
                return Err(e);
            }
        };
        pkt.set_len(n);

        if pkt.invalid() || pkt.version() != 4 {
            tracing::debug!("worker {} drop non-ipv4 packet of {} bytes", worker, n);
            continue;
        }

        let dst = pkt.dst().to_string();
        tracing::debug!(
            "worker {} got tun packet {} -> {} len {}",
            worker,
            pkt.src(),
            dst,
            n
        );

        match &forward {
            Forward::Server(routes) => match routes.lookup(&dst) {
                Some(endpoint) => {
                    let data = Envelope::encode_packet(pkt.bytes());
                    if let Err(e) = endpoint.send(data).await {
                        tracing::warn!("worker {} send to {} fail: {}", worker, dst, e);
                    }
                }
                None => {
                    tracing::info!(
                        "worker {} no route {} -> {}, packet dropped",
                        worker,
                        pkt.src(),
                        dst
                    );
                }
            },
            Forward::Client(pool) => pool.send_packet(pkt.bytes()).await,
        }
    }
}
