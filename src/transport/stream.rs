//! Stream endpoint
//!
//! One established TCP stream plus the pair of tasks that service it:
//! a reader task that decodes records and hands envelopes to the
//! dispatch handler, and a writer task that drains a small bounded
//! outbound queue through the record framer. The queue is deliberately
//! tiny so a slow peer backpressures the TUN pump instead of buffering
//! latency.
//!
//! Either task failing flips the shared `closed` flag and cancels the
//! other; the endpoint counts as closed once both have unwound.

use crate::codec::record::{RecordReader, RecordWriter};
use crate::crypto::Cipher;
use crate::transport::Dispatch;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per endpoint. Small on purpose: the queue is a
/// backpressure signal, not a buffer.
pub const OUTBOUND_QUEUE: usize = 2;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

pub struct StreamEndpoint {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    writer: Arc<Mutex<RecordWriter<OwnedWriteHalf>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl StreamEndpoint {
    /// Wraps an established stream and spawns its reader and writer
    /// tasks.
    ///
    /// # Returns
    /// The endpoint handle plus a join handle that completes once both
    /// tasks have terminated, i.e. once the endpoint is fully closed.
    pub fn spawn(
        stream: TcpStream,
        cipher: Option<Cipher>,
        dispatch: Arc<dyn Dispatch>,
    ) -> crate::Result<(Arc<StreamEndpoint>, JoinHandle<()>)> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let endpoint = Arc::new(StreamEndpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            outbound_tx,
            writer: Arc::new(Mutex::new(RecordWriter::new(write_half, cipher.clone()))),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let reader = tokio::spawn(Self::read_loop(
            endpoint.clone(),
            RecordReader::new(read_half, cipher),
            dispatch,
        ));
        let writer = tokio::spawn(Self::write_loop(endpoint.clone(), outbound_rx));

        let done = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                let _ = reader.await;
                let _ = writer.await;
                tracing::debug!("endpoint {} to {} stopped", endpoint.id, endpoint.peer_addr);
            }
        });

        Ok((endpoint, done))
    }

    async fn read_loop(
        endpoint: Arc<StreamEndpoint>,
        mut reader: RecordReader<OwnedReadHalf>,
        dispatch: Arc<dyn Dispatch>,
    ) {
        loop {
            tokio::select! {
                _ = endpoint.cancel.cancelled() => break,
                result = reader.read_record() => {
                    match result {
                        Ok(data) => dispatch.on_envelope(data, &endpoint).await,
                        Err(e) => {
                            tracing::debug!("read from {} fail: {}", endpoint.peer_addr, e);
                            break;
                        }
                    }
                }
            }
        }
        endpoint.close();
    }

    async fn write_loop(endpoint: Arc<StreamEndpoint>, mut outbound_rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            tokio::select! {
                _ = endpoint.cancel.cancelled() => break,
                message = outbound_rx.recv() => {
                    let Some(data) = message else { break };
                    let mut writer = endpoint.writer.lock().await;
                    if let Err(e) = writer.write_record(&data).await {
                        tracing::debug!("write to {} fail: {}", endpoint.peer_addr, e);
                        break;
                    }
                }
            }
        }
        endpoint.close();
        endpoint.writer.lock().await.shutdown().await;
    }

    /// Queues an envelope for transmission, waiting while the queue is
    /// full. This is the normal path for tunneled packets.
    pub async fn send(&self, data: Vec<u8>) -> crate::Result<()> {
        if self.is_closed() {
            return Err("endpoint closed".into());
        }
        self.outbound_tx
            .send(data)
            .await
            .map_err(|_| "outbound queue closed")?;
        Ok(())
    }

    /// Writes an envelope through the framer immediately, bypassing the
    /// queue. Used for heartbeats, where the caller wants the error.
    pub async fn send_now(&self, data: &[u8]) -> crate::Result<()> {
        if self.is_closed() {
            return Err("endpoint closed".into());
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_record(data).await {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    /// Flags the endpoint closed and cancels both tasks. Idempotent;
    /// safe to call from either task or from outside.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
