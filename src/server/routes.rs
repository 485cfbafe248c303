//! Route table
//!
//! Maps a client VIP to the set of live stream endpoints through which
//! that VIP is reachable. One client opening N parallel streams yields
//! N entries under its VIP; dispatch picks among them uniformly at
//! random. Entries go stale when an endpoint dies and are corrected
//! lazily during lookup or by the periodic sweeper, so a dead endpoint
//! survives at most one sweep interval.
//!
//! A single mutex guards both indices. Critical sections only touch the
//! hash maps; the guard is not `Send`, so holding it across stream I/O
//! does not compile.

use crate::transport::StreamEndpoint;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How often the sweeper walks the table.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RouteInner {
    /// vip -> stream id -> endpoint
    routes: HashMap<String, HashMap<String, Arc<StreamEndpoint>>>,
    /// endpoint id -> (vip, stream id), for removal without a scan
    reverse: HashMap<u64, (String, String)>,
}

pub struct RouteTable {
    inner: Mutex<RouteInner>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable {
            inner: Mutex::new(RouteInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouteInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts `endpoint` as a path to `vip`, keyed by the client's
    /// per-stream identifier. Repeated pings from the same stream
    /// re-register in place.
    ///
    /// # Returns
    /// `true` when the stream id was not registered before.
    pub fn register(&self, vip: &str, stream_id: &str, endpoint: Arc<StreamEndpoint>) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .reverse
            .insert(endpoint.id(), (vip.to_string(), stream_id.to_string()));
        inner
            .routes
            .entry(vip.to_string())
            .or_default()
            .insert(stream_id.to_string(), endpoint)
            .is_none()
    }

    /// Picks a live endpoint for `vip` uniformly at random.
    ///
    /// Closed endpoints encountered during selection are evicted and
    /// the draw retried; `None` means no live path remains.
    pub fn lookup(&self, vip: &str) -> Option<Arc<StreamEndpoint>> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut found = None;
        let mut emptied = false;
        if let Some(set) = inner.routes.get_mut(vip) {
            while found.is_none() && !set.is_empty() {
                let keys: Vec<String> = set.keys().cloned().collect();
                let pick = &keys[rand::rng().random_range(0..keys.len())];
                let dead = match set.get(pick) {
                    Some(endpoint) if !endpoint.is_closed() => {
                        found = Some(endpoint.clone());
                        None
                    }
                    Some(endpoint) => Some(endpoint.id()),
                    None => None,
                };
                if let Some(id) = dead {
                    set.remove(pick);
                    inner.reverse.remove(&id);
                    tracing::info!("remove dead conn {} from route {}", pick, vip);
                }
            }
            emptied = set.is_empty();
        }
        if emptied {
            inner.routes.remove(vip);
        }
        found
    }

    /// Removes an endpoint from both indices, via the reverse index.
    /// Used when a connection's tasks have terminated.
    pub fn remove(&self, endpoint_id: u64) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some((vip, stream_id)) = inner.reverse.remove(&endpoint_id) else {
            return false;
        };
        let mut emptied = false;
        if let Some(set) = inner.routes.get_mut(&vip) {
            set.remove(&stream_id);
            emptied = set.is_empty();
        }
        if emptied {
            inner.routes.remove(&vip);
        }
        true
    }

    /// Drops every endpoint whose `closed` flag is set.
    ///
    /// # Returns
    /// How many endpoints were removed.
    pub fn sweep(&self) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut dead = Vec::new();
        for (vip, set) in &inner.routes {
            for (stream_id, endpoint) in set {
                if endpoint.is_closed() {
                    dead.push((vip.clone(), stream_id.clone(), endpoint.id()));
                }
            }
        }

        for (vip, stream_id, id) in &dead {
            inner.reverse.remove(id);
            let mut emptied = false;
            if let Some(set) = inner.routes.get_mut(vip) {
                set.remove(stream_id);
                emptied = set.is_empty();
            }
            if emptied {
                inner.routes.remove(vip);
            }
            tracing::info!("remove dead conn {} from route {}", stream_id, vip);
        }
        dead.len()
    }

    /// Total number of registered endpoints across all VIPs.
    pub fn endpoint_count(&self) -> usize {
        self.lock().routes.values().map(|set| set.len()).sum()
    }

    /// The table as `vip -> stream ids`, for logging.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.lock()
            .routes
            .iter()
            .map(|(vip, set)| (vip.clone(), set.keys().cloned().collect()))
            .collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
