//! Connection admission.
//!
//! [`ConnectionTracker`] caps concurrent sockets globally and per remote IP.
//! A slot is held by a [`ConnectionGuard`] for the lifetime of the socket
//! task and released on drop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use crate::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_IP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitExceeded {
    #[error("total connection limit reached")]
    TotalLimit,
    #[error("per-IP connection limit reached")]
    PerIpLimit,
}

struct TrackerInner {
    total: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    max_connections: usize,
    max_per_ip: usize,
}

#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                total: AtomicUsize::new(0),
                per_ip: Mutex::new(HashMap::new()),
                max_connections,
                max_per_ip,
            }),
        }
    }

    /// Reserve a slot for `ip`. Loopback peers skip the per-IP cap but still
    /// count towards the total.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, LimitExceeded> {
        let inner = &self.inner;

        // Optimistic increment, rolled back on rejection.
        let prev = inner.total.fetch_add(1, Ordering::SeqCst);
        if prev >= inner.max_connections {
            inner.total.fetch_sub(1, Ordering::SeqCst);
            return Err(LimitExceeded::TotalLimit);
        }

        let per_ip_counted = !ip.is_loopback();
        if per_ip_counted {
            let mut map = inner.per_ip.lock();
            let count = map.entry(ip).or_insert(0);
            if *count >= inner.max_per_ip {
                if *count == 0 {
                    map.remove(&ip);
                }
                inner.total.fetch_sub(1, Ordering::SeqCst);
                return Err(LimitExceeded::PerIpLimit);
            }
            *count += 1;
        }

        Ok(ConnectionGuard {
            tracker: Arc::clone(&self.inner),
            ip,
            per_ip_counted,
        })
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn count_for(&self, ip: IpAddr) -> usize {
        self.inner.per_ip.lock().get(&ip).copied().unwrap_or(0)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_IP)
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("total", &self.total())
            .field("max_connections", &self.inner.max_connections)
            .field("max_per_ip", &self.inner.max_per_ip)
            .finish()
    }
}

pub struct ConnectionGuard {
    tracker: Arc<TrackerInner>,
    ip: IpAddr,
    per_ip_counted: bool,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.total.fetch_sub(1, Ordering::SeqCst);

        if self.per_ip_counted {
            let mut map = self.tracker.per_ip.lock();
            if let Some(count) = map.get_mut(&self.ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(&self.ip);
                }
            }
        }
    }
}
