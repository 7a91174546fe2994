use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::tls::TrustMode;
use crate::transport::Connection;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) const fn is_tls(self) -> bool {
        matches!(self, Self::Https)
    }

    pub(crate) const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Connection-pool partition key: (scheme, host, port).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Route {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl std::fmt::Display for Route {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolLimits {
    pub(crate) max_total: usize,
    pub(crate) max_per_route: usize,
    /// Maximum connection lifetime counted from creation. Zero disables
    /// reuse: connections are never parked idle.
    pub(crate) ttl: Duration,
}

struct IdleEntry {
    connection: Connection,
    trust: TrustMode,
    idle_since: Instant,
    allowance: Duration,
}

#[derive(Default)]
struct RouteSlots {
    /// Connections currently leased for this route, across every trust
    /// mode. The per-route cap applies to this count.
    leased: usize,
    idle: VecDeque<IdleEntry>,
}

struct PoolState {
    total_leased: usize,
    routes: HashMap<Route, RouteSlots>,
}

/// Bounded pool of reusable connections keyed by route. Leases are
/// exclusive; callers block on the condvar while the route or the pool
/// is at capacity. Idle connections past their allowance or lifetime
/// are evicted eagerly on every lease and release.
pub(crate) struct ConnectionPool {
    limits: PoolLimits,
    state: Mutex<PoolState>,
    freed: Condvar,
    reuse_count: AtomicU64,
}

impl ConnectionPool {
    pub(crate) fn new(limits: PoolLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            state: Mutex::new(PoolState {
                total_leased: 0,
                routes: HashMap::new(),
            }),
            freed: Condvar::new(),
            reuse_count: AtomicU64::new(0),
        })
    }

    pub(crate) fn lease(self: &Arc<Self>, route: &Route, trust: &TrustMode) -> ConnectionLease {
        let mut guard = lock_unpoisoned(&self.state);
        loop {
            let now = Instant::now();
            let PoolState {
                total_leased,
                routes,
            } = &mut *guard;
            let slots = routes.entry(route.clone()).or_default();
            Self::evict_expired(slots, self.limits.ttl, now);

            if let Some(position) = slots.idle.iter().position(|entry| entry.trust == *trust) {
                let entry = slots.idle.remove(position).expect("idle entry at position");
                slots.leased += 1;
                *total_leased += 1;
                self.reuse_count.fetch_add(1, Ordering::Relaxed);
                let mut connection = entry.connection;
                connection.reused = true;
                return ConnectionLease {
                    pool: Arc::clone(self),
                    route: route.clone(),
                    trust: trust.clone(),
                    connection: Some(connection),
                    released: false,
                };
            }

            if slots.leased < self.limits.max_per_route && *total_leased < self.limits.max_total {
                slots.leased += 1;
                *total_leased += 1;
                return ConnectionLease {
                    pool: Arc::clone(self),
                    route: route.clone(),
                    trust: trust.clone(),
                    connection: None,
                    released: false,
                };
            }

            guard = match self.freed.wait(guard) {
                Ok(next) => next,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn evict_expired(slots: &mut RouteSlots, ttl: Duration, now: Instant) {
        slots.idle.retain(|entry| {
            if ttl.is_zero() {
                return false;
            }
            now.duration_since(entry.connection.created_at) < ttl
                && now.duration_since(entry.idle_since) < entry.allowance
        });
    }

    fn release_slot(&self, route: &Route, returned: Option<IdleEntry>) {
        let mut guard = lock_unpoisoned(&self.state);
        let PoolState {
            total_leased,
            routes,
        } = &mut *guard;
        *total_leased = total_leased.saturating_sub(1);
        if let Some(slots) = routes.get_mut(route) {
            slots.leased = slots.leased.saturating_sub(1);
            if let Some(entry) = returned
                && !self.limits.ttl.is_zero()
                && !entry.allowance.is_zero()
            {
                slots.idle.push_back(entry);
            }
            Self::evict_expired(slots, self.limits.ttl, Instant::now());
        }
        drop(guard);
        self.freed.notify_all();
    }

    /// Times an idle connection satisfied a lease instead of a fresh
    /// connect. Stays at zero when reuse is disabled.
    pub(crate) fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        let guard = lock_unpoisoned(&self.state);
        guard.routes.values().map(|slots| slots.idle.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn leased_count(&self) -> usize {
        lock_unpoisoned(&self.state).total_leased
    }
}

/// Exclusive claim on one pool slot, and optionally a reusable
/// connection. Dropping the lease frees the slot and discards the
/// connection; `release` returns a still-viable connection to the idle
/// set with its keep-alive allowance.
pub(crate) struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    route: Route,
    trust: TrustMode,
    connection: Option<Connection>,
    released: bool,
}

impl ConnectionLease {
    pub(crate) fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    pub(crate) fn release(mut self, connection: Option<Connection>, allowance: Option<Duration>) {
        self.released = true;
        let returned = match (connection, allowance) {
            (Some(connection), Some(allowance)) => Some(IdleEntry {
                connection,
                trust: self.trust.clone(),
                idle_since: Instant::now(),
                allowance,
            }),
            _ => None,
        };
        self.pool.release_slot(&self.route, returned);
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_slot(&self.route, None);
        }
    }
}
