//! Per-host connection pool with lock-free leasing.
//!
//! The pool gates *use* of connections and nothing else: it never connects,
//! sends, or closes on its own. The map mutex is held only across
//! lookup/insert; the lease itself is a CAS on the connection's atomic
//! state, so concurrent callers never block each other on pool work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::connection::Connection;

/// Map of host → fixed vector of shared connections.
pub struct ConnectionPool {
    max_per_host: usize,
    conns: Mutex<HashMap<String, Vec<Arc<Connection>>>>,
}

impl ConnectionPool {
    pub fn new(max_per_host: usize) -> ConnectionPool {
        ConnectionPool {
            max_per_host: max_per_host.max(1),
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn host_pool(&self, host: &str) -> Vec<Arc<Connection>> {
        let mut map = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(host.to_string())
            .or_insert_with(|| {
                (0..self.max_per_host)
                    .map(|_| Arc::new(Connection::new()))
                    .collect()
            })
            .clone()
    }

    /// Lease the first idle connection for `host`, creating the per-host
    /// vector on first use. Returns `None` when every slot is in use.
    pub fn pick(&self, host: &str) -> Option<Arc<Connection>> {
        let pool = self.host_pool(host);
        pool.into_iter().find(|conn| conn.try_lease())
    }

    /// Return a leased connection. Only the lease holder may call this.
    pub fn release(&self, conn: &Arc<Connection>) {
        conn.release_lease();
    }

    /// Snapshot of leased slots for `host`.
    pub fn used_count(&self, host: &str) -> usize {
        self.snapshot(host, |conn| !conn.is_idle())
    }

    /// Snapshot of idle slots for `host`.
    pub fn idle_count(&self, host: &str) -> usize {
        self.snapshot(host, |conn| conn.is_idle())
    }

    /// Close every idle connection for `host`. Slots busy at the time of
    /// the scan are left alone.
    pub fn close_idle(&self, host: &str) {
        let pool = {
            let map = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(host) {
                Some(pool) => pool.clone(),
                None => return,
            }
        };
        for conn in pool {
            if conn.try_lease() {
                if conn.is_connected() {
                    conn.close();
                }
                conn.release_lease();
            }
        }
    }

    fn snapshot(&self, host: &str, pred: impl Fn(&Arc<Connection>) -> bool) -> usize {
        let pool = {
            let map = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(host) {
                Some(pool) => pool.clone(),
                None => return 0,
            }
        };
        pool.iter().filter(|conn| pred(conn)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pick_exhausts_after_max_per_host() {
        let pool = ConnectionPool::new(2);
        let a = pool.pick("example.org").unwrap();
        let b = pool.pick("example.org").unwrap();
        assert!(pool.pick("example.org").is_none());
        assert_eq!(pool.used_count("example.org"), 2);
        assert_eq!(pool.idle_count("example.org"), 0);

        pool.release(&a);
        assert_eq!(pool.idle_count("example.org"), 1);
        assert!(pool.pick("example.org").is_some());
        pool.release(&b);
    }

    #[test]
    fn hosts_have_independent_pools() {
        let pool = ConnectionPool::new(1);
        let _a = pool.pick("a").unwrap();
        assert!(pool.pick("a").is_none());
        assert!(pool.pick("b").is_some());
    }

    #[test]
    fn lease_release_returns_to_idle() {
        let pool = ConnectionPool::new(1);
        for _ in 0..100 {
            let conn = pool.pick("h").unwrap();
            assert!(!conn.is_idle());
            pool.release(&conn);
            assert!(conn.is_idle());
        }
    }

    #[test]
    fn concurrent_pickers_never_share_a_lease() {
        let pool = Arc::new(ConnectionPool::new(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut wins = 0usize;
                for _ in 0..200 {
                    if let Some(conn) = pool.pick("h") {
                        wins += 1;
                        pool.release(&conn);
                    }
                }
                wins
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap() > 0);
        }
        // Everything released at the end.
        assert_eq!(pool.idle_count("h"), 4);
    }

    #[test]
    fn k_plus_one_callers_yield_exactly_k_leases() {
        let pool = ConnectionPool::new(3);
        let leased: Vec<_> = (0..4).filter_map(|_| pool.pick("h")).collect();
        assert_eq!(leased.len(), 3);
        for conn in &leased {
            pool.release(conn);
        }
    }
}
