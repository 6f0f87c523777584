//! Per-host (per pool-key) idle queue and slot accounting, used by [`super::Fabric`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use super::{probe_liveness, ConnMeta, PooledConnection};

pub struct IdleEntry {
    pub conn: PooledConnection,
    pub last_used: Instant,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct HostPoolStats {
    pub active: u32,
    pub idle: u32,
    pub created: u64,
    pub reused: u64,
}

/// LIFO idle queue plus FIFO release ordering for eviction fairness: new
/// connections are handed out most-recently-used first (better cache
/// locality for the peer), while idle cleanup walks oldest-first.
pub struct HostPool {
    idle: Mutex<VecDeque<IdleEntry>>,
    active: AtomicU32,
    notify: Notify,
    created: AtomicU64,
    reused: AtomicU64,
}

impl HostPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            active: AtomicU32::new(0),
            notify: Notify::new(),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Pops the most-recently-released idle connection (LIFO), skipping and
    /// discarding any that fail the liveness probe or have sat idle past
    /// `max_idle_time`.
    pub async fn try_checkout(&self, max_idle_time: Duration, stale_check_threshold: Duration) -> Option<PooledConnection> {
        loop {
            let entry = {
                let mut idle = self.idle.lock().await;
                idle.pop_back()?
            };

            if entry.last_used.elapsed() > max_idle_time {
                self.active.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            let mut entry = entry;
            if entry.last_used.elapsed() >= stale_check_threshold && !probe_liveness(&mut entry.conn.stream).await {
                self.active.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            self.reused.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
            return Some(entry.conn);
        }
    }

    /// Reserves a slot for a new dial, blocking (with `wait_timeout`) while
    /// the host is at `max` active connections. Returns `false` on timeout.
    pub async fn reserve_slot(&self, max: u32, wait_timeout: Duration) -> bool {
        let deadline = Instant::now() + wait_timeout;
        loop {
            let current = self.active.load(Ordering::Relaxed);
            if current < max
                && self
                    .active
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            {
                self.created.fetch_add(1, Ordering::Relaxed);
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    pub fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub async fn release(&self, conn: PooledConnection, keep_alive: bool, max_idle: u16) {
        if !keep_alive {
            self.decrement_active();
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= max_idle as usize {
            drop(idle);
            self.decrement_active();
            return;
        }
        let now = Instant::now();
        idle.push_back(IdleEntry {
            conn,
            last_used: now,
            created_at: now,
        });
    }

    pub fn evict_older_than(&self, max_idle_time: Duration) {
        if let Ok(mut idle) = self.idle.try_lock() {
            let before = idle.len();
            idle.retain(|e| e.last_used.elapsed() <= max_idle_time);
            let evicted = before - idle.len();
            if evicted > 0 {
                self.active.fetch_sub(evicted as u32, Ordering::Relaxed);
                self.notify.notify_waiters();
            }
        }
    }

    pub fn close_all(&self) {
        if let Ok(mut idle) = self.idle.try_lock() {
            idle.clear();
        }
        self.notify.notify_waiters();
    }

    /// `self.active` tracks allocated slots (in-use *and* idle, since an
    /// idle connection still occupies a slot against `max_conns_per_host`);
    /// the reported `active` count is checked-out connections only, so
    /// `active + idle` matches the number of physical connections rather
    /// than double-counting the idle ones.
    pub fn stats(&self) -> HostPoolStats {
        let idle = self.idle.try_lock().map(|g| g.len() as u32).unwrap_or(0);
        let allocated = self.active.load(Ordering::Relaxed);
        HostPoolStats {
            active: allocated.saturating_sub(idle),
            idle,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

#[allow(dead_code)]
fn _assert_meta_send(_: &ConnMeta) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::boxed;

    fn dummy_conn() -> PooledConnection {
        let (a, _b) = tokio::io::duplex(16);
        PooledConnection {
            stream: boxed(a),
            meta: ConnMeta {
                connected_ip: None,
                connected_port: 80,
                alpn: None,
                tls_version: None,
                cipher: None,
                server_name: None,
                session_resumed: false,
                local_addr: None,
                remote_addr: None,
                connection_id: 1,
                proxy_used: false,
                proxy_type: None,
                proxy_address: None,
                reused_from_pool: false,
                pool_key: "k".into(),
                tls_session_id: None,
            },
        }
    }

    #[tokio::test]
    async fn release_then_checkout_is_lifo_and_counts_reuse() {
        let pool = HostPool::new();
        pool.increment_active();
        pool.release(dummy_conn(), true, 10).await;
        let stats_before = pool.stats();
        assert_eq!(stats_before.idle, 1);

        let got = pool.try_checkout(Duration::from_secs(60), Duration::from_secs(60)).await;
        assert!(got.is_some());
        let stats_after = pool.stats();
        assert_eq!(stats_after.idle, 0);
        assert_eq!(stats_after.reused, 1);
    }

    #[tokio::test]
    async fn release_without_keep_alive_frees_slot_instead_of_queueing() {
        let pool = HostPool::new();
        pool.increment_active();
        pool.release(dummy_conn(), false, 10).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn idle_connections_are_not_double_counted_against_active() {
        let pool = HostPool::new();
        pool.increment_active();
        pool.increment_active();
        pool.release(dummy_conn(), true, 10).await;
        pool.release(dummy_conn(), true, 10).await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.active + stats.idle, 2);
    }

    #[tokio::test]
    async fn reserve_slot_blocks_until_a_slot_frees() {
        let pool = HostPool::new();
        assert!(pool.reserve_slot(1, Duration::from_millis(50)).await);
        assert!(!pool.reserve_slot(1, Duration::from_millis(20)).await);
        pool.decrement_active();
        assert!(pool.reserve_slot(1, Duration::from_millis(50)).await);
    }
}
