//! The HTTP/2 engine (spec §4.8): frame codec, HPACK, stream state machine,
//! request encoding and the connection object, plus a small cache keyed by
//! pool key so repeat requests to the same origin reuse one physical
//! connection instead of re-handshaking.

mod conn;
mod frame;
mod hpack;
mod request;
mod settings;
mod stream;

pub use conn::{Http2Connection, Http2Response};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::options::{Options, Scheme};
use crate::pool::{ConnMeta, Fabric};
use crate::timing::Recorder;

const PING_AFTER_IDLE: Duration = Duration::from_secs(15);
const EVICT_AFTER_IDLE: Duration = Duration::from_secs(300);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Substring the protocol dispatcher matches on to decide whether an HTTP/2
/// failure should fall back to HTTP/1.1 (spec §4.9).
pub(crate) const ALPN_REFUSAL_MARKER: &str = "does not support HTTP/2";

struct CachedConn {
    conn: Arc<Http2Connection>,
    meta: ConnMeta,
}

/// Caches live [`Http2Connection`]s by pool key, alongside a background
/// health-check pass that pings connections idle past [`PING_AFTER_IDLE`]
/// and evicts ones idle past [`EVICT_AFTER_IDLE`] or that fail the ping.
pub struct Http2Pool {
    fabric: Arc<Fabric>,
    conns: DashMap<String, CachedConn>,
    shutdown: CancellationToken,
    shut_down_once: AtomicBool,
    health_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Http2Pool {
    pub fn new(fabric: Arc<Fabric>) -> Arc<Self> {
        let pool = Arc::new(Self {
            fabric,
            conns: DashMap::new(),
            shutdown: CancellationToken::new(),
            shut_down_once: AtomicBool::new(false),
            health_handle: Mutex::new(None),
        });
        pool.clone().spawn_health_task();
        pool
    }

    fn spawn_health_task(self: Arc<Self>) {
        let shutdown = self.shutdown.clone();
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.run_health_pass().await,
                }
            }
        });
        if let Ok(mut guard) = self.health_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn run_health_pass(&self) {
        let keys: Vec<String> = self.conns.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(entry) = self.conns.get(&key) else {
                continue;
            };
            let idle = entry.conn.idle_for().await;
            if idle > EVICT_AFTER_IDLE || entry.conn.is_closed() {
                drop(entry);
                self.evict(&key).await;
                continue;
            }
            if idle > PING_AFTER_IDLE {
                let conn = entry.conn.clone();
                drop(entry);
                if conn.ping().await.is_err() {
                    self.evict(&key).await;
                }
            }
        }
    }

    async fn evict(&self, pool_key: &str) {
        if self.conns.remove(pool_key).is_some() {
            self.fabric.close_active(pool_key);
        }
    }

    /// Returns a ready connection for `opts`, reusing a cached one when it
    /// is still open, or dialing and handshaking a fresh one otherwise.
    pub async fn acquire(&self, opts: &Options, timer: &mut Recorder) -> Result<(Arc<Http2Connection>, ConnMeta), Error> {
        let pool_key = Fabric::pool_key_for(opts);

        if let Some(entry) = self.conns.get(&pool_key) {
            if !entry.conn.is_closed() {
                let mut meta = entry.meta.clone();
                meta.reused_from_pool = true;
                return Ok((entry.conn.clone(), meta));
            }
        }
        self.evict(&pool_key).await;

        let pooled = self.fabric.connect(opts, timer).await?;

        // Check ALPN before attempting the HTTP/2 preface: if the peer only
        // negotiated http/1.1, it will never understand our handshake bytes
        // and we'd otherwise pay a full timeout before the dispatcher gets a
        // chance to fall back (spec §4.9).
        if matches!(opts.scheme, Scheme::Https) && pooled.meta.alpn.as_deref() != Some("h2") {
            self.fabric.close_active(&pooled.meta.pool_key);
            return Err(Error::protocol(
                "dispatch",
                format!("peer {ALPN_REFUSAL_MARKER} (ALPN negotiated a different protocol)"),
            ));
        }

        let conn = Arc::new(Http2Connection::handshake(pooled.stream, &opts.http2_settings).await?);
        self.conns.insert(
            pool_key.clone(),
            CachedConn {
                conn: conn.clone(),
                meta: pooled.meta.clone(),
            },
        );
        Ok((conn, pooled.meta))
    }

    pub async fn shutdown(&self) {
        if self.shut_down_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(handle) = self.health_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.conns.clear();
    }
}
