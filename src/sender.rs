//! The public `Sender` API (spec §6): `Do`, `PoolStats`, `Close`.

use std::sync::Arc;

use crate::dispatch;
use crate::error::Error;
use crate::h2::Http2Pool;
use crate::options::Options;
use crate::pool::{Fabric, FabricConfig, PoolStats};
use crate::response::Response;

/// The transport entry point. Cheap to clone (internally `Arc`-backed);
/// share one `Sender` across tasks rather than constructing many.
#[derive(Clone)]
pub struct Sender {
    fabric: Arc<Fabric>,
    h2_pool: Arc<Http2Pool>,
}

impl Sender {
    pub fn new() -> Self {
        Self::with_config(FabricConfig::default())
    }

    pub fn with_config(config: FabricConfig) -> Self {
        let fabric = Fabric::new(config);
        let h2_pool = Http2Pool::new(fabric.clone());
        Self { fabric, h2_pool }
    }

    /// Sends one already-formatted HTTP/1.1-style `raw_request` and returns
    /// the parsed response plus its verbatim wire bytes (spec §4.9, §6).
    pub async fn do_request(&self, raw_request: &[u8], options: &Options) -> Result<Response, Error> {
        dispatch::do_request(&self.fabric, &self.h2_pool, raw_request, options).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.fabric.pool_stats()
    }

    /// Shuts the transport down: stops background tasks, closes every
    /// pooled and cached connection. Idempotent.
    pub async fn close(&self) {
        self.h2_pool.shutdown().await;
        self.fabric.shutdown().await;
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_stats_start_empty() {
        let sender = Sender::new();
        let stats = sender.pool_stats();
        assert_eq!(stats.active_conns, 0);
        assert_eq!(stats.idle_conns, 0);
        sender.close().await;
    }
}
