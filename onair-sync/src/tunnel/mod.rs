//! Connections to the legacy store
//!
//! The legacy MySQL store is only reachable through a tunnel. A
//! [`TunnelConnector`] knows how to open and close the tunnel and a pool on top
//! of it; [`TunnelledConnectionManager`] decides *when* to do so.

pub mod manager;
pub mod ssh;

pub use manager::{ReleaseHandle, TunnelledConnectionManager};
pub use ssh::{SshTunnel, SshTunnelConnector};

use crate::config::LegacyStoreConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::info;

/// Opens and closes a tunnel and the connection pool that runs over it
///
/// Close methods are best effort: failures are logged by the implementation and
/// never returned, since teardown always runs to completion.
#[async_trait]
pub trait TunnelConnector: Send + Sync + 'static {
    type Tunnel: Send + Sync + 'static;
    type Connection: Clone + Send + Sync + 'static;

    async fn open_tunnel(&self) -> Result<Self::Tunnel>;

    async fn open_pool(&self, tunnel: &Self::Tunnel) -> Result<Self::Connection>;

    async fn close_pool(&self, connection: &Self::Connection);

    async fn close_tunnel(&self, tunnel: &Self::Tunnel);
}

/// Connector for a store that is reachable without a tunnel
///
/// Used when no `[legacy.tunnel]` section is configured (local development,
/// VPN-reachable hosts).
pub struct DirectConnector {
    database_url: String,
    max_connections: u32,
    connect_timeout: Duration,
}

impl DirectConnector {
    pub fn new(config: &LegacyStoreConfig) -> Self {
        Self {
            database_url: config.database_url.clone(),
            max_connections: config.max_connections,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

#[async_trait]
impl TunnelConnector for DirectConnector {
    type Tunnel = ();
    type Connection = MySqlPool;

    async fn open_tunnel(&self) -> Result<()> {
        Ok(())
    }

    async fn open_pool(&self, _tunnel: &()) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.database_url)
            .await
            .map_err(|e| Error::ConnectionUnavailable(e.to_string()))?;
        info!("Connected to legacy store directly");
        Ok(pool)
    }

    async fn close_pool(&self, connection: &MySqlPool) {
        connection.close().await;
    }

    async fn close_tunnel(&self, _tunnel: &()) {}
}
