//! Client accept loop
//!
//! Accepts plain TCP connections and hands each one to the session pool,
//! which carries it to the server over one of its sessions.

use crate::pool::SessionPool;
use crate::tunnel::Connector;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local TCP side of the tunnel
pub struct Client<C: Connector> {
    listener: TcpListener,
    pool: Arc<SessionPool<C>>,
}

impl<C: Connector> Client<C> {
    pub fn new(listener: TcpListener, pool: SessionPool<C>) -> Self {
        Self {
            listener,
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool<C>> {
        &self.pool
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.listener.accept() => r,
            };

            match accepted {
                Ok((conn, peer)) => {
                    debug!("accepted {}", peer);
                    if let Err(e) = conn.set_nodelay(true) {
                        debug!("set nodelay for {}: {}", peer, e);
                    }
                    let idx = self.pool.next_slot();
                    let pool = Arc::clone(&self.pool);
                    tokio::spawn(async move { pool.dispatch(idx, peer, conn).await });
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }

        self.pool.close().await;
    }
}
