//! Server accept loop
//!
//! Accepts sessions from an [`Acceptor`], then for every stream a client
//! opens, dials the fixed target over TCP and relays between the two.

use crate::relay::Relay;
use crate::transport::connect_timeout;
use crate::tunnel::{Acceptor, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limit on each target dial
pub const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// First pause after a failed accept
pub const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Longest pause between failed accepts
pub const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Tunnel server: sessions in, TCP to `target` out
pub struct Server<A: Acceptor> {
    acceptor: A,
    target: Arc<str>,
    relay: Relay,
}

impl<A: Acceptor> Server<A> {
    pub fn new(acceptor: A, target: &str, relay: Relay) -> Self {
        Self {
            acceptor,
            target: Arc::from(target),
            relay,
        }
    }

    /// Accept sessions until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut handlers = JoinSet::new();
        let mut backoff = INITIAL_ACCEPT_BACKOFF;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
                r = self.acceptor.accept() => r,
            };

            match accepted {
                Ok(session) => {
                    backoff = INITIAL_ACCEPT_BACKOFF;
                    handlers.spawn(handle_session(
                        session,
                        Arc::clone(&self.target),
                        self.relay.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
            }
        }

        info!("server stopping, {} sessions open", handlers.len());
        // handlers see the same token and close their sessions
        while handlers.join_next().await.is_some() {}
    }
}

/// Serve one session's streams until the session fails
async fn handle_session<S: Session>(
    session: S,
    target: Arc<str>,
    relay: Relay,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = session.accept_stream() => r,
        };

        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                debug!("session {} ended: {}", session.remote_addr(), e);
                break;
            }
        };

        match connect_timeout(&target, TARGET_DIAL_TIMEOUT).await {
            Ok(conn) => {
                let relay = relay.clone();
                let route = format!("{} -> {}", session.remote_addr(), target);
                tokio::spawn(async move { relay.run(&route, stream, conn).await });
            }
            Err(e) => {
                // only this stream is lost
                warn!("dial target {}: {}", target, e);
                drop(stream);
            }
        }
    }

    session.close();
}
