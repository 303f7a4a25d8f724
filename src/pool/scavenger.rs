//! Deferred reclamation of retired sessions
//!
//! A session replaced in the pool may still carry streams. The scavenger
//! holds it until those streams are gone, or until the scavenge TTL runs out,
//! then closes it.

use crate::tunnel::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Retired sessions queued before `retire` waits
pub const SCAVENGE_QUEUE: usize = 128;

/// How often retired sessions are checked
pub const SCAVENGE_INTERVAL: Duration = Duration::from_secs(1);

struct Entry<S> {
    session: Arc<S>,
    retired_at: Instant,
}

/// Sending side of the scavenger queue
pub struct ScavengerHandle<S: Session> {
    tx: mpsc::Sender<Arc<S>>,
}

impl<S: Session> Clone for ScavengerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Session> ScavengerHandle<S> {
    /// Hand a session over for reclamation. Waits while the queue is full.
    pub async fn retire(&self, session: Arc<S>) {
        if let Err(mpsc::error::SendError(session)) = self.tx.send(session).await {
            // nobody left to wait for its streams
            session.close();
        }
    }
}

/// Start the scavenger task. `ttl` of `None` disables forced reclamation.
pub fn spawn<S: Session>(
    ttl: Option<Duration>,
    shutdown: CancellationToken,
) -> (ScavengerHandle<S>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SCAVENGE_QUEUE);
    let task = tokio::spawn(run(rx, ttl, shutdown));
    (ScavengerHandle { tx }, task)
}

async fn run<S: Session>(
    mut rx: mpsc::Receiver<Arc<S>>,
    ttl: Option<Duration>,
    shutdown: CancellationToken,
) {
    let mut entries: Vec<Entry<S>> = Vec::new();
    let mut ticker = time::interval(SCAVENGE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            retired = rx.recv() => match retired {
                Some(session) => {
                    info!("session marked as expired: {}", session.remote_addr());
                    entries.push(Entry {
                        session,
                        retired_at: Instant::now(),
                    });
                }
                None => break,
            },
            _ = ticker.tick() => sweep(&mut entries, ttl),
        }
    }

    rx.close();
    while let Ok(session) = rx.try_recv() {
        session.close();
    }
    for entry in entries.drain(..) {
        entry.session.close();
    }
    debug!("scavenger stopped");
}

fn sweep<S: Session>(entries: &mut Vec<Entry<S>>, ttl: Option<Duration>) {
    entries.retain(|entry| {
        let session = &entry.session;
        if session.num_streams() == 0 || session.is_closed() {
            session.close();
            info!("session normally closed: {}", session.remote_addr());
            return false;
        }
        match ttl {
            Some(ttl) if entry.retired_at.elapsed() >= ttl => {
                session.close();
                info!("session reached scavenge ttl: {}", session.remote_addr());
                false
            }
            _ => true,
        }
    });
}
