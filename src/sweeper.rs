//! Periodic cache and session sweeps.
//!
//! One recurring task drives both sweeps at independently configured
//! intervals. The task has an explicit start/stop lifecycle tied to server
//! startup and shutdown; it is not fire-and-forget.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::auth::ClientCache;
use crate::session::SessionManager;

pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn start(
        cache: Arc<ClientCache>,
        sessions: Arc<SessionManager>,
        client_interval: Duration,
        session_interval: Duration,
    ) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut clients = tokio::time::interval(client_interval);
            let mut sess = tokio::time::interval(session_interval);
            clients.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            sess.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Both intervals fire immediately once; harmless no-op sweeps.

            loop {
                tokio::select! {
                    _ = clients.tick() => {
                        let evicted = cache.sweep_expired(Instant::now()).await;
                        if evicted > 0 {
                            debug!(evicted, "client cache sweep");
                        }
                    }
                    _ = sess.tick() => {
                        let closed = sessions.cleanup_expired(Instant::now());
                        if closed > 0 {
                            debug!(closed, "session sweep");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        Self { shutdown, task }
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
