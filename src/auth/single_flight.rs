//! Single-flight authentication.
//!
//! Concurrent authentication attempts for the same credential key share one
//! upstream login: the first caller becomes the leader and spawns the login
//! as a detached task, every concurrent caller subscribes to the same
//! broadcast slot, and the slot is cleared unconditionally when the login
//! completes, success or failure. Because the login runs in its own task, a
//! caller whose connection is abandoned mid-login does not cancel it; the
//! result is still cached for whoever comes next.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::debug;

use crate::auth::cache::{teardown, AuthMethod, AuthenticatedClient, Checkout, ClientCache};
use crate::auth::key::CredentialKey;
use crate::client::TaskForgeClient;
use crate::error::AuthError;

type AuthResult = Result<AuthenticatedClient, AuthError>;

enum Role {
    Waiter(broadcast::Receiver<AuthResult>),
    Leader {
        tx: broadcast::Sender<AuthResult>,
        rx: broadcast::Receiver<AuthResult>,
        stale: Option<Arc<TaskForgeClient>>,
    },
}

type PendingMap = Arc<Mutex<HashMap<CredentialKey, broadcast::Sender<AuthResult>>>>;

/// Deregisters the pending slot on drop, so the slot is cleared and the
/// broadcast channel closes even when the login future panics and unwinds
/// the task.
struct SlotGuard {
    pending: PendingMap,
    key: CredentialKey,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.key);
        }
    }
}

pub struct SingleFlight {
    cache: Arc<ClientCache>,
    pending: PendingMap,
}

impl SingleFlight {
    pub fn new(cache: Arc<ClientCache>) -> Self {
        Self {
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &Arc<ClientCache> {
        &self.cache
    }

    /// Number of logins currently in flight. Diagnostics only.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Resolve `key` to an authenticated client, logging in at most once
    /// no matter how many callers arrive concurrently.
    ///
    /// `login` produces a fresh client on success; it is only invoked when
    /// there is neither a pending login nor a valid cache entry for `key`.
    pub async fn authenticate<F>(
        &self,
        key: CredentialKey,
        email: &str,
        method: AuthMethod,
        login: F,
    ) -> AuthResult
    where
        F: Future<Output = Result<TaskForgeClient, AuthError>> + Send + 'static,
    {
        // Lock order: pending before cache entries; no other path takes both.
        let role = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(tx) = pending.get(&key) {
                Role::Waiter(tx.subscribe())
            } else {
                match self.cache.checkout(key, Instant::now(), method) {
                    Checkout::Hit(found) => return Ok(found),
                    Checkout::Miss { stale } => {
                        let (tx, rx) = broadcast::channel(1);
                        pending.insert(key, tx.clone());
                        Role::Leader { tx, rx, stale }
                    }
                }
            }
        };

        let mut rx = match role {
            Role::Waiter(rx) => {
                debug!(key = ?key, "joining in-flight login");
                rx
            }
            Role::Leader { tx, rx, stale } => {
                let cache = Arc::clone(&self.cache);
                let slot = SlotGuard {
                    pending: Arc::clone(&self.pending),
                    key,
                };
                let email = email.to_string();
                tokio::spawn(async move {
                    if let Some(old) = stale {
                        teardown(&old, &email).await;
                    }

                    let result = match login.await {
                        Ok(client) => {
                            let (snapshot, displaced) =
                                cache.insert(key, client, email.clone(), method, Instant::now());
                            if let Some(old) = displaced {
                                teardown(&old, &email).await;
                            }
                            Ok(snapshot)
                        }
                        Err(e) => Err(e),
                    };

                    // Clear the slot before fan-out so a failed attempt never
                    // blocks the next one.
                    drop(slot);
                    let _ = tx.send(result);
                });
                rx
            }
        };

        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(AuthError::UpstreamLogin("login task dropped".to_string())),
        }
    }
}
