//! Authenticated-client cache.
//!
//! Maps credential keys to logged-in TaskForge client handles. Entries carry
//! a sliding idle window (reset on every reuse) and an absolute lifetime cap;
//! both must hold for an entry to be served. Expiry is enforced lazily on
//! every checkout and eagerly by the periodic sweep, so idle memory does not
//! grow unbounded between reads.
//!
//! The cache is the sole owner of each handle's teardown: a handle is logged
//! out exactly once, when its entry is evicted, replaced, or drained at
//! shutdown. Sessions hold non-owning references and never log out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::key::CredentialKey;
use crate::client::TaskForgeClient;

/// How the caller authenticated for a given reuse of a cached client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Token,
}

/// Snapshot handed out to sessions and tool handlers. The `client` Arc is a
/// shared reference; lifecycle stays with the cache.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client: Arc<TaskForgeClient>,
    pub email: String,
    pub method: AuthMethod,
}

struct Entry {
    client: Arc<TaskForgeClient>,
    email: String,
    method: AuthMethod,
    created_at: Instant,
    last_accessed: Instant,
}

impl Entry {
    fn snapshot(&self) -> AuthenticatedClient {
        AuthenticatedClient {
            client: Arc::clone(&self.client),
            email: self.email.clone(),
            method: self.method,
        }
    }
}

/// Result of a cache lookup. A `Miss` may carry the stale handle that was
/// displaced by lazy expiry; the caller owns its teardown.
pub enum Checkout {
    Hit(AuthenticatedClient),
    Miss {
        stale: Option<Arc<TaskForgeClient>>,
    },
}

/// Entry metadata, exposed for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub email: String,
    pub method: AuthMethod,
    pub created_at: Instant,
    pub last_accessed: Instant,
}

pub struct ClientCache {
    entries: Mutex<HashMap<CredentialKey, Entry>>,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl ClientCache {
    pub fn new(idle_timeout: Duration, max_lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
            max_lifetime,
        }
    }

    fn is_valid(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.last_accessed) < self.idle_timeout
            && now.duration_since(entry.created_at) < self.max_lifetime
    }

    /// Look up `key`, re-checking validity. A valid entry is touched
    /// (sliding window) and its auth method updated to how the caller
    /// authenticated this time. An expired entry is removed and returned as
    /// `stale` for teardown.
    pub fn checkout(&self, key: CredentialKey, now: Instant, method: AuthMethod) -> Checkout {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(entry) if self.is_valid(entry, now) => {
                entry.last_accessed = now;
                entry.method = method;
                Checkout::Hit(entry.snapshot())
            }
            Some(_) => {
                let entry = entries.remove(&key).expect("entry just matched");
                debug!(key = ?key, email = %entry.email, "evicting expired client on read");
                Checkout::Miss {
                    stale: Some(entry.client),
                }
            }
            None => Checkout::Miss { stale: None },
        }
    }

    /// Insert a freshly logged-in client. Returns the snapshot to hand to the
    /// caller and, if the key was occupied, the displaced handle the caller
    /// must tear down.
    pub fn insert(
        &self,
        key: CredentialKey,
        client: TaskForgeClient,
        email: String,
        method: AuthMethod,
        now: Instant,
    ) -> (AuthenticatedClient, Option<Arc<TaskForgeClient>>) {
        let entry = Entry {
            client: Arc::new(client),
            email,
            method,
            created_at: now,
            last_accessed: now,
        };
        let snapshot = entry.snapshot();
        let displaced = self
            .entries
            .lock()
            .unwrap()
            .insert(key, entry)
            .map(|old| old.client);
        (snapshot, displaced)
    }

    /// Evict one entry, tearing its client down. Returns whether anything
    /// was removed.
    pub async fn remove(&self, key: CredentialKey) -> bool {
        let removed = self.entries.lock().unwrap().remove(&key);
        match removed {
            Some(entry) => {
                teardown(&entry.client, &entry.email).await;
                true
            }
            None => false,
        }
    }

    /// Eager sweep: evict and tear down every invalid entry. Returns the
    /// number evicted.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let victims: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            let expired: Vec<CredentialKey> = entries
                .iter()
                .filter(|(_, e)| !self.is_valid(e, now))
                .map(|(k, _)| *k)
                .collect();
            expired
                .into_iter()
                .filter_map(|k| entries.remove(&k))
                .collect()
        };

        let count = victims.len();
        for entry in victims {
            teardown(&entry.client, &entry.email).await;
        }
        count
    }

    /// Shutdown drain: tear down and remove everything.
    pub async fn clear(&self) -> usize {
        let victims: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, e)| e).collect()
        };

        let count = victims.len();
        for entry in victims {
            teardown(&entry.client, &entry.email).await;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata for one entry, without touching it.
    pub fn metadata(&self, key: CredentialKey) -> Option<EntryInfo> {
        self.entries.lock().unwrap().get(&key).map(|e| EntryInfo {
            email: e.email.clone(),
            method: e.method,
            created_at: e.created_at,
            last_accessed: e.last_accessed,
        })
    }
}

/// Best-effort logout. Errors are logged and swallowed; eviction must never
/// fail or block on a misbehaving upstream.
pub async fn teardown(client: &TaskForgeClient, email: &str) {
    if let Err(e) = client.logout().await {
        warn!(email = %email, error = %e, "client logout failed during eviction");
    }
}
