//! Protocol session tracking for the streamable HTTP transport.
//!
//! A session is a long-lived MCP conversation, distinct from any single HTTP
//! request. Each entry exclusively owns the duplex pipe into its per-session
//! MCP service and holds a non-owning reference to the cached TaskForge
//! client that authenticated it. Session identifiers are generated here at
//! creation time and never accepted from a caller, so an id cannot be fixed
//! or guessed into existence.
//!
//! Sessions expire on their own idle TTL, independent of the client cache,
//! and the map is capped: creation beyond `max_sessions` is rejected (the
//! documented overflow policy; nothing is silently evicted).

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::auth::AuthenticatedClient;
use crate::error::SessionError;

struct Pipe {
    writer: WriteHalf<DuplexStream>,
    reader: BufReader<ReadHalf<DuplexStream>>,
}

/// The client side of a session's duplex pipe, plus the service task on the
/// other end. Requests within one session are serialized by the pipe mutex;
/// unrelated sessions proceed independently.
pub struct SessionTransport {
    pipe: tokio::sync::Mutex<Pipe>,
    service: JoinHandle<()>,
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport").finish_non_exhaustive()
    }
}

impl SessionTransport {
    pub fn new(
        writer: WriteHalf<DuplexStream>,
        reader: ReadHalf<DuplexStream>,
        service: JoinHandle<()>,
    ) -> Self {
        Self {
            pipe: tokio::sync::Mutex::new(Pipe {
                writer,
                reader: BufReader::new(reader),
            }),
            service,
        }
    }

    /// Write one JSON-RPC message and, if it carries an id, read lines until
    /// the matching response arrives (notifications in between are skipped).
    pub async fn request(
        &self,
        message: &str,
        expects_response: bool,
    ) -> io::Result<Option<String>> {
        let mut pipe = self.pipe.lock().await;
        pipe.writer.write_all(message.as_bytes()).await?;
        pipe.writer.write_all(b"\n").await?;
        pipe.writer.flush().await?;

        if !expects_response {
            return Ok(None);
        }

        let mut line = String::new();
        loop {
            line.clear();
            let n = pipe.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "session transport closed",
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let is_response = serde_json::from_str::<serde_json::Value>(trimmed)
                .map(|v| v.get("id").is_some())
                .unwrap_or(false);
            if is_response {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Stop the service task. Dropping the transport also closes the pipe,
    /// which ends the service on its next read.
    pub fn close(&self) {
        self.service.abort();
    }
}

struct SessionEntry {
    transport: Arc<SessionTransport>,
    client: Option<AuthenticatedClient>,
    created_at: Instant,
    last_activity: Instant,
}

/// Session metadata snapshot, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub email: Option<String>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    timeout: Duration,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
            max_sessions,
        }
    }

    /// Register a new session, generating its identifier. Fails with
    /// `LimitReached` at the cap; the caller still owns the transport and
    /// must close it.
    pub fn create_session(
        &self,
        client: Option<AuthenticatedClient>,
        transport: Arc<SessionTransport>,
    ) -> Result<String, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        sessions.insert(
            id.clone(),
            SessionEntry {
                transport,
                client,
                created_at: now,
                last_activity: now,
            },
        );
        info!(session_id = %id, live = sessions.len(), "session created");
        Ok(id)
    }

    /// Fetch a session's transport for one request, enforcing the idle TTL
    /// lazily and touching the activity timestamp. An expired session is
    /// closed and reported as `Expired` so the caller re-initializes instead
    /// of re-authenticating.
    pub fn checkout(&self, id: &str, now: Instant) -> Result<Arc<SessionTransport>, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(id) {
            Some(entry) if now.duration_since(entry.last_activity) < self.timeout => {
                entry.last_activity = now;
                Ok(Arc::clone(&entry.transport))
            }
            Some(_) => {
                let entry = sessions.remove(id).expect("entry just matched");
                entry.transport.close();
                debug!(session_id = %id, "session expired on access");
                Err(SessionError::Expired(id.to_string()))
            }
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.lock().unwrap().get(id).map(|e| SessionInfo {
            id: id.to_string(),
            email: e.client.as_ref().map(|c| c.email.clone()),
            created_at: e.created_at,
            last_activity: e.last_activity,
        })
    }

    /// Close and drop one session. Returns whether it existed.
    pub fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(id);
        match removed {
            Some(entry) => {
                entry.transport.close();
                info!(session_id = %id, "session removed");
                true
            }
            None => false,
        }
    }

    /// Eager TTL sweep. Returns the number of sessions closed.
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let victims: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.lock().unwrap();
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_activity) >= self.timeout)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in &victims {
            entry.transport.close();
            debug!(session_id = %id, "session expired in sweep");
        }
        victims.len()
    }

    /// Shutdown drain: close every transport and clear the map.
    pub fn cleanup_all(&self) -> usize {
        let victims: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, e)| e).collect()
        };
        for entry in &victims {
            entry.transport.close();
        }
        victims.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
