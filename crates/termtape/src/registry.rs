//! C8: the process-wide session directory. One outer `std::sync::Mutex`
//! guards the id -> session map itself; each session is additionally
//! wrapped in its own `tokio::sync::Mutex` so a long `expect()` call on one
//! session never blocks lookups or operations on another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::error::CoreError;
use crate::error::Result;
use crate::session::Session;
use crate::session::SessionOptions;

pub type SharedSession = Arc<AsyncMutex<Session>>;

/// Summary returned by [`Registry::list_sessions`], cheap to clone without
/// holding a session's lock for the caller's inspection.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub command: String,
    pub alive: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct Registry {
    config: Config,
    inner: StdMutex<HashMap<String, SharedSession>>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: StdMutex::new(HashMap::new()),
        }
    }

    /// Reuse the first alive session whose `command` exactly matches
    /// `opts.command` (independent of `opts.session_id`); otherwise spawn a
    /// fresh one and register it under `opts.session_id` (defaulting to a
    /// generated id when absent). Enforces `max_sessions` before spawning.
    pub async fn control(&self, opts: SessionOptions, reuse: bool) -> Result<SharedSession> {
        if reuse {
            if let Some(existing) = self.find_alive_by_command(&opts.command).await {
                return Ok(existing);
            }
        }

        {
            let map = self.inner.lock().map_err(|_| CoreError::session("registry lock poisoned"))?;
            if map.len() >= self.config.max_sessions {
                return Err(CoreError::session(format!(
                    "session registry is full ({} of {} slots in use)",
                    map.len(),
                    self.config.max_sessions
                )));
            }
        }

        let session = Session::new(opts).await?;
        let id = session.session_id.clone();
        let shared: SharedSession = Arc::new(AsyncMutex::new(session));
        let mut map = self.inner.lock().map_err(|_| CoreError::session("registry lock poisoned"))?;
        map.insert(id, shared.clone());
        Ok(shared)
    }

    /// First alive session whose `command` exactly matches, scanning the
    /// map in arbitrary (HashMap) order.
    async fn find_alive_by_command(&self, command: &str) -> Option<SharedSession> {
        let candidates: Vec<SharedSession> = {
            let map = self.inner.lock().ok()?;
            map.values().cloned().collect()
        };
        for shared in candidates {
            let guard = shared.lock().await;
            let matches = guard.command == command && guard.is_alive();
            drop(guard);
            if matches {
                return Some(shared);
            }
        }
        None
    }

    pub fn lookup(&self, session_id: &str) -> Option<SharedSession> {
        let map = self.inner.lock().ok()?;
        map.get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<SharedSession> {
        let mut map = self.inner.lock().ok()?;
        map.remove(session_id)
    }

    /// Snapshot every registered session's id/command/liveness without
    /// holding the map lock while consulting each session.
    pub async fn list_sessions(&self, active_only: bool) -> Vec<SessionSummary> {
        let sessions: Vec<SharedSession> = {
            let map = match self.inner.lock() {
                Ok(map) => map,
                Err(_) => return Vec::new(),
            };
            map.values().cloned().collect()
        };
        let mut summaries = Vec::with_capacity(sessions.len());
        for shared in sessions {
            let guard = shared.lock().await;
            let alive = guard.is_alive();
            if active_only && !alive {
                continue;
            }
            summaries.push(SessionSummary {
                session_id: guard.session_id.clone(),
                command: guard.command.clone(),
                alive,
                created_at: guard.created_at(),
            });
        }
        summaries
    }

    /// Close every session whose liveness/age test fails, removing it from
    /// the map. Closes happen after releasing the map lock so a slow
    /// `close()` on one session doesn't stall registration of new ones.
    pub async fn cleanup_sessions(&self, force: bool, max_age_minutes: i64) -> usize {
        let candidates: Vec<(String, SharedSession)> = {
            let map = match self.inner.lock() {
                Ok(map) => map,
                Err(_) => return 0,
            };
            map.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };

        let mut to_remove = Vec::new();
        for (id, shared) in candidates {
            let guard = shared.lock().await;
            let age_minutes = (chrono::Utc::now() - guard.created_at()).num_minutes();
            let stale = force || !guard.is_alive() || age_minutes >= max_age_minutes;
            drop(guard);
            if stale {
                shared.lock().await.close(force).await.ok();
                to_remove.push(id);
            }
        }

        reap_zombies();

        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for id in to_remove {
            if map.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

/// Best-effort reap of any of our direct children that have become
/// zombies. `sysinfo` doesn't portably expose zombie state, so this walks
/// pids with a non-blocking `waitpid`.
#[cfg(unix)]
fn reap_zombies() {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: -1 waits for any child, WNOHANG never blocks; both are
        // valid arguments regardless of whether this process has children.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

#[cfg(not(unix))]
fn reap_zombies() {}
