use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::{Session, SessionSnapshot};
use crate::classify::ErrorAnalysis;

/// Registry entry of a running or finished session.
pub(crate) struct SessionHandle {
    pub generation: u64,
    pub state: Arc<Mutex<Session>>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().snapshot()
    }
}

/// Why a session could not be inserted.
#[derive(Debug)]
pub(crate) enum InsertRejected {
    Active,
    /// The previous generation is still being torn down.
    Stopping,
}

/// Marks a stream id as stopping until dropped.
pub(crate) struct StopGuard<'a> {
    registry: &'a SessionRegistry,
    stream_id: String,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.registry.stopping.lock().remove(&self.stream_id);
    }
}

/// Single source of truth for sessions, keyed by stream id.
///
/// The locks are never held across an await point. Callers that hold a
/// snapshot must tolerate the session disappearing afterwards. Lock order is
/// `sessions` before `stopping`.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    stopping: Mutex<HashSet<String>>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, stream_id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().get(stream_id).map(SessionHandle::snapshot)
    }

    /// Inserts `make()` unless an active session exists or the previous one
    /// is still stopping. A finished session (failed or stopped) is replaced
    /// and returned for cleanup.
    pub fn insert_if_inactive(
        &self,
        stream_id: &str,
        make: impl FnOnce() -> SessionHandle,
    ) -> Result<Option<SessionHandle>, InsertRejected> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(stream_id) {
            if existing.state.lock().status.is_active() {
                return Err(InsertRejected::Active);
            }
        }
        if self.stopping.lock().contains(stream_id) {
            return Err(InsertRejected::Stopping);
        }
        Ok(sessions.insert(stream_id.to_string(), make()))
    }

    /// Removes the session and keeps its id reserved until the returned
    /// guard is dropped, so no new generation can start during teardown.
    pub fn begin_stop(&self, stream_id: &str) -> Option<(SessionHandle, StopGuard<'_>)> {
        let mut sessions = self.sessions.write();
        let handle = sessions.remove(stream_id)?;
        self.stopping.lock().insert(stream_id.to_string());
        Some((
            handle,
            StopGuard {
                registry: self,
                stream_id: stream_id.to_string(),
            },
        ))
    }

    pub fn last_error(&self, stream_id: &str) -> Option<ErrorAnalysis> {
        self.sessions
            .read()
            .get(stream_id)
            .and_then(|handle| handle.state.lock().last_error.clone())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<_> = self
            .sessions
            .read()
            .values()
            .map(SessionHandle::snapshot)
            .collect();
        list.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        list
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Sessions created more than `max_age` ago, regardless of activity.
    pub fn older_than(&self, max_age: Duration) -> Vec<String> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, handle)| handle.state.lock().age() > max_age)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count_active(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|handle| handle.state.lock().status.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
