//! Process-wide `session_id → Session` registry and idle sweep (C5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;

use crate::error::{Result, RtspError};
use crate::registry::StreamRegistry;
use crate::session::Session;

const SESSION_ID_HEX_LEN: usize = 16;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const RTCP_SR_INTERVAL: Duration = Duration::from_secs(5);
const MAX_ID_COLLISION_RETRIES: usize = 8;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Allocate a new session bound to `stream_id`, retrying on the
    /// (vanishingly unlikely) event of an ID collision.
    pub fn create(&self, stream_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        for _ in 0..MAX_ID_COLLISION_RETRIES {
            let session_id = generate_session_id();
            if !sessions.contains_key(&session_id) {
                let session = Arc::new(Session::new(session_id.clone(), stream_id.to_string(), None));
                sessions.insert(session_id, session.clone());
                return session;
            }
        }
        // Even at the retry ceiling, fall back to a fresh id: the
        // probability of exhausting 8 retries on a 64-bit space is
        // astronomically small and not worth a fallible return type here.
        let session_id = generate_session_id();
        let session = Arc::new(Session::new(session_id.clone(), stream_id.to_string(), None));
        sessions.insert(session_id, session.clone());
        session
    }

    pub fn lookup(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RtspError::UnknownSession(session_id.to_string()))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Collect sessions whose idle timeout has elapsed and remove them,
    /// returning what was removed so the caller can close their transports.
    pub fn sweep_idle(&self) -> Vec<Arc<Session>> {
        let idle_ids: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.is_idle())
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(idle_ids.len());
        let mut sessions = self.sessions.write();
        for id in idle_ids {
            if let Some(session) = sessions.remove(&id) {
                removed.push(session);
            }
        }
        removed
    }
}

/// Spawn the periodic idle-sweep task. Runs until the manager is dropped
/// (the returned `JoinHandle` is tied to the caller's shutdown sequence).
/// Expired sessions are also unsubscribed from their stream so the fanout
/// registry stops holding a reference (and stops spawning enqueue work) for
/// a client that is no longer there.
pub fn spawn_idle_sweep(manager: Arc<SessionManager>, streams: Arc<StreamRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let expired = manager.sweep_idle();
            for session in expired {
                if let Some(stream) = streams.by_stream_id(&session.stream_id) {
                    stream.unsubscribe(&session.session_id);
                }
                tracing::info!(session_id = %session.session_id, "session expired, tearing down");
            }
        }
    })
}

/// Spawn the periodic RTCP Sender Report task, emitting one SR per track of
/// every live session on a fixed interval regardless of access-unit flow.
pub fn spawn_rtcp_task(manager: Arc<SessionManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RTCP_SR_INTERVAL);
        loop {
            interval.tick().await;
            for session in manager.sessions() {
                session.send_sender_reports().await;
            }
        }
    })
}

fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; SESSION_ID_HEX_LEN / 2] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_lookup_round_trips() {
        let manager = SessionManager::new();
        let session = manager.create("cam1");
        let found = manager.lookup(&session.session_id).unwrap();
        assert_eq!(found.stream_id, "cam1");
    }

    #[test]
    fn lookup_of_unknown_session_is_an_error() {
        let manager = SessionManager::new();
        assert!(manager.lookup("deadbeefdeadbeef").is_err());
    }

    #[test]
    fn remove_takes_the_session_out_of_the_registry() {
        let manager = SessionManager::new();
        let session = manager.create("cam1");
        assert!(manager.remove(&session.session_id).is_some());
        assert!(manager.lookup(&session.session_id).is_err());
    }

    #[test]
    fn session_ids_are_sixteen_hex_characters() {
        let manager = SessionManager::new();
        let session = manager.create("cam1");
        assert_eq!(session.session_id.len(), SESSION_ID_HEX_LEN);
        assert!(session.session_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sweep_idle_is_a_no_op_for_fresh_sessions() {
        let manager = SessionManager::new();
        manager.create("cam1");
        assert!(manager.sweep_idle().is_empty());
        assert_eq!(manager.len(), 1);
    }
}
