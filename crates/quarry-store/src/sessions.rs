use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::instrument;

use quarry_core::ids::SessionId;
use quarry_core::session::Session;

use crate::error::StoreError;

/// Read/write contract for conversation sessions.
///
/// `update` runs the transform while holding the store's lock for that
/// session, so a guard check inside the transform and the write that
/// follows it cannot interleave with another update.
pub trait SessionStore: Send + Sync {
    fn insert(&self, session: Session) -> Result<(), StoreError>;
    fn get(&self, id: &SessionId) -> Result<Session, StoreError>;
    /// Most recently updated first.
    fn list(&self) -> Result<Vec<Session>, StoreError>;
    fn update(
        &self,
        id: &SessionId,
        transform: &mut dyn FnMut(Session) -> Session,
    ) -> Result<Session, StoreError>;
    fn delete(&self, id: &SessionId) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, store and return a fresh session.
    pub fn create(&self, name: &str) -> Result<Session, StoreError> {
        let session = Session::new(name);
        self.insert(session.clone())?;
        Ok(session)
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut all: Vec<Session> = self.sessions.lock().values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    #[instrument(skip(self, transform), fields(session_id = %id))]
    fn update(
        &self,
        id: &SessionId,
        transform: &mut dyn FnMut(Session) -> Session,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.lock();
        let current = sessions
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        let next = transform(current);
        sessions.insert(id.clone(), next.clone());
        Ok(next)
    }

    fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.lock().remove(id).is_some())
    }
}
