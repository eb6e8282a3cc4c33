//! Session id allocation and session-to-match routing

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use uuid::Uuid;

use super::SessionId;

/// Where a session lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRoute {
    pub match_id: Uuid,
    pub player_id: Uuid,
}

/// Process-level directory of sessions, shared by the connection handlers
/// and the matchmaking service
pub struct SessionDirectory {
    next_id: AtomicU32,
    routes: DashMap<SessionId, SessionRoute>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            routes: DashMap::new(),
        }
    }

    /// Allocate a fresh session id. Zero is never handed out; on the wire it
    /// means "no session to resume".
    pub fn allocate(&self) -> SessionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn bind(&self, session: SessionId, match_id: Uuid, player_id: Uuid) {
        self.routes.insert(session, SessionRoute { match_id, player_id });
    }

    pub fn route(&self, session: SessionId) -> Option<SessionRoute> {
        self.routes.get(&session).map(|r| *r.value())
    }

    /// Forget every session of a finished match
    pub fn unbind_match(&self, match_id: Uuid) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| route.match_id != match_id);
        before - self.routes.len()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_follow_bindings() {
        let directory = SessionDirectory::new();
        let a = directory.allocate();
        let b = directory.allocate();
        assert_ne!(a, b);
        assert_ne!(a, 0);

        let match_id = Uuid::new_v4();
        let player = Uuid::new_v4();
        directory.bind(a, match_id, player);
        directory.bind(b, match_id, Uuid::new_v4());
        assert_eq!(directory.route(a), Some(SessionRoute { match_id, player_id: player }));

        assert_eq!(directory.unbind_match(match_id), 2);
        assert!(directory.route(a).is_none());
    }
}
