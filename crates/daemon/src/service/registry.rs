use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use common::prelude::{PublicKey, Session, State};
use parking_lot::Mutex;

/// Live sessions, indexed by the user they act for.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<PublicKey, Vec<(u64, Session)>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session` for `user`. The returned id unregisters it.
    pub fn register(&self, user: PublicKey, session: Session) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .entry(user)
            .or_default()
            .push((id, session));
        id
    }

    pub fn unregister(&self, user: &PublicKey, id: u64) {
        let mut sessions = self.sessions.lock();
        if let Some(list) = sessions.get_mut(user) {
            list.retain(|(other, _)| *other != id);
            if list.is_empty() {
                sessions.remove(user);
            }
        }
    }

    /// Established sessions of `user`.
    pub fn sessions_for(&self, user: &PublicKey) -> Vec<Session> {
        self.sessions
            .lock()
            .get(user)
            .map(|list| {
                list.iter()
                    .filter(|(_, s)| s.state() == State::Established)
                    .map(|(_, s)| s.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .values()
            .flat_map(|list| list.iter().map(|(_, s)| s.clone()))
            .collect()
    }

    /// `(user, session name, state)` of everything registered, by user.
    pub fn who(&self) -> Vec<(PublicKey, String, State)> {
        let sessions = self.sessions.lock();
        let mut out: Vec<_> = sessions
            .iter()
            .flat_map(|(user, list)| {
                list.iter()
                    .map(move |(_, s)| (*user, s.name().to_string(), s.state()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
