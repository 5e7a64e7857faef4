// Session Registry: `(user_id, platform_id) -> [Session]`, per spec.md
// §4.H. A single `RwLock<HashMap<..>>` guards the map (the teacher's own
// `broadcast_registry`/`active_receiver_sessions` in `services/server`'s
// `AppState` use the identical RwLock-over-HashMap shape); a bounded
// broadcast channel emits an online/offline diff on every change so other
// components (metrics, presence) can observe it without polling the map.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::session::Session;

#[derive(Debug, Clone, Serialize)]
pub struct UserState {
    pub user_id: String,
    pub online: Vec<i32>,
    pub offline: Vec<i32>,
}

struct UserPlatform {
    last_active: Instant,
    sessions: Vec<Session>,
}

pub struct SessionRegistry {
    users: RwLock<HashMap<String, UserPlatform>>,
    state_tx: broadcast::Sender<UserState>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        let (state_tx, _) = broadcast::channel(1024);
        Self {
            users: RwLock::new(HashMap::new()),
            state_tx,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserState> {
        self.state_tx.subscribe()
    }

    pub async fn get_all(&self, user_id: &str) -> Vec<Session> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|p| p.sessions.clone())
            .unwrap_or_default()
    }

    pub async fn get(&self, user_id: &str, platform_id: i32) -> Vec<Session> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|p| p.sessions.iter().filter(|s| s.platform_id == platform_id).cloned().collect())
            .unwrap_or_default()
    }

    /// Appends `session`, creating the user's entry if this is its first
    /// session. Returns the sessions that were already registered for the
    /// same `(user_id, platform_id)` pair, for the caller's multi-device
    /// policy to act on before or after admitting the new one.
    pub async fn set(&self, session: Session) -> Vec<Session> {
        let user_id = session.user_id.clone();
        let platform_id = session.platform_id;
        let mut users = self.users.write().await;
        let entry = users.entry(user_id.clone()).or_insert_with(|| UserPlatform {
            last_active: Instant::now(),
            sessions: Vec::new(),
        });
        let existing: Vec<Session> = entry
            .sessions
            .iter()
            .filter(|s| s.platform_id == platform_id)
            .cloned()
            .collect();
        entry.last_active = Instant::now();
        entry.sessions.push(session);
        let _ = self.state_tx.send(UserState {
            user_id,
            online: vec![platform_id],
            offline: Vec::new(),
        });
        existing
    }

    /// Removes sessions identified by `session_ids` (their stable identity,
    /// not address/pointer equality, since `Session` is `Clone`). If the
    /// user's entry becomes empty it is dropped and `true` is returned so the
    /// caller can decrement an online-user gauge.
    pub async fn delete(&self, user_id: &str, session_ids: &[u64]) -> bool {
        let mut users = self.users.write().await;
        let Some(entry) = users.get_mut(user_id) else {
            return false;
        };
        let removed_platforms: Vec<i32> = entry
            .sessions
            .iter()
            .filter(|s| session_ids.contains(&s.id()))
            .map(|s| s.platform_id)
            .collect();
        entry.sessions.retain(|s| !session_ids.contains(&s.id()));
        let became_empty = entry.sessions.is_empty();
        if became_empty {
            users.remove(user_id);
        }
        drop(users);
        if !removed_platforms.is_empty() {
            let _ = self.state_tx.send(UserState {
                user_id: user_id.to_owned(),
                online: Vec::new(),
                offline: removed_platforms,
            });
        }
        became_empty
    }

    /// Snapshot of users whose last activity is after `deadline` (relative to
    /// `now`), i.e. users considered online as of `now`.
    pub async fn online_status_since(&self, deadline: Instant) -> Vec<String> {
        self.users
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.last_active > deadline)
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub async fn touch_user(&self, user_id: &str) {
        if let Some(entry) = self.users.write().await.get_mut(user_id) {
            entry.last_active = Instant::now();
        }
    }

    pub async fn online_user_count(&self) -> usize {
        self.users.read().await.len()
    }
}
