//! The session directory: who is on this channel right now.
//!
//! Both indexes (by player id and by name) live behind one `RwLock` so they
//! can never diverge. Lookups take the read lock; `all()` hands back a
//! cloned snapshot so callers can iterate without holding the lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::GameSession;

#[derive(Default)]
struct Indexes {
    by_id: HashMap<u32, Arc<GameSession>>,
    by_name: HashMap<String, u32>,
}

#[derive(Default)]
pub struct PlayerDirectory {
    inner: RwLock<Indexes>,
}

impl PlayerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the session under both keys. Returns false (and inserts
    /// nothing) if the player id or the name is already taken.
    pub async fn add(&self, session: Arc<GameSession>) -> bool {
        let mut idx = self.inner.write().await;
        if idx.by_id.contains_key(&session.player_id) || idx.by_name.contains_key(&session.name) {
            return false;
        }
        idx.by_name.insert(session.name.clone(), session.player_id);
        idx.by_id.insert(session.player_id, session);
        true
    }

    /// Removes the session under both keys, returning it if it was present.
    pub async fn remove(&self, player_id: u32) -> Option<Arc<GameSession>> {
        let mut idx = self.inner.write().await;
        let session = idx.by_id.remove(&player_id)?;
        idx.by_name.remove(&session.name);
        Some(session)
    }

    pub async fn get_by_id(&self, player_id: u32) -> Option<Arc<GameSession>> {
        self.inner.read().await.by_id.get(&player_id).cloned()
    }

    /// Name lookup is case-sensitive, matching the name as assigned.
    pub async fn get_by_name(&self, name: &str) -> Option<Arc<GameSession>> {
        let idx = self.inner.read().await;
        let id = idx.by_name.get(name)?;
        idx.by_id.get(id).cloned()
    }

    pub async fn is_connected(&self, player_id: u32) -> bool {
        self.inner.read().await.by_id.contains_key(&player_id)
    }

    /// Snapshot of every connected session.
    pub async fn all(&self) -> Vec<Arc<GameSession>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(id: u32, name: &str) -> Arc<GameSession> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(GameSession::new(id, name.to_string(), tx))
    }

    #[tokio::test]
    async fn test_add_then_lookup_both_keys() {
        let dir = PlayerDirectory::new();
        assert!(dir.add(session(1, "Ashe")).await);

        assert_eq!(dir.get_by_id(1).await.unwrap().name, "Ashe");
        assert_eq!(dir.get_by_name("Ashe").await.unwrap().player_id, 1);
        assert!(dir.is_connected(1).await);
    }

    #[tokio::test]
    async fn test_name_lookup_is_case_sensitive() {
        let dir = PlayerDirectory::new();
        dir.add(session(1, "Ashe")).await;
        assert!(dir.get_by_name("ashe").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = PlayerDirectory::new();
        assert!(dir.add(session(1, "Ashe")).await);
        assert!(!dir.add(session(1, "Brin")).await);
        assert_eq!(dir.len().await, 1);
        // the rejected insert must not have clobbered the name index
        assert!(dir.get_by_name("Brin").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = PlayerDirectory::new();
        assert!(dir.add(session(1, "Ashe")).await);
        assert!(!dir.add(session(2, "Ashe")).await);
        assert_eq!(dir.get_by_name("Ashe").await.unwrap().player_id, 1);
    }

    #[tokio::test]
    async fn test_remove_clears_both_keys() {
        let dir = PlayerDirectory::new();
        dir.add(session(1, "Ashe")).await;
        let removed = dir.remove(1).await.unwrap();
        assert_eq!(removed.name, "Ashe");

        assert!(dir.get_by_id(1).await.is_none());
        assert!(dir.get_by_name("Ashe").await.is_none());
        assert!(dir.remove(1).await.is_none());
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn test_all_returns_snapshot() {
        let dir = PlayerDirectory::new();
        dir.add(session(1, "Ashe")).await;
        dir.add(session(2, "Brin")).await;
        let snapshot = dir.all().await;
        assert_eq!(snapshot.len(), 2);

        dir.remove(1).await;
        // the snapshot taken earlier is unaffected
        assert_eq!(snapshot.len(), 2);
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_no_lost_updates() {
        let dir = Arc::new(PlayerDirectory::new());
        let mut tasks = Vec::new();
        for id in 0..200u32 {
            let d = Arc::clone(&dir);
            tasks.push(tokio::spawn(async move {
                d.add(session(id, &format!("p{id}"))).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(dir.len().await, 200);
    }
}
