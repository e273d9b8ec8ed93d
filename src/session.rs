//! Per-player session state.
//!
//! A `GameSession` is one connected player on this channel. It owns the
//! outbound packet channel to the connection's writer task plus the small
//! amount of per-player state the handoff protocol needs: the action lock,
//! the departing flag, and the transient effect list carried across a
//! channel change.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, Mutex};

/// One timed effect (a buff) active on a player. `remaining_ms` is the time
/// left when the snapshot was taken, not an absolute deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEffect {
    pub skill_id: u16,
    pub remaining_ms: u32,
}

pub struct GameSession {
    pub player_id: u32,
    pub name: String,
    tx: mpsc::Sender<Vec<u8>>,
    /// Set while a channel change is pending; blocks new world actions.
    actions_locked: AtomicBool,
    /// Set when the redirect has been sent. The session is no longer ours
    /// to mutate past this point.
    departing: AtomicBool,
    effects: Mutex<Vec<ActiveEffect>>,
}

impl GameSession {
    pub fn new(player_id: u32, name: String, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            player_id,
            name,
            tx,
            actions_locked: AtomicBool::new(false),
            departing: AtomicBool::new(false),
            effects: Mutex::new(Vec::new()),
        }
    }

    /// Queue a packet for the connection's writer task. A closed channel
    /// means the client already disconnected; the packet is dropped.
    pub async fn send(&self, pkt: Vec<u8>) {
        let _ = self.tx.send(pkt).await;
    }

    pub fn lock_actions(&self) {
        self.actions_locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock_actions(&self) {
        self.actions_locked.store(false, Ordering::SeqCst);
    }

    pub fn actions_locked(&self) -> bool {
        self.actions_locked.load(Ordering::SeqCst)
    }

    /// Marks the session as leaving this channel. One-way.
    pub fn begin_departure(&self) {
        self.departing.store(true, Ordering::SeqCst);
    }

    pub fn is_departing(&self) -> bool {
        self.departing.load(Ordering::SeqCst)
    }

    /// True when the session may initiate new world actions.
    pub fn can_act(&self) -> bool {
        !self.actions_locked() && !self.is_departing()
    }

    pub async fn add_effect(&self, effect: ActiveEffect) {
        let mut effects = self.effects.lock().await;
        effects.retain(|e| e.skill_id != effect.skill_id);
        effects.push(effect);
    }

    pub async fn effects(&self) -> Vec<ActiveEffect> {
        self.effects.lock().await.clone()
    }

    /// Replaces the effect list wholesale (continuation application).
    pub async fn set_effects(&self, effects: Vec<ActiveEffect>) {
        *self.effects.lock().await = effects;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (GameSession, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        (GameSession::new(7, "Nia".to_string(), tx), rx)
    }

    #[tokio::test]
    async fn test_send_reaches_writer_channel() {
        let (s, mut rx) = session();
        s.send(vec![1, 2, 3]).await;
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_to_closed_channel_is_dropped() {
        let (s, rx) = session();
        drop(rx);
        s.send(vec![9]).await;
    }

    #[test]
    fn test_action_lock_roundtrip() {
        let (tx, _rx) = mpsc::channel(1);
        let s = GameSession::new(1, "A".to_string(), tx);
        assert!(s.can_act());
        s.lock_actions();
        assert!(s.actions_locked());
        assert!(!s.can_act());
        s.unlock_actions();
        assert!(s.can_act());
    }

    #[test]
    fn test_departure_is_one_way() {
        let (tx, _rx) = mpsc::channel(1);
        let s = GameSession::new(1, "A".to_string(), tx);
        s.begin_departure();
        assert!(s.is_departing());
        assert!(!s.can_act());
    }

    #[tokio::test]
    async fn test_add_effect_replaces_same_skill() {
        let (s, _rx) = session();
        s.add_effect(ActiveEffect { skill_id: 11, remaining_ms: 5000 }).await;
        s.add_effect(ActiveEffect { skill_id: 11, remaining_ms: 9000 }).await;
        let effects = s.effects().await;
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].remaining_ms, 9000);
    }
}
