//! The channel-change handoff protocol.
//!
//! A handoff moves a player's session to a sibling channel. The source
//! inserts a pending entry, arms a timeout, and notifies the destination
//! through the bridge; the destination's acceptance (or the timeout,
//! whichever lands first) resolves the entry. Both resolution arms go
//! through a single remove-if-present on the pending table, so completion
//! and timeout are mutually exclusive and a late arrival of either is a
//! quiet no-op.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::sync::Mutex;

use super::packet;
use super::ChannelState;
use crate::data::skill_db::SkillRegistry;
use crate::session::{ActiveEffect, GameSession};
use crate::timer::{self, DelayHandle};

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("channel change already pending for player {0}")]
    AlreadyPending(u32),
    #[error("player {0} is already departing this channel")]
    AlreadyDeparting(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error("continuation payload failed to inflate: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("continuation payload truncated")]
    Truncated,
}

/// One in-flight channel change.
pub struct PendingHandoff {
    pub dest_channel: u8,
    pub requested_at: Instant,
    timeout: DelayHandle,
}

#[derive(Default)]
pub struct HandoffTable {
    inner: Mutex<HashMap<u32, PendingHandoff>>,
}

impl HandoffTable {
    /// The arbitration point: whoever gets the entry owns the transition.
    pub async fn remove(&self, player_id: u32) -> Option<PendingHandoff> {
        self.inner.lock().await.remove(&player_id)
    }

    pub async fn is_pending(&self, player_id: u32) -> bool {
        self.inner.lock().await.contains_key(&player_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

/// Starts a channel change for `session` toward `dest_channel`.
///
/// Rejects if one is already pending for this player. Locks the player's
/// actions, arms the timeout, then notifies the destination (fire and
/// forget; resolution arrives through the bridge or the timer).
pub async fn request_channel_change(
    state: &Arc<ChannelState>,
    session: &Arc<GameSession>,
    dest_channel: u8,
) -> Result<(), HandoffError> {
    let player_id = session.player_id;
    if session.is_departing() {
        return Err(HandoffError::AlreadyDeparting(player_id));
    }

    {
        let mut pending = state.handoffs.inner.lock().await;
        if pending.contains_key(&player_id) {
            return Err(HandoffError::AlreadyPending(player_id));
        }
        session.lock_actions();

        let st = Arc::clone(state);
        let window = Duration::from_millis(state.config.handoff_timeout_ms);
        let timeout = timer::delay(window, async move {
            handoff_timed_out(&st, player_id).await;
        });
        pending.insert(
            player_id,
            PendingHandoff {
                dest_channel,
                requested_at: Instant::now(),
                timeout,
            },
        );
    }

    let continuation = PlayerContinuation::capture(session).await;
    state
        .peers
        .send_channel_change_request(state.channel_id(), dest_channel, &continuation)
        .await;
    tracing::debug!(
        "[channel] [handoff] requested player_id={} dest={}",
        player_id,
        dest_channel
    );
    Ok(())
}

/// The destination accepted `player_id`. Resolves the pending entry if the
/// timeout has not beaten us to it; a stale or duplicate call is a no-op.
pub async fn complete_channel_change(state: &Arc<ChannelState>, player_id: u32) {
    let Some(entry) = state.handoffs.remove(player_id).await else {
        tracing::debug!("[channel] [handoff] stale completion player_id={}", player_id);
        return;
    };
    entry.timeout.cancel();

    match state.peers.resolve_host(entry.dest_channel).await {
        Ok((host, port)) => {
            if let Some(session) = state.directory.get_by_id(player_id).await {
                session.begin_departure();
                session.send(packet::write_channel_host(host, port)).await;
                tracing::info!(
                    "[channel] [handoff] redirected player_id={} dest={} took_ms={}",
                    player_id,
                    entry.dest_channel,
                    entry.requested_at.elapsed().as_millis()
                );
            }
        }
        Err(e) => {
            tracing::debug!(
                "[channel] [handoff] destination unreachable player_id={} err={}",
                player_id,
                e
            );
            channel_change_error(state, player_id).await;
        }
    }
}

/// The error path: drop any residual pending entry and hand control back
/// to the player.
pub async fn channel_change_error(state: &Arc<ChannelState>, player_id: u32) {
    state.handoffs.remove(player_id).await;
    if let Some(session) = state.directory.get_by_id(player_id).await {
        session.unlock_actions();
        session.send(packet::write_enable_actions()).await;
    }
}

/// Timeout arm. Arbitrates through the table: if the entry is already gone
/// the completion won and there is nothing to do.
async fn handoff_timed_out(state: &Arc<ChannelState>, player_id: u32) {
    if state.handoffs.remove(player_id).await.is_none() {
        return;
    }
    tracing::debug!("[channel] [handoff] timed out player_id={}", player_id);
    channel_change_error(state, player_id).await;
}

// ── Continuation ─────────────────────────────────────────────────────────────

/// Transient per-player state carried across a handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerContinuation {
    pub player_id: u32,
    pub effects: Vec<ActiveEffect>,
}

impl PlayerContinuation {
    pub async fn capture(session: &GameSession) -> Self {
        Self {
            player_id: session.player_id,
            effects: session.effects().await,
        }
    }

    /// LE body `[player_id:4][count:2]` then `[skill_id:2][remaining_ms:4]`
    /// per effect, zlib-compressed for the inter-channel hop.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(6 + self.effects.len() * 6);
        body.put_u32_le(self.player_id);
        body.put_u16_le(self.effects.len() as u16);
        for e in &self.effects {
            body.put_u16_le(e.skill_id);
            body.put_u32_le(e.remaining_ms);
        }
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        // writing into a Vec cannot fail
        let _ = enc.write_all(&body);
        enc.finish().unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ContinuationError> {
        let mut body = Vec::new();
        ZlibDecoder::new(payload).read_to_end(&mut body)?;
        if body.len() < 6 {
            return Err(ContinuationError::Truncated);
        }
        let player_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let count = u16::from_le_bytes([body[4], body[5]]) as usize;
        if body.len() < 6 + count * 6 {
            return Err(ContinuationError::Truncated);
        }
        let mut effects = Vec::with_capacity(count);
        for i in 0..count {
            let off = 6 + i * 6;
            effects.push(ActiveEffect {
                skill_id: u16::from_le_bytes([body[off], body[off + 1]]),
                remaining_ms: u32::from_le_bytes([
                    body[off + 2],
                    body[off + 3],
                    body[off + 4],
                    body[off + 5],
                ]),
            });
        }
        Ok(Self { player_id, effects })
    }

    /// Applies the snapshot to a freshly attached session. Effects whose
    /// skill the registry cannot load are dropped; durations are clamped to
    /// the skill's base buff duration.
    pub async fn apply_to(&self, session: &GameSession, skills: &SkillRegistry) {
        let mut applied = Vec::with_capacity(self.effects.len());
        for e in &self.effects {
            match skills.get_skill(e.skill_id).await {
                Some(stats) => {
                    let remaining = if stats.buff_duration_ms > 0 {
                        e.remaining_ms.min(stats.buff_duration_ms)
                    } else {
                        e.remaining_ms
                    };
                    applied.push(ActiveEffect {
                        skill_id: e.skill_id,
                        remaining_ms: remaining,
                    });
                }
                None => tracing::debug!(
                    "[channel] [handoff] dropping unknown effect skill_id={} player_id={}",
                    e.skill_id,
                    self.player_id
                ),
            }
        }
        session.set_effects(applied).await;
    }
}

struct StoredContinuation {
    continuation: PlayerContinuation,
    expires: Instant,
}

/// Snapshots waiting for their player to arrive on this channel.
pub struct ContinuationStore {
    inner: Mutex<HashMap<u32, StoredContinuation>>,
    ttl: Duration,
}

impl ContinuationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Overwrite-or-insert; the newest snapshot wins.
    pub async fn store(&self, continuation: PlayerContinuation) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            continuation.player_id,
            StoredContinuation {
                continuation,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    /// Removes and applies the continuation for this session's player, if
    /// one is waiting. Returns whether one was found; on false the caller
    /// proceeds with fresh state.
    pub async fn consume_for(&self, session: &GameSession, skills: &SkillRegistry) -> bool {
        let stored = self.inner.lock().await.remove(&session.player_id);
        match stored {
            Some(s) => {
                s.continuation.apply_to(session, skills).await;
                true
            }
            None => false,
        }
    }

    /// Drops snapshots whose player never arrived. Called from the channel
    /// ticker.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        let now = Instant::now();
        inner.retain(|_, s| s.expires > now);
        before - inner.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::skill_db::{SkillSource, SkillStats};
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn fixture_registry(tag: &str, ids: &[u16]) -> (SkillRegistry, PathBuf) {
        let dir = std::env::temp_dir().join(format!("miru_handoff_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("skills")).unwrap();
        for &id in ids {
            let stats = SkillStats {
                id,
                name: format!("skill{id}"),
                max_level: 10,
                buff_duration_ms: 30_000,
                cooldown_ms: 0,
            };
            std::fs::write(
                dir.join("skills").join(format!("{id}.yaml")),
                serde_yaml::to_string(&stats).unwrap(),
            )
            .unwrap();
        }
        (SkillRegistry::new(SkillSource::Kvj(dir.clone())), dir)
    }

    fn session(id: u32) -> (Arc<GameSession>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(GameSession::new(id, format!("p{id}"), tx)), rx)
    }

    #[tokio::test]
    async fn test_continuation_decode_recovers_effects() {
        let c = PlayerContinuation {
            player_id: 7,
            effects: vec![
                ActiveEffect { skill_id: 11, remaining_ms: 12_000 },
                ActiveEffect { skill_id: 12, remaining_ms: 500 },
            ],
        };
        let decoded = PlayerContinuation::decode(&c.encode()).unwrap();
        assert_eq!(decoded, c);
    }

    #[tokio::test]
    async fn test_continuation_decode_rejects_truncated() {
        let c = PlayerContinuation {
            player_id: 7,
            effects: vec![ActiveEffect { skill_id: 11, remaining_ms: 1 }],
        };
        // re-compress a truncated body so the zlib layer is valid but the
        // effect array is short
        let mut body = Vec::new();
        ZlibDecoder::new(&c.encode()[..]).read_to_end(&mut body).unwrap();
        body.truncate(8);
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&body).unwrap();
        let payload = enc.finish().unwrap();

        assert!(matches!(
            PlayerContinuation::decode(&payload),
            Err(ContinuationError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_store_then_consume_once() {
        let (skills, dir) = fixture_registry("consume", &[11]);
        let store = ContinuationStore::new(Duration::from_secs(60));
        let (s, _rx) = session(7);

        store
            .store(PlayerContinuation {
                player_id: 7,
                effects: vec![ActiveEffect { skill_id: 11, remaining_ms: 9_000 }],
            })
            .await;
        assert_eq!(store.len().await, 1);

        assert!(store.consume_for(&s, &skills).await);
        assert_eq!(s.effects().await, vec![ActiveEffect { skill_id: 11, remaining_ms: 9_000 }]);

        // second consume finds nothing and leaves the session alone
        assert!(!store.consume_for(&s, &skills).await);
        assert_eq!(s.effects().await.len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_consume_drops_unknown_skills_and_clamps() {
        let (skills, dir) = fixture_registry("clamp", &[11]);
        let store = ContinuationStore::new(Duration::from_secs(60));
        let (s, _rx) = session(8);

        store
            .store(PlayerContinuation {
                player_id: 8,
                effects: vec![
                    // over the 30s base duration: clamped
                    ActiveEffect { skill_id: 11, remaining_ms: 99_000 },
                    // not in the registry: dropped
                    ActiveEffect { skill_id: 200, remaining_ms: 1_000 },
                ],
            })
            .await;

        assert!(store.consume_for(&s, &skills).await);
        assert_eq!(s.effects().await, vec![ActiveEffect { skill_id: 11, remaining_ms: 30_000 }]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_store_overwrites_previous_snapshot() {
        let (skills, dir) = fixture_registry("overwrite", &[11]);
        let store = ContinuationStore::new(Duration::from_secs(60));
        let (s, _rx) = session(9);

        for remaining in [1_000, 2_000] {
            store
                .store(PlayerContinuation {
                    player_id: 9,
                    effects: vec![ActiveEffect { skill_id: 11, remaining_ms: remaining }],
                })
                .await;
        }
        assert_eq!(store.len().await, 1);

        store.consume_for(&s, &skills).await;
        assert_eq!(s.effects().await[0].remaining_ms, 2_000);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_sweep_expired_drops_stale_entries() {
        let store = ContinuationStore::new(Duration::from_millis(0));
        store
            .store(PlayerContinuation { player_id: 1, effects: Vec::new() })
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.len().await, 0);
    }
}
