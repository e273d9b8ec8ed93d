//! The channel's view of its sibling channels.
//!
//! Each peer entry is a reachable (host, port) for client redirects plus an
//! optional outbound link for handoff signaling. Delivery is at-most-once:
//! a request with no usable link is dropped with a warning, never retried
//! here (the transport may have its own policy).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::handoff::{self, PlayerContinuation};
use super::packet;
use super::ChannelState;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no known endpoint for channel {0}")]
    HostUnresolved(u8),
}

pub struct PeerChannel {
    pub host: [u8; 4],
    pub port: u16,
    /// Outbound link to the peer process. None = endpoint known but no
    /// connection established yet.
    pub tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[derive(Default)]
pub struct ChannelPeers {
    inner: Mutex<HashMap<u8, PeerChannel>>,
}

impl ChannelPeers {
    pub async fn register_peer(
        &self,
        channel: u8,
        host: [u8; 4],
        port: u16,
        tx: Option<mpsc::Sender<Vec<u8>>>,
    ) {
        self.inner
            .lock()
            .await
            .insert(channel, PeerChannel { host, port, tx });
    }

    pub async fn remove_peer(&self, channel: u8) -> bool {
        self.inner.lock().await.remove(&channel).is_some()
    }

    /// Resolves a sibling's client-facing endpoint. Port 0 counts as no
    /// valid endpoint (the peer is draining).
    pub async fn resolve_host(&self, channel: u8) -> Result<([u8; 4], u16), BridgeError> {
        let peers = self.inner.lock().await;
        match peers.get(&channel) {
            Some(p) if p.port != 0 => Ok((p.host, p.port)),
            _ => Err(BridgeError::HostUnresolved(channel)),
        }
    }

    /// Notifies `dest_channel` of an incoming player, carrying the encoded
    /// continuation snapshot. Fire and forget.
    pub async fn send_channel_change_request(
        &self,
        src_channel: u8,
        dest_channel: u8,
        continuation: &PlayerContinuation,
    ) {
        let pkt = packet::write_change_request(
            src_channel,
            continuation.player_id,
            &continuation.encode(),
        );
        self.send_to_peer(dest_channel, pkt).await;
    }

    pub async fn send_to_peer(&self, channel: u8, msg: Vec<u8>) {
        let peers = self.inner.lock().await;
        match peers.get(&channel).and_then(|p| p.tx.as_ref()) {
            Some(tx) => {
                let _ = tx.send(msg).await;
            }
            None => {
                tracing::warn!("[channel] [chanif] no link to channel {}, message dropped", channel)
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

// ── Inbound dispatch ─────────────────────────────────────────────────────────

/// Entry point for packets arriving from a sibling channel.
pub async fn dispatch_peer_packet(state: &Arc<ChannelState>, pkt: &[u8]) {
    if pkt.len() < 2 {
        return;
    }
    let cmd = u16::from_le_bytes([pkt[0], pkt[1]]);
    match cmd {
        packet::CHAN_CHANGE_REQUEST => handle_change_request(state, pkt).await,
        packet::CHAN_CHANGE_ACCEPTED => handle_change_accepted(state, pkt).await,
        _ => tracing::warn!("[channel] [chanif] unknown cmd={:04X}", cmd),
    }
}

/// A sibling wants to move a player here. Store the continuation for the
/// player's arrival and tell the source we accept. A mangled continuation
/// is not grounds to refuse the player; they just arrive with fresh state.
async fn handle_change_request(state: &Arc<ChannelState>, pkt: &[u8]) {
    // [2]=src_channel [3..7]=player_id [7..11]=payload_len [11..]=payload
    if pkt.len() < 11 {
        return;
    }
    let src_channel = pkt[2];
    let player_id = u32::from_le_bytes([pkt[3], pkt[4], pkt[5], pkt[6]]);
    let payload_len = u32::from_le_bytes([pkt[7], pkt[8], pkt[9], pkt[10]]) as usize;
    if pkt.len() < 11 + payload_len {
        tracing::warn!("[channel] [chanif] truncated change request player_id={}", player_id);
        return;
    }

    match PlayerContinuation::decode(&pkt[11..11 + payload_len]) {
        Ok(c) if c.player_id == player_id => state.continuations.store(c).await,
        Ok(c) => tracing::warn!(
            "[channel] [chanif] continuation id mismatch header={} body={}",
            player_id,
            c.player_id
        ),
        Err(e) => tracing::warn!(
            "[channel] [chanif] bad continuation player_id={} err={}",
            player_id,
            e
        ),
    }

    state
        .peers
        .send_to_peer(src_channel, packet::write_change_accepted(player_id))
        .await;
    tracing::debug!(
        "[channel] [chanif] accepted incoming player_id={} from channel {}",
        player_id,
        src_channel
    );
}

/// The destination accepted a player we asked to move.
async fn handle_change_accepted(state: &Arc<ChannelState>, pkt: &[u8]) {
    if pkt.len() < 6 {
        return;
    }
    let player_id = u32::from_le_bytes([pkt[2], pkt[3], pkt[4], pkt[5]]);
    handoff::complete_channel_change(state, player_id).await;
}
