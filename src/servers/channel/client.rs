//! Client connection shell.
//!
//! Reads the attach frame that identifies the player (the real game
//! handshake lives upstream in the transport layer), registers the session
//! in the directory, applies any waiting continuation, and pumps outbound
//! packets until the socket closes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::ChannelState;
use crate::session::GameSession;

const MAX_NAME_LEN: usize = 16;

/// Reads the attach frame: `[player_id:4][name_len:1][name]`.
pub async fn read_attach_frame<R: AsyncReadExt + Unpin>(stream: &mut R) -> Result<(u32, String)> {
    let mut head = [0u8; 5];
    stream.read_exact(&mut head).await?;
    let player_id = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let name_len = head[4] as usize;
    if name_len == 0 || name_len > MAX_NAME_LEN {
        bail!("bad name length {}", name_len);
    }
    let mut name = vec![0u8; name_len];
    stream.read_exact(&mut name).await?;
    let name = String::from_utf8(name)?;
    Ok((player_id, name))
}

pub async fn serve(state: Arc<ChannelState>, mut stream: TcpStream, peer: SocketAddr) {
    let (player_id, name) = match read_attach_frame(&mut stream).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[channel] [client] bad attach from {}: {}", peer, e);
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let session = Arc::new(GameSession::new(player_id, name, tx));
    if !state.add_player(Arc::clone(&session)).await {
        tracing::warn!(
            "[channel] [client] duplicate attach player_id={} from {}",
            player_id,
            peer
        );
        return;
    }

    let restored = state.consume_continuation_for(&session).await;
    tracing::info!(
        "[channel] [client] attached player_id={} name={} restored={} peer={}",
        player_id,
        session.name,
        restored,
        peer
    );

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_half.write_all(&msg).await.is_err() {
                break;
            }
        }
    });

    // inbound game packets are parsed upstream; here we only track liveness
    let mut buf = [0u8; 4096];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.remove_player(player_id).await;
    writer.abort();
    tracing::info!("[channel] [client] detached player_id={}", player_id);
}
