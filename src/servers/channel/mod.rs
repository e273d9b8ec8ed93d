pub mod bridge;
pub mod client;
pub mod handoff;
pub mod packet;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::ChannelConfig;
use crate::data::skill_db::SkillRegistry;
use crate::directory::PlayerDirectory;
use crate::field::MapRegistry;
use crate::session::GameSession;
use crate::timer::{self, RepeatHandle};

/// One channel process: the session directory, the handoff machinery, the
/// sibling table, and the lifecycle of the client-facing listener.
pub struct ChannelState {
    pub config: ChannelConfig,
    pub directory: PlayerDirectory,
    pub handoffs: handoff::HandoffTable,
    pub continuations: handoff::ContinuationStore,
    pub peers: bridge::ChannelPeers,
    pub skills: Arc<SkillRegistry>,
    pub maps: MapRegistry,
    /// Outbound link to the center coordinator. None = not connected.
    center_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Bound client port. None = unbound (draining / not yet listening).
    port: Mutex<Option<u16>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<RepeatHandle>>,
}

impl ChannelState {
    pub fn new(config: ChannelConfig, skills: Arc<SkillRegistry>) -> Self {
        let ttl = Duration::from_secs(config.continuation_ttl_secs);
        Self {
            config,
            directory: PlayerDirectory::new(),
            handoffs: handoff::HandoffTable::default(),
            continuations: handoff::ContinuationStore::new(ttl),
            peers: bridge::ChannelPeers::default(),
            skills,
            maps: MapRegistry::new(),
            center_tx: Mutex::new(None),
            port: Mutex::new(None),
            started_at: Mutex::new(None),
            accept_task: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    pub fn world_id(&self) -> u8 {
        self.config.world_id
    }

    pub fn channel_id(&self) -> u8 {
        self.config.channel_id
    }

    pub async fn port(&self) -> Option<u16> {
        *self.port.lock().await
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().await
    }

    // ── Population ───────────────────────────────────────────────────────────

    /// Inserts the session and reports the new population. False if the
    /// player id or name is already taken (nothing is reported).
    pub async fn add_player(&self, session: Arc<GameSession>) -> bool {
        if !self.directory.add(session).await {
            return false;
        }
        self.send_population().await;
        true
    }

    /// Removes the session and reports the new population.
    pub async fn remove_player(&self, player_id: u32) -> Option<Arc<GameSession>> {
        let removed = self.directory.remove(player_id).await?;
        self.send_population().await;
        Some(removed)
    }

    // ── Continuations (inbound collaborator surface) ─────────────────────────

    pub async fn store_continuation(&self, continuation: handoff::PlayerContinuation) {
        self.continuations.store(continuation).await;
    }

    /// Applies a waiting continuation to a freshly attached session.
    /// Returns false when none was stored (caller proceeds with fresh state).
    pub async fn consume_continuation_for(&self, session: &GameSession) -> bool {
        self.continuations.consume_for(session, &self.skills).await
    }

    // ── Center link ──────────────────────────────────────────────────────────

    pub async fn set_center_link(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.center_tx.lock().await = Some(tx);
    }

    pub async fn clear_center_link(&self) {
        *self.center_tx.lock().await = None;
    }

    pub async fn send_population(&self) {
        let count = self.directory.len().await as u16;
        self.send_to_center(packet::write_population_changed(self.channel_id(), count))
            .await;
    }

    pub async fn send_port_change(&self) {
        let port = self.port().await;
        self.send_to_center(packet::write_channel_port(
            self.world_id(),
            self.channel_id(),
            port,
        ))
        .await;
    }

    /// A down or saturated link is logged and tolerated; the mutation that
    /// triggered the report must not fail because of it.
    async fn send_to_center(&self, msg: Vec<u8>) {
        let tx = self.center_tx.lock().await;
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(msg).await.is_err() {
                    tracing::warn!("[channel] [centerif] link closed, report dropped");
                }
            }
            None => tracing::warn!("[channel] [centerif] not connected, report dropped"),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Binds the client listener and brings the channel online: records the
    /// start time, reports the port, arms the world ticker. A bind failure
    /// is fatal to this channel.
    pub async fn listen(self: &Arc<Self>, port: u16) -> Result<()> {
        if let Err(e) = self.bind_and_accept(port).await {
            self.shutdown().await;
            return Err(e);
        }
        *self.started_at.lock().await = Some(Utc::now());
        self.send_port_change().await;
        tracing::info!(
            "[channel] [ready] world={} channel={} port={:?}",
            self.world_id(),
            self.channel_id(),
            self.port().await
        );

        let st = Arc::clone(self);
        let period = Duration::from_secs(self.config.respawn_interval_secs);
        let tick = timer::run_repeatedly(period, move || {
            let st = Arc::clone(&st);
            async move {
                for map in st.maps.all().await {
                    map.respawn_mobs();
                }
                let swept = st.continuations.sweep_expired().await;
                if swept > 0 {
                    tracing::debug!("[channel] swept {} stale continuations", swept);
                }
            }
        });
        *self.ticker.lock().await = Some(tick);
        Ok(())
    }

    /// Rebinds the client listener on a new port and reports the change.
    pub async fn change_port(self: &Arc<Self>, new_port: u16) -> Result<()> {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.bind_and_accept(new_port).await {
            self.shutdown().await;
            return Err(e);
        }
        self.send_port_change().await;
        tracing::info!(
            "[channel] [rebind] world={} channel={} port={}",
            self.world_id(),
            self.channel_id(),
            new_port
        );
        Ok(())
    }

    /// Takes the channel offline for new routing decisions: unbinds the
    /// listener, stops the ticker, and reports the unbound port upward.
    /// Existing sessions are unaffected.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        if let Some(tick) = self.ticker.lock().await.take() {
            tick.stop();
        }
        *self.port.lock().await = None;
        self.send_port_change().await;
        tracing::info!(
            "[channel] [offline] world={} channel={}",
            self.world_id(),
            self.channel_id()
        );
    }

    async fn bind_and_accept(self: &Arc<Self>, port: u16) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.channel_ip, port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("cannot bind client listener on {bind_addr}"))?;
        // port 0 asks the OS for an ephemeral port; record what we got
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        *self.port.lock().await = Some(bound);

        let st = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let s = Arc::clone(&st);
                        tokio::spawn(async move {
                            client::serve(s, stream, peer).await;
                        });
                    }
                    Err(e) => tracing::warn!("[channel] [accept_error] {}", e),
                }
            }
        });
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }
}

/// Maintains the outbound connection to the center coordinator, re-dialing
/// on loss. Reports sent while disconnected are dropped with a warning.
pub async fn connect_center(state: Arc<ChannelState>) {
    let addr = format!("{}:{}", state.config.center_ip, state.config.center_port);
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                tracing::info!("[channel] [centerif] connected addr={}", addr);
                let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
                state.set_center_link(tx).await;
                // re-announce state after a reconnect
                state.send_port_change().await;
                state.send_population().await;

                let (mut read_half, mut write_half) = stream.into_split();
                let writer = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if write_half.write_all(&msg).await.is_err() {
                            break;
                        }
                    }
                });

                // drain inbound until the center goes away
                let mut buf = [0u8; 512];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                state.clear_center_link().await;
                writer.abort();
                tracing::warn!("[channel] [centerif] connection lost");
            }
            Err(e) => {
                tracing::warn!("[channel] [centerif] connect failed addr={} err={}", addr, e)
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::skill_db::SkillSource;

    fn test_state() -> Arc<ChannelState> {
        let config = ChannelConfig::from_str(
            r#"
world_id: 0
channel_id: 1
channel_ip: "127.0.0.1"
channel_port: 0
center_ip: "127.0.0.1"
"#,
        )
        .unwrap();
        let skills = Arc::new(SkillRegistry::new(SkillSource::Kvj(std::env::temp_dir())));
        Arc::new(ChannelState::new(config, skills))
    }

    fn session(id: u32, name: &str) -> Arc<GameSession> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(GameSession::new(id, name.to_string(), tx))
    }

    #[tokio::test]
    async fn test_population_reported_after_each_mutation() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(16);
        state.set_center_link(tx).await;

        state.add_player(session(1, "Ashe")).await;
        state.add_player(session(2, "Brin")).await;
        state.remove_player(1).await;

        let mut counts = Vec::new();
        for _ in 0..3 {
            let pkt = rx.recv().await.unwrap();
            assert_eq!(pkt[0], packet::CENTER_POPULATION_CHANGED);
            assert_eq!(pkt[1], 1); // channel id
            counts.push(u16::from_le_bytes([pkt[2], pkt[3]]));
        }
        assert_eq!(counts, vec![1, 2, 1]);
        assert_eq!(state.directory.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_add_reports_nothing() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(16);
        state.set_center_link(tx).await;

        assert!(state.add_player(session(1, "Ashe")).await);
        assert!(!state.add_player(session(1, "Dupe")).await);

        let first = rx.recv().await.unwrap();
        assert_eq!(u16::from_le_bytes([first[2], first[3]]), 1);
        assert!(rx.try_recv().is_err(), "rejected add must not report");
    }

    #[tokio::test]
    async fn test_report_without_center_link_is_tolerated() {
        let state = test_state();
        // no link set: the mutation itself must still succeed
        assert!(state.add_player(session(1, "Ashe")).await);
        assert!(state.remove_player(1).await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_reports_unbound_port() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(16);
        state.set_center_link(tx).await;

        state.shutdown().await;
        let pkt = rx.recv().await.unwrap();
        assert_eq!(pkt[0], packet::CENTER_CHANNEL_PORT);
        assert_eq!(
            i32::from_le_bytes([pkt[3], pkt[4], pkt[5], pkt[6]]),
            packet::PORT_UNBOUND
        );
        assert_eq!(state.port().await, None);
    }

    #[tokio::test]
    async fn test_listen_binds_and_records_start() {
        let state = test_state();
        state.listen(0).await.unwrap();
        assert!(state.started_at().await.is_some());
        assert!(state.port().await.unwrap() > 0);
        state.shutdown().await;
    }
}
