use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;

use miru::config::ChannelConfig;
use miru::data::skill_db::{SkillRegistry, SkillSource};
use miru::servers::channel::{connect_center, ChannelState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .init();

    let mut conf_file = "conf/channel.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: channel_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    return Err(anyhow::anyhow!("--conf requires a FILE argument"));
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ChannelConfig::from_file(&conf_file)?;

    let skills = Arc::new(SkillRegistry::new(build_skill_source(&config).await?));
    match skills.load_all().await {
        Ok(n) => tracing::info!("[skill] preloaded {} definitions", n),
        // lazy per-id loads can still succeed later
        Err(e) => tracing::warn!("[skill] preload failed: {}", e),
    }

    tracing::info!(
        "[channel] [started] world={} channel={}",
        config.world_id,
        config.channel_id
    );

    let port = config.channel_port;
    let state = Arc::new(ChannelState::new(config, skills));

    for peer in &state.config.peers {
        let host = peer.host_bytes()?;
        state.peers.register_peer(peer.channel, host, peer.port, None).await;
    }

    tokio::spawn(connect_center(Arc::clone(&state)));

    state.listen(port).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("[channel] [signal] shutting down");
    state.shutdown().await;
    Ok(())
}

async fn build_skill_source(config: &ChannelConfig) -> Result<SkillSource> {
    match config.skill_source.as_str() {
        "mcdb" => {
            let pool = MySqlPoolOptions::new()
                .max_connections(5)
                .connect(&config.sql_url())
                .await
                .with_context(|| {
                    format!(
                        "Cannot connect to MySQL (host={}:{} db={} user={})",
                        config.sql_ip, config.sql_port, config.sql_db, config.sql_id
                    )
                })?;
            Ok(SkillSource::Mcdb(pool))
        }
        _ => Ok(SkillSource::Kvj(PathBuf::from(&config.data_dir))),
    }
}
