//! Loaded maps and the periodic mob respawn step.
//!
//! The channel core only owns the tick that drives respawning; what a map
//! simulates beyond that lives upstream. Spawn points revive after their
//! respawn delay plus a small random jitter, at a re-rolled position inside
//! the spawn rect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngExt;
use tokio::sync::RwLock;

/// Rectangle a spawn point may place its mob in (inclusive bounds).
#[derive(Debug, Clone, Copy)]
pub struct SpawnRect {
    pub x0: u16,
    pub y0: u16,
    pub x1: u16,
    pub y1: u16,
}

#[derive(Debug)]
pub struct MobSpawn {
    pub mob_id: u32,
    pub rect: SpawnRect,
    pub respawn_after: Duration,
    pub x: u16,
    pub y: u16,
    alive: bool,
    died_at: Option<Instant>,
}

impl MobSpawn {
    pub fn new(mob_id: u32, rect: SpawnRect, respawn_after: Duration) -> Self {
        Self {
            mob_id,
            rect,
            respawn_after,
            x: rect.x0,
            y: rect.y0,
            alive: true,
            died_at: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

pub struct GameMap {
    pub id: u16,
    spawns: Mutex<Vec<MobSpawn>>,
}

impl GameMap {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            spawns: Mutex::new(Vec::new()),
        }
    }

    pub fn add_spawn(&self, spawn: MobSpawn) {
        self.spawns.lock().unwrap().push(spawn);
    }

    /// Marks the first living spawn of `mob_id` dead, starting its respawn
    /// clock. Returns false if none was alive.
    pub fn kill_mob(&self, mob_id: u32) -> bool {
        let mut spawns = self.spawns.lock().unwrap();
        for s in spawns.iter_mut() {
            if s.mob_id == mob_id && s.alive {
                s.alive = false;
                s.died_at = Some(Instant::now());
                return true;
            }
        }
        false
    }

    /// One simulation step: revive every spawn whose delay has elapsed,
    /// re-rolling its position. Returns the number revived.
    pub fn respawn_mobs(&self) -> usize {
        let mut spawns = self.spawns.lock().unwrap();
        let mut revived = 0;
        let mut rng = rand::rng();
        for s in spawns.iter_mut() {
            if s.alive {
                continue;
            }
            let due = s
                .died_at
                .map(|d| d.elapsed() >= s.respawn_after)
                .unwrap_or(true);
            if !due {
                continue;
            }
            s.x = rng.random_range(s.rect.x0..=s.rect.x1);
            s.y = rng.random_range(s.rect.y0..=s.rect.y1);
            s.alive = true;
            s.died_at = None;
            revived += 1;
        }
        if revived > 0 {
            tracing::debug!("[field] respawn map={} revived={}", self.id, revived);
        }
        revived
    }

    pub fn alive_count(&self) -> usize {
        self.spawns.lock().unwrap().iter().filter(|s| s.alive).count()
    }
}

/// The set of currently loaded maps. Owned externally; the channel core
/// iterates it once per tick.
#[derive(Default)]
pub struct MapRegistry {
    maps: RwLock<HashMap<u16, Arc<GameMap>>>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, map: GameMap) -> Arc<GameMap> {
        let map = Arc::new(map);
        self.maps.write().await.insert(map.id, Arc::clone(&map));
        map
    }

    pub async fn get(&self, id: u16) -> Option<Arc<GameMap>> {
        self.maps.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<GameMap>> {
        self.maps.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.maps.read().await.len()
    }
}
