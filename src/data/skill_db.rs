//! Skill definitions: read-through cache over a pluggable backing store.
//!
//! The registry is constructed once at startup with the data source chosen
//! by config and passed by reference to whoever needs skill stats. Lookups
//! load lazily per id; `load_all` preloads the whole table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{MySqlPool, Row};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillStats {
    pub id: u16,
    pub name: String,
    pub max_level: u8,
    /// Base duration of the buff this skill applies, 0 for instant skills.
    #[serde(default)]
    pub buff_duration_ms: u32,
    #[serde(default)]
    pub cooldown_ms: u32,
}

/// Where skill rows come from. Selected once at startup.
pub enum SkillSource {
    /// SQL backing store (`Skills` table).
    Mcdb(MySqlPool),
    /// One YAML file per skill under `<dir>/skills/<id>.yaml`.
    Kvj(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum SkillDbError {
    #[error("skill store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("skill store query failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("skill {id} is malformed: {reason}")]
    Malformed { id: u16, reason: String },
}

pub struct SkillRegistry {
    source: SkillSource,
    skills: Mutex<HashMap<u16, Arc<SkillStats>>>,
}

impl SkillRegistry {
    pub fn new(source: SkillSource) -> Self {
        Self {
            source,
            skills: Mutex::new(HashMap::new()),
        }
    }

    /// Cached lookup; loads from the backing store on first miss. Returns
    /// `None` for ids the store does not know (or cannot currently serve;
    /// a later lookup may retry the load).
    pub async fn get_skill(&self, id: u16) -> Option<Arc<SkillStats>> {
        if let Some(stats) = self.skills.lock().await.get(&id) {
            return Some(Arc::clone(stats));
        }
        match self.load_one(id).await {
            Ok(Some(stats)) => {
                let stats = Arc::new(stats);
                self.skills.lock().await.insert(id, Arc::clone(&stats));
                Some(stats)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("[skill] load failed id={} err={}", id, e);
                None
            }
        }
    }

    pub async fn can_load(&self, id: u16) -> bool {
        self.get_skill(id).await.is_some()
    }

    /// Preloads every skill the backing store has. Returns the number of
    /// definitions now cached.
    pub async fn load_all(&self) -> Result<usize, SkillDbError> {
        let loaded = match &self.source {
            SkillSource::Mcdb(pool) => load_all_sql(pool).await?,
            SkillSource::Kvj(dir) => load_all_files(dir)?,
        };
        let mut cache = self.skills.lock().await;
        for stats in loaded {
            cache.insert(stats.id, Arc::new(stats));
        }
        Ok(cache.len())
    }

    pub async fn cached_len(&self) -> usize {
        self.skills.lock().await.len()
    }

    async fn load_one(&self, id: u16) -> Result<Option<SkillStats>, SkillDbError> {
        match &self.source {
            SkillSource::Mcdb(pool) => load_one_sql(pool, id).await,
            SkillSource::Kvj(dir) => load_one_file(dir, id),
        }
    }
}

async fn load_one_sql(pool: &MySqlPool, id: u16) -> Result<Option<SkillStats>, SkillDbError> {
    let row = sqlx::query(
        "SELECT SklId, SklName, SklMaxLevel, SklBuffMs, SklCooldownMs \
         FROM Skills WHERE SklId = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(stats_from_row(&row)?))
}

async fn load_all_sql(pool: &MySqlPool) -> Result<Vec<SkillStats>, SkillDbError> {
    let rows = sqlx::query(
        "SELECT SklId, SklName, SklMaxLevel, SklBuffMs, SklCooldownMs FROM Skills",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(stats_from_row).collect()
}

fn stats_from_row(row: &sqlx::mysql::MySqlRow) -> Result<SkillStats, SkillDbError> {
    Ok(SkillStats {
        id: row.try_get::<u32, _>(0).map(|v| v as u16)?,
        name: row.try_get::<String, _>(1).unwrap_or_default(),
        max_level: row.try_get::<u32, _>(2).map(|v| v as u8).unwrap_or(1),
        buff_duration_ms: row.try_get::<u32, _>(3).unwrap_or(0),
        cooldown_ms: row.try_get::<u32, _>(4).unwrap_or(0),
    })
}

fn skill_path(dir: &Path, id: u16) -> PathBuf {
    dir.join("skills").join(format!("{id}.yaml"))
}

fn load_one_file(dir: &Path, id: u16) -> Result<Option<SkillStats>, SkillDbError> {
    let path = skill_path(dir, id);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let stats: SkillStats =
        serde_yaml::from_str(&contents).map_err(|e| SkillDbError::Malformed {
            id,
            reason: e.to_string(),
        })?;
    if stats.id != id {
        return Err(SkillDbError::Malformed {
            id,
            reason: format!("file declares id {}", stats.id),
        });
    }
    Ok(Some(stats))
}

fn load_all_files(dir: &Path) -> Result<Vec<SkillStats>, SkillDbError> {
    let skills_dir = dir.join("skills");
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(&skills_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "yaml") {
            continue;
        }
        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u16>().ok())
        else {
            continue;
        };
        if let Some(stats) = load_one_file(dir, id)? {
            out.push(stats);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_dir(tag: &str, skills: &[SkillStats]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("miru_skilldb_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("skills")).unwrap();
        for s in skills {
            let yaml = serde_yaml::to_string(s).unwrap();
            std::fs::write(skill_path(&dir, s.id), yaml).unwrap();
        }
        dir
    }

    fn haste() -> SkillStats {
        SkillStats {
            id: 11,
            name: "Haste".to_string(),
            max_level: 20,
            buff_duration_ms: 60_000,
            cooldown_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_lazy_load_and_cache() {
        let dir = fixture_dir("lazy", &[haste()]);
        let reg = SkillRegistry::new(SkillSource::Kvj(dir.clone()));
        assert_eq!(reg.cached_len().await, 0);

        let stats = reg.get_skill(11).await.unwrap();
        assert_eq!(stats.name, "Haste");
        assert_eq!(reg.cached_len().await, 1);

        // second lookup is served from cache even if the file disappears
        std::fs::remove_file(skill_path(&dir, 11)).unwrap();
        assert!(reg.get_skill(11).await.is_some());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_unknown_skill_returns_none() {
        let dir = fixture_dir("unknown", &[]);
        let reg = SkillRegistry::new(SkillSource::Kvj(dir.clone()));
        assert!(reg.get_skill(999).await.is_none());
        assert!(!reg.can_load(999).await);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_load_all_preloads() {
        let mut other = haste();
        other.id = 12;
        other.name = "Ironhide".to_string();
        let dir = fixture_dir("all", &[haste(), other]);

        let reg = SkillRegistry::new(SkillSource::Kvj(dir.clone()));
        assert_eq!(reg.load_all().await.unwrap(), 2);
        assert_eq!(reg.get_skill(12).await.unwrap().name, "Ironhide");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_mismatched_id_is_malformed() {
        let dir = fixture_dir("mismatch", &[]);
        // file named 13.yaml but declaring id 11
        std::fs::write(skill_path(&dir, 13), serde_yaml::to_string(&haste()).unwrap()).unwrap();

        let reg = SkillRegistry::new(SkillSource::Kvj(dir.clone()));
        assert!(reg.get_skill(13).await.is_none());
        std::fs::remove_dir_all(dir).ok();
    }
}
