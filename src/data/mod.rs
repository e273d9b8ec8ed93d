//! Static game-data lookup services.

pub mod skill_db;
