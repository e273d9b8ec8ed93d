//! Miru - world channel server
//!
//! One shard ("channel") of a sharded multiplayer world: holds the sessions
//! of its connected players, hands sessions off to sibling channels on
//! request, and keeps the center coordinator informed of its population and
//! availability.

/// Server configuration (YAML)
pub mod config;
/// Static game-data lookup (skill definitions)
pub mod data;
/// Session directory: who is on this channel
pub mod directory;
/// Loaded maps and the mob respawn step
pub mod field;
/// Server implementations
pub mod servers;
/// Per-player session state
pub mod session;
/// Delayed and repeating task scheduling
pub mod timer;
