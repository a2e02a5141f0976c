//! A pacman-style package repository's core engine: archive inspection,
//! descriptor persistence, sync-database codec, and the Add/Remove/Move
//! state machine that keeps a management repository and its published
//! layer symlinks and databases in agreement.
//!
//! This crate is a library only — no HTTP surface, no CLI. A caller embeds
//! it behind whatever front end it needs.

pub mod arch;
pub mod archive;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod repo;
pub mod signature;
pub mod syncdb;
pub mod version;
