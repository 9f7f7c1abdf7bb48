//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Domain entities live in `crate::model`; callers import the repository API
//! from `livesync::db` directly.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::QueueStats;
