//! Durable task queue and workflow engine on Postgres.
//!
//! Tasks live in one table and move through
//! `pending -> claimed -> completed | retrying | failed`, with
//! `cancelled` reachable before a claim. Workers claim with
//! `FOR UPDATE SKIP LOCKED`, the reaper reclaims work from workers that
//! went quiet, workflows hold tasks until their predecessors complete,
//! and cron entries spawn tasks when due.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod reaper;
pub mod schedules;
pub mod tasks;
pub mod workflows;
pub mod worker;

pub use engine::Engine;
pub use error::{EngineError, Result};
