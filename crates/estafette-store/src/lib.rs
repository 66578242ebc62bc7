//! # estafette-store
//!
//! Local persistent storage for the Estafette delivery engine, backed by
//! SQLite. The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for messages,
//! reactions and edit history. Message payloads are stored as a type-tagged
//! JSON column; everything the engine filters on is broken out into plain
//! columns.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reactions;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
