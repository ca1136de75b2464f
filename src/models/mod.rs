//! Core data models for the photo caption store.
//!
//! Index entries map to SQLite rows via `sqlx::FromRow`; captions and asset
//! views serialize as JSON via `serde`.

pub mod asset;
pub mod caption;
pub mod index_entry;
