//! # Repository Module
//!
//! Database repositories for the tables the sync engine writes through.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  DeferredWriteProcessor                                                │
//! │       │                                                                 │
//! │       │  db.progress().upsert(user, work, 12, None)                    │
//! │       ▼                                                                 │
//! │  ProgressRepository                                                    │
//! │  ├── get(&self, user, work)                                            │
//! │  └── upsert(&self, user, work, chapter, chapter_id)                    │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`library::LibraryRepository`] - Works a user has added
//! - [`progress::ProgressRepository`] - Last chapter read per work
//! - [`review::ReviewRepository`] - One review per user and work
//! - [`session::SessionRepository`] - Sync-session audit rows

pub mod library;
pub mod progress;
pub mod review;
pub mod session;
