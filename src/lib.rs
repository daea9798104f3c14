//! # hawken-tracker
//!
//! Tracks the live players and matches of Hawken game servers and keeps
//! per-player statistics, match aggregates and global rankings up to date
//! from the rate-limited stats service.
//!
//! Two journaled pipelines do the work. A poll records who is playing
//! where right now; an update refreshes stats snapshots, match aggregates
//! and the global rankings in resumable commit windows. Pushed match
//! events are a secondary ingestion path.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler / CLI (main.rs)
//!     │
//!     ├── PollService, UpdateService, EventIngester (service/)
//!     │     ├── JournalManager, windowed processor
//!     │     └── CallsignConflictResolver, RankingEngine
//!     │
//!     ├── ApiClient → StatsApi (api/)
//!     │
//!     ├── TrackerSession → PostgreSQL (persistence/)
//!     └── RankStore, TokenStore → Redis (persistence/)
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
