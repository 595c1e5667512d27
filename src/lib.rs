//! star-watcher - watch GitHub users' starred repositories
//!
//! Each run loads the previous snapshot for a user, fetches their stars
//! (incrementally when possible), classifies what changed, and atomically
//! writes the new snapshot back.

pub mod auth;
pub mod config;
pub mod differ;
pub mod error;
pub mod github;
pub mod monitor;
pub mod output;
pub mod planner;
pub mod retry;
pub mod source;
pub mod state;
pub mod storage;

pub use config::Config;
pub use differ::{diff, ChangeSet, DiffOptions};
pub use error::{Result, WatchError};
pub use monitor::{CycleResult, MonitorEvent, MonitorService, Target};
pub use state::{Repository, UserState};
