//! Remote source interface
//!
//! The monitor only talks to GitHub through [`StarSource`], which keeps the
//! planner and orchestrator testable against in-memory fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Credential;
use crate::error::SourceError;
use crate::state::Repository;

/// Largest page GitHub will return
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// When the star was created
    Created,
    /// When the repository was last pushed
    Updated,
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Created => write!(f, "created"),
            SortKey::Updated => write!(f, "updated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "asc"),
            SortDirection::Desc => write!(f, "desc"),
        }
    }
}

/// Parameters for one page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    /// Opaque cursor from the previous page; `None` starts at the beginning
    pub cursor: Option<String>,
    pub per_page: u32,
    pub sort: SortKey,
    pub direction: SortDirection,
}

impl ListOptions {
    /// Newest stars first, which is what both fetch strategies need.
    pub fn newest_first(per_page: u32) -> Self {
        Self {
            cursor: None,
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
            sort: SortKey::Created,
            direction: SortDirection::Desc,
        }
    }

    pub fn at(&self, cursor: Option<String>) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next: bool,
    pub next_cursor: Option<String>,
}

/// Rate-limit snapshot taken from the latest response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub used: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StarredPage {
    pub repositories: Vec<Repository>,
    pub page_info: PageInfo,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Lists a user's starred repositories.
#[async_trait]
pub trait StarSource: Send + Sync {
    /// Fetch one page of starred repositories.
    async fn list_starred(
        &self,
        username: &str,
        options: &ListOptions,
    ) -> Result<StarredPage, SourceError>;

    /// Cheap existence check; `SourceError::NotFound` when the user is unknown.
    async fn validate_user(&self, username: &str) -> Result<(), SourceError>;

    /// A session that sends `credential` with every request.
    fn with_credential(&self, credential: &Credential) -> Arc<dyn StarSource>;
}
