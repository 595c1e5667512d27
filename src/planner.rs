//! Incremental fetch planning
//!
//! GitHub can list a user's stars newest first, so once a page stops
//! producing stars newer than the last one we saw, nothing further down the
//! list can be new either. Between periodic full syncs the planner exploits
//! that to fetch only the head of the list.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::{seconds, Config};
use crate::error::{Result, SourceError, WatchError};
use crate::retry::{RetryError, RetryExecutor};
use crate::source::{ListOptions, RateLimitInfo, StarSource, StarredPage};
use crate::state::{latest_starred_at, Repository, UserState};

/// Knobs the planner reads from the `[incremental]` and `[api]` sections
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    pub incremental_enabled: bool,
    pub fallback_on_error: bool,
    pub max_incremental_pages: u32,
    pub timestamp_tolerance: Duration,
    pub per_page: u32,
    /// Skip the incremental path for this run
    pub force_full: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PlannerConfig {
    fn from(config: &Config) -> Self {
        Self {
            incremental_enabled: config.incremental.enabled,
            fallback_on_error: config.incremental.fallback_on_error,
            max_incremental_pages: config.incremental.max_incremental_pages,
            timestamp_tolerance: seconds(config.incremental.timestamp_tolerance_secs),
            per_page: config.api.per_page,
            force_full: false,
        }
    }
}

/// Why a full fetch was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncReason {
    Forced,
    IncrementalDisabled,
    FirstRun,
    NoPriorItems,
    ResyncDue,
    Fallback,
    /// `last_starred_at` plus the tolerance is not a representable time
    CutoffOutOfRange,
}

impl fmt::Display for FullSyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FullSyncReason::Forced => "full sync requested",
            FullSyncReason::IncrementalDisabled => "incremental mode disabled",
            FullSyncReason::FirstRun => "first run",
            FullSyncReason::NoPriorItems => "no previously known repositories",
            FullSyncReason::ResyncDue => "full sync interval elapsed",
            FullSyncReason::Fallback => "incremental fetch failed",
            FullSyncReason::CutoffOutOfRange => "incremental cutoff out of range",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Full(FullSyncReason),
    /// Only stars newer than `since` (plus tolerance) are fetched
    Incremental { since: DateTime<Utc> },
}

/// Result of one fetch
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Previous repositories merged with what was fetched, newest star first
    pub repositories: Vec<Repository>,
    /// Strategy that actually produced `repositories`
    pub strategy: FetchStrategy,
    /// Repositories taken from the remote side
    pub fetched: usize,
    pub pages: u32,
    pub rate_limit: Option<RateLimitInfo>,
    /// Rough count of page requests an incremental fetch avoided
    pub api_calls_saved: u64,
}

impl FetchOutcome {
    pub fn is_full_sync(&self) -> bool {
        matches!(self.strategy, FetchStrategy::Full(_))
    }

    pub fn latest_starred_at(&self) -> Option<DateTime<Utc>> {
        latest_starred_at(&self.repositories)
    }
}

/// Pick a strategy for `state` at time `now`.
pub fn plan(state: &UserState, config: &PlannerConfig, now: DateTime<Utc>) -> FetchStrategy {
    if config.force_full {
        return FetchStrategy::Full(FullSyncReason::Forced);
    }
    if !config.incremental_enabled || !state.incremental_enabled {
        return FetchStrategy::Full(FullSyncReason::IncrementalDisabled);
    }
    let Some(since) = state.last_starred_at else {
        return FetchStrategy::Full(FullSyncReason::FirstRun);
    };
    if state.repositories.is_empty() {
        return FetchStrategy::Full(FullSyncReason::NoPriorItems);
    }
    if state.full_sync_due(now) {
        return FetchStrategy::Full(FullSyncReason::ResyncDue);
    }
    if incremental_cutoff(since, config.timestamp_tolerance).is_none() {
        return FetchStrategy::Full(FullSyncReason::CutoffOutOfRange);
    }
    FetchStrategy::Incremental { since }
}

/// Stars at or before this instant are treated as already known.
fn incremental_cutoff(since: DateTime<Utc>, tolerance: Duration) -> Option<DateTime<Utc>> {
    since.checked_add_signed(tolerance)
}

/// Overlay `fetched` on `previous` by `full_name`; fetched entries win.
/// The result is sorted newest star first, then by name.
pub fn merge(previous: &[Repository], fetched: Vec<Repository>) -> Vec<Repository> {
    let mut by_name: HashMap<String, Repository> = previous
        .iter()
        .map(|r| (r.full_name.clone(), r.clone()))
        .collect();
    for repo in fetched.into_iter().rev() {
        by_name.insert(repo.full_name.clone(), repo);
    }

    let mut merged: Vec<Repository> = by_name.into_values().collect();
    merged.sort_by(|a, b| {
        b.starred_at
            .cmp(&a.starred_at)
            .then_with(|| a.full_name.cmp(&b.full_name))
    });
    merged
}

/// Pages a full fetch of `total` repositories would have needed beyond the
/// `pages` actually read.
fn estimate_calls_saved(total: usize, per_page: u32, pages: u32) -> u64 {
    let per_page = u64::from(per_page.max(1));
    let full_pages = (total as u64).div_ceil(per_page).max(1);
    full_pages.saturating_sub(u64::from(pages))
}

fn next_cursor(page: &StarredPage) -> Option<String> {
    if !page.page_info.has_next {
        return None;
    }
    if page.page_info.next_cursor.is_none() {
        warn!("Source reported more pages without a cursor; stopping");
    }
    page.page_info.next_cursor.clone()
}

fn fetch_error(err: RetryError<SourceError>) -> WatchError {
    if err.is_cancelled() {
        WatchError::Cancelled
    } else {
        WatchError::Fetch(err)
    }
}

/// Runs the chosen strategy against a [`StarSource`].
pub struct FetchPlanner<'a> {
    source: &'a dyn StarSource,
    retry: &'a RetryExecutor,
    config: &'a PlannerConfig,
}

impl<'a> FetchPlanner<'a> {
    pub fn new(
        source: &'a dyn StarSource,
        retry: &'a RetryExecutor,
        config: &'a PlannerConfig,
    ) -> Self {
        Self {
            source,
            retry,
            config,
        }
    }

    /// Plan and execute a fetch for `username` given its previous state.
    pub async fn fetch(
        &self,
        username: &str,
        previous: &UserState,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome> {
        match plan(previous, self.config, now) {
            FetchStrategy::Full(reason) => {
                info!("Full fetch for {}: {}", username, reason);
                self.full_fetch(username, reason).await
            }
            FetchStrategy::Incremental { since } => {
                match self.incremental_fetch(username, previous, since).await {
                    Ok(outcome) => Ok(outcome),
                    Err(err) if err.is_cancelled() => Err(WatchError::Cancelled),
                    Err(err) if self.config.fallback_on_error => {
                        warn!(
                            "Incremental fetch for {} failed ({}), falling back to full fetch",
                            username, err
                        );
                        self.full_fetch(username, FullSyncReason::Fallback).await
                    }
                    Err(err) => Err(WatchError::IncrementalFetch(err)),
                }
            }
        }
    }

    async fn page(
        &self,
        username: &str,
        options: &ListOptions,
    ) -> std::result::Result<StarredPage, RetryError<SourceError>> {
        self.retry
            .run("list starred repositories", || {
                self.source.list_starred(username, options)
            })
            .await
    }

    /// Every page, no early exit. The result replaces the previous set so
    /// that unstarred repositories disappear.
    async fn full_fetch(&self, username: &str, reason: FullSyncReason) -> Result<FetchOutcome> {
        let mut options = ListOptions::newest_first(self.config.per_page);
        let mut fetched = Vec::new();
        let mut rate_limit = None;
        let mut pages = 0u32;

        loop {
            let page = self.page(username, &options).await.map_err(fetch_error)?;
            pages += 1;
            if page.rate_limit.is_some() {
                rate_limit = page.rate_limit.clone();
            }

            let cursor = next_cursor(&page);
            let count = page.repositories.len();
            fetched.extend(page.repositories);
            debug!("Page {} for {}: {} repositories", pages, username, count);

            match cursor {
                Some(cursor) if count > 0 => options = options.at(Some(cursor)),
                _ => break,
            }
        }

        let fetched_count = fetched.len();
        Ok(FetchOutcome {
            repositories: merge(&[], fetched),
            strategy: FetchStrategy::Full(reason),
            fetched: fetched_count,
            pages,
            rate_limit,
            api_calls_saved: 0,
        })
    }

    /// Newest-first pages until a page holds a star at or below the cutoff,
    /// comes back short, has no successor, or the page limit is reached.
    async fn incremental_fetch(
        &self,
        username: &str,
        previous: &UserState,
        since: DateTime<Utc>,
    ) -> std::result::Result<FetchOutcome, RetryError<SourceError>> {
        // plan() only picks this path when the cutoff is representable
        let cutoff = incremental_cutoff(since, self.config.timestamp_tolerance)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut options = ListOptions::newest_first(self.config.per_page);
        let requested = options.per_page as usize;
        let mut fresh = Vec::new();
        let mut rate_limit = None;
        let mut pages = 0u32;

        loop {
            if pages >= self.config.max_incremental_pages {
                warn!(
                    "Incremental fetch for {} stopped at the {} page limit",
                    username, self.config.max_incremental_pages
                );
                break;
            }

            let page = self.page(username, &options).await?;
            pages += 1;
            if page.rate_limit.is_some() {
                rate_limit = page.rate_limit.clone();
            }

            let cursor = next_cursor(&page);
            let returned = page.repositories.len();
            let before = fresh.len();
            fresh.extend(
                page.repositories
                    .into_iter()
                    .filter(|repo| repo.starred_at > cutoff),
            );
            let new_here = fresh.len() - before;
            debug!(
                "Page {} for {}: {} of {} repositories are new",
                pages, username, new_here, returned
            );

            let reached_known = new_here < returned;
            if new_here == 0 || reached_known || returned < requested {
                break;
            }
            match cursor {
                Some(cursor) => options = options.at(Some(cursor)),
                None => break,
            }
        }

        let fetched = fresh.len();
        let repositories = merge(&previous.repositories, fresh);
        let api_calls_saved = estimate_calls_saved(repositories.len(), self.config.per_page, pages);
        info!(
            "Incremental fetch for {}: {} new in {} pages, ~{} calls saved",
            username, fetched, pages, api_calls_saved
        );

        Ok(FetchOutcome {
            repositories,
            strategy: FetchStrategy::Incremental { since },
            fetched,
            pages,
            rate_limit,
            api_calls_saved,
        })
    }
}
