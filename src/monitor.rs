//! Monitoring service
//!
//! Runs one check cycle per user: validate, load state, fetch, classify,
//! persist. Cycles for different users can run side by side; each one owns
//! its state file and source session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{CredentialProvider, TokenSource};
use crate::config::Config;
use crate::differ::{diff, ChangeSet, DiffOptions};
use crate::error::{AuthError, Result, SourceError, StateError, WatchError};
use crate::planner::{FetchOutcome, FetchPlanner, FetchStrategy, FullSyncReason, PlannerConfig};
use crate::retry::{RetryError, RetryExecutor};
use crate::source::{RateLimitInfo, StarSource};
use crate::state::{validate_username, UpdateKind, UserState, STATE_VERSION};
use crate::storage::StateStore;

/// Progress notifications emitted during a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Checking that the user exists
    ValidatingUser { username: String },
    /// A token was found and will be used
    Authenticated { username: String, source: TokenSource },
    /// Reading the previous snapshot
    LoadingState { username: String },
    /// The previous snapshot was unusable and was replaced by an empty one
    StateRecovered { username: String, reason: String },
    /// Fetching starred repositories
    Fetching { username: String, strategy: FetchStrategy },
    /// Fetch finished
    Fetched {
        username: String,
        fetched: usize,
        pages: u32,
    },
    /// Comparing snapshots
    Comparing { username: String },
    /// Writing the new snapshot
    Saving { username: String },
    /// Cycle finished
    Completed { username: String, changes: usize },
}

impl MonitorEvent {
    /// Events worth showing without `--verbose`
    pub fn is_milestone(&self) -> bool {
        matches!(
            self,
            MonitorEvent::ValidatingUser { .. }
                | MonitorEvent::StateRecovered { .. }
                | MonitorEvent::Fetching { .. }
                | MonitorEvent::Completed { .. }
        )
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorEvent::ValidatingUser { username } => {
                write!(f, "Validating user {}", username)
            }
            MonitorEvent::Authenticated { username, source } => {
                write!(f, "Using token from {} for {}", source, username)
            }
            MonitorEvent::LoadingState { username } => {
                write!(f, "Loading previous state for {}", username)
            }
            MonitorEvent::StateRecovered { username, reason } => write!(
                f,
                "Previous state for {} was unusable ({}), starting fresh",
                username, reason
            ),
            MonitorEvent::Fetching { username, strategy } => match strategy {
                FetchStrategy::Full(reason) => {
                    write!(f, "Fetching all starred repositories for {} ({})", username, reason)
                }
                FetchStrategy::Incremental { since } => write!(
                    f,
                    "Fetching repositories {} starred since {}",
                    username,
                    since.format("%Y-%m-%d %H:%M:%S UTC")
                ),
            },
            MonitorEvent::Fetched {
                username,
                fetched,
                pages,
            } => write!(
                f,
                "Fetched {} repositories for {} in {} pages",
                fetched, username, pages
            ),
            MonitorEvent::Comparing { username } => write!(f, "Comparing changes for {}", username),
            MonitorEvent::Saving { username } => write!(f, "Saving state for {}", username),
            MonitorEvent::Completed { username, changes } => {
                write!(f, "Finished {} ({} changes)", username, changes)
            }
        }
    }
}

/// Summary of one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub username: String,
    pub changes: ChangeSet,
    pub total_repositories: usize,
    pub previous_check: Option<DateTime<Utc>>,
    pub current_check: DateTime<Utc>,
    pub rate_limit: Option<RateLimitInfo>,
    pub is_first_run: bool,
    pub is_full_sync: bool,
    pub api_calls_saved: u64,
    pub incremental_enabled: bool,
    /// The previous state file was corrupted and has been rebuilt
    pub state_recovered: bool,
    pub authenticated: bool,
}

/// One user to check and where to keep their state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub username: String,
    pub state_path: PathBuf,
}

/// Runs check cycles
pub struct MonitorService {
    source: Arc<dyn StarSource>,
    store: Arc<dyn StateStore>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    planner: PlannerConfig,
    diff_options: DiffOptions,
    full_sync_interval_hours: u32,
    retry: RetryExecutor,
    cancel: CancellationToken,
    event_callback: Option<Box<dyn Fn(MonitorEvent) + Send + Sync>>,
}

impl MonitorService {
    pub fn new(source: Arc<dyn StarSource>, store: Arc<dyn StateStore>, config: &Config) -> Self {
        let cancel = CancellationToken::new();
        Self {
            source,
            store,
            credentials: None,
            planner: PlannerConfig::from(config),
            diff_options: config.diff_options(),
            full_sync_interval_hours: config.incremental.full_sync_interval_hours,
            retry: RetryExecutor::new(config.retry_policy(), cancel.clone()),
            cancel,
            event_callback: None,
        }
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Share `token` with the caller so in-flight requests and retry waits
    /// can be interrupted.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.retry = RetryExecutor::new(self.retry.policy().clone(), token.clone());
        self.cancel = token;
        self
    }

    /// Skip incremental fetching for cycles run by this service.
    pub fn force_full_sync(mut self, force: bool) -> Self {
        self.planner.force_full = force;
        self
    }

    /// Set event callback
    pub fn on_event<F>(&mut self, callback: F)
    where
        F: Fn(MonitorEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    fn emit_event(&self, event: MonitorEvent) {
        debug!("{}", event);
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }

    /// Source session for one cycle, authenticated when a token is available.
    fn session(&self, username: &str) -> (Arc<dyn StarSource>, bool) {
        let Some(ref provider) = self.credentials else {
            return (self.source.clone(), false);
        };

        match provider.get_credential() {
            Ok(credential) => {
                self.emit_event(MonitorEvent::Authenticated {
                    username: username.to_string(),
                    source: credential.source,
                });
                (self.source.with_credential(&credential), true)
            }
            Err(AuthError::TokenNotFound) => {
                debug!("No token available, continuing unauthenticated");
                (self.source.clone(), false)
            }
            Err(e) => {
                warn!("Could not resolve a token ({}), continuing unauthenticated", e);
                (self.source.clone(), false)
            }
        }
    }

    /// Previous state, or an empty baseline. The second value carries the
    /// reason when an existing file had to be discarded.
    fn load_state(
        &self,
        username: &str,
        path: &Path,
        now: DateTime<Utc>,
    ) -> Result<(UserState, Option<String>)> {
        match self.store.load(path) {
            Ok(state) if state.username.eq_ignore_ascii_case(username) => Ok((state, None)),
            Ok(state) => {
                let reason = format!("state belongs to '{}'", state.username);
                warn!("Ignoring {}: {}", path.display(), reason);
                Ok((UserState::new(username, now), Some(reason)))
            }
            Err(StateError::NotFound { .. }) => {
                debug!("No previous state for {}", username);
                Ok((UserState::new(username, now), None))
            }
            Err(StateError::Corrupted { reason, .. }) => {
                warn!("State file {} is corrupted ({}), starting fresh", path.display(), reason);
                Ok((UserState::new(username, now), Some(reason)))
            }
            Err(e) => Err(WatchError::StateLoad(e)),
        }
    }

    /// Run one full check cycle for `username`, persisting to `state_path`.
    pub async fn run_cycle(&self, username: &str, state_path: &Path) -> Result<CycleResult> {
        validate_username(username)?;

        let (source, authenticated) = self.session(username);

        self.emit_event(MonitorEvent::ValidatingUser {
            username: username.to_string(),
        });
        match self
            .retry
            .run("validate user", || source.validate_user(username))
            .await
        {
            Ok(()) => {}
            Err(RetryError::NonRetryable {
                source: SourceError::NotFound(_),
                ..
            }) => return Err(WatchError::UserNotFound(username.to_string())),
            Err(e) if e.is_cancelled() => return Err(WatchError::Cancelled),
            Err(e) => {
                return Err(WatchError::UserCheck {
                    username: username.to_string(),
                    source: e,
                })
            }
        }

        self.emit_event(MonitorEvent::LoadingState {
            username: username.to_string(),
        });
        let (mut previous, recovered) = self.load_state(username, state_path, Utc::now())?;
        if let Some(ref reason) = recovered {
            self.emit_event(MonitorEvent::StateRecovered {
                username: username.to_string(),
                reason: reason.clone(),
            });
        }
        previous.full_sync_interval = self.full_sync_interval_hours;

        let now = Utc::now();
        let is_first_run = previous.is_first_run();
        let planner = FetchPlanner::new(source.as_ref(), &self.retry, &self.planner);
        self.emit_event(MonitorEvent::Fetching {
            username: username.to_string(),
            strategy: crate::planner::plan(&previous, &self.planner, now),
        });
        let outcome = planner.fetch(username, &previous, now).await?;
        self.emit_event(MonitorEvent::Fetched {
            username: username.to_string(),
            fetched: outcome.fetched,
            pages: outcome.pages,
        });

        self.emit_event(MonitorEvent::Comparing {
            username: username.to_string(),
        });
        let changes = if is_first_run {
            ChangeSet::default()
        } else {
            diff(&previous.repositories, &outcome.repositories, &self.diff_options)
        };

        let previous_check = (!is_first_run).then_some(previous.last_check);
        let state = next_state(previous, &outcome, is_first_run, now);

        if self.cancel.is_cancelled() {
            return Err(WatchError::Cancelled);
        }

        self.emit_event(MonitorEvent::Saving {
            username: username.to_string(),
        });
        self.store
            .save(state_path, &state)
            .map_err(WatchError::Persistence)?;

        if !changes.is_empty() {
            info!("{}: {} changes", username, changes.total_changes);
        }
        self.emit_event(MonitorEvent::Completed {
            username: username.to_string(),
            changes: changes.total_changes,
        });

        let is_full_sync = outcome.is_full_sync();
        Ok(CycleResult {
            username: username.to_string(),
            total_repositories: state.repositories.len(),
            changes,
            previous_check,
            current_check: now,
            rate_limit: outcome.rate_limit,
            is_first_run,
            is_full_sync,
            api_calls_saved: outcome.api_calls_saved,
            incremental_enabled: state.incremental_enabled,
            state_recovered: recovered.is_some(),
            authenticated,
        })
    }

    /// Run cycles for several users concurrently. Results come back in the
    /// order of `targets`.
    pub async fn run_many(&self, targets: &[Target]) -> Vec<(String, Result<CycleResult>)> {
        let cycles = targets.iter().map(|target| async move {
            let result = self.run_cycle(&target.username, &target.state_path).await;
            (target.username.clone(), result)
        });
        join_all(cycles).await
    }
}

/// Fold a fetch into the previous state.
fn next_state(
    previous: UserState,
    outcome: &FetchOutcome,
    is_first_run: bool,
    now: DateTime<Utc>,
) -> UserState {
    let mut state = previous;
    state.repositories = outcome.repositories.clone();
    state.total_count = state.repositories.len() as u64;
    state.check_count = state.check_count.saturating_add(1);
    state.last_check = now;
    state.state_version = STATE_VERSION.to_string();

    match outcome.strategy {
        FetchStrategy::Full(reason) => {
            let kind = match reason {
                FullSyncReason::Fallback => UpdateKind::Fallback,
                _ if is_first_run => UpdateKind::FirstRun,
                _ => UpdateKind::FullSync,
            };
            state.record_full_sync(now, kind, &reason.to_string());
        }
        FetchStrategy::Incremental { .. } => {
            state.record_incremental(now, outcome.fetched, outcome.api_calls_saved);
        }
    }
    state.record_starred_at(outcome.latest_starred_at(), now);
    state
}
