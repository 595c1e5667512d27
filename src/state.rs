//! Persisted per-user snapshot of starred repositories
//!
//! [`UserState`] is what gets written to `~/.star-watcher/<user>.json`. Field
//! names are part of the on-disk format and must stay stable; fields added
//! after the first release carry serde defaults so older files still load.

use std::collections::VecDeque;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

/// Schema version written into every state file
pub const STATE_VERSION: &str = "1.0.0";

/// Allowed drift between our clock and GitHub's before a timestamp counts as "in the future"
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 60;

/// Full resync interval used when a state file predates the field
pub const DEFAULT_FULL_SYNC_INTERVAL_HOURS: u32 = 24;

/// Entries kept in [`AuditLog`]
pub const AUDIT_LOG_CAPACITY: usize = 100;

fn username_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,37}[a-zA-Z0-9])?$").ok())
        .as_ref()
}

fn repository_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_.-]+/[a-zA-Z0-9_.-]+$").ok())
        .as_ref()
}

/// Check a GitHub username: 1-39 characters, alphanumeric or hyphen, no
/// leading or trailing hyphen.
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username_pattern().map_or(false, |re| re.is_match(username)) {
        Ok(())
    } else {
        Err(ValidationError::Username(username.to_string()))
    }
}

fn check_not_future(
    field: impl Into<String>,
    value: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if value > now + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS) {
        return Err(ValidationError::FutureTimestamp {
            field: field.into(),
            value,
        });
    }
    Ok(())
}

/// A repository the user has starred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// `owner/name`, the identity key
    pub full_name: String,
    #[serde(default)]
    pub description: String,
    pub star_count: u64,
    /// Last time the repository itself changed
    pub updated_at: DateTime<Utc>,
    pub url: String,
    /// When the watched user starred it
    pub starred_at: DateTime<Utc>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub private: bool,
}

impl Repository {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if !repository_pattern().map_or(false, |re| re.is_match(&self.full_name)) {
            return Err(ValidationError::RepositoryName(self.full_name.clone()));
        }

        let https = reqwest::Url::parse(&self.url)
            .map(|url| url.scheme() == "https")
            .unwrap_or(false);
        if !https {
            return Err(ValidationError::RepositoryUrl {
                name: self.full_name.clone(),
                url: self.url.clone(),
            });
        }

        check_not_future(format!("{} starred_at", self.full_name), self.starred_at, now)
    }

    /// True when any of the descriptive fields differ.
    pub fn metadata_differs(&self, other: &Repository) -> bool {
        self.description != other.description
            || self.star_count != other.star_count
            || self.language != other.language
            || self.private != other.private
            || self.updated_at != other.updated_at
    }
}

/// Most recent `starred_at` across `repositories`.
pub fn latest_starred_at<'a, I>(repositories: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = &'a Repository>,
{
    repositories.into_iter().map(|r| r.starred_at).max()
}

/// What kind of bookkeeping change an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    StarredAt,
    FullSync,
    Incremental,
    FirstRun,
    Fallback,
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampUpdate {
    pub timestamp: DateTime<Utc>,
    pub update_type: UpdateKind,
    pub old_value: Option<DateTime<Utc>>,
    pub new_value: Option<DateTime<Utc>>,
    pub repo_count: usize,
    #[serde(default)]
    pub api_calls_saved: u64,
    #[serde(default)]
    pub reason: String,
}

/// Fixed-capacity log of bookkeeping changes. The oldest entries are
/// dropped on push and when an oversized log is read back from disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TimestampUpdate>", into = "Vec<TimestampUpdate>")]
pub struct AuditLog {
    entries: VecDeque<TimestampUpdate>,
}

impl AuditLog {
    pub fn push(&mut self, entry: TimestampUpdate) {
        self.entries.push_back(entry);
        while self.entries.len() > AUDIT_LOG_CAPACITY {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimestampUpdate> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&TimestampUpdate> {
        self.entries.back()
    }
}

impl From<Vec<TimestampUpdate>> for AuditLog {
    fn from(entries: Vec<TimestampUpdate>) -> Self {
        let skip = entries.len().saturating_sub(AUDIT_LOG_CAPACITY);
        Self {
            entries: entries.into_iter().skip(skip).collect(),
        }
    }
}

impl From<AuditLog> for Vec<TimestampUpdate> {
    fn from(log: AuditLog) -> Self {
        log.entries.into_iter().collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_full_sync_interval() -> u32 {
    DEFAULT_FULL_SYNC_INTERVAL_HOURS
}

/// Reads `null` as the empty value. Files from users with no stars carry
/// `"repositories": null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Everything we remember about one watched user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub username: String,
    pub last_check: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub repositories: Vec<Repository>,
    /// Repository count reported by the last fetch
    pub total_count: u64,
    pub state_version: String,
    pub check_count: u64,

    /// Newest `starred_at` seen so far; the incremental fetch cutoff
    #[serde(default)]
    pub last_starred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_full_sync_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub incremental_enabled: bool,
    /// Hours between forced full fetches
    #[serde(default = "default_full_sync_interval")]
    pub full_sync_interval: u32,
    #[serde(default)]
    pub last_incremental_at: Option<DateTime<Utc>>,
    /// Running estimate of API calls avoided by incremental fetches
    #[serde(default)]
    pub api_calls_saved: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp_updates: AuditLog,
}

impl UserState {
    /// Empty baseline for a user we have never checked.
    pub fn new(username: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            last_check: now,
            repositories: Vec::new(),
            total_count: 0,
            state_version: STATE_VERSION.to_string(),
            check_count: 0,
            last_starred_at: None,
            last_full_sync_at: None,
            incremental_enabled: true,
            full_sync_interval: DEFAULT_FULL_SYNC_INTERVAL_HOURS,
            last_incremental_at: None,
            api_calls_saved: 0,
            timestamp_updates: AuditLog::default(),
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        validate_username(&self.username)?;

        if self.state_version.trim().is_empty() {
            return Err(ValidationError::MissingVersion);
        }

        check_not_future("last_check", self.last_check, now)?;
        for (field, value) in [
            ("last_starred_at", self.last_starred_at),
            ("last_full_sync_at", self.last_full_sync_at),
            ("last_incremental_at", self.last_incremental_at),
        ] {
            if let Some(value) = value {
                check_not_future(field, value, now)?;
            }
        }

        for repo in &self.repositories {
            repo.validate(now)?;
        }

        Ok(())
    }

    pub fn is_first_run(&self) -> bool {
        self.check_count == 0
    }

    /// True when the configured interval has passed since the last full
    /// fetch, or there never was one.
    pub fn full_sync_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_full_sync_at {
            None => true,
            Some(last) => now - last >= Duration::hours(i64::from(self.full_sync_interval)),
        }
    }

    /// Advance the incremental cutoff if `candidate` is newer.
    pub fn record_starred_at(&mut self, candidate: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let Some(candidate) = candidate else {
            return;
        };
        if self.last_starred_at.map_or(true, |current| candidate > current) {
            let old = self.last_starred_at.replace(candidate);
            self.timestamp_updates.push(TimestampUpdate {
                timestamp: now,
                update_type: UpdateKind::StarredAt,
                old_value: old,
                new_value: Some(candidate),
                repo_count: self.repositories.len(),
                api_calls_saved: 0,
                reason: "newer star observed".to_string(),
            });
        }
    }

    pub fn record_full_sync(&mut self, now: DateTime<Utc>, kind: UpdateKind, reason: &str) {
        let old = self.last_full_sync_at.replace(now);
        self.timestamp_updates.push(TimestampUpdate {
            timestamp: now,
            update_type: kind,
            old_value: old,
            new_value: Some(now),
            repo_count: self.repositories.len(),
            api_calls_saved: 0,
            reason: reason.to_string(),
        });
    }

    pub fn record_incremental(&mut self, now: DateTime<Utc>, fetched: usize, calls_saved: u64) {
        let old = self.last_incremental_at.replace(now);
        self.api_calls_saved = self.api_calls_saved.saturating_add(calls_saved);
        self.timestamp_updates.push(TimestampUpdate {
            timestamp: now,
            update_type: UpdateKind::Incremental,
            old_value: old,
            new_value: Some(now),
            repo_count: fetched,
            api_calls_saved: calls_saved,
            reason: format!("fetched {} new repositories", fetched),
        });
    }
}
