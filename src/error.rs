//! Error types for star-watcher

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::retry::{Classify, RetryClass, RetryError};

/// Errors produced by a [`StarSource`](crate::source::StarSource).
///
/// Every failure the remote side can produce is a distinct variant so the
/// retry executor can classify it without looking at message text.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded{}", .reset_at.map(|t| format!(" (resets at {})", t.to_rfc3339())).unwrap_or_default())]
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        limit: Option<u64>,
    },

    #[error("network error: {0}")]
    Transient(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl Classify for SourceError {
    fn classify(&self) -> RetryClass {
        match self {
            SourceError::RateLimited { reset_at, .. } => RetryClass::RateLimited {
                reset_at: *reset_at,
            },
            SourceError::Transient(_) | SourceError::Server { .. } => RetryClass::Transient,
            SourceError::NotFound(_)
            | SourceError::Unauthorized(_)
            | SourceError::Api { .. }
            | SourceError::Decode(_) => RetryClass::Terminal,
        }
    }
}

/// Invariant violations in the persisted model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid username '{0}': must be 1-39 alphanumeric characters or hyphens, not starting or ending with a hyphen")]
    Username(String),

    #[error("invalid repository name '{0}': expected owner/name")]
    RepositoryName(String),

    #[error("repository {name} has an invalid URL '{url}': must be https")]
    RepositoryUrl { name: String, url: String },

    #[error("{field} is in the future: {value}")]
    FutureTimestamp { field: String, value: DateTime<Utc> },

    #[error("state version must not be empty")]
    MissingVersion,
}

/// Persistence layer failures.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("state file {} is corrupted: {reason}", .path.display())]
    Corrupted { path: PathBuf, reason: String },

    #[error("refusing to save invalid state: {0}")]
    Invalid(#[from] ValidationError),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Credential lookup and storage failures.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no GitHub token found - set GITHUB_TOKEN or run `star-watcher auth login`")]
    TokenNotFound,

    #[error("token must not be empty")]
    EmptyToken,

    #[error("prompt failed: {0}")]
    Prompt(String),

    #[error("token {token} was rejected by GitHub: {reason}")]
    InvalidToken { token: String, reason: String },

    #[error("could not verify token: {0}")]
    Verification(String),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that end a monitoring cycle.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("user '{0}' not found on GitHub")]
    UserNotFound(String),

    #[error("failed to validate user '{username}': {source}")]
    UserCheck {
        username: String,
        source: RetryError<SourceError>,
    },

    #[error("failed to fetch starred repositories: {0}")]
    Fetch(#[source] RetryError<SourceError>),

    #[error("incremental fetch failed and fallback is disabled: {0}")]
    IncrementalFetch(#[source] RetryError<SourceError>),

    #[error("failed to load state: {0}")]
    StateLoad(#[source] StateError),

    #[error("failed to persist state: {0}")]
    Persistence(#[source] StateError),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, WatchError>;

impl WatchError {
    /// Stable label for the failure category, used in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            WatchError::Validation(_) | WatchError::UserNotFound(_) => "validation",
            WatchError::UserCheck { source, .. } => retry_kind(source),
            WatchError::Fetch(source) | WatchError::IncrementalFetch(source) => retry_kind(source),
            WatchError::StateLoad(_) | WatchError::Persistence(_) => "persistence",
            WatchError::Cancelled => "cancelled",
        }
    }

    /// Actionable context for the user, where there is any.
    pub fn hint(&self) -> Option<String> {
        let source = match self {
            WatchError::UserNotFound(_) => {
                return Some("check the spelling of the username".to_string())
            }
            WatchError::Validation(ValidationError::Username(_)) => {
                return Some("usernames may only contain letters, digits and hyphens".to_string())
            }
            WatchError::Persistence(_) | WatchError::StateLoad(_) => {
                return Some("check permissions on the state directory".to_string())
            }
            WatchError::UserCheck { source, .. }
            | WatchError::Fetch(source)
            | WatchError::IncrementalFetch(source) => source.last_error()?,
            _ => return None,
        };

        match source {
            SourceError::RateLimited { reset_at, .. } => Some(match reset_at {
                Some(reset) => format!(
                    "rate limit resets at {}; authenticate with GITHUB_TOKEN for a higher limit",
                    reset.to_rfc3339()
                ),
                None => "authenticate with GITHUB_TOKEN for a higher rate limit".to_string(),
            }),
            SourceError::Unauthorized(_) => {
                Some("the token was rejected; run `star-watcher auth login` to replace it".to_string())
            }
            SourceError::Transient(_) | SourceError::Server { .. } => {
                Some("GitHub may be unreachable; try again later".to_string())
            }
            _ => None,
        }
    }
}

fn retry_kind(err: &RetryError<SourceError>) -> &'static str {
    match err.last_error() {
        None => "cancelled",
        Some(SourceError::RateLimited { .. }) => "rate_limit",
        Some(SourceError::Transient(_)) | Some(SourceError::Server { .. }) => "network",
        Some(SourceError::NotFound(_)) => "not_found",
        Some(SourceError::Unauthorized(_)) => "auth",
        Some(SourceError::Api { .. }) | Some(SourceError::Decode(_)) => "api",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_classification() {
        assert_eq!(
            SourceError::Transient("timeout".into()).classify(),
            RetryClass::Transient
        );
        assert_eq!(
            SourceError::Server {
                status: 502,
                message: String::new()
            }
            .classify(),
            RetryClass::Transient
        );
        assert_eq!(
            SourceError::NotFound("octocat".into()).classify(),
            RetryClass::Terminal
        );
        assert_eq!(
            SourceError::RateLimited {
                reset_at: None,
                limit: Some(60)
            }
            .classify(),
            RetryClass::RateLimited { reset_at: None }
        );
    }

    #[test]
    fn test_watch_error_kind_and_hint() {
        let reset = Utc::now();
        let err = WatchError::Fetch(RetryError::Exhausted {
            attempts: 4,
            source: SourceError::RateLimited {
                reset_at: Some(reset),
                limit: Some(60),
            },
        });
        assert_eq!(err.kind(), "rate_limit");
        assert!(err.hint().unwrap().contains(&reset.to_rfc3339()));

        let err = WatchError::Fetch(RetryError::Cancelled { attempts: 1 });
        assert_eq!(err.kind(), "cancelled");
        assert!(err.hint().is_none());

        assert_eq!(WatchError::UserNotFound("x".into()).kind(), "validation");
    }

    #[test]
    fn test_rate_limit_message_includes_reset() {
        let msg = SourceError::RateLimited {
            reset_at: None,
            limit: None,
        }
        .to_string();
        assert_eq!(msg, "rate limit exceeded");
    }
}
