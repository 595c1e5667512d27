//! End-to-end check cycles against the in-memory source and store

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use common::{repo, repos, test_config, FakeSource, MemoryStore};
use star_watcher::auth::{Credential, StaticCredential, TokenSource};
use star_watcher::config::Config;
use star_watcher::error::{SourceError, WatchError};
use star_watcher::monitor::{MonitorEvent, MonitorService, Target};
use star_watcher::state::{Repository, UpdateKind};

fn state_path(username: &str) -> PathBuf {
    PathBuf::from(format!("/state/{}.json", username))
}

fn service(source: &FakeSource, store: &Arc<MemoryStore>, config: &Config) -> MonitorService {
    MonitorService::new(Arc::new(source.clone()), store.clone(), config)
}

fn names(repositories: &[Repository]) -> Vec<String> {
    repositories.iter().map(|r| r.full_name.clone()).collect()
}

fn stored_names(store: &MemoryStore, path: &Path) -> Vec<String> {
    let mut names = names(&store.get(path).unwrap().repositories);
    names.sort();
    names
}

#[tokio::test]
async fn test_first_run_establishes_baseline() {
    let source = FakeSource::new(repos("octo", 3, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");

    let result = service(&source, &store, &test_config())
        .run_cycle("octocat", &path)
        .await
        .unwrap();

    assert!(result.is_first_run);
    assert!(result.is_full_sync);
    assert!(result.changes.is_empty());
    assert_eq!(result.total_repositories, 3);
    assert_eq!(result.previous_check, None);

    let state = store.get(&path).unwrap();
    assert_eq!(state.check_count, 1);
    assert_eq!(state.repositories.len(), 3);
    assert!(state.last_full_sync_at.is_some());
    assert_eq!(
        state.timestamp_updates.iter().next().unwrap().update_type,
        UpdateKind::FirstRun
    );
}

#[tokio::test]
async fn test_new_star_detected_incrementally() {
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &test_config());

    service.run_cycle("octocat", &path).await.unwrap();
    source.add(repo("new/star", Utc::now() - Duration::hours(1)));
    source.reset_calls();

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(!result.is_first_run);
    assert!(!result.is_full_sync);
    assert_eq!(names(&result.changes.new_stars), vec!["new/star"]);
    assert_eq!(result.changes.total_changes, 1);
    assert_eq!(result.total_repositories, 3);
    assert!(result.previous_check.is_some());
    assert_eq!(source.list_calls(), 1);

    let state = store.get(&path).unwrap();
    assert_eq!(state.check_count, 2);
    assert!(state.last_incremental_at.is_some());
    assert_eq!(
        state.last_starred_at.unwrap(),
        result.changes.new_stars[0].starred_at
    );
}

#[tokio::test]
async fn test_corrupted_state_starts_fresh() {
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    store.corrupt(&path);

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let mut service = service(&source, &store, &test_config());
    service.on_event(move |event| seen.lock().unwrap().push(event));

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(result.state_recovered);
    assert!(result.is_first_run);
    assert!(result.changes.is_empty());
    assert_eq!(store.get(&path).unwrap().check_count, 1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, MonitorEvent::StateRecovered { .. })));
}

#[tokio::test]
async fn test_state_of_other_user_is_discarded() {
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("shared");
    let service = service(&source, &store, &test_config());

    service.run_cycle("someone", &path).await.unwrap();
    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(result.state_recovered);
    assert!(result.is_first_run);
    assert_eq!(store.get(&path).unwrap().username, "octocat");
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_for_reset() {
    let source = FakeSource::new(repos("octo", 2, 1));
    source.fail_next_list(SourceError::RateLimited {
        reset_at: Some(Utc::now() + Duration::seconds(2)),
        limit: Some(60),
    });
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");

    let started = tokio::time::Instant::now();
    let result = service(&source, &store, &test_config())
        .run_cycle("octocat", &path)
        .await
        .unwrap();

    assert!(started.elapsed() >= std::time::Duration::from_millis(1900));
    assert_eq!(result.total_repositories, 2);
    assert_eq!(source.list_calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_without_retry_fails() {
    let source = FakeSource::new(repos("octo", 2, 1));
    source.fail_next_list(SourceError::RateLimited {
        reset_at: None,
        limit: Some(60),
    });
    let store = Arc::new(MemoryStore::default());
    let mut config = test_config();
    config.retry.retry_on_rate_limit = false;

    let err = service(&source, &store, &config)
        .run_cycle("octocat", &state_path("octocat"))
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::Fetch(_)));
    assert_eq!(err.kind(), "rate_limit");
    assert_eq!(store.saves(), 0);
}

#[tokio::test]
async fn test_incremental_matches_full_fetch() {
    let mut config = test_config();
    config.api.per_page = 2;

    let source = FakeSource::new(repos("old", 6, 1));
    let incremental_store = Arc::new(MemoryStore::default());
    let full_store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");

    let incremental = service(&source, &incremental_store, &config);
    incremental.run_cycle("octocat", &path).await.unwrap();
    full_store.insert(&path, incremental_store.get(&path).unwrap());

    let now = Utc::now();
    for hours in 1..=3 {
        source.add(repo(&format!("new/repo-{}", hours), now - Duration::hours(hours)));
    }

    source.reset_calls();
    let from_incremental = incremental.run_cycle("octocat", &path).await.unwrap();
    let incremental_calls = source.list_calls();

    source.reset_calls();
    let from_full = service(&source, &full_store, &config)
        .force_full_sync(true)
        .run_cycle("octocat", &path)
        .await
        .unwrap();
    let full_calls = source.list_calls();

    assert!(!from_incremental.is_full_sync);
    assert!(from_full.is_full_sync);
    assert_eq!(
        names(&from_incremental.changes.new_stars),
        names(&from_full.changes.new_stars)
    );
    assert_eq!(from_incremental.changes.new_stars.len(), 3);
    assert_eq!(
        stored_names(&incremental_store, &path),
        stored_names(&full_store, &path)
    );
    assert_eq!(incremental_calls, 2);
    assert_eq!(full_calls, 5);
    assert!(from_incremental.api_calls_saved > 0);
}

#[tokio::test]
async fn test_repeated_full_fetch_is_idempotent() {
    let source = FakeSource::new(repos("octo", 5, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &test_config()).force_full_sync(true);

    service.run_cycle("octocat", &path).await.unwrap();
    let first = store.get(&path).unwrap().repositories;
    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(result.changes.is_empty());
    assert_eq!(store.get(&path).unwrap().repositories, first);
}

#[tokio::test]
async fn test_full_sync_reports_unstars() {
    let source = FakeSource::new(repos("octo", 3, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &test_config()).force_full_sync(true);

    service.run_cycle("octocat", &path).await.unwrap();
    source.remove("octo/repo-1");
    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert_eq!(names(&result.changes.unstars), vec!["octo/repo-1"]);
    assert_eq!(result.total_repositories, 2);
}

#[tokio::test]
async fn test_failed_incremental_falls_back_to_full() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    let source = FakeSource::new(repos("octo", 3, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    source.add(repo("new/star", Utc::now() - Duration::hours(1)));
    source.fail_next_list(SourceError::Server {
        status: 502,
        message: "bad gateway".to_string(),
    });

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(result.is_full_sync);
    assert_eq!(names(&result.changes.new_stars), vec!["new/star"]);
    let state = store.get(&path).unwrap();
    assert!(state
        .timestamp_updates
        .iter()
        .any(|u| u.update_type == UpdateKind::Fallback));
}

#[tokio::test]
async fn test_failed_incremental_without_fallback() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    config.incremental.fallback_on_error = false;
    let source = FakeSource::new(repos("octo", 3, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    source.fail_next_list(SourceError::Transient("connection reset".to_string()));

    let err = service.run_cycle("octocat", &path).await.unwrap_err();

    assert!(matches!(err, WatchError::IncrementalFetch(_)));
    assert_eq!(err.kind(), "network");
    assert_eq!(store.get(&path).unwrap().check_count, 1);
}

#[tokio::test]
async fn test_incremental_page_limit() {
    let mut config = test_config();
    config.api.per_page = 2;
    config.incremental.max_incremental_pages = 1;
    let source = FakeSource::new(repos("old", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    let now = Utc::now();
    for minutes in 1..=5 {
        source.add(repo(&format!("new/repo-{}", minutes), now - Duration::minutes(minutes * 10)));
    }
    source.reset_calls();

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert_eq!(source.list_calls(), 1);
    assert_eq!(
        names(&result.changes.new_stars),
        vec!["new/repo-1", "new/repo-2"]
    );
}

#[tokio::test]
async fn test_tolerance_window_bounds_incremental_cutoff() {
    let config = test_config();
    let tolerance = Duration::seconds(config.incremental.timestamp_tolerance_secs as i64);
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    let last_seen = store.get(&path).unwrap().last_starred_at.unwrap();
    source.add(repo("edge/at-tolerance", last_seen + tolerance));
    source.add(repo(
        "edge/past-tolerance",
        last_seen + tolerance + Duration::seconds(1),
    ));

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(!result.is_full_sync);
    assert_eq!(names(&result.changes.new_stars), vec!["edge/past-tolerance"]);
    assert!(!stored_names(&store, &path).contains(&"edge/at-tolerance".to_string()));
}

#[tokio::test]
async fn test_page_of_known_stars_ends_incremental_fetch() {
    let mut config = test_config();
    config.api.per_page = 2;
    let source = FakeSource::new(repos("octo", 5, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    source.reset_calls();

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(!result.is_full_sync);
    assert_eq!(source.list_calls(), 1);
    assert!(result.changes.is_empty());
    assert_eq!(result.total_repositories, 5);
}

#[tokio::test]
async fn test_short_page_ends_incremental_fetch() {
    let mut config = test_config();
    config.api.per_page = 3;
    let source = FakeSource::new(repos("old", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    let now = Utc::now();
    for hours in 1..=4 {
        source.add(repo(&format!("new/repo-{}", hours), now - Duration::hours(hours)));
    }
    // two items per page although three were asked for, with more pages behind
    source.cap_page_size(2);
    source.reset_calls();

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(!result.is_full_sync);
    assert_eq!(source.list_calls(), 1);
    assert_eq!(
        names(&result.changes.new_stars),
        vec!["new/repo-1", "new/repo-2"]
    );
}

#[tokio::test]
async fn test_huge_tolerance_forces_full_fetch() {
    let mut config = test_config();
    config.incremental.timestamp_tolerance_secs = 10_000_000_000_000;
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &config);

    service.run_cycle("octocat", &path).await.unwrap();
    source.add(repo("new/star", Utc::now() - Duration::hours(1)));

    let result = service.run_cycle("octocat", &path).await.unwrap();

    assert!(result.is_full_sync);
    assert_eq!(names(&result.changes.new_stars), vec!["new/star"]);
}

#[tokio::test]
async fn test_persistence_failure_is_reported() {
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let path = state_path("octocat");
    let service = service(&source, &store, &test_config());

    service.run_cycle("octocat", &path).await.unwrap();
    let before = store.get(&path).unwrap();
    store.fail_saves(true);
    source.add(repo("new/star", Utc::now() - Duration::hours(1)));

    let err = service.run_cycle("octocat", &path).await.unwrap_err();

    assert!(matches!(err, WatchError::Persistence(_)));
    assert_eq!(err.kind(), "persistence");
    assert_eq!(store.get(&path).unwrap().check_count, before.check_count);
    assert_eq!(store.get(&path).unwrap().repositories, before.repositories);
}

#[tokio::test]
async fn test_unknown_user_touches_nothing() {
    let source = FakeSource::new(repos("octo", 2, 1));
    source.mark_missing("ghost");
    let store = Arc::new(MemoryStore::default());

    let err = service(&source, &store, &test_config())
        .run_cycle("ghost", &state_path("ghost"))
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::UserNotFound(ref u) if u == "ghost"));
    assert_eq!(source.validate_calls(), 1);
    assert_eq!(source.list_calls(), 0);
    assert_eq!(store.saves(), 0);
}

#[tokio::test]
async fn test_invalid_username_rejected_before_requests() {
    let source = FakeSource::new(Vec::new());
    let store = Arc::new(MemoryStore::default());

    let err = service(&source, &store, &test_config())
        .run_cycle("-bad-", &state_path("bad"))
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::Validation(_)));
    assert_eq!(source.validate_calls(), 0);
}

#[tokio::test]
async fn test_user_check_retries_transient_errors() {
    let source = FakeSource::new(repos("octo", 1, 1));
    source.fail_next_validate(SourceError::Transient("timeout".to_string()));
    let store = Arc::new(MemoryStore::default());

    service(&source, &store, &test_config())
        .run_cycle("octocat", &state_path("octocat"))
        .await
        .unwrap();

    assert_eq!(source.validate_calls(), 2);
}

#[tokio::test]
async fn test_cancelled_cycle_saves_nothing() {
    let source = FakeSource::new(repos("octo", 2, 1));
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = service(&source, &store, &test_config())
        .with_cancellation(cancel)
        .run_cycle("octocat", &state_path("octocat"))
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::Cancelled));
    assert_eq!(store.saves(), 0);
}

#[tokio::test]
async fn test_credentials_reach_the_source() {
    let source = FakeSource::new(repos("octo", 1, 1));
    let store = Arc::new(MemoryStore::default());
    let credential = Credential::new("ghp_testtoken123", TokenSource::Environment);

    let result = service(&source, &store, &test_config())
        .with_credentials(Arc::new(StaticCredential(credential)))
        .run_cycle("octocat", &state_path("octocat"))
        .await
        .unwrap();

    assert!(result.authenticated);
    assert!(source
        .tokens_seen()
        .iter()
        .all(|t| t.as_deref() == Some("ghp_testtoken123")));
}

#[tokio::test]
async fn test_run_many_keeps_order_and_isolates_failures() {
    let source = FakeSource::new(repos("octo", 2, 1));
    source.mark_missing("ghost");
    let store = Arc::new(MemoryStore::default());
    let targets: Vec<Target> = ["alice", "ghost", "bob"]
        .iter()
        .map(|name| Target {
            username: name.to_string(),
            state_path: state_path(name),
        })
        .collect();

    let outcomes = service(&source, &store, &test_config())
        .run_many(&targets)
        .await;

    let users: Vec<&str> = outcomes.iter().map(|(u, _)| u.as_str()).collect();
    assert_eq!(users, vec!["alice", "ghost", "bob"]);
    assert!(outcomes[0].1.is_ok());
    assert!(outcomes[1].1.is_err());
    assert!(outcomes[2].1.is_ok());
    assert!(store.get(&state_path("alice")).is_some());
    assert!(store.get(&state_path("bob")).is_some());
    assert!(store.get(&state_path("ghost")).is_none());
}
