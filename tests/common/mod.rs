//! In-memory source and store shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use star_watcher::auth::Credential;
use star_watcher::config::Config;
use star_watcher::error::{SourceError, StateError};
use star_watcher::source::{ListOptions, PageInfo, RateLimitInfo, StarSource, StarredPage};
use star_watcher::state::{Repository, UserState};
use star_watcher::storage::StateStore;

pub fn repo(name: &str, starred_at: DateTime<Utc>) -> Repository {
    Repository {
        full_name: name.to_string(),
        description: format!("{} description", name),
        star_count: 1,
        updated_at: Utc::now() - Duration::days(30),
        url: format!("https://github.com/{}", name),
        starred_at,
        language: "Rust".to_string(),
        private: false,
    }
}

/// `count` repositories named `owner/repo-<i>`, starred `i + offset_days` days ago
pub fn repos(prefix: &str, count: usize, offset_days: i64) -> Vec<Repository> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            repo(
                &format!("{}/repo-{}", prefix, i),
                now - Duration::days(i as i64 + offset_days),
            )
        })
        .collect()
}

/// Config with millisecond retry delays
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.max_retries = 2;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.rate_limit_buffer_secs = 0;
    config
}

#[derive(Default)]
struct SourceInner {
    repositories: Mutex<Vec<Repository>>,
    missing_users: Mutex<HashSet<String>>,
    list_errors: Mutex<VecDeque<SourceError>>,
    validate_errors: Mutex<VecDeque<SourceError>>,
    list_calls: AtomicU32,
    validate_calls: AtomicU32,
    page_cap: Mutex<Option<usize>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
}

/// Serves a fixed list of stars newest first, with an index cursor
#[derive(Clone, Default)]
pub struct FakeSource {
    inner: Arc<SourceInner>,
    token: Option<String>,
}

impl FakeSource {
    pub fn new(repositories: Vec<Repository>) -> Self {
        let source = Self::default();
        source.set_repositories(repositories);
        source
    }

    pub fn set_repositories(&self, repositories: Vec<Repository>) {
        *self.inner.repositories.lock().unwrap() = repositories;
    }

    pub fn add(&self, repository: Repository) {
        self.inner.repositories.lock().unwrap().push(repository);
    }

    pub fn remove(&self, full_name: &str) {
        self.inner
            .repositories
            .lock()
            .unwrap()
            .retain(|r| r.full_name != full_name);
    }

    pub fn mark_missing(&self, username: &str) {
        self.inner
            .missing_users
            .lock()
            .unwrap()
            .insert(username.to_string());
    }

    /// Fail the next list call with `error`
    pub fn fail_next_list(&self, error: SourceError) {
        self.inner.list_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_validate(&self, error: SourceError) {
        self.inner.validate_errors.lock().unwrap().push_back(error);
    }

    /// Serve at most `size` items per page while still reporting a next page
    pub fn cap_page_size(&self, size: usize) {
        *self.inner.page_cap.lock().unwrap() = Some(size);
    }

    pub fn list_calls(&self) -> u32 {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> u32 {
        self.inner.validate_calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.inner.list_calls.store(0, Ordering::SeqCst);
        self.inner.validate_calls.store(0, Ordering::SeqCst);
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.inner.tokens_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StarSource for FakeSource {
    async fn list_starred(
        &self,
        _username: &str,
        options: &ListOptions,
    ) -> Result<StarredPage, SourceError> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.tokens_seen.lock().unwrap().push(self.token.clone());
        if let Some(error) = self.inner.list_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut all = self.inner.repositories.lock().unwrap().clone();
        all.sort_by(|a, b| {
            b.starred_at
                .cmp(&a.starred_at)
                .then_with(|| a.full_name.cmp(&b.full_name))
        });

        let start: usize = options
            .cursor
            .as_deref()
            .map(|c| c.parse().unwrap())
            .unwrap_or(0);
        let size = match *self.inner.page_cap.lock().unwrap() {
            Some(cap) => cap.min(options.per_page as usize),
            None => options.per_page as usize,
        };
        let end = (start + size).min(all.len());
        let page = all.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let has_next = end < all.len();

        Ok(StarredPage {
            repositories: page,
            page_info: PageInfo {
                has_next,
                next_cursor: has_next.then(|| end.to_string()),
            },
            rate_limit: Some(RateLimitInfo {
                limit: 5000,
                remaining: 4000,
                reset_at: Some(Utc::now() + Duration::hours(1)),
                used: 1000,
            }),
        })
    }

    async fn validate_user(&self, username: &str) -> Result<(), SourceError> {
        self.inner.validate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.validate_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.inner.missing_users.lock().unwrap().contains(username) {
            return Err(SourceError::NotFound(format!("user {}", username)));
        }
        Ok(())
    }

    fn with_credential(&self, credential: &Credential) -> Arc<dyn StarSource> {
        Arc::new(Self {
            inner: self.inner.clone(),
            token: Some(credential.token.clone()),
        })
    }
}

/// Keeps states in a map; can be told to report corruption or fail writes
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<PathBuf, UserState>>,
    corrupted: Mutex<HashSet<PathBuf>>,
    fail_saves: AtomicBool,
    saves: AtomicU32,
}

impl MemoryStore {
    pub fn get(&self, path: &Path) -> Option<UserState> {
        self.states.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, path: &Path, state: UserState) {
        self.states.lock().unwrap().insert(path.to_path_buf(), state);
    }

    pub fn corrupt(&self, path: &Path) {
        self.corrupted.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStore {
    fn load(&self, path: &Path) -> Result<UserState, StateError> {
        if self.corrupted.lock().unwrap().contains(path) {
            return Err(StateError::Corrupted {
                path: path.to_path_buf(),
                reason: "expected value at line 1 column 1".to_string(),
            });
        }
        self.get(path).ok_or_else(|| StateError::NotFound {
            path: path.to_path_buf(),
        })
    }

    fn save(&self, path: &Path, state: &UserState) -> Result<(), StateError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StateError::Write {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        state.validate(Utc::now())?;
        self.corrupted.lock().unwrap().remove(path);
        self.insert(path, state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
