//! Change classification between two snapshots
//!
//! Every repository lands in at most one bucket. For a repository present in
//! both snapshots a moved `starred_at` wins over metadata churn: a move of at
//! least the re-star threshold counts as a new star (GitHub gives no other
//! signal for unstar-then-restar), a smaller move is a re-star.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use serde::Serialize;

use crate::state::Repository;

/// Default gap between two `starred_at` values that counts as a fresh star
pub const DEFAULT_RESTAR_THRESHOLD_SECS: i64 = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct DiffOptions {
    /// Report repositories that disappeared. Only trustworthy after a full fetch.
    pub detect_unstars: bool,
    pub detect_restars: bool,
    pub restar_threshold: Duration,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            detect_unstars: true,
            detect_restars: true,
            restar_threshold: Duration::seconds(DEFAULT_RESTAR_THRESHOLD_SECS),
        }
    }
}

/// Result of comparing two snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub new_stars: Vec<Repository>,
    pub unstars: Vec<Repository>,
    pub re_stars: Vec<Repository>,
    pub updated: Vec<Repository>,
    pub total_changes: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.total_changes == 0
    }
}

fn newest_first(repos: &mut [Repository]) {
    repos.sort_by(|a, b| {
        b.starred_at
            .cmp(&a.starred_at)
            .then_with(|| a.full_name.cmp(&b.full_name))
    });
}

/// Classify `current` against `previous`, both keyed by `full_name`.
pub fn diff(previous: &[Repository], current: &[Repository], options: &DiffOptions) -> ChangeSet {
    let before: HashMap<&str, &Repository> = previous
        .iter()
        .map(|r| (r.full_name.as_str(), r))
        .collect();

    let mut changes = ChangeSet::default();
    let mut seen = HashSet::with_capacity(current.len());

    for repo in current {
        if !seen.insert(repo.full_name.as_str()) {
            continue;
        }

        let Some(old) = before.get(repo.full_name.as_str()) else {
            changes.new_stars.push(repo.clone());
            continue;
        };

        if options.detect_restars && repo.starred_at > old.starred_at {
            if repo.starred_at - old.starred_at >= options.restar_threshold {
                changes.new_stars.push(repo.clone());
            } else {
                changes.re_stars.push(repo.clone());
            }
        } else if repo.metadata_differs(old) {
            changes.updated.push(repo.clone());
        }
    }

    if options.detect_unstars {
        let mut gone = HashSet::new();
        for old in previous {
            if !seen.contains(old.full_name.as_str()) && gone.insert(old.full_name.as_str()) {
                changes.unstars.push(old.clone());
            }
        }
    }

    newest_first(&mut changes.new_stars);
    newest_first(&mut changes.unstars);
    newest_first(&mut changes.re_stars);
    newest_first(&mut changes.updated);

    changes.total_changes = changes.new_stars.len()
        + changes.unstars.len()
        + changes.re_stars.len()
        + changes.updated.len();
    changes
}
