//! Result rendering

use std::fmt::Write;

use clap::ValueEnum;
use console::{style, Emoji};
use serde::Serialize;

use crate::error::WatchError;
use crate::monitor::CycleResult;
use crate::state::Repository;

static STAR: Emoji = Emoji("🌟 ", "* ");
static CHECK: Emoji = Emoji("✓ ", "* ");
static CROSS: Emoji = Emoji("✗ ", "x ");
static WARN: Emoji = Emoji("⚠ ", "! ");

/// Remaining requests below which a warning is printed
pub const LOW_RATE_LIMIT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    username: &'a str,
    kind: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl<'a> ErrorReport<'a> {
    fn new(username: &'a str, err: &WatchError) -> Self {
        Self {
            username,
            kind: err.kind(),
            error: err.to_string(),
            hint: err.hint(),
        }
    }
}

fn repo_line(repo: &Repository) -> String {
    let mut line = format!("{}", style(&repo.full_name).cyan().bold());
    if !repo.description.is_empty() {
        let _ = write!(line, " - {}", repo.description);
    }
    let mut meta = Vec::new();
    if !repo.language.is_empty() {
        meta.push(repo.language.clone());
    }
    meta.push(format!("★ {}", repo.star_count));
    if repo.private {
        meta.push("private".to_string());
    }
    let _ = write!(line, " {}", style(format!("({})", meta.join(", "))).dim());
    line
}

fn section(out: &mut String, title: String, repos: &[Repository]) {
    if repos.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}", title);
    for repo in repos {
        let _ = writeln!(out, "  {}", repo_line(repo));
        let _ = writeln!(out, "    {}", style(&repo.url).dim());
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        "repository"
    } else {
        "repositories"
    }
}

/// Human-readable report for one cycle.
pub fn render_text(result: &CycleResult, verbose: bool) -> String {
    let mut out = String::new();
    let user = style(&result.username).green().bold();
    let changes = &result.changes;

    if result.state_recovered {
        let _ = writeln!(
            out,
            "{}Previous state for {} could not be read and was rebuilt",
            WARN, user
        );
    }

    if result.is_first_run {
        let _ = writeln!(
            out,
            "{}First run for {} - baseline established with {} starred {}",
            CHECK,
            user,
            result.total_repositories,
            plural(result.total_repositories)
        );
    } else if changes.new_stars.is_empty() {
        let _ = writeln!(out, "{}No new starred repositories found for {}", CHECK, user);
    } else {
        let count = changes.new_stars.len();
        section(
            &mut out,
            format!("{}{} has starred {} new {}!", STAR, user, count, plural(count)),
            &changes.new_stars,
        );
    }

    if verbose && !result.is_first_run {
        section(
            &mut out,
            format!("{} unstarred:", style("Unstarred").yellow()),
            &changes.unstars,
        );
        section(
            &mut out,
            format!("{} (starred again):", style("Re-starred").yellow()),
            &changes.re_stars,
        );
        section(
            &mut out,
            format!("{}:", style("Updated").yellow()),
            &changes.updated,
        );
    } else if !result.is_first_run {
        let other = changes.unstars.len() + changes.re_stars.len() + changes.updated.len();
        if other > 0 {
            let _ = writeln!(
                out,
                "  {}",
                style(format!(
                    "{} other changes ({} unstarred, {} re-starred, {} updated); use --verbose for details",
                    other,
                    changes.unstars.len(),
                    changes.re_stars.len(),
                    changes.updated.len()
                ))
                .dim()
            );
        }
    }

    let mut summary = format!(
        "Tracking {} {}",
        result.total_repositories,
        plural(result.total_repositories)
    );
    if let Some(previous) = result.previous_check {
        let _ = write!(
            summary,
            ", last checked {}",
            previous.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if result.is_full_sync {
        summary.push_str(", full sync");
    } else {
        let _ = write!(
            summary,
            ", incremental (~{} API calls saved)",
            result.api_calls_saved
        );
    }
    let _ = writeln!(out, "  {}", style(summary).dim());

    if let Some(ref rate) = result.rate_limit {
        if rate.remaining < LOW_RATE_LIMIT {
            let reset = rate
                .reset_at
                .map(|t| format!(", resets at {}", t.format("%H:%M:%S UTC")))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{}{}",
                WARN,
                style(format!(
                    "Only {} of {} API requests left{}",
                    rate.remaining, rate.limit, reset
                ))
                .yellow()
            );
            if !result.authenticated {
                let _ = writeln!(
                    out,
                    "  {}",
                    style("Set GITHUB_TOKEN or pass --auth for a higher limit").dim()
                );
            }
        }
    }

    out
}

/// Human-readable report for a failed cycle.
pub fn render_error_text(username: &str, err: &WatchError) -> String {
    let mut out = format!(
        "{}{} {}: {}\n",
        CROSS,
        style(username).red().bold(),
        style(format!("[{}]", err.kind())).dim(),
        err
    );
    if let Some(hint) = err.hint() {
        let _ = writeln!(out, "  {}", style(hint).dim());
    }
    out
}

/// JSON for one or more cycles. A single user renders as the bare result
/// (or error) object; several users render as `{results, errors}`.
pub fn render_json(outcomes: &[(String, Result<CycleResult, WatchError>)]) -> serde_json::Result<String> {
    if let [(username, single)] = outcomes {
        return match single {
            Ok(result) => serde_json::to_string_pretty(result),
            Err(err) => serde_json::to_string_pretty(&ErrorReport::new(username, err)),
        };
    }

    let results: Vec<&CycleResult> = outcomes.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
    let errors: Vec<ErrorReport> = outcomes
        .iter()
        .filter_map(|(user, r)| r.as_ref().err().map(|e| ErrorReport::new(user, e)))
        .collect();

    serde_json::to_string_pretty(&serde_json::json!({
        "results": results,
        "errors": errors,
    }))
}
