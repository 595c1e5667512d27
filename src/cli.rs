//! CLI command definitions and handlers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji, Term};
use dialoguer::Password;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use star_watcher::auth::{prompt_for_token, CredentialProvider, StaticCredential, TokenManager};
use star_watcher::config::Config;
use star_watcher::github::GitHubClient;
use star_watcher::monitor::{MonitorService, Target};
use star_watcher::output::{render_error_text, render_json, render_text, OutputFormat};
use star_watcher::state::validate_username;
use star_watcher::storage::{default_state_path, remove_all, remove_state, JsonStateStore};

static CHECK: Emoji = Emoji("✓ ", "* ");
static CROSS: Emoji = Emoji("✗ ", "x ");
static ARROW: Emoji = Emoji("→ ", "-> ");
static INFO: Emoji = Emoji("ℹ ", "i ");

#[derive(Parser)]
#[command(name = "star-watcher")]
#[command(
    author,
    version,
    about = "Watch GitHub users' starred repositories and report what changed"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print results and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Config file (default: ~/.config/star-watcher/config.toml)
    #[arg(long, global = true, env = "STAR_WATCHER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check users for newly starred repositories
    Monitor {
        /// GitHub usernames, comma-separated (e.g. octocat,torvalds)
        #[arg(value_delimiter = ',', required = true)]
        usernames: Vec<String>,

        /// State file to use instead of ~/.star-watcher/<user>.json (single user only)
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,

        /// Prompt for a GitHub token if none is configured
        #[arg(long)]
        auth: bool,

        /// Fetch every starred repository instead of only new ones
        #[arg(long)]
        full: bool,
    },

    /// Remove stored state
    Cleanup {
        /// User whose state should be removed
        username: Option<String>,

        /// Remove the state of every user
        #[arg(long, conflicts_with = "username")]
        all: bool,

        /// Remove this state file instead of the default one
        #[arg(long, conflicts_with = "all")]
        state_file: Option<PathBuf>,
    },

    /// Manage the stored GitHub token
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Manage configuration
    Config {
        /// Configuration key (e.g. retry.max_retries)
        key: Option<String>,

        /// Configuration value (omit to show current)
        value: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AuthAction {
    /// Show which token would be used
    Status,
    /// Store a personal access token
    Login,
    /// Delete the stored token
    Logout,
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn dedup_usernames(usernames: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for name in usernames {
        let name = name.trim().to_string();
        if !name.is_empty() && !seen.iter().any(|s: &String| s.eq_ignore_ascii_case(&name)) {
            seen.push(name);
        }
    }
    seen
}

async fn credential_provider(
    config: &Config,
    prompt: bool,
    client: &GitHubClient,
) -> Result<Arc<dyn CredentialProvider>> {
    let tokens = TokenManager::new(&config.auth);
    if !prompt || tokens.get_credential().is_ok() {
        return Ok(Arc::new(tokens));
    }

    if !Term::stderr().is_term() {
        warn!("--auth needs an interactive terminal; continuing unauthenticated");
        return Ok(Arc::new(tokens));
    }

    let credential = prompt_for_token(&tokens, client).await?;
    Ok(Arc::new(StaticCredential(credential)))
}

/// Check one or more users. Returns whether every cycle succeeded.
pub async fn monitor(
    config: &Config,
    usernames: Vec<String>,
    state_file: Option<PathBuf>,
    output: OutputFormat,
    auth: bool,
    full: bool,
    verbose: bool,
    quiet: bool,
) -> Result<bool> {
    let usernames = dedup_usernames(usernames);
    if usernames.is_empty() {
        bail!("No usernames given");
    }
    if state_file.is_some() && usernames.len() > 1 {
        bail!("--state-file can only be used with a single username");
    }

    let targets: Vec<Target> = usernames
        .iter()
        .map(|username| Target {
            username: username.clone(),
            state_path: state_file
                .clone()
                .unwrap_or_else(|| default_state_path(&config.storage.state_dir, username)),
        })
        .collect();

    let client = GitHubClient::new(&config.api).context("Failed to create HTTP client")?;
    let credentials = credential_provider(config, auth, &client).await?;
    let source = Arc::new(client);
    let store = Arc::new(JsonStateStore::new(config.storage.keep_backup));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let mut service = MonitorService::new(source, store, config)
        .with_credentials(credentials)
        .with_cancellation(cancel)
        .force_full_sync(full);

    let progress = if output == OutputFormat::Text && !quiet {
        Some(spinner()?)
    } else {
        None
    };
    if let Some(pb) = progress.clone() {
        service.on_event(move |event| {
            if verbose {
                pb.println(format!("{}{}", ARROW, event));
            } else if event.is_milestone() {
                pb.set_message(event.to_string());
            }
        });
    }

    let outcomes = service.run_many(&targets).await;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    match output {
        OutputFormat::Json => println!("{}", render_json(&outcomes)?),
        OutputFormat::Text => {
            for (i, (username, outcome)) in outcomes.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                match outcome {
                    Ok(result) => print!("{}", render_text(result, verbose)),
                    Err(err) => eprint!("{}", render_error_text(username, err)),
                }
            }
        }
    }

    Ok(outcomes.iter().all(|(_, outcome)| outcome.is_ok()))
}

/// Remove state files
pub fn cleanup(
    config: &Config,
    username: Option<String>,
    all: bool,
    state_file: Option<PathBuf>,
) -> Result<()> {
    let removed = if all {
        remove_all(&config.storage.state_dir)?
    } else if let Some(path) = state_file {
        remove_state(&path)?
    } else if let Some(username) = username {
        validate_username(&username)?;
        remove_state(&default_state_path(&config.storage.state_dir, &username))?
    } else {
        bail!("Specify a username, --state-file or --all");
    };

    if removed.is_empty() {
        println!("{} Nothing to remove", INFO);
    } else {
        for path in &removed {
            println!("{} Removed {}", CHECK, style(path.display()).dim());
        }
    }

    Ok(())
}

/// Manage the stored token
pub async fn manage_auth(config: &Config, action: AuthAction) -> Result<()> {
    let tokens = TokenManager::new(&config.auth);

    match action {
        AuthAction::Status => match tokens.get_credential() {
            Ok(credential) => {
                println!(
                    "{} Using token {} from {}",
                    CHECK,
                    style(credential.masked()).cyan(),
                    credential.source
                );
            }
            Err(_) => {
                println!("{} No token configured, requests are unauthenticated", INFO);
                println!(
                    "  Store one with: {} star-watcher auth login",
                    style("$").dim()
                );
            }
        },
        AuthAction::Login => {
            if !Term::stderr().is_term() {
                bail!("auth login needs an interactive terminal");
            }
            let token: String = Password::new()
                .with_prompt("GitHub personal access token")
                .interact()?;
            let client =
                GitHubClient::new(&config.api).context("Failed to create HTTP client")?;
            let login = tokens.store_validated(&token, &client).await?;
            println!(
                "{} Stored token for {} in {}",
                CHECK,
                style(login).bold(),
                style(tokens.location()).dim()
            );
        }
        AuthAction::Logout => {
            if tokens.remove_token()? {
                println!("{} Removed stored token", CHECK);
            } else {
                println!("{} No stored token", CROSS);
            }
        }
    }

    Ok(())
}

/// Manage configuration
pub fn manage_config(
    config_path: Option<PathBuf>,
    key: Option<String>,
    value: Option<String>,
) -> Result<()> {
    let mut config = Config::load(config_path.as_deref())?;

    match (key, value) {
        (None, _) => {
            // Show all config
            println!("{}", style("Configuration:").bold());
            println!();
            for key in Config::keys() {
                println!("  {}: {}", key, style(config.get(key)?).cyan());
            }
        }
        (Some(key), None) => {
            // Show specific key
            let value = config.get(&key)?;
            println!("{}: {}", key, style(value).cyan());
        }
        (Some(key), Some(value)) => {
            // Set key
            config.set(&key, &value)?;
            config.save(config_path.as_deref())?;
            println!("{} Set {} = {}", CHECK, key, style(value).green());
        }
    }

    Ok(())
}
