//! star-watcher - watch GitHub users' starred repositories
//!
//! Polls the starred repositories of one or more users, compares them with
//! the snapshot from the previous run, and reports new stars, unstars,
//! re-stars and metadata updates.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use star_watcher::config::Config;

fn init_logging(cli: &Cli, config: &Config) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,star_watcher={}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    let fixes = config.validate();

    // Initialize logging
    init_logging(&cli, &config);
    for fix in fixes {
        warn!("{}", fix);
    }

    match cli.command {
        Commands::Monitor {
            usernames,
            state_file,
            output,
            auth,
            full,
        } => {
            let ok = cli::monitor(
                &config,
                usernames,
                state_file,
                output,
                auth,
                full,
                cli.verbose,
                cli.quiet,
            )
            .await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Cleanup {
            username,
            all,
            state_file,
        } => {
            cli::cleanup(&config, username, all, state_file)?;
        }
        Commands::Auth { action } => {
            cli::manage_auth(&config, action).await?;
        }
        Commands::Config { key, value } => {
            cli::manage_config(cli.config.clone(), key, value)?;
        }
    }

    Ok(())
}
