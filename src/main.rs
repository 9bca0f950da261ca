use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use vigil::config::Config;
use vigil::errors::SessionError;

mod cmd;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Unattended TDD orchestrator")]
pub struct Cli {
    /// Working directory holding the .vigil state (default: current dir)
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a ticket file and add it to the queue
    Enqueue {
        /// Path to the ticket JSON
        ticket: PathBuf,
    },
    /// Show the session, queue, and every work item
    Status,
    /// Unfreeze an escalated work item
    Resume {
        id: String,
        /// Phase to re-enter (default: the phase that escalated)
        #[arg(long)]
        phase: Option<String>,
    },
    /// Pause the active attention window at its next safe checkpoint
    Pause,
    /// Cancel one work item at its next safe checkpoint
    Cancel { id: String },
    /// Open an attention window over the queue
    Run {
        /// Unattended budget, e.g. "4h", "90m", or minutes as a bare number
        #[arg(long, default_value = "4h")]
        budget: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vigil=info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match run_cli(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

/// 0 success, 1 invalid input or failure, 2 no active session.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::NoActiveSession) => 2,
        _ => 1,
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let base_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    match cli.command {
        Commands::Enqueue { ticket } => {
            let config = Config::new(base_dir, None)?;
            cmd::cmd_enqueue(&config, &ticket)
        }
        Commands::Status => {
            let config = Config::new(base_dir, None)?;
            cmd::cmd_status(&config)
        }
        Commands::Resume { id, phase } => {
            let config = Config::new(base_dir, None)?;
            cmd::cmd_resume(&config, &id, phase.as_deref())
        }
        Commands::Pause => {
            let config = Config::new(base_dir, None)?;
            cmd::cmd_pause(&config)
        }
        Commands::Cancel { id } => {
            let config = Config::new(base_dir, None)?;
            cmd::cmd_cancel(&config, &id)
        }
        Commands::Run { budget } => {
            let budget = parse_budget(&budget)?;
            let config = Config::new(base_dir, Some(budget))?;
            cmd::cmd_run(config, budget).await
        }
    }
}

/// "4h" / "90m" / "30s"; a bare number means minutes.
fn parse_budget(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (value, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], Some(c.to_ascii_lowercase())),
        Some(_) => (s, None),
        None => bail!("Budget must not be empty"),
    };
    let value: u64 = value
        .parse()
        .with_context(|| format!("Invalid budget '{s}'"))?;
    if value == 0 {
        bail!("Budget must be positive");
    }
    Ok(match unit {
        Some('h') => Duration::from_secs(value * 3600),
        Some('m') | None => Duration::from_secs(value * 60),
        Some('s') => Duration::from_secs(value),
        Some(other) => bail!("Unknown budget unit '{other}' (use h, m, or s)"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_budget_units() {
        assert_eq!(parse_budget("4h").unwrap(), Duration::from_secs(4 * 3600));
        assert_eq!(parse_budget("90m").unwrap(), Duration::from_secs(90 * 60));
        assert_eq!(parse_budget("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_budget("240").unwrap(), Duration::from_secs(240 * 60));
    }

    #[test]
    fn test_parse_budget_rejects_garbage() {
        assert!(parse_budget("").is_err());
        assert!(parse_budget("0h").is_err());
        assert!(parse_budget("4d").is_err());
        assert!(parse_budget("soon").is_err());
    }
}
