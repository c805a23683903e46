pub mod commands;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

use crate::commands::import::ImportWindow;

#[derive(Debug, Parser)]
#[command(
    name = "fleetsync",
    about = "Fleetsync operator CLI",
    long_about = "Operate the booking sync engine: migrations, config inspection, bulk imports, outbox replay and lock recovery.",
    after_help = "Examples:\n  fleetsync migrate\n  fleetsync import --year 2025\n  fleetsync outbox list --status failed\n  fleetsync release-locks --older-than-secs 900"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Stage and merge historical CRM leads for a year or an explicit range")]
    Import {
        #[arg(long, conflicts_with_all = ["from", "to"], required_unless_present_all = ["from", "to"])]
        year: Option<i32>,
        #[arg(long, requires = "to", help = "Range start, RFC 3339")]
        from: Option<DateTime<Utc>>,
        #[arg(long, requires = "from", help = "Range end (exclusive), RFC 3339")]
        to: Option<DateTime<Utc>>,
    },
    #[command(about = "Inspect and replay outbound call ledger entries")]
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
    #[command(about = "Reset bookings stuck in `in_progress` past a threshold")]
    ReleaseLocks {
        #[arg(long, help = "Defaults to sync.stale_lock_after_secs")]
        older_than_secs: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum OutboxAction {
    #[command(about = "List entries, newest first")]
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    #[command(about = "Counts by status and target plus recent failures")]
    Stats,
    #[command(about = "Re-run the operation behind one entry")]
    Replay { attempt_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Import { year, from, to } => {
            let window = match (year, from, to) {
                (Some(year), _, _) => ImportWindow::Year(year),
                (None, Some(from), Some(to)) => ImportWindow::Range { from, to },
                _ => {
                    return exit_with(commands::CommandResult::failure(
                        "import",
                        "invalid_argument",
                        "pass --year or both --from and --to",
                        2,
                    ))
                }
            };
            commands::import::run(window)
        }
        Command::Outbox { action } => match action {
            OutboxAction::List { status, limit } => commands::outbox::list(status.as_deref(), limit),
            OutboxAction::Stats => commands::outbox::stats(),
            OutboxAction::Replay { attempt_id } => commands::outbox::replay(&attempt_id),
        },
        Command::ReleaseLocks { older_than_secs } => commands::release_locks::run(older_than_secs),
    };

    exit_with(result)
}

fn exit_with(result: commands::CommandResult) -> ExitCode {
    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
