pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "gradplan",
    about = "Graduation plan operator CLI",
    long_about = "Operate gradplan migrations, demo catalog seeding, config inspection, worker cycles and smoke validation.",
    after_help = "Examples:\n  gradplan config\n  gradplan migrate\n  gradplan worker-cycle --limit 5"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load and verify the demo catalog (one student, three programs)")]
    Seed,
    #[command(about = "Drive a scripted plan run end to end against an in-memory database")]
    Smoke,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Recover stale claims and advance runnable jobs once, then exit")]
    WorkerCycle {
        #[arg(long, help = "Jobs to process this cycle, capped by worker.max_batch_limit")]
        limit: Option<u32>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Smoke => commands::smoke::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::WorkerCycle { limit } => commands::worker_cycle::run(limit),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
