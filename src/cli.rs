use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stockfeed")]
#[command(about = "Mirrors a zip-compressed stock quote feed into versioned SQLite snapshots")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the scheduled update worker and run until terminated
    Run(FeedArgs),

    /// Execute exactly one ingestion cycle and exit
    Once(FeedArgs),

    /// Show the live snapshot marker and the archive index
    Status(StatusArgs),
}

#[derive(Parser)]
pub struct FeedArgs {
    /// Config file path (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Feed URL, overrides the config file
    #[arg(long)]
    pub url: Option<String>,

    /// Update interval such as "10m" or "90s", overrides the config file
    #[arg(long)]
    pub interval: Option<String>,

    /// Run the first cycle immediately instead of after one interval
    #[arg(long, default_value_t = false)]
    pub immediate: bool,

    /// Database file path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Scratch directory for downloads and extraction
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Config file path (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Database file path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
