use clap::Parser;

use stockfeed::cli::{Cli, Command, FeedArgs, StatusArgs};
use stockfeed::config::{self, Config};
use stockfeed::fetch::HttpFetcher;
use stockfeed::store::engine::{self, ApplyOutcome};
use stockfeed::store::Store;
use stockfeed::update;
use stockfeed::worker::{UpdateWorker, WorkerSettings};

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(&args),
        Command::Once(args) => once(&args),
        Command::Status(args) => status(&args),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Host the worker until the process is terminated. The worker owns the
/// schedule; the main thread has nothing left to do.
fn run(args: &FeedArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(args)?;
    let store = Store::open(&config.db_path)?;
    let fetcher = HttpFetcher::new(config.http_timeout);

    let worker = UpdateWorker::new(
        WorkerSettings {
            source_url: config.source_url,
            interval: config.interval,
            start_immediately: config.start_immediately,
            work_dir: config.work_dir,
        },
        Box::new(fetcher),
        store,
    );

    worker.start();
    loop {
        std::thread::park();
    }
}

fn once(args: &FeedArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(args)?;
    let mut store = Store::open(&config.db_path)?;
    let fetcher = HttpFetcher::new(config.http_timeout);

    let cycle = update::run_cycle(&fetcher, &mut store, &config.source_url, &config.work_dir)?;

    match cycle.outcome {
        ApplyOutcome::Unchanged => {
            println!(
                "feed unchanged at {} {}",
                cycle.stamp.date, cycle.stamp.time
            );
        }
        ApplyOutcome::Applied { archived } => {
            println!(
                "snapshot replaced: {} {} ({} columns, {} rows)",
                cycle.stamp.date, cycle.stamp.time, cycle.titles, cycle.rows
            );
            if let Some(date) = archived {
                println!("previous snapshot archived under {date}");
            }
        }
    }

    Ok(())
}

fn status(args: &StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = config::resolve_db_path(args)?;
    let store = Store::open(&db_path)?;

    let marker = engine::last_update(&store)?;
    let titles = engine::live_titles(&store)?;
    let rows = engine::live_row_count(&store)?;
    let archives = engine::archive_entries(&store)?;

    if args.json {
        let report = serde_json::json!({
            "last_update": marker,
            "columns": titles.len(),
            "rows": rows,
            "archives": archives,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match &marker {
        Some(marker) => {
            println!("Live snapshot:");
            println!("  Date:     {}", marker.date);
            println!("  Time:     {}", marker.time);
            println!("  Ingested: {}", format_timestamp(marker.updated_at));
            println!("  Columns:  {}", titles.len());
            println!("  Rows:     {rows}");
        }
        None => println!("No snapshot ingested yet."),
    }

    if archives.is_empty() {
        println!("\nNo archived snapshots.");
    } else {
        println!("\nArchived snapshots:");
        for entry in &archives {
            println!(
                "  {} {}  ({}, archived {})",
                entry.date,
                entry.time,
                entry.data_table,
                format_timestamp(entry.archived_at)
            );
        }
    }

    Ok(())
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
