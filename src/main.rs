//! blunderlab command-line interface.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blunderlab::chess::pgn::split_pgn_games;
use blunderlab::config::{default_concurrency, DEFAULT_ENGINE_DEPTH};
use blunderlab::db::{AnalysisStore, Database, GameStore, JobStore, NewGame};
use blunderlab::events::{AppEvent, EventBus};
use blunderlab::jobs::{AnalyzeOptions, BulkOptions, GameAnalyzer};

#[derive(Parser)]
#[command(
    name = "blunderlab",
    version,
    about = "Analyze chess games for blunders with a UCI engine"
)]
struct Cli {
    /// SQLite database path.
    #[arg(long, env = "BLUNDERLAB_DB", default_value = "data/blunderlab.sqlite3", global = true)]
    db: PathBuf,

    /// UCI engine binary.
    #[arg(long, env = "BLUNDERLAB_ENGINE", default_value = "stockfish", global = true)]
    engine: PathBuf,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import games from a PGN file.
    Import {
        /// PGN file, possibly containing many games.
        file: PathBuf,
        /// Source site the games came from.
        #[arg(long, value_parser = ["lichess", "chesscom"], default_value = "lichess")]
        source: String,
        /// Account the games belong to.
        #[arg(long)]
        username: String,
    },
    /// Analyze a stored game.
    Analyze {
        /// Game id (sha256 of the normalized PGN).
        game_id: String,
        /// Engine analysis depth.
        #[arg(long, default_value_t = DEFAULT_ENGINE_DEPTH)]
        depth: u32,
        /// Time limit per position in seconds; overrides depth.
        #[arg(long)]
        time: Option<f64>,
        /// Pipeline steps to run; defaults to the full pipeline.
        #[arg(long, num_args = 1..)]
        steps: Option<Vec<String>>,
        /// Re-run steps even if already completed.
        #[arg(long)]
        force: bool,
    },
    /// Analyze multiple stored games over an engine pool.
    AnalyzeBulk {
        /// Filter by source site.
        #[arg(long, value_parser = ["lichess", "chesscom"])]
        source: Option<String>,
        /// Filter by username.
        #[arg(long)]
        username: Option<String>,
        /// Engine analysis depth.
        #[arg(long, default_value_t = DEFAULT_ENGINE_DEPTH)]
        depth: u32,
        /// Time limit per position in seconds; overrides depth.
        #[arg(long)]
        time: Option<f64>,
        /// Max games to analyze.
        #[arg(long)]
        limit: Option<usize>,
        /// Re-analyze already analyzed games.
        #[arg(long)]
        force: bool,
        /// Number of parallel engine processes.
        #[arg(short = 'j', long, default_value_t = default_concurrency())]
        concurrency: usize,
    },
    /// Classify openings for analyzed games missing one.
    BackfillEco,
    /// Fill in missing game phases.
    BackfillPhases,
    /// Classify tactical patterns for unclassified blunders.
    BackfillTactics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "blunderlab=debug"
    } else {
        "blunderlab=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db = Database::open(&cli.db)
        .with_context(|| format!("failed to open database at {}", cli.db.display()))?;
    let games = GameStore::new(db.clone());
    let analysis = AnalysisStore::new(db.clone());
    let jobs = JobStore::new(db);
    let events = EventBus::new();
    let engine_path = cli.engine.to_string_lossy().into_owned();
    let mut analyzer = GameAnalyzer::new(analysis, games, jobs, events, engine_path);

    match cli.command {
        Command::Import {
            file,
            source,
            username,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut new_games = Vec::new();
            for chunk in split_pgn_games(&content) {
                match NewGame::from_pgn(&chunk, &source, &username) {
                    Ok(game) => new_games.push(game),
                    Err(e) => eprintln!("skipping unparseable game: {}", e),
                }
            }
            let inserted = analyzer.games().insert_games(&new_games)?;
            println!(
                "Imported {} games ({} new) from {}",
                new_games.len(),
                inserted,
                file.display()
            );
        }

        Command::Analyze {
            game_id,
            depth,
            time,
            steps,
            force,
        } => {
            let opts = AnalyzeOptions {
                depth: Some(depth),
                time_limit: time,
                thresholds: None,
                steps,
                force,
            };
            let report = analyzer.analyze_game(&game_id, &opts, None).await?;
            println!(
                "Analysis complete for game {} (executed: {:?}, skipped: {:?})",
                game_id, report.steps_executed, report.steps_skipped
            );
        }

        Command::AnalyzeBulk {
            source,
            username,
            depth,
            time,
            limit,
            force,
            concurrency,
        } => {
            let bar = spawn_progress_bar(analyzer.events());
            let report = analyzer
                .analyze_bulk(BulkOptions {
                    source,
                    username,
                    depth: Some(depth),
                    time_limit: time,
                    limit,
                    force,
                    steps: None,
                    concurrency,
                    job_id: None,
                })
                .await?;
            bar.finish_and_clear();
            println!(
                "Bulk analysis complete: processed {}, analyzed {}, skipped {}, failed {}.",
                report.processed, report.analyzed, report.skipped, report.failed
            );
        }

        Command::BackfillEco => {
            let report = analyzer.backfill_eco().await?;
            println!(
                "ECO backfill complete: {} games processed, {} classified.",
                report.games_processed, report.items_updated
            );
        }

        Command::BackfillPhases => {
            let report = analyzer.backfill_phases()?;
            println!(
                "Phase backfill complete: {} games processed, {} moves updated.",
                report.games_processed, report.items_updated
            );
        }

        Command::BackfillTactics => {
            let report = analyzer.backfill_tactics()?;
            println!(
                "Tactics backfill complete: {} games processed, {} blunders classified.",
                report.games_processed, report.items_updated
            );
        }
    }

    Ok(())
}

/// Drive an indicatif bar from the analyzer's progress events.
fn spawn_progress_bar(events: &EventBus) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} games ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut rx = events.subscribe();
    let bar_handle = bar.clone();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match rx.recv().await {
                Ok(AppEvent::JobProgressUpdated { current, total, .. }) => {
                    bar_handle.set_length(u64::from(total));
                    bar_handle.set_position(u64::from(current));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
    bar
}
