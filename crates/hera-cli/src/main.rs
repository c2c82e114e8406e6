use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hera_backfill::{BackfillConfig, RunOverrides};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hera-cli")]
#[command(about = "Héra field backfill command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a backfill until the scan completes or a stop condition is hit.
    Run(RunArgs),
    /// Show the persisted cursor for a backfill.
    Status {
        name: String,
        /// Also count documents still matching the pending predicate.
        #[arg(long)]
        count: bool,
    },
    /// Remove the persisted cursor so the next run starts from the beginning.
    Reset { name: String },
    List,
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    name: String,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Pages to process in this run; 0 means unlimited.
    #[arg(long)]
    max_rounds: Option<u64>,
    #[arg(long)]
    start_after: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let json = std::env::var("HERA_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

/// Flip the stop flag on Ctrl-C; the engine honors it at the next page boundary.
fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::List) {
        Commands::Run(args) => {
            let overrides = RunOverrides {
                page_size: args.page_size,
                chunk_size: args.chunk_size,
                max_rounds: args.max_rounds,
                start_after: args.start_after,
                dry_run: args.dry_run,
            };
            let report =
                hera_backfill::run_backfill_from_env(&args.name, overrides, Some(stop_on_ctrl_c()))
                    .await?;
            println!(
                "backfill {}: {} run_id={} rounds={} updated={} skipped={} elapsed_ms={} docs_per_sec={:.1}",
                report.backfill,
                report.stop_reason,
                report.run_id,
                report.totals.rounds,
                report.totals.updated,
                report.totals.skipped(),
                report.elapsed_ms,
                report.docs_per_sec
            );
        }
        Commands::Status { name, count } => {
            let status = hera_backfill::backfill_status_from_env(&name, count).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Reset { name } => {
            let path = hera_backfill::reset_cursor_from_env(&name).await?;
            println!("cursor cleared: {}", path.display());
        }
        Commands::List => {
            for definition in hera_backfill::list_backfills_from_env()? {
                println!(
                    "{}: {}.{} -> {} ({:?}, key {})",
                    definition.name,
                    definition.collection,
                    definition.source_field,
                    definition.target_field,
                    definition.derivation,
                    definition.id_field
                );
            }
        }
        Commands::Report { runs } => {
            let config = BackfillConfig::from_env();
            println!(
                "{}",
                hera_backfill::recent_reports_markdown(&config.reports_dir, runs)?
            );
        }
    }

    Ok(())
}
