use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use moviefix::ledger::Ledger;
use moviefix::patch_tool::PatchTool;
use moviefix::process::{FileProcessor, ProcessorConfig};
use moviefix::remux::RemuxSettings;
use moviefix::walk;

#[derive(Parser)]
#[command(
    name = "moviefix",
    about = "Re-mux movie files for fast seeking and record reversible patches"
)]
struct Cli {
    /// Directory containing movie files
    directory: PathBuf,

    /// Process subdirectories recursively
    #[arg(short, long)]
    recursive: bool,

    /// Process files even if the ledger already lists them
    #[arg(short, long)]
    force: bool,

    /// Process only files owned by this group id
    #[arg(short, long)]
    gid: Option<u32>,

    /// Path to the processing ledger (default: <DIRECTORY>/.moviefix-ledger.json)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Wall-clock timeout for a single re-mux invocation, in seconds
    #[arg(long, default_value_t = 900)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Fatal before any file is touched: no patch tool means no reversibility.
    let tool = PatchTool::select()?;

    let ledger_path = cli
        .ledger
        .unwrap_or_else(|| cli.directory.join(".moviefix-ledger.json"));
    let ledger = Ledger::load(&ledger_path);

    let config = ProcessorConfig {
        target_gid: cli.gid,
        force: cli.force,
        remux: RemuxSettings {
            timeout: Duration::from_secs(cli.timeout_secs),
            ..Default::default()
        },
    };
    let mut processor = FileProcessor::new(config, tool, ledger);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current file");
            stop_on_signal.store(true, Ordering::Relaxed);
        }
    });

    let start = Instant::now();
    let summary = walk::run(&mut processor, &cli.directory, cli.recursive, stop).await?;
    let elapsed = start.elapsed();

    println!("\nRun complete");
    println!("  Files processed: {}", summary.processed);
    println!("  Files skipped: {}", summary.skipped);
    println!("  Files failed: {}", summary.failed);
    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

    Ok(())
}
