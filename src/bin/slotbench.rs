//! Slotbench - load generator for the consolidation pipeline
//!
//! Drives concurrent appenders through a shared group writer and reports
//! consolidation statistics when the run completes.
//!
//! # Examples
//!
//! ```bash
//! # Measure pure consolidation in memory
//! slotbench --threads 8 --records 100000
//!
//! # Append to a real log file, syncing every 64th record
//! slotbench --sink file --path bench.log --sync-interval 64
//!
//! # Load pool sizing from a config file
//! slotbench --config pool.toml
//! ```

use clap::{Parser, ValueEnum};
use slotlog::{FileSink, GroupWriter, LogConfig, LogSink, MemorySink, SlotFlags};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Slotbench - measure consolidated append throughput
#[derive(Parser, Debug)]
#[command(name = "slotbench")]
#[command(version = slotlog::VERSION)]
#[command(about = "Measure consolidated append throughput", long_about = None)]
struct Cli {
    /// Number of writer threads
    #[arg(long, default_value = "4", env = "SLOTBENCH_THREADS")]
    threads: usize,

    /// Records appended per thread
    #[arg(long, default_value = "100000", env = "SLOTBENCH_RECORDS")]
    records: usize,

    /// Size of each record in bytes
    #[arg(long, default_value = "128", env = "SLOTBENCH_RECORD_SIZE")]
    record_size: usize,

    /// Request a sync on every Nth record (0 disables)
    #[arg(long, default_value = "0", env = "SLOTBENCH_SYNC_INTERVAL")]
    sync_interval: usize,

    /// Where consolidated groups go
    #[arg(long, value_enum, default_value = "memory")]
    sink: SinkKind,

    /// Log file path for the file sink
    #[arg(long, default_value = "slotbench.log")]
    path: PathBuf,

    /// Pool sizing from a TOML file (defaults apply otherwise)
    #[arg(long, env = "SLOTBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

/// Group destination
#[derive(ValueEnum, Clone, Copy, Debug)]
enum SinkKind {
    /// Capture groups in memory, measuring pure consolidation
    Memory,
    /// Append groups to a log file
    File,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli);

    anyhow::ensure!(cli.threads > 0, "at least one writer thread is required");
    anyhow::ensure!(cli.record_size > 0, "records must be at least one byte");

    let config = match &cli.config {
        Some(path) => LogConfig::load(path)?,
        None => LogConfig::default(),
    };

    info!("🚀 slotbench starting...");
    info!(
        threads = cli.threads,
        records = cli.records,
        record_size = cli.record_size,
        "Workload configuration"
    );

    let sink: Box<dyn LogSink> = match cli.sink {
        SinkKind::Memory => Box::new(MemorySink::new()),
        SinkKind::File => {
            let sink = FileSink::create(&cli.path)?;
            info!("✅ Log file ready at {}", sink.path().display());
            Box::new(sink)
        }
    };
    let writer = Arc::new(GroupWriter::new(config, sink)?);

    let start = Instant::now();
    let mut workers = Vec::new();
    for thread_id in 0..cli.threads {
        let writer = Arc::clone(&writer);
        let records = cli.records;
        let record_size = cli.record_size;
        let sync_interval = cli.sync_interval;
        workers.push(thread::spawn(move || -> slotlog::error::Result<()> {
            let mut record = vec![0u8; record_size];
            for seq in 0..records {
                // Tag each record so groups stay distinguishable.
                let tag = format!("{:08}:{:08};", thread_id, seq);
                let n = tag.len().min(record.len());
                record[..n].copy_from_slice(&tag.as_bytes()[..n]);
                let flags = if sync_interval > 0 && seq % sync_interval == 0 {
                    SlotFlags::SYNC
                } else {
                    SlotFlags::empty()
                };
                writer.append(&record, flags)?;
            }
            Ok(())
        }));
    }
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
    }
    writer.flush()?;
    let elapsed = start.elapsed();

    let total = cli.threads * cli.records;
    let rate = total as f64 / elapsed.as_secs_f64();
    let mib = (total * cli.record_size) as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();
    info!(
        "✅ {} appends in {:.2?} ({:.0} records/s, {:.1} MiB/s)",
        total, elapsed, rate, mib
    );
    println!("{}", writer.stats());
    Ok(())
}

/// Setup console logging
fn setup_logging(cli: &Cli) {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();
}
