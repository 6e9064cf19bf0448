//! BarVault CLI: fetch, status and verify commands.
//!
//! Commands:
//! - `fetch-historical`: download bars for one or more symbols and merge
//!   them into the store
//! - `update`: bring every stored series up to a target end
//! - `status`: list stored series from their metadata sidecars
//! - `verify`: re-read stored series and report ordering problems and gaps
//!
//! Exit codes: 0 success, 1 any fatal error, 130 cancelled (Ctrl-C).

use anyhow::{Context, Result};
use barvault_core::data::{exchange_client, CancelToken, DataError, TracingProgress};
use barvault_core::domain::Timeframe;
use barvault_core::parse_time_expr;
use barvault_core::storage::{list_series, MergeWriter, StorageFormat, StorageKey};
use barvault_runner::{
    plan_updates, run_batch, verify_store, BatchSummary, FetchSettings, KeyJob, PipelineContext,
    SeriesFilter,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "barvault",
    version,
    about = "BarVault: historical candlestick downloader with incremental, crash-safe storage"
)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download historical bars and merge them into the store.
    FetchHistorical(FetchArgs),

    /// Extend every stored series (optionally filtered) up to --until.
    Update(UpdateArgs),

    /// List stored series.
    Status {
        /// Output directory.
        #[arg(long, default_value = "data/raw")]
        out: PathBuf,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Check stored series for ordering problems, bad bars and gaps.
    Verify {
        /// Output directory.
        #[arg(long, default_value = "data/raw")]
        out: PathBuf,

        #[arg(long)]
        exchange: Option<String>,

        #[arg(long)]
        symbol: Option<String>,

        #[arg(long)]
        timeframe: Option<String>,

        #[arg(long)]
        format: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Exchange id: binance (spot) or binanceusdm (USDⓈ-M futures).
    #[arg(long)]
    exchange: String,

    /// Symbol, e.g. ETH/USDT or BTC/USDT:USDT. Repeat for several.
    #[arg(long, required = true)]
    symbol: Vec<String>,

    /// Bar granularity: 1m 3m 5m 15m 30m 1h 2h 4h 6h 8h 12h 1d 3d 1w.
    #[arg(long)]
    timeframe: String,

    /// Range start: YYYY-MM-DD, a datetime, epoch milliseconds, or "now".
    #[arg(long)]
    since: String,

    /// Range end (exclusive). Same forms as --since.
    #[arg(long, default_value = "now")]
    until: String,

    /// Output directory.
    #[arg(long)]
    out: PathBuf,

    /// Storage format: parquet or csv.
    #[arg(long, default_value = "parquet")]
    format: String,

    /// Bars per request; clamped to the exchange maximum.
    #[arg(long)]
    limit: Option<usize>,

    /// Continue after the newest stored bar when that is later than --since.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct UpdateArgs {
    /// Output directory to scan.
    #[arg(long, default_value = "data/raw")]
    out: PathBuf,

    #[arg(long)]
    exchange: Option<String>,

    #[arg(long)]
    symbol: Option<String>,

    #[arg(long)]
    timeframe: Option<String>,

    #[arg(long)]
    format: Option<String>,

    /// Target end (exclusive): YYYY-MM-DD, a datetime, epoch milliseconds, or "now".
    #[arg(long, default_value = "now")]
    until: String,

    /// Bars per request; clamped to the exchange maximum.
    #[arg(long)]
    limit: Option<usize>,

    /// TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::FetchHistorical(args) => run_fetch(args),
        Commands::Update(args) => run_update(args),
        Commands::Status { out, json } => run_status(&out, json).map(|()| ExitCode::SUCCESS),
        Commands::Verify {
            out,
            exchange,
            symbol,
            timeframe,
            format,
            json,
        } => run_verify(&out, exchange, symbol, timeframe, format, json),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on the first Ctrl-C; exit immediately on the second.
fn install_ctrl_c(token: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "Ctrl-C handling unavailable");
                return;
            }
        };
        runtime.block_on(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("interrupt received; finishing current pages and committing progress");
            token.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(i32::from(EXIT_CANCELLED));
            }
        });
    });
}

fn run_fetch(args: FetchArgs) -> Result<ExitCode> {
    let settings = match &args.config {
        Some(path) => FetchSettings::from_file(path)?,
        None => FetchSettings::default(),
    };

    // Validate everything before any network activity.
    let timeframe: Timeframe = args.timeframe.parse()?;
    let format: StorageFormat = args.format.parse().map_err(anyhow::Error::msg)?;
    let since = parse_time_expr(&args.since)?;
    let until = parse_time_expr(&args.until)?;
    let keys = args
        .symbol
        .iter()
        .map(|s| StorageKey::new(&args.exchange, s, timeframe))
        .collect::<Result<Vec<_>, _>>()?;
    if since >= until {
        return Err(DataError::InvalidRange {
            start: since,
            end: until,
        }
        .into());
    }
    let exchange = keys
        .first()
        .map(|k| k.exchange().to_string())
        .context("at least one --symbol is required")?;
    let client = exchange_client(&exchange, &settings.http_options(&exchange))?;

    let cancel = CancelToken::new();
    install_ctrl_c(cancel.clone());

    let ctx = PipelineContext {
        writer: MergeWriter::new(&args.out, format),
        retry: settings.retry_policy(),
        cancel,
    };
    let jobs: Vec<KeyJob> = keys
        .into_iter()
        .map(|key| KeyJob {
            key,
            since,
            until,
            page_size: args.limit,
            resume: args.resume,
        })
        .collect();

    let summary = run_batch(
        client,
        &ctx,
        &jobs,
        settings.runner.max_concurrent_keys,
        &TracingProgress,
    );

    println!();
    println!("=== Fetch Summary ===");
    println!("Range:     {} to {}", since.iso(), until.iso());
    print_batch(&summary);
    Ok(exit_code(&[summary]))
}

fn run_update(args: UpdateArgs) -> Result<ExitCode> {
    let settings = match &args.config {
        Some(path) => FetchSettings::from_file(path)?,
        None => FetchSettings::default(),
    };
    let filter = series_filter(args.exchange, args.symbol, args.timeframe, args.format)?;
    let until = parse_time_expr(&args.until)?;
    let groups = plan_updates(&args.out, &filter, until, args.limit)?;
    if groups.is_empty() {
        println!("No stored series under {} match", args.out.display());
        return Ok(ExitCode::SUCCESS);
    }

    // Build every client first so a bad exchange id fails before any download.
    let clients = groups
        .iter()
        .map(|g| exchange_client(&g.exchange, &settings.http_options(&g.exchange)))
        .collect::<Result<Vec<_>, _>>()?;

    let cancel = CancelToken::new();
    install_ctrl_c(cancel.clone());

    let mut summaries = Vec::with_capacity(groups.len());
    for (group, client) in groups.iter().zip(clients) {
        if cancel.is_cancelled() {
            break;
        }
        let ctx = PipelineContext {
            writer: MergeWriter::new(&args.out, group.format),
            retry: settings.retry_policy(),
            cancel: cancel.clone(),
        };
        summaries.push(run_batch(
            client,
            &ctx,
            &group.jobs,
            settings.runner.max_concurrent_keys,
            &TracingProgress,
        ));
    }

    println!();
    println!("=== Update Summary ===");
    println!("Target:    {}", until.iso());
    for summary in &summaries {
        print_batch(summary);
    }
    let started: usize = summaries.iter().map(|s| s.total).sum();
    let planned: usize = groups.iter().map(|g| g.jobs.len()).sum();
    if started < planned {
        println!("Skipped:   {} (cancelled before start)", planned - started);
    }
    Ok(exit_code(&summaries))
}

fn print_batch(summary: &BatchSummary) {
    for report in &summary.reports {
        let (added, total, path) = report.commit.as_ref().map_or(
            (0, 0, String::from("-")),
            |c| (c.added(), c.committed_count, c.path.display().to_string()),
        );
        println!(
            "{:<28} {:<16} fetched {:>8}  added {:>8}  stored {:>8}  {}",
            report.key.to_string(),
            format!("{:?}", report.status),
            report.fetched,
            added,
            total,
            path
        );
        if report.rejected > 0 {
            println!("{:<28} rejected {} malformed bars", "", report.rejected);
        }
    }
    for (key, err) in &summary.errors {
        error!(key = %key, kind = err.kind(), "{err}");
        match err.reached() {
            Some(reached) => println!(
                "{:<28} FAILED ({}) reached {} ({})",
                key.to_string(),
                err.kind(),
                reached.iso(),
                reached
            ),
            None => println!("{:<28} FAILED ({})", key.to_string(), err.kind()),
        }
    }
    if summary.skipped > 0 {
        println!("Skipped:   {} (cancelled before start)", summary.skipped);
    }
}

/// 1 if any key failed, 130 if the run was cancelled, else 0.
fn exit_code(summaries: &[BatchSummary]) -> ExitCode {
    if summaries.iter().any(|s| s.failed > 0) {
        ExitCode::from(EXIT_FAILURE)
    } else if summaries.iter().any(|s| s.cancelled) {
        ExitCode::from(EXIT_CANCELLED)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_status(out: &Path, json: bool) -> Result<()> {
    let series = list_series(out)?;
    if json {
        let rows: Vec<_> = series
            .iter()
            .map(|s| {
                serde_json::json!({
                    "key": s.key,
                    "format": s.format,
                    "path": s.path,
                    "file_bytes": s.file_bytes,
                    "meta": s.meta,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if series.is_empty() {
        println!("No stored series under {}", out.display());
        return Ok(());
    }

    let total_size: u64 = series.iter().map(|s| s.file_bytes).sum();
    println!("Store: {}", out.display());
    println!("Series: {}", series.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!(
        "{:<32} {:<8} {:<50} {:>10} {:>10}",
        "Key", "Format", "Range", "Bars", "Size"
    );
    println!("{}", "-".repeat(114));
    for s in &series {
        let (range, bars) = match &s.meta {
            Some(m) => (
                format!("{} to {}", m.first_open_time.iso(), m.last_open_time.iso()),
                m.bar_count.to_string(),
            ),
            None => ("(no meta)".into(), "?".into()),
        };
        println!(
            "{:<32} {:<8} {:<50} {:>10} {:>10}",
            s.key.to_string(),
            s.format,
            range,
            bars,
            format_size(s.file_bytes)
        );
    }
    Ok(())
}

fn run_verify(
    out: &Path,
    exchange: Option<String>,
    symbol: Option<String>,
    timeframe: Option<String>,
    format: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let filter = series_filter(exchange, symbol, timeframe, format)?;
    let entries = verify_store(out, &filter)?;
    let violations = entries.iter().filter(|e| e.has_ordering_violation()).count();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No stored series under {} match", out.display());
    } else {
        for entry in &entries {
            match &entry.report {
                Err(reason) => println!(
                    "{:<32} {:<8} UNREADABLE: {reason}",
                    entry.key.to_string(),
                    entry.format
                ),
                Ok(r) => {
                    let verdict = if r.is_clean() {
                        "OK"
                    } else if r.is_ordered() {
                        "GAPS"
                    } else {
                        "BROKEN"
                    };
                    println!(
                        "{:<32} {:<8} {:<7} bars {:>9}  out-of-order {:>4}  duplicates {:>4}  \
                         bad {:>4}  gaps {:>5} ({} missing)",
                        entry.key.to_string(),
                        entry.format,
                        verdict,
                        r.bar_count,
                        r.out_of_order,
                        r.duplicates,
                        r.insane_bars,
                        r.gaps.len(),
                        r.missing_bars()
                    );
                    for gap in r.gaps.iter().take(5) {
                        println!(
                            "    gap after {} before {} ({} bars)",
                            gap.after.iso(),
                            gap.before.iso(),
                            gap.missing
                        );
                    }
                }
            }
            if entry.sidecar_matches == Some(false) {
                println!("    metadata sidecar does not match the data file");
            }
        }
    }

    Ok(if violations > 0 {
        ExitCode::from(EXIT_FAILURE)
    } else {
        ExitCode::SUCCESS
    })
}

fn series_filter(
    exchange: Option<String>,
    symbol: Option<String>,
    timeframe: Option<String>,
    format: Option<String>,
) -> Result<SeriesFilter> {
    Ok(SeriesFilter {
        exchange,
        symbol,
        timeframe: timeframe.as_deref().map(str::parse::<Timeframe>).transpose()?,
        format: format
            .as_deref()
            .map(str::parse::<StorageFormat>)
            .transpose()
            .map_err(anyhow::Error::msg)?,
    })
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
