use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reclaim_config::ReclaimConfig;
use reclaim_memory::{
    format_bytes, CleanupPriority, CleanupResult, MemoryOptions, MemoryReport, MemorySystem,
    PressureEvent,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "reclaim.toml";

#[derive(Parser)]
#[command(name = "reclaim", version, about = "Memory pressure diagnostics")]
struct Cli {
    /// Config file (defaults to ./reclaim.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample once and print the current pressure report
    Status(BallastArgs),
    /// Run a manual cleanup pass and print its result
    Cleanup(BallastArgs),
    /// Run the background monitor and print events as they happen
    Watch(WatchArgs),
    /// Print the JSON schema for the config file
    Schema,
}

#[derive(Args)]
struct BallastArgs {
    /// Allocate this much into a `scratch` pool first (e.g. "256MiB")
    #[arg(long, value_parser = parse_size)]
    fill: Option<u64>,
}

#[derive(Args)]
struct WatchArgs {
    /// Number of sampling intervals to watch for
    #[arg(long, default_value_t = 12)]
    ticks: u32,
    #[command(flatten)]
    ballast: BallastArgs,
}

fn parse_size(value: &str) -> Result<u64, String> {
    reclaim_memory::parse_byte_size(value).map_err(|err| err.to_string())
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    if let Command::Schema = cli.command {
        let schema = reclaim_config::json_schema();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(0);
    }

    let config = load_config(cli.config.as_deref())?;
    reclaim_config::init_tracing(&config.logging);
    let options = config.memory_options()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(execute(cli.command, cli.json, options))
}

async fn execute(command: Command, json: bool, options: MemoryOptions) -> Result<i32> {
    let system = MemorySystem::from_options(options)?;
    match command {
        Command::Status(args) => {
            fill_scratch(&system, args.fill);
            system.tick().await;
            print_report(&system.report(), json)?;
            Ok(0)
        }
        Command::Cleanup(args) => {
            fill_scratch(&system, args.fill);
            system.tick().await;
            let result = system.perform_manual_cleanup().await;
            let exit = if result.success { 0 } else { 1 };
            print_result(&result, json)?;
            Ok(exit)
        }
        Command::Watch(args) => {
            fill_scratch(&system, args.ballast.fill);
            watch(&system, args.ticks, json).await?;
            Ok(0)
        }
        Command::Schema => Ok(0),
    }
}

fn load_config(path: Option<&Path>) -> Result<ReclaimConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.is_file() {
                return Ok(ReclaimConfig::default());
            }
            default
        }
    };

    let (config, diagnostics) = ReclaimConfig::load_from_path_with_diagnostics(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    for key in &diagnostics.unknown_keys {
        eprintln!("warning: {}: unknown key `{key}`", path.display());
    }
    Ok(config)
}

/// Store `bytes` of real allocations in a low-priority `scratch` pool so
/// cleanup has something to release.
fn fill_scratch(system: &MemorySystem, bytes: Option<u64>) {
    let Some(bytes) = bytes else {
        return;
    };
    let pool = system.create_pool::<Vec<u8>>("scratch", CleanupPriority::Low);
    const CHUNK: u64 = 4 * reclaim_memory::MB;
    let mut remaining = bytes;
    let mut index = 0usize;
    while remaining > 0 {
        let size = remaining.min(CHUNK);
        // Touch every page so the allocation shows up in the resident size.
        let buffer = vec![1u8; size as usize];
        pool.store(format!("chunk-{index}"), buffer, size);
        remaining -= size;
        index += 1;
    }
    tracing::info!(
        target: "reclaim.cli",
        requested_bytes = bytes,
        stored_bytes = pool.usage_bytes(),
        "filled scratch pool"
    );
}

async fn watch(system: &MemorySystem, ticks: u32, json: bool) -> Result<()> {
    let interval = system.options().sampling_interval;
    let mut events = system.subscribe();
    system.start();

    let deadline = tokio::time::sleep(interval * ticks);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event, json)?,
                None => break,
            },
        }
    }

    system.shutdown().await;
    print_report(&system.report(), json)
}

#[derive(Serialize)]
struct ResultEnvelope<'a> {
    cleanup: &'a CleanupResult,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &MemoryReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    println!("level: {}", report.level);
    match report.resident_bytes {
        Some(bytes) => println!("  resident: {}", format_bytes(bytes)),
        None => println!("  resident: unknown"),
    }
    if let (Some(available), Some(total)) = (report.available_bytes, report.total_bytes) {
        println!(
            "  system: {} available of {}",
            format_bytes(available),
            format_bytes(total)
        );
    }
    for threshold in &report.thresholds {
        println!("  {:<9} >= {}", threshold.level.as_str(), format_bytes(threshold.bytes));
    }
    if let Some(headroom) = report.headroom_bytes() {
        println!("  headroom: {}", format_bytes(headroom));
    }
    for pool in &report.pools {
        println!(
            "  pool {}: {} entries, {} of {}",
            pool.name,
            pool.entries,
            format_bytes(pool.usage_bytes),
            format_bytes(pool.capacity_bytes)
        );
    }
    let stats = &report.statistics;
    println!(
        "  cleanups: {} ({} automatic, {} manual), freed {}",
        stats.total_cleanups,
        stats.automatic_cleanups,
        stats.manual_cleanups,
        format_bytes(stats.total_memory_freed_bytes)
    );
    Ok(())
}

fn print_result(result: &CleanupResult, json: bool) -> Result<()> {
    if json {
        return print_json(&ResultEnvelope { cleanup: result });
    }

    println!(
        "cleanup: {}",
        if result.success { "ok" } else { "completed with errors" }
    );
    println!(
        "  freed: {}",
        format_bytes(u64::try_from(result.memory_freed_bytes).unwrap_or(0))
    );
    println!("  handlers: {}", result.handlers_executed);
    if let Some(millis) = result.duration_millis {
        println!("  elapsed_ms: {millis}");
    }
    if let Some(error) = &result.error {
        println!("  error: {error}");
    }
    Ok(())
}

fn print_event(event: &PressureEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        PressureEvent::LevelChanged {
            from,
            to,
            usage_bytes,
            ..
        } => println!("level {from} -> {to} at {}", format_bytes(*usage_bytes)),
        PressureEvent::CleanupCompleted {
            result,
            is_automatic,
        } => println!(
            "{} cleanup freed {} ({} handlers)",
            if *is_automatic { "automatic" } else { "manual" },
            format_bytes(u64::try_from(result.memory_freed_bytes).unwrap_or(0)),
            result.handlers_executed
        ),
        PressureEvent::PauseBackgroundWork { level, usage_bytes } => println!(
            "pause background work ({level}, {})",
            format_bytes(*usage_bytes)
        ),
        PressureEvent::ResumeBackgroundWork => println!("resume background work"),
        PressureEvent::Advisory { level, usage_bytes } => println!(
            "advisory: pressure {level} at {}",
            format_bytes(*usage_bytes)
        ),
    }
    Ok(())
}
