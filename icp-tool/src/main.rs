//! Incremental checkpoint operator tool
//!
//! This binary inspects, verifies and restores base files written by the
//! checkpoint engine, and dry-runs the recovery vote of a group.
//!
//! # Usage
//!
//! ```bash
//! # Show the layers of a base file
//! icp inspect l1/dcp-id0-rank0.icp
//!
//! # Verify every layer, failing if any is corrupt
//! icp verify l1/dcp-id0-rank0.icp
//!
//! # Restore layer 2 into one file per variable
//! icp restore l1/dcp-id0-rank0.icp --layer 2 --out restored/
//!
//! # Vote on every level for a group of 4 ranks
//! icp --config icp.toml vote --ranks 4 --checkpoint-id 7 --file-id 0
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use icp_core::checkpoint::format::parse_full_file_name;
use icp_core::config::StorageConfig;
use icp_core::{
    build_storage, Expectation, IcpConfig, IcpError, InProcessGroup, LayerFile, LevelValidator,
    LocalStorage, OpenMode, Reconstructor, RecoveryReport, ResilienceLevel, RestoredState,
    StorageBackend,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Incremental checkpoint operator tool
#[derive(Parser, Debug)]
#[command(name = "icp")]
#[command(about = "Inspect, verify and restore incremental checkpoint files")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header and layer table of a base file
    Inspect {
        path: PathBuf,
    },
    /// Verify every finalized layer of a base file
    Verify {
        path: PathBuf,
    },
    /// Rebuild the variables of a checkpoint file
    Restore {
        path: PathBuf,
        /// Layer to rebuild; defaults to the newest valid one
        #[arg(short, long)]
        layer: Option<u32>,
        /// Directory receiving one `var-<id>.bin` per variable
        #[arg(short, long, default_value = "restored")]
        out: PathBuf,
    },
    /// Run the recovery vote of a group of ranks within this process
    Vote {
        #[arg(long, default_value = "1")]
        ranks: u32,
        #[arg(long)]
        checkpoint_id: i32,
        #[arg(long, default_value = "0")]
        file_id: u64,
        /// Only vote on this level (1-4)
        #[arg(long)]
        level: Option<u8>,
    },
}

fn load_config(path: Option<&Path>) -> CliResult<IcpConfig> {
    let config = match path {
        Some(path) => IcpConfig::from_file(path)?,
        None => IcpConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Storage for paths given on the command line, resolved against the
/// current directory.
fn cli_storage() -> CliResult<Arc<dyn StorageBackend>> {
    let config = StorageConfig {
        base_path: PathBuf::from("."),
        ..StorageConfig::default()
    };
    Ok(Arc::new(LocalStorage::new(&config)?))
}

fn inspect(path: &Path) -> CliResult<()> {
    let storage = cli_storage()?;
    let file = LayerFile::open(storage.as_ref(), path)?;
    let header = file.header();
    let trailer = file.trailer();

    println!("file:        {}", path.display());
    println!("size:        {} bytes", file.file_size());
    println!("rank:        {}", trailer.rank);
    println!("file id:     {}", trailer.file_id);
    println!("block size:  {}", header.block_size);
    println!("stack size:  {}", header.stack_size);
    println!("hash:        {}", trailer.hash_function);
    println!("blocks:      {}", trailer.datastructure.len());
    println!();
    println!(
        "{:>5}  {:>8}  {:>10}  {:>10}  {:>6}  {:>9}  layer hash",
        "layer", "ckpt", "offset", "size", "vars", "committed"
    );
    for layer in file.layers() {
        println!(
            "{:>5}  {:>8}  {:>10}  {:>10}  {:>6}  {:>9}  {}",
            layer.layer,
            layer.checkpoint_id,
            layer.body_offset,
            layer.body_size,
            layer.variables.len(),
            layer.committed_blocks,
            hex::encode(&layer.layer_hash)
        );
    }
    Ok(())
}

fn verify(path: &Path) -> CliResult<()> {
    let storage = cli_storage()?;
    let file = LayerFile::open(storage.as_ref(), path)?;

    let mut failed = 0usize;
    for (layer, result) in file.verify_all() {
        match result {
            Ok(verified) => println!(
                "layer {layer}: ok (checkpoint {}, {} blocks)",
                verified.summary.checkpoint_id,
                verified.blocks.len()
            ),
            Err(e) => {
                failed += 1;
                println!("layer {layer}: CORRUPT ({e})");
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} corrupt layer(s) in {}", path.display()).into());
    }
    Ok(())
}

fn write_variables(state: &RestoredState, out: &Path) -> CliResult<()> {
    let storage = cli_storage()?;
    for id in state.ids() {
        let target = out.join(format!("var-{id}.bin"));
        let data = state.variable(id)?;
        let mut writer = storage.open_write(&target, OpenMode::Truncate)?;
        writer
            .write_all(data)
            .map_err(|e| IcpError::storage_with_source(&target, "failed to write variable", e))?;
        writer.finish()?;
        tracing::debug!(id, bytes = data.len(), path = %target.display(), "Wrote variable");
    }
    Ok(())
}

fn restore(path: &Path, layer: Option<u32>, out: &Path) -> CliResult<()> {
    let reconstructor = Reconstructor::new(cli_storage()?);
    let is_full = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_full_file_name)
        .is_some();

    let state = match (is_full, layer) {
        (true, _) => reconstructor.restore_full(path)?,
        (false, Some(layer)) => reconstructor.reconstruct_layer(path, layer)?,
        (false, None) => reconstructor.reconstruct(path)?,
    };
    if !state.corrupt_layers().is_empty() {
        tracing::warn!(layers = ?state.corrupt_layers(), "Skipped corrupt layers");
    }

    write_variables(&state, out)?;
    println!(
        "restored checkpoint {} (layer {}): {} variable(s) into {}",
        state.checkpoint_id(),
        state.layer(),
        state.len(),
        out.display()
    );
    Ok(())
}

fn vote(config: &IcpConfig, ranks: u32, expect: Expectation, level: Option<u8>) -> CliResult<()> {
    let level = match level {
        Some(n) => Some(
            ResilienceLevel::from_number(n).ok_or_else(|| format!("invalid level {n}, expected 1-4"))?,
        ),
        None => None,
    };
    let storage = build_storage(&config.storage)?;

    let handles: Vec<_> = InProcessGroup::create(ranks.max(1))
        .into_iter()
        .map(|member| {
            let validator = LevelValidator::new(Arc::clone(&storage), config, member);
            let expect = expect.clone();
            thread::spawn(move || match level {
                Some(level) => validator.validate_level(level, &expect).map(|verdict| RecoveryReport {
                    checkpoint_id: expect.checkpoint_id,
                    verdicts: vec![(level, verdict)],
                }),
                None => validator.validate_all(&expect),
            })
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| "vote thread panicked".to_string())??;
        reports.push(report);
    }

    // Every rank evaluates the same votes, so rank 0's report speaks for all.
    if let Some(report) = reports.first() {
        for (level, verdict) in &report.verdicts {
            println!("{level}: {verdict:?}");
        }
        match report.first_recoverable() {
            Some(level) => println!("recover from {level}"),
            None => println!("no level can recover checkpoint {}", report.checkpoint_id),
        }
    }
    Ok(())
}

fn main() -> CliResult<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Inspect { path } => inspect(&path),
        Command::Verify { path } => verify(&path),
        Command::Restore { path, layer, out } => restore(&path, layer, &out),
        Command::Vote {
            ranks,
            checkpoint_id,
            file_id,
            level,
        } => {
            let config = load_config(args.config.as_deref())?;
            tracing::info!(ranks, checkpoint_id, file_id, "Running recovery vote");
            vote(&config, ranks, Expectation::new(checkpoint_id, file_id), level)
        }
    }
}
