// rust/restart-driver/src/main.rs

//! Row-Contiguous Checkpoint/Restart Driver
//!
//! Writes the integers `1..=dim0*dim1` row-major into a 2-D dataset that is
//! split into equal square blocks, one block per rank. Each rank registers
//! one part per row of its block, so only the rows are contiguous in the
//! file. A GLOBAL dataset records the number of processes that wrote the
//! checkpoint.
//!
//! The restart may run with a different number of ranks `n`, as long as
//! `n` is a perfect square and `dim0 / sqrt(n)` and `dim1 / sqrt(n)` are
//! integers greater than zero.
//!
//! # Usage
//!
//! ```bash
//! # Checkpoint with 4 simulated ranks
//! rst-row-contiguous 1 --ranks 4
//!
//! # Restart with 16 ranks and verify the checksum
//! rst-row-contiguous 0 --ranks 16
//!
//! # Real MPI ranks sharing one HDF5 file (built with --features mpi)
//! mpirun -n 4 rst-row-contiguous 1 --file row-conti.h5
//! mpirun -n 16 rst-row-contiguous 0 --file row-conti.h5
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use restart_core::{
    BlockDecomposition, ElementType, ProcessGroup, RestartConfig, RestartIo, StorageMode,
};

const DATASET: &str = "shared dataset";
const META_DATASET: &str = "number of processes";

/// Row-contiguous checkpoint/restart driver
#[derive(Parser, Debug)]
#[command(name = "rst-row-contiguous")]
#[command(about = "Checkpoint (1) or restart and verify (0) a block-decomposed grid")]
struct Args {
    /// 1 writes the checkpoint, 0 restarts from it
    mode: Option<u8>,

    /// Number of simulated ranks (ignored with real MPI ranks)
    #[arg(short, long, default_value = "4")]
    ranks: usize,

    /// Checkpoint container path
    #[arg(short, long, default_value = "row-conti.rst")]
    file: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rows of the global grid
    #[arg(long, default_value = "1024")]
    dim0: u64,

    /// Columns of the global grid
    #[arg(long, default_value = "1024")]
    dim1: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let checkpoint = match args.mode {
        Some(mode) => mode != 0,
        None => {
            println!("no argument passed (value 1:checkpoint or 0:restart)");
            return Ok(ExitCode::SUCCESS);
        }
    };

    let config = match &args.config {
        Some(path) => RestartConfig::from_file(path)?,
        None => RestartConfig::default(),
    }
    .with_env_overrides();

    let verified = launch(&args, &config, checkpoint)?;

    Ok(if verified {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Runs every rank as a thread of this process.
#[cfg(not(feature = "mpi"))]
fn launch(args: &Args, config: &RestartConfig, checkpoint: bool) -> restart_core::Result<bool> {
    tracing::info!(ranks = args.ranks, file = %args.file.display(), "starting simulated ranks");

    let outcomes = restart_core::LocalGroup::run(args.ranks, |group| {
        run_rank(Arc::new(group), args, config, checkpoint)
    });

    let mut verified = true;
    for outcome in outcomes {
        verified &= outcome?;
    }
    Ok(verified)
}

/// Runs this process as one rank of `MPI_COMM_WORLD`, writing the
/// checkpoint as a parallel HDF5 file.
#[cfg(feature = "mpi")]
fn launch(args: &Args, config: &RestartConfig, checkpoint: bool) -> restart_core::Result<bool> {
    let universe = mpi::initialize()
        .ok_or_else(|| restart_core::RestartError::group_sync("MPI was already initialized"))?;
    let group = restart_core::MpiGroup::world(&universe);

    let mut config = config.clone();
    config.engine.backend = restart_core::EngineBackend::Hdf5;
    tracing::info!(ranks = group.size(), file = %args.file.display(), "starting MPI ranks");

    run_rank(Arc::new(group), args, &config, checkpoint)
}

/// Checkpoints or restarts this rank's block. Returns whether the restored
/// grid passed the checksum; a checkpoint always passes.
fn run_rank(
    group: Arc<dyn ProcessGroup>,
    args: &Args,
    config: &RestartConfig,
    checkpoint: bool,
) -> restart_core::Result<bool> {
    let rank = group.rank();
    let size = group.size();
    let io = RestartIo::from_config(config, group)?;

    let shape = [args.dim0, args.dim1];
    let decomp = BlockDecomposition::uniform(&shape, size)?;
    let rows = decomp.rows(rank)?;
    let block = decomp.block(rank)?;

    // Row-major consecutive integers starting at 1 for the block's corner.
    let (row0, col0) = (block.offset()[0], block.offset()[1]);
    let mut data: Vec<Vec<i32>> = rows
        .iter()
        .enumerate()
        .map(|(i, region)| {
            let first = (row0 + i as u64) * args.dim1 + col0 + 1;
            (0..region.extent()[1]).map(|j| (first + j) as i32).collect()
        })
        .collect();

    if checkpoint {
        let processes = [size as i32];

        let mut var = io.define(DATASET, 2, ElementType::Int(4), &shape, StorageMode::Shard)?;
        for (row, region) in data.iter().zip(&rows) {
            var.register(row.as_slice(), Some(region.offset()), Some(region.extent()))?;
        }
        let mut meta = io.define(META_DATASET, 1, ElementType::Int(4), &[1], StorageMode::Global)?;
        meta.register(&processes, None, None)?;

        io.write_all(&args.file, &[var, meta])?;
        tracing::info!(rank, parts = rows.len(), "checkpoint written");
        return Ok(true);
    }

    for row in &mut data {
        row.fill(-1);
    }
    let mut written_by = [0i32];
    {
        let mut var = io.define(DATASET, 2, ElementType::Int(4), &shape, StorageMode::Shard)?;
        for (row, region) in data.iter_mut().zip(&rows) {
            var.register_mut(row.as_mut_slice(), Some(region.offset()), Some(region.extent()))?;
        }
        let mut meta = io.define(META_DATASET, 1, ElementType::Int(4), &[1], StorageMode::Global)?;
        meta.register_mut(&mut written_by, None, None)?;

        io.read_all(&args.file, &mut [var, meta])?;
    }

    let local: i64 = data.iter().flatten().map(|&v| i64::from(v)).sum();
    let total = io.access().group().all_reduce_sum(local as u64);
    let elements = args.dim0 * args.dim1;
    let check = elements * (elements + 1) / 2;
    let verified = total == check;

    if rank == 0 {
        println!(
            "[{rank}]: {} (res:{total},check:{check}) restarted {size} ranks from a checkpoint of {} ranks",
            if verified { "SUCCESS" } else { "FAILURE" },
            written_by[0]
        );
    }
    Ok(verified)
}
