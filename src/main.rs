//! CLI entry point: parses a shared-memory key and region size, attaches
//! the region, runs the optimizer, and writes results back.
//!
//! Ported from `main.c` in the reference implementation
//! (`parseArguments`/`runOptimizer`/`main`), with manual `strtoull` parsing
//! replaced by a `clap::Parser` derive, matching the CLI idiom used
//! elsewhere in the corpus (e.g. `oetiker-byonk/src/main.rs`).

use clap::Parser;

use threadloom::debug;
use threadloom::error::{ArgumentError, ThreadloomError};
use threadloom::optimizer::Optimizer;
use threadloom::shared_memory::SharedRegion;
use threadloom::worker_pool::{core_amount, WorkerPool};

#[derive(Parser, Debug)]
#[command(
    name = "threadloom",
    about = "Greedy thread-stringing optimizer over a shared-memory region"
)]
struct Args {
    /// System V shared-memory key identifying the region to attach.
    shared_memory_key: u64,

    /// Size in bytes of the shared-memory region.
    shared_memory_size: u64,

    /// Number of worker threads. Defaults to the detected core count.
    #[arg(long)]
    workers: Option<usize>,

    /// Pin each worker thread to a distinct CPU core.
    #[arg(long, default_value_t = true)]
    pin_cores: bool,
}

fn run() -> Result<(), ThreadloomError> {
    env_logger::init();

    let args = Args::try_parse().map_err(|e| ArgumentError::Invalid(e.to_string()))?;

    let worker_amount = args.workers.unwrap_or_else(core_amount).max(1);
    let pool = WorkerPool::new(worker_amount, args.pin_cores)?;

    let mut region = SharedRegion::attach(args.shared_memory_key, args.shared_memory_size)?;

    let image_width;
    let debug_flags;
    let mut optimizer = {
        let input = region.input();
        image_width = input.layout().image_width as u32;
        debug_flags = input.layout().debug_flags;
        Optimizer::new(&input, pool)?
    };

    let dump_dir = debug::dump_dir(debug_flags);
    optimizer.run_with(|iteration, image| {
        if let Some(dir) = &dump_dir {
            if let Err(err) = debug::save_iteration_image(dir, iteration, image_width, image) {
                log::warn!("failed to write debug image for iteration {iteration}: {err}");
            }
        }
    });

    let (_, mut output) = region.views();
    optimizer.write_output(&mut output);
    drop(output);
    region.detach();

    Ok(())
}

fn main() {
    if let Err(err) = run() {
        log::error!("{err}");
        eprintln!("threadloom: {err}");
        std::process::exit(1);
    }
}
