use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arrayshm::{ArrayShm, Semaphore, WriterConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "zyshm-writer.toml")]
    config: String,
    /// Records per insert; anything beyond capacity is dropped.
    #[clap(short = 'n', long = "batch", default_value = "20")]
    batch: usize,
    #[clap(long = "interval-ms", default_value = "1000")]
    interval_ms: u64,
    /// Stop after this many inserts instead of running until signaled.
    #[clap(long = "rounds")]
    rounds: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    info!(?cfg, "loaded config");

    let mut shm = ArrayShm::<i32>::new();
    let origin = shm.init(cfg.shm.shm_key, cfg.shm.max_node_count, true)?;
    info!(?origin, max_node_count = shm.max_node_count(), "array shm ready");
    let sem = Semaphore::create(cfg.shm.sem_key)?;

    let closing = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&closing))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&closing))?;

    run(&mut shm, &sem, &opts, &closing)?;
    Ok(())
}

/// Values in 0..10000 that change every round.
fn gen_batch(round: u64, len: usize) -> Vec<i32> {
    (0..len as u64)
        .map(|i| {
            let mixed = round.wrapping_mul(2_654_435_761) ^ i.wrapping_mul(40_503).rotate_left(17);
            (mixed % 10_000) as i32
        })
        .collect()
}

fn run(
    shm: &mut ArrayShm<i32>,
    sem: &Semaphore,
    opts: &Opts,
    closing: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let mut round = 0u64;
    while !closing.load(Ordering::Relaxed) {
        if opts.rounds.map_or(false, |limit| round >= limit) {
            break;
        }
        let nodes = gen_batch(round, opts.batch);
        let count = {
            let _held = sem.guard()?;
            shm.insert(&nodes)?
        };
        println!("insert node count: {}", count);
        round += 1;
        thread::sleep(Duration::from_millis(opts.interval_ms));
    }
    info!(rounds = round, "writer stopped");
    Ok(())
}
