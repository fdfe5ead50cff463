use std::error::Error;
use std::hint::black_box;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arrayshm::{ArrayShm, WriterConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "zyshm-writer.toml")]
    config: String,
    #[clap(short = 'n', long = "iterations", default_value = "1000000")]
    iterations: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    let mut shm = ArrayShm::<i32>::new();
    let origin = shm.init(cfg.shm.shm_key, cfg.shm.max_node_count, true)?;
    info!(?origin, iterations = opts.iterations, "benchmarking inserts");

    let shm_cost = shm_performance(&mut shm, opts.iterations)?;
    report("shm", opts.iterations, shm_cost);
    let heap_cost = heap_performance(shm.max_node_count() as usize, opts.iterations);
    report("heap", opts.iterations, heap_cost);
    Ok(())
}

fn shm_performance(shm: &mut ArrayShm<i32>, iterations: usize) -> Result<Duration, Box<dyn Error>> {
    let nodes = [100, 10];
    let start = Instant::now();
    for _ in 0..iterations {
        black_box(shm.insert(&nodes)?);
    }
    Ok(start.elapsed())
}

fn heap_performance(len: usize, iterations: usize) -> Duration {
    let mut heap = vec![0i32; len];
    let start = Instant::now();
    for _ in 0..iterations {
        for slot in heap.iter_mut() {
            *slot = 10;
        }
        black_box(&mut heap);
    }
    start.elapsed()
}

fn report(name: &str, iterations: usize, cost: Duration) {
    let iops = (iterations as f64) / cost.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} performance cost time(ns): {} ({}K ops/s)",
        name,
        cost.as_nanos(),
        (iops / 1000f64) as u64
    );
}
