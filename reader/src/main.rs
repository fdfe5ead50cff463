use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arrayshm::{ArrayShm, ReaderConfig, Semaphore};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "zyshm-reader.toml")]
    config: String,
    #[clap(long = "interval-ms", default_value = "1000")]
    interval_ms: u64,
    /// Only attach; fail when no writer has created the array yet.
    #[clap(long = "attach-only")]
    attach_only: bool,
    /// Read once and exit.
    #[clap(long = "once")]
    once: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    info!(?cfg, "loaded config");

    let mut shm = ArrayShm::<i32>::new();
    let origin = shm.init(cfg.shm.shm_key, cfg.shm.max_node_count, !opts.attach_only)?;
    info!(?origin, max_node_count = shm.max_node_count(), "array shm ready");
    let sem = Semaphore::create(cfg.shm.sem_key)?;

    let closing = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&closing))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&closing))?;

    run(&mut shm, &sem, &opts, &closing)?;
    Ok(())
}

fn run(
    shm: &mut ArrayShm<i32>,
    sem: &Semaphore,
    opts: &Opts,
    closing: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    while !closing.load(Ordering::Relaxed) {
        let mut line = String::new();
        let (header, traversed) = {
            let _held = sem.guard()?;
            let header = shm.get_header()?;
            let traversed = shm.traverse(|node| {
                line.push_str(&node.to_string());
                line.push(' ');
                true
            });
            (header, traversed)
        };

        println!(
            "header info, version: {:#x}, cur_node_count: {}, max_node_count: {}, time_ns: {}, crc: {}",
            header.version,
            header.cur_node_count,
            header.max_node_count,
            header.time_ns,
            header.header_crc_val
        );
        if let Err(e) = traversed {
            error!(error = %e, "traverse failed");
            return Err(Box::new(e));
        }
        println!("{}\n", line);

        if opts.once {
            break;
        }
        thread::sleep(Duration::from_millis(opts.interval_ms));
    }
    info!("reader stopped");
    Ok(())
}
