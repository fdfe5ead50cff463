use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{unique_key, SegmentGuard};
use crate::array::ArrayShm;
use crate::errors::Result;
use crate::semaphore::Semaphore;

const BATCH_LEN: usize = 64;

/// Every record of a batch carries the batch id, so a reader that sees two
/// different ids in one traversal has read a half-written batch.
fn batch(id: u64) -> Vec<u64> {
    vec![id; BATCH_LEN]
}

#[test]
fn locked_readers_never_see_torn_batches() -> Result<()> {
    let shm_key = unique_key();
    let sem_key = unique_key();
    let _shm_guard = SegmentGuard(shm_key);
    let _sem_guard = SegmentGuard(sem_key);

    let mut creator = ArrayShm::<u64>::new();
    creator.init(shm_key, BATCH_LEN as u32, true)?;
    let sem = Semaphore::create(sem_key)?;
    {
        let _held = sem.guard()?;
        creator.insert(&batch(0))?;
    }

    let stop = Arc::new(AtomicBool::new(false));

    let writer = thread::spawn({
        let stop = Arc::clone(&stop);
        move || -> Result<u64> {
            let mut shm = ArrayShm::<u64>::new();
            shm.init(shm_key, 0, false)?;
            let sem = Semaphore::create(sem_key)?;
            let mut id = 0;
            while !stop.load(Ordering::Relaxed) {
                id += 1;
                let nodes = batch(id);
                {
                    let _held = sem.guard()?;
                    shm.insert(&nodes)?;
                }
                thread::sleep(Duration::from_micros(50));
            }
            Ok(id)
        }
    });

    let reader = thread::spawn({
        let stop = Arc::clone(&stop);
        move || -> Result<(usize, usize)> {
            let mut shm = ArrayShm::<u64>::new();
            shm.init(shm_key, 0, false)?;
            let sem = Semaphore::create(sem_key)?;
            let (mut reads, mut torn) = (0, 0);
            while !stop.load(Ordering::Relaxed) {
                let nodes = {
                    let _held = sem.guard()?;
                    shm.collect()?
                };
                reads += 1;
                if nodes.len() != BATCH_LEN || nodes.iter().any(|n| *n != nodes[0]) {
                    torn += 1;
                }
                thread::sleep(Duration::from_micros(70));
            }
            Ok((reads, torn))
        }
    });

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);

    let batches = writer.join().expect("writer thread panicked")?;
    let (reads, torn) = reader.join().expect("reader thread panicked")?;

    assert!(batches > 0);
    assert!(reads > 0);
    assert_eq!(torn, 0);
    Ok(())
}

#[test]
fn read_modify_write_under_semaphore_loses_nothing() -> Result<()> {
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 200;

    let shm_key = unique_key();
    let sem_key = unique_key();
    let _shm_guard = SegmentGuard(shm_key);
    let _sem_guard = SegmentGuard(sem_key);

    let mut counter = ArrayShm::<u64>::new();
    counter.init(shm_key, 1, true)?;
    counter.insert(&[0])?;
    let _sem = Semaphore::create(sem_key)?;

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(move || -> Result<()> {
                let mut shm = ArrayShm::<u64>::new();
                shm.init(shm_key, 1, true)?;
                let sem = Semaphore::create(sem_key)?;
                for _ in 0..ROUNDS {
                    sem.lock(true)?;
                    let current = shm.collect()?[0];
                    shm.insert(&[current + 1])?;
                    sem.unlock()?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread panicked")?;
    }

    assert_eq!(counter.collect()?, vec![THREADS * ROUNDS]);
    Ok(())
}
