//! Cross-process binary semaphore.
//!
//! Callers hold it around any header read plus body read or write sequence
//! on a shared array. It is a System V semaphore set with one member, where
//! a value of 1 means available.
//!
//! Both lock and unlock are done with `SEM_UNDO`, so when a process dies
//! holding the semaphore the kernel gives it back.

use std::fmt;
use std::io;
use std::mem;
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_short, key_t, sembuf};
use tracing::{debug, info, warn};

use crate::errors::{Result, ShmError};

const SEM_PERMS: c_int = 0o666;
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

fn os_error(key: u32, op: &'static str) -> ShmError {
    ShmError::Semaphore {
        key,
        op,
        source: io::Error::last_os_error(),
    }
}

fn semget(key: u32, flags: c_int) -> Result<c_int> {
    let id = unsafe { libc::semget(key as key_t, 1, flags) };
    if id < 0 {
        return Err(os_error(key, "semget"));
    }
    Ok(id)
}

fn semop(id: c_int, sem_op: c_short, flags: c_int) -> io::Result<()> {
    let mut op = sembuf {
        sem_num: 0,
        sem_op,
        sem_flg: flags as c_short,
    };
    if unsafe { libc::semop(id, &mut op, 1) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn rmid(key: u32, id: c_int) -> Result<()> {
    if unsafe { libc::semctl(id, 0, libc::IPC_RMID) } < 0 {
        return Err(os_error(key, "semctl(IPC_RMID)"));
    }
    Ok(())
}

/// Removes the semaphore set for `key` without attaching a semaphore.
pub fn remove_semaphore(key: u32) -> Result<()> {
    let id = semget(key, 0)?;
    rmid(key, id)?;
    info!(key, "removed semaphore");
    Ok(())
}

pub struct Semaphore {
    key: u32,
    id: c_int,
}

impl Semaphore {
    /// Opens the semaphore at `key`, creating it in the available state when
    /// no process has yet.
    pub fn create(key: u32) -> Result<Semaphore> {
        if key == 0 {
            return Err(ShmError::InvalidKey(key));
        }
        if let Ok(id) = semget(key, SEM_PERMS) {
            return Semaphore::open_existing(key, id);
        }
        match semget(key, libc::IPC_CREAT | libc::IPC_EXCL | SEM_PERMS) {
            Ok(id) => Semaphore::init_new(key, id),
            Err(ShmError::Semaphore { ref source, .. })
                if source.raw_os_error() == Some(libc::EEXIST) =>
            {
                warn!(key, "semaphore was created by another process meanwhile, attaching");
                let id = semget(key, SEM_PERMS)?;
                Semaphore::open_existing(key, id)
            }
            Err(e) => Err(e),
        }
    }

    fn init_new(key: u32, id: c_int) -> Result<Semaphore> {
        // A plain semop, not SETVAL, so sem_otime marks the set as ready.
        // No SEM_UNDO here: the creator exiting must not take it back.
        semop(id, 1, 0).map_err(|source| ShmError::Semaphore {
            key,
            op: "semop(init)",
            source,
        })?;
        info!(key, "created semaphore");
        Ok(Semaphore { key, id })
    }

    fn is_ready(key: u32, id: c_int) -> Result<bool> {
        let mut ds: libc::semid_ds = unsafe { mem::zeroed() };
        if unsafe { libc::semctl(id, 0, libc::IPC_STAT, &mut ds as *mut libc::semid_ds) } < 0 {
            return Err(os_error(key, "semctl(IPC_STAT)"));
        }
        Ok(ds.sem_otime != 0)
    }

    fn open_existing(key: u32, id: c_int) -> Result<Semaphore> {
        let started = Instant::now();
        while !Semaphore::is_ready(key, id)? {
            if started.elapsed() > INIT_TIMEOUT {
                return Err(ShmError::Semaphore {
                    key,
                    op: "open",
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        "semaphore was never initialized by its creator",
                    ),
                });
            }
            thread::sleep(Duration::from_millis(1));
        }
        debug!(key, "attached semaphore");
        Ok(Semaphore { key, id })
    }

    #[inline]
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Takes the semaphore. With `wait == false` it returns
    /// [`ShmError::Busy`] at once when another holder has it.
    pub fn lock(&self, wait: bool) -> Result<()> {
        let flags = if wait {
            libc::SEM_UNDO
        } else {
            libc::SEM_UNDO | libc::IPC_NOWAIT
        };
        loop {
            match semop(self.id, -1, flags) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if !wait && e.raw_os_error() == Some(libc::EAGAIN) => {
                    return Err(ShmError::Busy { key: self.key })
                }
                Err(source) => {
                    return Err(ShmError::Semaphore {
                        key: self.key,
                        op: "semop(lock)",
                        source,
                    })
                }
            }
        }
    }

    pub fn unlock(&self) -> Result<()> {
        semop(self.id, 1, libc::SEM_UNDO).map_err(|source| ShmError::Semaphore {
            key: self.key,
            op: "semop(unlock)",
            source,
        })
    }

    /// Blocks until the semaphore is taken; it is given back when the guard
    /// drops.
    pub fn guard(&self) -> Result<SemaphoreGuard<'_>> {
        self.lock(true)?;
        Ok(SemaphoreGuard { sem: self })
    }

    /// Removes the semaphore set. Processes blocked in `lock` get an error.
    pub fn destroy(self) -> Result<()> {
        rmid(self.key, self.id)?;
        info!(key = self.key, "destroyed semaphore");
        Ok(())
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("key", &format_args!("{:#x}", self.key))
            .field("id", &self.id)
            .finish()
    }
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.unlock() {
            warn!(key = self.sem.key, error = %e, "failed to unlock semaphore");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::process::{self, Command};

    use super::*;
    use crate::tests::{unique_key, SegmentGuard};

    const HOLDER_KEY_VAR: &str = "ARRAYSHM_SEM_HOLDER_KEY";

    #[test]
    fn rejects_zero_key() {
        assert!(matches!(Semaphore::create(0), Err(ShmError::InvalidKey(0))));
    }

    #[test]
    fn second_handle_sees_the_same_lock() -> Result<()> {
        let key = unique_key();
        let _guard = SegmentGuard(key);
        let a = Semaphore::create(key)?;
        let b = Semaphore::create(key)?;

        a.lock(false)?;
        assert!(matches!(b.lock(false), Err(ShmError::Busy { .. })));
        a.unlock()?;
        b.lock(false)?;
        assert!(matches!(a.lock(false), Err(ShmError::Busy { .. })));
        b.unlock()?;
        Ok(())
    }

    #[test]
    fn guard_releases_on_drop() -> Result<()> {
        let key = unique_key();
        let _guard = SegmentGuard(key);
        let sem = Semaphore::create(key)?;
        {
            let _held = sem.guard()?;
            assert!(sem.lock(false).is_err());
        }
        sem.lock(false)?;
        sem.unlock()?;
        Ok(())
    }

    #[test]
    fn busy_is_not_an_os_failure() -> Result<()> {
        let key = unique_key();
        let _guard = SegmentGuard(key);
        let sem = Semaphore::create(key)?;
        let other = Semaphore::create(key)?;
        let _held = sem.guard()?;

        let err = other.lock(false).unwrap_err();
        assert!(matches!(err, ShmError::Busy { key: k } if k == key));
        assert!(err.to_string().contains("busy"));
        Ok(())
    }

    #[test]
    fn destroyed_semaphore_fails_with_os_error() -> Result<()> {
        let key = unique_key();
        let _guard = SegmentGuard(key);
        let sem = Semaphore::create(key)?;
        let other = Semaphore::create(key)?;
        sem.destroy()?;
        assert!(matches!(other.lock(false), Err(ShmError::Semaphore { .. })));
        Ok(())
    }

    #[test]
    fn destroy_removes_the_set() -> Result<()> {
        let key = unique_key();
        let _guard = SegmentGuard(key);
        let sem = Semaphore::create(key)?;
        sem.destroy()?;
        match remove_semaphore(key) {
            Err(ShmError::Semaphore { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            other => panic!("unexpected {:?}", other),
        }
        // a fresh one starts available again
        let sem = Semaphore::create(key)?;
        sem.lock(false)?;
        sem.unlock()?;
        Ok(())
    }

    /// Runs only when spawned by `dead_holder_gives_the_lock_back`.
    #[test]
    fn abort_while_holding() {
        let key: u32 = match env::var(HOLDER_KEY_VAR) {
            Ok(key) => key.parse().unwrap(),
            Err(_) => return,
        };
        let sem = Semaphore::create(key).unwrap();
        sem.lock(true).unwrap();
        process::abort();
    }

    #[test]
    fn dead_holder_gives_the_lock_back() -> Result<()> {
        let key = unique_key();
        let _guard = SegmentGuard(key);
        let sem = Semaphore::create(key)?;

        let mut child = Command::new(env::current_exe().unwrap())
            .args([
                "--exact",
                "semaphore::tests::abort_while_holding",
                "--test-threads",
                "1",
                "--nocapture",
            ])
            .env(HOLDER_KEY_VAR, key.to_string())
            .spawn()
            .unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());

        // the child was the last to touch the set, either by its lock or by
        // the kernel undoing it at exit
        let last_pid = unsafe { libc::semctl(sem.id, 0, libc::GETPID) };
        assert_eq!(last_pid as u32, child.id());

        sem.lock(false)?;
        sem.unlock()?;
        Ok(())
    }
}
