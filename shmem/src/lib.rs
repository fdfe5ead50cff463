//! Fixed-capacity arrays of plain records in keyed, cross-process shared
//! memory.
//!
//! A region is a header (version, counts, checksum, timestamp) followed by
//! equal-size record slots. The first process to ask with `is_create` makes
//! it; everybody else, including a relaunched creator, attaches. Segments are
//! never removed by this crate, use [`remove_segment`] from ops tooling.
//!
//! The array key names a POSIX shared memory object (`/zyshm_<key hex>`),
//! not a System V `shmget` key. Processes that map the region with
//! `shmget(key)` see a different segment even though the header layout and
//! checksum match. The [`Semaphore`] key, on the other hand, is a plain
//! System V `semget` key.
//!
//! Nothing here locks. Bracket access with a [`Semaphore`] when more than
//! one process may touch the region.

pub mod array;
pub mod config;
pub mod core;
mod crc;
mod errors;
pub mod semaphore;

#[cfg(test)]
mod tests;

pub use crate::array::{ArrayHeader, ArrayShm, SHM_VERSION};
pub use crate::config::{ReaderConfig, ShmConfig, WriterConfig};
pub use crate::core::{remove_segment, HeaderCodec, Origin, ShmNode, ShmRegion};
pub use crate::crc::calc_crc;
pub use crate::errors::{Result, ShmError};
pub use crate::semaphore::{remove_semaphore, Semaphore, SemaphoreGuard};
