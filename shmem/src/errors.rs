use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm key {0} is invalid, it should be larger than 0")]
    InvalidKey(u32),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("already initialized, can't reinitialize")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    #[error("try to attach shm which does not exist, key: {key:#x}: {source}")]
    NotFound {
        key: u32,
        #[source]
        source: shared_memory::ShmemError,
    },

    #[error("failed to attach shm, key: {key:#x}: {source}")]
    AttachFailed {
        key: u32,
        #[source]
        source: shared_memory::ShmemError,
    },

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    #[error("shm {key:#x} is truncated, header implies {expected} bytes but only {actual} are mapped")]
    Truncated {
        key: u32,
        expected: usize,
        actual: usize,
    },

    #[error("semaphore {key:#x} is busy")]
    Busy { key: u32 },

    #[error("semaphore {key:#x}, {op} failed: {source}")]
    Semaphore {
        key: u32,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(
        "version check error, header info, version: {version:#x}, cur_node_count: {cur_node_count}, \
         max_node_count: {max_node_count}, header_crc_val: {header_crc_val}, time_ns: {time_ns}"
    )]
    VersionMismatch {
        version: u32,
        cur_node_count: u32,
        max_node_count: u32,
        header_crc_val: u32,
        time_ns: u64,
    },

    #[error("CRC calibration error, stored: {stored:#x}, computed: {computed:#x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("shm is not attached")]
    NotAttached,

    #[error("failed to get node at pos {pos} (offset {offset})")]
    OutOfBounds { pos: usize, offset: usize },

    #[error("traverse callback returned false at node {index}")]
    CallbackStopped { index: usize },

    #[error("buffer size mismatch, expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },
}

impl ShmError {
    /// Version and checksum failures mean the region can't be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ShmError::VersionMismatch { .. } | ShmError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ShmError>;
