//! Array store header.
//!
//! layout (native byte order, matches a `#[repr(C)]` struct, no padding)
//!  0  -- u32 version
//!  4  -- u32 cur_node_count
//!  8  -- u32 max_node_count
//! 12  -- u32 header_crc_val, computed with this field zeroed
//! 16  -- u64 time_ns
//! 24  -- end

use std::mem;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::{HeaderCodec, ShmNode};
use crate::crc::calc_crc;
use crate::errors::{Result, ShmError};

/// Binary layout version of the array store.
pub const SHM_VERSION: u32 = 0xFFFF_FF01;

pub const ARRAY_HEADER_SIZE: usize = 24;

const POS_VERSION: usize = 0;
const POS_CUR_NODE_COUNT: usize = 4;
const POS_MAX_NODE_COUNT: usize = 8;
const POS_HEADER_CRC_VAL: usize = 12;
const POS_TIME_NS: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ArrayHeader {
    pub version: u32,
    pub cur_node_count: u32,
    pub max_node_count: u32,
    pub header_crc_val: u32,
    pub time_ns: u64,
}

const _: () = assert!(mem::size_of::<ArrayHeader>() == ARRAY_HEADER_SIZE);

#[inline]
fn u32_at(bytes: &[u8; ARRAY_HEADER_SIZE], pos: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_ne_bytes(word)
}

impl ArrayHeader {
    pub fn new(max_node_count: u32) -> ArrayHeader {
        ArrayHeader {
            version: SHM_VERSION,
            cur_node_count: 0,
            max_node_count,
            header_crc_val: 0,
            time_ns: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; ARRAY_HEADER_SIZE] {
        let mut buf = [0u8; ARRAY_HEADER_SIZE];
        buf[POS_VERSION..POS_VERSION + 4].copy_from_slice(&self.version.to_ne_bytes());
        buf[POS_CUR_NODE_COUNT..POS_CUR_NODE_COUNT + 4]
            .copy_from_slice(&self.cur_node_count.to_ne_bytes());
        buf[POS_MAX_NODE_COUNT..POS_MAX_NODE_COUNT + 4]
            .copy_from_slice(&self.max_node_count.to_ne_bytes());
        buf[POS_HEADER_CRC_VAL..POS_HEADER_CRC_VAL + 4]
            .copy_from_slice(&self.header_crc_val.to_ne_bytes());
        buf[POS_TIME_NS..POS_TIME_NS + 8].copy_from_slice(&self.time_ns.to_ne_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; ARRAY_HEADER_SIZE]) -> ArrayHeader {
        let mut time_ns = [0u8; 8];
        time_ns.copy_from_slice(&bytes[POS_TIME_NS..POS_TIME_NS + 8]);
        ArrayHeader {
            version: u32_at(bytes, POS_VERSION),
            cur_node_count: u32_at(bytes, POS_CUR_NODE_COUNT),
            max_node_count: u32_at(bytes, POS_MAX_NODE_COUNT),
            header_crc_val: u32_at(bytes, POS_HEADER_CRC_VAL),
            time_ns: u64::from_ne_bytes(time_ns),
        }
    }

    /// Checksum of the header with `header_crc_val` taken as zero.
    pub fn checksum(&self) -> u32 {
        let mut unsealed = *self;
        unsealed.header_crc_val = 0;
        calc_crc(&unsealed.to_bytes())
    }

    /// Stamps `time_ns` and stores a fresh checksum.
    pub fn seal(&mut self, time_ns: u64) {
        self.time_ns = time_ns;
        self.header_crc_val = self.checksum();
    }

    /// Total region length (header plus every slot) this header describes.
    pub fn region_len<T: ShmNode>(&self) -> usize {
        ARRAY_HEADER_SIZE + self.max_node_count as usize * mem::size_of::<T>()
    }
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub struct ArrayHeaderCodec;

impl HeaderCodec for ArrayHeaderCodec {
    type Header = ArrayHeader;

    const SIZE: usize = ARRAY_HEADER_SIZE;

    fn encode(header: &ArrayHeader, out: &mut [u8]) {
        out[..ARRAY_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Checks the version first, then the checksum, then the counts.
    fn decode(bytes: &[u8]) -> Result<ArrayHeader> {
        let raw: &[u8; ARRAY_HEADER_SIZE] =
            bytes.try_into().map_err(|_| ShmError::BufferSize {
                expected: ARRAY_HEADER_SIZE,
                actual: bytes.len(),
            })?;
        let header = ArrayHeader::from_bytes(raw);
        if header.version != SHM_VERSION {
            return Err(ShmError::VersionMismatch {
                version: header.version,
                cur_node_count: header.cur_node_count,
                max_node_count: header.max_node_count,
                header_crc_val: header.header_crc_val,
                time_ns: header.time_ns,
            });
        }
        let computed = header.checksum();
        if computed != header.header_crc_val {
            return Err(ShmError::ChecksumMismatch {
                stored: header.header_crc_val,
                computed,
            });
        }
        if header.cur_node_count > header.max_node_count {
            return Err(ShmError::InvalidSize(format!(
                "cur_node_count {} exceeds max_node_count {}",
                header.cur_node_count, header.max_node_count
            )));
        }
        Ok(header)
    }
}
