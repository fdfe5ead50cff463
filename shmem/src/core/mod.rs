use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info, warn};

use crate::errors::{Result, ShmError};

/// A record that can be byte-copied in and out of shared memory.
///
/// # Safety
///
/// Implementors must be plain data: no pointers, references or owned heap
/// data, and every bit pattern of `size_of::<Self>()` bytes must be a valid
/// value. All processes sharing a region must also agree on the layout
/// (field order, padding, endianness), so user structs should be `#[repr(C)]`
/// and built for the same target.
pub unsafe trait ShmNode: Copy + 'static {}

macro_rules! impl_shm_node {
    ($($t:ty),*) => {
        $(unsafe impl ShmNode for $t {})*
    };
}

impl_shm_node!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize, f32, f64);

unsafe impl<T: ShmNode, const N: usize> ShmNode for [T; N] {}

/// Fixed-size header format placed at the front of a region.
pub trait HeaderCodec {
    type Header: Copy;

    /// Encoded length in bytes. Anything `<= 1` means the region has no header.
    const SIZE: usize;

    fn encode(header: &Self::Header, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Result<Self::Header>;
}

impl HeaderCodec for () {
    type Header = ();

    const SIZE: usize = 0;

    fn encode(_: &(), _: &mut [u8]) {}

    fn decode(_: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Created,
    Attached,
}

pub fn segment_os_id(key: u32) -> String {
    format!("/zyshm_{:08x}", key)
}

fn open_segment(key: u32) -> std::result::Result<Shmem, ShmemError> {
    ShmemConf::new().os_id(segment_os_id(key)).open()
}

/// `NotFound` only when the segment really is missing.
fn open_error(key: u32, source: ShmemError) -> ShmError {
    match source {
        ShmemError::MapOpenFailed(errno) if errno == libc::ENOENT as u32 => {
            ShmError::NotFound { key, source }
        }
        ShmemError::LinkDoesNotExist => ShmError::NotFound { key, source },
        source => ShmError::AttachFailed { key, source },
    }
}

/// Unlinks the OS segment for `key`.
///
/// Nothing in this crate calls this: already attached processes keep their
/// mapping, but any later attach will fail or create a fresh segment.
pub fn remove_segment(key: u32) -> Result<()> {
    let mut shmem = open_segment(key).map_err(|source| open_error(key, source))?;
    shmem.set_owner(true);
    drop(shmem);
    info!(key, "removed shm segment");
    Ok(())
}

/// One process's view of a keyed shared memory segment, split into a header
/// part of `H::SIZE` bytes and a body of fixed-size `T` slots.
pub struct ShmRegion<T, H> {
    key: u32,
    shmem: Option<Shmem>,
    header_len: usize,
    body_len: usize,
    _marker: PhantomData<(T, H)>,
}

impl<T: ShmNode, H: HeaderCodec> ShmRegion<T, H> {
    #[inline]
    pub fn header_size() -> usize {
        if H::SIZE > 1 {
            H::SIZE
        } else {
            0
        }
    }

    #[inline]
    pub fn node_size() -> usize {
        mem::size_of::<T>()
    }

    /// Attaches to the segment at `key`, or creates it when none exists and
    /// `is_create` is set. An existing segment always wins over creation.
    ///
    /// On attach the header prefix is handed to `parse_header` together with
    /// the mapped length; it must return the total region length the header
    /// implies. `body_size` only matters when a segment is created.
    pub fn init<F>(key: u32, body_size: usize, is_create: bool, parse_header: F) -> Result<(Self, Origin)>
    where
        F: FnOnce(&[u8], usize) -> Result<usize>,
    {
        if key == 0 {
            return Err(ShmError::InvalidKey(key));
        }
        let body_size = if is_create { body_size } else { 0 };
        if is_create && body_size == 0 {
            return Err(ShmError::InvalidSize(
                "the requested length is invalid (==0) when creating shm".to_string(),
            ));
        }

        match open_segment(key) {
            Ok(probe) => Self::attach(key, probe, parse_header).map(|r| (r, Origin::Attached)),
            Err(source) if !is_create => Err(open_error(key, source)),
            Err(_) => match Self::create(key, body_size) {
                Ok(region) => Ok((region, Origin::Created)),
                Err(ShmError::SharedMemory(ShmemError::MappingIdExists)) => {
                    warn!(key, "shm was created by another process meanwhile, attaching");
                    let probe =
                        open_segment(key).map_err(|source| open_error(key, source))?;
                    Self::attach(key, probe, parse_header).map(|r| (r, Origin::Attached))
                }
                Err(e) => Err(e),
            },
        }
    }

    fn create(key: u32, body_len: usize) -> Result<Self> {
        let header_len = Self::header_size();
        let len = header_len.checked_add(body_len).ok_or_else(|| {
            ShmError::InvalidSize(format!("body size {} overflows", body_len))
        })?;
        let mut shmem = ShmemConf::new().size(len).os_id(segment_os_id(key)).create()?;
        // The segment outlives this mapping.
        shmem.set_owner(false);
        unsafe { ptr::write_bytes(shmem.as_ptr(), 0, len) };
        info!(key, len, header_len, "created shm");
        Ok(ShmRegion {
            key,
            shmem: Some(shmem),
            header_len,
            body_len,
            _marker: PhantomData,
        })
    }

    fn attach<F>(key: u32, probe: Shmem, parse_header: F) -> Result<Self>
    where
        F: FnOnce(&[u8], usize) -> Result<usize>,
    {
        let header_len = Self::header_size();
        let mapped = probe.len();
        if mapped < header_len {
            return Err(ShmError::Truncated {
                key,
                expected: header_len,
                actual: mapped,
            });
        }
        let mut header = vec![0u8; header_len];
        unsafe { ptr::copy_nonoverlapping(probe.as_ptr(), header.as_mut_ptr(), header_len) };
        let len = parse_header(&header, mapped)?;
        drop(probe);

        if len < header_len {
            return Err(ShmError::InvalidSize(format!(
                "header implies {} bytes, less than the header itself",
                len
            )));
        }
        let shmem = open_segment(key).map_err(|source| open_error(key, source))?;
        if shmem.len() < len {
            return Err(ShmError::Truncated {
                key,
                expected: len,
                actual: shmem.len(),
            });
        }
        info!(key, len, header_len, "attached shm");
        Ok(ShmRegion {
            key,
            shmem: Some(shmem),
            header_len,
            body_len: len - header_len,
            _marker: PhantomData,
        })
    }

    /// Unmaps this process's view. The segment itself stays.
    pub fn detach(&mut self) -> Result<()> {
        match self.shmem.take() {
            Some(shmem) => {
                drop(shmem);
                debug!(key = self.key, "detached shm");
                Ok(())
            }
            None => Err(ShmError::NotAttached),
        }
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.shmem.is_some()
    }

    #[inline]
    pub fn key(&self) -> u32 {
        self.key
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.header_len + self.body_len
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Byte offset from the region base of slot `pos`, shifted by `offset`.
    /// Bounded by the mapped body only; capacity is the caller's concern.
    #[inline]
    fn node_offset(&self, pos: usize, offset: usize) -> Option<usize> {
        let start = pos.checked_mul(Self::node_size())?.checked_add(offset)?;
        let end = start.checked_add(Self::node_size())?;
        if end > self.body_len {
            return None;
        }
        Some(self.header_len + start)
    }

    pub fn read_node(&self, pos: usize, offset: usize) -> Option<T> {
        let shmem = self.shmem.as_ref()?;
        let at = self.node_offset(pos, offset)?;
        Some(unsafe { ptr::read_unaligned(shmem.as_ptr().add(at) as *const T) })
    }

    pub fn write_node(&mut self, pos: usize, offset: usize, node: &T) -> bool {
        let at = match self.node_offset(pos, offset) {
            Some(at) => at,
            None => return false,
        };
        match self.shmem.as_ref() {
            Some(shmem) => {
                unsafe { ptr::write_unaligned(shmem.as_ptr().add(at) as *mut T, *node) };
                true
            }
            None => false,
        }
    }

    pub fn read_header(&self, out: &mut [u8]) -> Result<()> {
        let shmem = self.shmem.as_ref().ok_or(ShmError::NotAttached)?;
        if out.len() != self.header_len {
            return Err(ShmError::BufferSize {
                expected: self.header_len,
                actual: out.len(),
            });
        }
        unsafe { ptr::copy_nonoverlapping(shmem.as_ptr(), out.as_mut_ptr(), self.header_len) };
        Ok(())
    }

    pub fn write_header(&mut self, bytes: &[u8]) -> Result<()> {
        let shmem = self.shmem.as_ref().ok_or(ShmError::NotAttached)?;
        if bytes.len() != self.header_len {
            return Err(ShmError::BufferSize {
                expected: self.header_len,
                actual: bytes.len(),
            });
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), shmem.as_ptr(), self.header_len) };
        Ok(())
    }
}

impl<T, H> fmt::Debug for ShmRegion<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegion")
            .field("key", &format_args!("{:#x}", self.key))
            .field("attached", &self.shmem.is_some())
            .field("header_len", &self.header_len)
            .field("body_len", &self.body_len)
            .finish()
    }
}
