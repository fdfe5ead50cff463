mod header;

use tracing::{trace, warn};

use crate::core::{HeaderCodec, Origin, ShmNode, ShmRegion};
use crate::errors::{Result, ShmError};

pub use self::header::{
    now_ns, ArrayHeader, ArrayHeaderCodec, ARRAY_HEADER_SIZE, SHM_VERSION,
};

/// A fixed-capacity array of `T` records in keyed shared memory.
///
/// One process creates and fills it; any number of processes attach and
/// traverse it. Nothing here locks: callers bracket `insert`, `traverse`
/// and `get_header` with an external lock (see [`crate::semaphore`]).
pub struct ArrayShm<T: ShmNode> {
    region: Option<ShmRegion<T, ArrayHeaderCodec>>,
    header: ArrayHeader,
    origin: Option<Origin>,
}

impl<T: ShmNode> Default for ArrayShm<T> {
    fn default() -> Self {
        ArrayShm::new()
    }
}

impl<T: ShmNode> ArrayShm<T> {
    pub fn new() -> ArrayShm<T> {
        ArrayShm {
            region: None,
            header: ArrayHeader::default(),
            origin: None,
        }
    }

    /// Attaches to the array at `key`, creating it with room for
    /// `max_node_count` records when it doesn't exist and `is_create` is set.
    ///
    /// An existing array is always attached, and its own capacity wins over
    /// `max_node_count`. An instance can be initialized once.
    pub fn init(&mut self, key: u32, max_node_count: u32, is_create: bool) -> Result<Origin> {
        if self.region.is_some() {
            return Err(ShmError::AlreadyInitialized);
        }
        let body_size = (max_node_count as usize)
            .checked_mul(ShmRegion::<T, ArrayHeaderCodec>::node_size())
            .ok_or_else(|| {
                ShmError::InvalidSize(format!("{} nodes overflow the address space", max_node_count))
            })?;

        let mut live = ArrayHeader::new(max_node_count);
        let (mut region, origin) =
            ShmRegion::<T, ArrayHeaderCodec>::init(key, body_size, is_create, |bytes, _| {
                Self::parse_header(&mut live, bytes)
            })?;
        if origin == Origin::Created {
            Self::store_header(&mut region, &mut live)?;
        }

        self.header = live;
        self.region = Some(region);
        self.origin = Some(origin);
        Ok(origin)
    }

    /// Copies `nodes` into the slots from index 0, up to capacity, and makes
    /// them the whole active set. Returns how many were written.
    pub fn insert(&mut self, nodes: &[T]) -> Result<usize> {
        let region = self.region.as_mut().ok_or(ShmError::NotInitialized)?;
        let limit = nodes.len().min(self.header.max_node_count as usize);
        let mut written = 0;
        for (pos, node) in nodes[..limit].iter().enumerate() {
            if region.write_node(pos, 0, node) {
                written += 1;
            }
        }
        self.header.cur_node_count = written as u32;
        Self::store_header(region, &mut self.header)?;
        Ok(written)
    }

    /// Validates the shared header, then calls `visit` for every active
    /// record in order. A `false` from `visit` ends the traversal with
    /// [`ShmError::CallbackStopped`].
    pub fn traverse<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&T) -> bool,
    {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        let mut bytes = [0u8; ARRAY_HEADER_SIZE];
        region.read_header(&mut bytes)?;
        Self::parse_header(&mut self.header, &bytes)?;

        for index in 0..self.header.cur_node_count as usize {
            let node = region
                .read_node(index, 0)
                .ok_or(ShmError::OutOfBounds { pos: index, offset: 0 })?;
            if !visit(&node) {
                return Err(ShmError::CallbackStopped { index });
            }
        }
        trace!(key = region.key(), count = self.header.cur_node_count, "traversed shm");
        Ok(())
    }

    /// Every active record, in slot order.
    pub fn collect(&mut self) -> Result<Vec<T>> {
        let mut nodes = Vec::with_capacity(self.header.cur_node_count as usize);
        self.traverse(|node| {
            nodes.push(*node);
            true
        })?;
        Ok(nodes)
    }

    /// The shared header as it is, without validation.
    pub fn get_header(&self) -> Result<ArrayHeader> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        let mut bytes = [0u8; ARRAY_HEADER_SIZE];
        region.read_header(&mut bytes)?;
        Ok(ArrayHeader::from_bytes(&bytes))
    }

    pub fn detach(&mut self) -> Result<()> {
        self.region
            .as_mut()
            .ok_or(ShmError::NotInitialized)?
            .detach()
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    #[inline]
    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    #[inline]
    pub fn max_node_count(&self) -> u32 {
        self.header.max_node_count
    }

    #[inline]
    pub fn key(&self) -> Option<u32> {
        self.region.as_ref().map(|r| r.key())
    }

    fn store_header(
        region: &mut ShmRegion<T, ArrayHeaderCodec>,
        header: &mut ArrayHeader,
    ) -> Result<()> {
        if header.max_node_count == 0 {
            return Err(ShmError::InvalidSize(
                "input max_node_count invalid (==0)".to_string(),
            ));
        }
        header.seal(now_ns());
        let mut bytes = [0u8; ARRAY_HEADER_SIZE];
        ArrayHeaderCodec::encode(header, &mut bytes);
        region.write_header(&bytes)?;
        trace!(
            key = region.key(),
            cur_node_count = header.cur_node_count,
            crc = header.header_crc_val,
            "wrote shm header"
        );
        Ok(())
    }

    /// Validates `bytes` and adopts them as the live header. Returns the
    /// total region length the header describes.
    fn parse_header(live: &mut ArrayHeader, bytes: &[u8]) -> Result<usize> {
        match ArrayHeaderCodec::decode(bytes) {
            Ok(header) => {
                *live = header;
                Ok(header.region_len::<T>())
            }
            Err(e) => {
                warn!(error = %e, "rejected shm header");
                Err(e)
            }
        }
    }
}
