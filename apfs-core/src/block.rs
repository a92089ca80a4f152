// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-level primitives.

use crate::checksum::{object_checksum, verify_object_checksum};
use crate::error::{ApfsError, Result};
use apfs_types::common::PhysicalAddressRaw;
use apfs_types::object::{ObjectHeaderRaw, ObjectType};
use apfs_types::DiskStruct;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Error for a block reading operation.
#[derive(Debug, Error)]
pub enum BlockReadError {
    #[error("block number {0} is out of bounds")]
    BlockBounds(PhysicalAddressRaw),
    #[error("I/O error reading block data: {0}")]
    Io(#[from] std::io::Error),
    #[error("other block reading error: {0}")]
    Other(&'static str),
}

/// Interface for reading blocks.
pub trait BlockReader {
    /// Obtain the size of blocks in bytes.
    fn block_size(&self) -> usize;

    /// Read a block's data into the specified bytes buffer.
    ///
    /// On success the buffer holds exactly one full block.
    fn read_block_into<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
        buf: &mut BytesMut,
    ) -> Result<(), BlockReadError>;

    /// Read block data into a new buffer allocated by this function.
    fn read_block_data<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
    ) -> Result<Bytes, BlockReadError> {
        let mut buf = BytesMut::zeroed(self.block_size());
        self.read_block_into(block_number, &mut buf)?;

        Ok(buf.freeze())
    }

    /// Resolve a [Block] instance for a specified block number.
    ///
    /// Caching implementations override this to avoid I/O.
    fn get_block<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
    ) -> Result<Block, BlockReadError> {
        let number = block_number.into();
        let buf = self.read_block_data(number)?;

        Ok(Block::new(number, buf))
    }

    /// Get a block and validate its checksum.
    ///
    /// Use this for every block holding an object with a header.
    fn get_block_validated<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
    ) -> Result<Block, ApfsError> {
        let block = self.get_block(block_number)?;
        block.validate_checksum()?;

        Ok(block)
    }
}

/// A container block and its underlying data.
#[derive(Clone)]
pub struct Block {
    number: PhysicalAddressRaw,
    buf: Bytes,
}

impl Debug for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("number", &self.number)
            .field("length", &self.buf.len())
            .finish()
    }
}

impl Deref for Block {
    type Target = Bytes;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl Block {
    /// Construct an instance from its block number and read data.
    pub fn new(number: PhysicalAddressRaw, buf: Bytes) -> Self {
        Self { number, buf }
    }

    /// The block number. 0 is the first block.
    pub fn number(&self) -> PhysicalAddressRaw {
        self.number
    }

    /// Obtain the raw bytes backing this block.
    pub fn bytes(&self) -> Bytes {
        self.buf.clone()
    }

    /// Compute the Fletcher-64 checksum of the object in this block.
    pub fn checksum_object(&self) -> Result<u64> {
        object_checksum(&self.buf)
    }

    /// Ensure the checksum is valid, returning an error if not.
    pub fn validate_checksum(&self) -> Result<()> {
        verify_object_checksum(&self.buf)
    }

    /// Decode the common object header at the start of the block.
    ///
    /// Headerless blocks decode to garbage; callers validate.
    pub fn object_header(&self) -> Result<ObjectHeaderRaw> {
        Ok(ObjectHeaderRaw::decode(&self.buf)?)
    }

    /// Decode the object header and require exact type and subtype words.
    pub fn expect_type(&self, typ: u32, subtype: u32) -> Result<ObjectHeaderRaw> {
        let header = self.object_header()?;

        if header.typ.0 != typ {
            return Err(ApfsError::UnexpectedObjectType {
                expected: typ,
                actual: header.typ.0,
            });
        }
        if header.subtype.0 != subtype {
            return Err(ApfsError::UnexpectedObjectSubtype {
                expected: subtype,
                actual: header.subtype.0,
            });
        }

        Ok(header)
    }

    /// Decode the object header and require the type and subtype, ignoring storage flags.
    pub fn expect_object_type(
        &self,
        allowed: &[ObjectType],
        subtype: ObjectType,
    ) -> Result<ObjectHeaderRaw> {
        let header = self.object_header()?;

        if !allowed.contains(&header.typ.object_type()) {
            return Err(ApfsError::UnexpectedObjectType {
                expected: allowed.first().map(|t| u32::from(*t)).unwrap_or_default(),
                actual: header.typ.0,
            });
        }
        if header.subtype.object_type() != subtype {
            return Err(ApfsError::UnexpectedObjectSubtype {
                expected: subtype.into(),
                actual: header.subtype.0,
            });
        }

        Ok(header)
    }
}

/// A seekable byte source.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Reads blocks from any seekable byte source.
#[derive(Clone)]
pub struct StreamBlockReader {
    reader: Arc<Mutex<Box<dyn ReadSeek>>>,
    initial_position: u64,
    block_size: usize,
    block_count: u64,
}

impl Debug for StreamBlockReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBlockReader")
            .field("initial_position", &self.initial_position)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish()
    }
}

impl BlockReader for StreamBlockReader {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block_into<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
        buf: &mut BytesMut,
    ) -> Result<(), BlockReadError> {
        let block_number = block_number.into();
        debug!("reading block {}", block_number);

        if *block_number >= self.block_count {
            return Err(BlockReadError::BlockBounds(block_number));
        }

        buf.resize(self.block_size, 0);

        let mut reader = self
            .reader
            .lock()
            .map_err(|_| BlockReadError::Other("reader lock poisoned"))?;
        reader.seek(SeekFrom::Start(
            self.initial_position + *block_number * self.block_size as u64,
        ))?;

        reader.read_exact(buf)?;

        Ok(())
    }
}

impl StreamBlockReader {
    /// Construct an instance reading blocks starting at the source's current position.
    pub fn new(mut reader: Box<dyn ReadSeek>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(ApfsError::InvalidArgument("block size must be non-zero"));
        }

        let initial_position = reader.stream_position().map_err(BlockReadError::from)?;
        let end = reader
            .seek(SeekFrom::End(0))
            .map_err(BlockReadError::from)?;
        reader
            .seek(SeekFrom::Start(initial_position))
            .map_err(BlockReadError::from)?;

        let block_count = end.saturating_sub(initial_position) / block_size as u64;
        debug!(
            "stream of {} blocks of {} bytes at offset {}",
            block_count, block_size, initial_position
        );

        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            initial_position,
            block_size,
            block_count,
        })
    }

    /// Number of whole blocks available.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[derive(Default)]
struct BlockCache {
    blocks: HashMap<u64, Bytes>,
    insertion_order: VecDeque<u64>,
}

/// A read-through cache of block data keyed by physical address.
///
/// Committed blocks never change, so entries are never invalidated. With a
/// capacity, the oldest inserted block is evicted first.
pub struct CachingBlockReader<R: BlockReader> {
    inner: R,
    capacity: Option<usize>,
    cache: Mutex<BlockCache>,
}

impl<R: BlockReader> CachingBlockReader<R> {
    /// Construct an unbounded cache.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, None)
    }

    /// Construct a cache holding at most `capacity` blocks.
    ///
    /// A capacity of 0 disables caching.
    pub fn with_capacity(inner: R, capacity: Option<usize>) -> Self {
        Self {
            inner,
            capacity,
            cache: Mutex::new(BlockCache::default()),
        }
    }

    /// The wrapped reader.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Number of blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.blocks.len())
            .unwrap_or_default()
    }

    fn cached(&self, number: PhysicalAddressRaw) -> Result<Option<Bytes>, BlockReadError> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| BlockReadError::Other("block cache lock poisoned"))?;

        Ok(cache.blocks.get(&number.0).cloned())
    }

    fn insert(&self, number: PhysicalAddressRaw, data: Bytes) -> Result<(), BlockReadError> {
        if self.capacity == Some(0) {
            return Ok(());
        }

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| BlockReadError::Other("block cache lock poisoned"))?;

        if cache.blocks.insert(number.0, data).is_none() {
            cache.insertion_order.push_back(number.0);
        }

        if let Some(capacity) = self.capacity {
            while cache.blocks.len() > capacity {
                match cache.insertion_order.pop_front() {
                    Some(oldest) => {
                        trace!("evicting block {} from cache", oldest);
                        cache.blocks.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }
}

impl<R: BlockReader> BlockReader for CachingBlockReader<R> {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read_block_into<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
        buf: &mut BytesMut,
    ) -> Result<(), BlockReadError> {
        let block = self.get_block(block_number)?;

        buf.clear();
        buf.extend_from_slice(&block);

        Ok(())
    }

    fn get_block<N: Into<PhysicalAddressRaw>>(
        &self,
        block_number: N,
    ) -> Result<Block, BlockReadError> {
        let number = block_number.into();

        if let Some(data) = self.cached(number)? {
            trace!("block {} served from cache", number);
            return Ok(Block::new(number, data));
        }

        let block = self.inner.get_block(number)?;
        self.insert(number, block.bytes())?;

        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::object_checksum;
    use apfs_types::object::{ObjectTypeFlags, ObjectTypeValueRaw};
    use apfs_types::DiskStructEncode;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BLOCK_SIZE: usize = 4096;

    fn image(blocks: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; BLOCK_SIZE * blocks as usize];

        for (index, block) in data.chunks_mut(BLOCK_SIZE).enumerate() {
            ObjectHeaderRaw {
                checksum: 0,
                identifier: (index as u64 + 100).into(),
                transaction_identifier: 1.into(),
                typ: ObjectTypeValueRaw::new(ObjectType::Test, ObjectTypeFlags::Physical),
                subtype: ObjectTypeValueRaw::default(),
            }
            .encode(block)?;

            let checksum = object_checksum(block)?;
            block[0..8].copy_from_slice(&checksum.to_le_bytes());
        }

        Ok(data)
    }

    /// Counts reads reaching the underlying source.
    struct CountingReader {
        inner: StreamBlockReader,
        reads: AtomicUsize,
    }

    impl BlockReader for CountingReader {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn read_block_into<N: Into<PhysicalAddressRaw>>(
            &self,
            block_number: N,
            buf: &mut BytesMut,
        ) -> Result<(), BlockReadError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_block_into(block_number, buf)
        }
    }

    #[test]
    fn stream_reader() -> Result<()> {
        let mut data = vec![0xaau8; 512];
        data.extend(image(3)?);

        let mut cursor = Cursor::new(data);
        cursor.seek(SeekFrom::Start(512)).map_err(BlockReadError::from)?;

        let reader = StreamBlockReader::new(Box::new(cursor), BLOCK_SIZE)?;
        assert_eq!(reader.block_count(), 3);

        let block = reader.get_block_validated(2u64)?;
        assert_eq!(block.number(), PhysicalAddressRaw(2));
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(block.object_header()?.identifier.0, 102);
        block.expect_type(0x400000ff, 0)?;

        assert!(matches!(
            reader.get_block(3u64),
            Err(BlockReadError::BlockBounds(PhysicalAddressRaw(3)))
        ));

        Ok(())
    }

    #[test]
    fn corrupt_block_rejected() -> Result<()> {
        let mut data = image(1)?;
        data[2000] ^= 0x80;

        let reader = StreamBlockReader::new(Box::new(Cursor::new(data)), BLOCK_SIZE)?;
        assert!(reader.get_block(0u64).is_ok());
        assert!(matches!(
            reader.get_block_validated(0u64),
            Err(ApfsError::InvalidChecksum { .. })
        ));

        Ok(())
    }

    #[test]
    fn unexpected_type() -> Result<()> {
        let reader = StreamBlockReader::new(Box::new(Cursor::new(image(1)?)), BLOCK_SIZE)?;
        let block = reader.get_block_validated(0u64)?;

        assert!(matches!(
            block.expect_type(0x40000007, 0),
            Err(ApfsError::UnexpectedObjectType {
                expected: 0x40000007,
                actual: 0x400000ff
            })
        ));
        assert!(block
            .expect_object_type(&[ObjectType::Test], ObjectType::Invalid)
            .is_ok());

        Ok(())
    }

    #[test]
    fn cache_reads_through_once() -> Result<()> {
        let inner = CountingReader {
            inner: StreamBlockReader::new(Box::new(Cursor::new(image(4)?)), BLOCK_SIZE)?,
            reads: AtomicUsize::new(0),
        };
        let reader = CachingBlockReader::new(inner);

        for _ in 0..3 {
            reader.get_block_validated(1u64)?;
            reader.get_block_validated(3u64)?;
        }

        assert_eq!(reader.inner().reads.load(Ordering::SeqCst), 2);
        assert_eq!(reader.cached_blocks(), 2);

        let mut buf = BytesMut::new();
        reader.read_block_into(3u64, &mut buf)?;
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert_eq!(reader.inner().reads.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn cache_capacity_evicts_oldest() -> Result<()> {
        let inner = CountingReader {
            inner: StreamBlockReader::new(Box::new(Cursor::new(image(4)?)), BLOCK_SIZE)?,
            reads: AtomicUsize::new(0),
        };
        let reader = CachingBlockReader::with_capacity(inner, Some(2));

        reader.get_block(0u64)?;
        reader.get_block(1u64)?;
        reader.get_block(2u64)?;
        assert_eq!(reader.cached_blocks(), 2);

        // Block 1 is still cached; block 0 was evicted.
        reader.get_block(1u64)?;
        assert_eq!(reader.inner().reads.load(Ordering::SeqCst), 3);
        reader.get_block(0u64)?;
        assert_eq!(reader.inner().reads.load(Ordering::SeqCst), 4);

        Ok(())
    }

    #[test]
    fn cache_disabled() -> Result<()> {
        let inner = StreamBlockReader::new(Box::new(Cursor::new(image(2)?)), BLOCK_SIZE)?;
        let reader = CachingBlockReader::with_capacity(inner, Some(0));

        reader.get_block(0u64)?;
        assert_eq!(reader.cached_blocks(), 0);

        Ok(())
    }
}
