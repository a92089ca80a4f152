// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Space manager chunk information blocks.

use crate::block::{Block, BlockReadError};
use crate::error::Result;
pub use apfs_types::chunk_info::*;
use apfs_types::common::PhysicalAddressRaw;
use apfs_types::{DiskStruct, ParseError};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::io::{Read, Seek, SeekFrom};

/// Size of a chunk information block read from a byte source.
pub const CHUNK_INFO_BLOCK_SIZE: usize = 4096;

/// A validated chunk information block and its entries.
#[derive(Clone, Debug)]
pub struct ChunkInfoBlock {
    header: ChunkInfoBlockRaw,
    entries: Vec<ChunkInfoRaw>,
}

impl ChunkInfoBlock {
    /// Construct an instance from a block.
    ///
    /// The checksum and the object type are verified before anything else
    /// is decoded.
    pub fn from_block(block: Block) -> Result<Self> {
        debug!("block {} -> chunk information block", block.number());
        block.validate_checksum()?;
        block.expect_type(CHUNK_INFO_BLOCK_TYPE, 0)?;

        let header = ChunkInfoBlockRaw::decode(&block)?;

        let count = header.chunk_info_count as usize;
        let needed = ChunkInfoBlockRaw::SIZE + count * ChunkInfoRaw::SIZE;
        if needed > block.len() {
            return Err(ParseError::InputTooSmall {
                needed,
                available: block.len(),
            }
            .into());
        }

        let entries = block[ChunkInfoBlockRaw::SIZE..]
            .chunks_exact(ChunkInfoRaw::SIZE)
            .take(count)
            .map(ChunkInfoRaw::decode)
            .collect::<Result<Vec<_>, _>>()?;

        trace!(
            "chunk information block {} holds {} entries",
            header.index,
            entries.len()
        );

        Ok(Self { header, entries })
    }

    pub fn header(&self) -> &ChunkInfoBlockRaw {
        &self.header
    }

    /// Position of this block among the space manager's chunk information blocks.
    pub fn index(&self) -> u32 {
        self.header.index
    }

    pub fn entries(&self) -> &[ChunkInfoRaw] {
        &self.entries
    }
}

/// Read and validate the chunk information block at byte `offset` of `source`.
pub fn read_chunk_information_block(
    source: &mut (impl Read + Seek),
    offset: u64,
) -> Result<ChunkInfoBlock> {
    debug!("reading chunk information block at offset {:#x}", offset);

    let mut buf = BytesMut::zeroed(CHUNK_INFO_BLOCK_SIZE);
    source
        .seek(SeekFrom::Start(offset))
        .map_err(BlockReadError::from)?;
    source.read_exact(&mut buf).map_err(BlockReadError::from)?;

    let number = PhysicalAddressRaw::from(offset / CHUNK_INFO_BLOCK_SIZE as u64);

    ChunkInfoBlock::from_block(Block::new(number, Bytes::from(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::object_checksum;
    use crate::error::{ApfsError, ErrorKind};
    use apfs_types::object::{ObjectHeaderRaw, ObjectType, ObjectTypeFlags, ObjectTypeValueRaw};
    use apfs_types::DiskStructEncode;
    use std::io::Cursor;

    fn chunk_info_block(typ: ObjectType, entries: &[ChunkInfoRaw]) -> Result<Vec<u8>> {
        let mut block = vec![0u8; CHUNK_INFO_BLOCK_SIZE];

        ChunkInfoBlockRaw {
            object: ObjectHeaderRaw {
                checksum: 0,
                identifier: 0x404.into(),
                transaction_identifier: 3.into(),
                typ: ObjectTypeValueRaw::new(typ, ObjectTypeFlags::Physical),
                subtype: ObjectTypeValueRaw::default(),
            },
            index: 2,
            chunk_info_count: entries.len() as u32,
        }
        .encode(&mut block)?;

        for (i, entry) in entries.iter().enumerate() {
            entry.encode(&mut block[ChunkInfoBlockRaw::SIZE + i * ChunkInfoRaw::SIZE..])?;
        }

        let checksum = object_checksum(&block)?;
        block[0..8].copy_from_slice(&checksum.to_le_bytes());

        Ok(block)
    }

    fn entries() -> Vec<ChunkInfoRaw> {
        (0..3u64)
            .map(|i| ChunkInfoRaw {
                transaction_id: (10 + i).into(),
                address: (i * 32768).into(),
                block_count: 32768,
                free_count: 100 * i as u32,
                bitmap_address: (0x500 + i).into(),
            })
            .collect()
    }

    #[test]
    fn read_at_offset() -> Result<()> {
        let block = chunk_info_block(ObjectType::SpaceManagerChunkInformationBlock, &entries())?;

        let mut image = vec![0xaau8; 8192];
        image.extend_from_slice(&block);
        let mut source = Cursor::new(image);

        let cib = read_chunk_information_block(&mut source, 8192)?;
        assert_eq!(cib.index(), 2);
        assert_eq!(cib.header().object.typ.0, CHUNK_INFO_BLOCK_TYPE);
        assert_eq!(cib.entries(), entries().as_slice());
        assert_eq!(cib.entries()[2].bitmap_address.0, 0x502);

        Ok(())
    }

    #[test]
    fn checksum_mismatch() -> Result<()> {
        let mut block =
            chunk_info_block(ObjectType::SpaceManagerChunkInformationBlock, &entries())?;
        block[ChunkInfoBlockRaw::SIZE + 5] ^= 0x10;

        let err = read_chunk_information_block(&mut Cursor::new(block), 0).unwrap_err();
        assert!(matches!(err, ApfsError::InvalidChecksum { .. }));
        assert_eq!(err.kind(), ErrorKind::Input);

        Ok(())
    }

    #[test]
    fn unexpected_type() -> Result<()> {
        let block = chunk_info_block(ObjectType::SpaceManagerBitmap, &entries())?;

        let err = read_chunk_information_block(&mut Cursor::new(block), 0).unwrap_err();
        assert!(matches!(
            err,
            ApfsError::UnexpectedObjectType {
                expected: CHUNK_INFO_BLOCK_TYPE,
                actual: 0x40000008
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Input);

        Ok(())
    }

    #[test]
    fn short_source() {
        let err = read_chunk_information_block(&mut Cursor::new(vec![0u8; 100]), 0).unwrap_err();
        assert!(matches!(err, ApfsError::BlockRead(BlockReadError::Io(_))));
    }

    #[test]
    fn empty_block() -> Result<()> {
        let block = chunk_info_block(ObjectType::SpaceManagerChunkInformationBlock, &[])?;
        let cib = ChunkInfoBlock::from_block(Block::new(7.into(), Bytes::from(block)))?;
        assert!(cib.entries().is_empty());

        Ok(())
    }
}
