// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Space manager chunk information blocks.

use crate::{
    common::{PhysicalAddressRaw, TransactionIdentifierRaw},
    object::ObjectHeaderRaw,
    DiskLayout,
};

/// Value of the type word of a physical chunk information block.
///
/// [crate::object::ObjectType::SpaceManagerChunkInformationBlock] with the
/// physical storage flag set.
pub const CHUNK_INFO_BLOCK_TYPE: u32 = 0x40000007;

/// Describes one chunk of blocks tracked by the space manager (`chunk_info_t`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct ChunkInfoRaw {
    /// Transaction that last touched this chunk (`ci_xid`).
    pub transaction_id: TransactionIdentifierRaw,

    /// First block address described (`ci_addr`).
    pub address: PhysicalAddressRaw,

    /// Number of blocks in the chunk (`ci_block_count`).
    pub block_count: u32,

    /// Number of unallocated blocks (`ci_free_count`).
    pub free_count: u32,

    /// Address of the allocation bitmap block, or 0 if none (`ci_bitmap_addr`).
    pub bitmap_address: PhysicalAddressRaw,
}

/// Header of a block holding [ChunkInfoRaw] entries (`chunk_info_block_t`).
///
/// `chunk_info_count` entries follow the header back to back.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct ChunkInfoBlockRaw {
    /// Common object header (`cib_o`).
    pub object: ObjectHeaderRaw,

    /// Position of this block among all chunk information blocks (`cib_index`).
    pub index: u32,

    /// Number of entries following the header (`cib_chunk_info_count`).
    pub chunk_info_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiskStruct, DiskStructEncode, ParseError};

    #[test]
    fn layouts() {
        assert_eq!(ChunkInfoBlockRaw::SIZE, 40);
        assert_eq!(ChunkInfoRaw::SIZE, 32);
        assert_eq!(
            ChunkInfoBlockRaw::field("chunk_info_count").map(|f| f.offset),
            Some(36)
        );
        assert_eq!(
            ChunkInfoRaw::field("bitmap_address").map(|f| f.offset),
            Some(24)
        );
    }

    #[test]
    fn encode_chunk_info() -> Result<(), ParseError> {
        let info = ChunkInfoRaw {
            transaction_id: TransactionIdentifierRaw(7),
            address: PhysicalAddressRaw(0x1000),
            block_count: 32768,
            free_count: 12,
            bitmap_address: PhysicalAddressRaw(0x2a),
        };

        let mut out = [0u8; 32];
        info.encode(&mut out)?;
        assert_eq!(&out[0..8], &7u64.to_le_bytes());
        assert_eq!(&out[16..20], &32768u32.to_le_bytes());
        assert_eq!(&out[24..32], &0x2au64.to_le_bytes());
        assert_eq!(ChunkInfoRaw::decode(&out)?, info);

        Ok(())
    }
}
