// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! B-tree node layouts.

use crate::{object::ObjectHeaderRaw, object::StorageClass, DiskLayout};
use bitflags::bitflags;

#[cfg(any(doc, test, feature = "encode"))]
use crate::object::ObjectType;
#[cfg(any(test, feature = "encode"))]
use {
    crate::{
        object::{ObjectTypeFlags, ObjectTypeValueRaw},
        DiskStruct, DiskStructEncode, ParseError,
    },
    alloc::vec::Vec,
};

/// A location offset marking a missing key or value (`BTOFF_INVALID`).
pub const BTREE_INVALID_OFFSET: u16 = 0xffff;

/// Size of the [BTreeInfoRaw] trailer stored at the end of root nodes.
pub const BTREE_INFO_SIZE: usize = 40;

/// Size of child node references stored as values in index nodes.
pub const BTREE_INDEX_VALUE_SIZE: usize = 8;

/// A location within a B-tree node (`nloc_t`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct NodeLocationRaw {
    /// Offset in bytes (`off`).
    ///
    /// For values, counted backwards from the end of the value area.
    pub offset: u16,

    /// Length in bytes (`len`).
    pub length: u16,
}

/// Location of a fixed-size key and value (`kvoff_t`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct KeyValueOffsetRaw {
    pub key: u16,
    pub value: u16,
}

/// Location of a variable-size key and value (`kvloc_t`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct KeyValueLocationRaw {
    pub key: NodeLocationRaw,
    pub value: NodeLocationRaw,
}

bitflags! {
    /// Tree-wide configuration flags (`bt_flags`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, DiskLayout)]
    #[apfs(bitflags_u32)]
    pub struct BTreeFlagsRaw: u32 {
        /// Keys are 64-bit integers (`BTREE_UINT64_KEYS`).
        const UInt64Keys = 0x01;

        /// Optimize for sequential inserts (`BTREE_SEQUENTIAL_INSERT`).
        const SequentialInsert = 0x02;

        /// The table of contents may hold keys without values (`BTREE_ALLOW_GHOSTS`).
        ///
        /// A ghost value has an offset of [BTREE_INVALID_OFFSET].
        const AllowGhosts = 0x04;

        /// Child nodes are referenced by ephemeral identifiers (`BTREE_EPHEMERAL`).
        const Ephemeral = 0x08;

        /// Child nodes are referenced by physical addresses (`BTREE_PHYSICAL`).
        ///
        /// When neither this nor [Self::Ephemeral] is set, child references
        /// are virtual and resolve through an object map.
        const Physical = 0x10;

        /// The tree isn't persisted across unmounting (`BTREE_NONPERSISTENT`).
        const NonPersistent = 0x20;

        /// Keys and values aren't 8 byte aligned (`BTREE_KV_NONALIGNED`).
        const KeyValueNonAligned = 0x40;

        /// Index nodes store hashes of their children (`BTREE_HASHED`).
        const Hashed = 0x80;

        /// Nodes are stored without object headers (`BTREE_NOHEADER`).
        const NoHeader = 0x100;

        const _ = !0;
    }
}

bitflags! {
    /// Per-node flags (`btn_flags`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, DiskLayout)]
    #[apfs(bitflags_u16)]
    pub struct BTreeNodeFlagsRaw: u16 {
        /// Root node (`BTNODE_ROOT`).
        ///
        /// The object type is [ObjectType::BTreeRoot] and the node ends with
        /// a [BTreeInfoRaw].
        const Root = 0x0001;

        /// Leaf node (`BTNODE_LEAF`).
        const Leaf = 0x0002;

        /// Keys and values have sizes recorded in [BTreeInfoFixedRaw] (`BTNODE_FIXED_KVSIZE`).
        ///
        /// The table of contents is then an array of [KeyValueOffsetRaw]
        /// instead of [KeyValueLocationRaw].
        const FixedKeyValueSize = 0x0004;

        /// Index entries carry child hashes (`BTNODE_HASHED`).
        const Hashed = 0x0008;

        /// Stored without an object header (`BTNODE_NOHEADER`).
        const NoHeader = 0x0010;

        /// Transient state that never reaches disk (`BTNODE_CHECK_KOFF_INVAL`).
        const CheckKoffInval = 0x8000;

        const _ = !0;
    }
}

/// Header of a B-tree node (`btree_node_phys_t`).
///
/// The node's data area follows at offset [DiskStruct::SIZE]: table of
/// contents, then keys growing forward, shared free space, and values
/// growing backward from the end of the block. Root nodes end with a
/// [BTreeInfoRaw] which shrinks the value area by [BTREE_INFO_SIZE].
///
/// [DiskStruct::SIZE]: crate::DiskStruct::SIZE
#[derive(Clone, Copy, Debug, DiskLayout)]
pub struct BTreeNodeRaw {
    /// Common object header (`btn_o`).
    pub object: ObjectHeaderRaw,

    /// Node flags (`btn_flags`).
    pub flags: BTreeNodeFlagsRaw,

    /// Number of levels below this node (`btn_level`). 0 for leaves.
    pub level: u16,

    /// Number of keys in this node (`btn_nkeys`).
    pub number_keys: u32,

    /// Location of the table of contents relative to the data area (`btn_table_space`).
    pub table_space: NodeLocationRaw,

    /// Shared free space, relative to the start of the key area (`btn_free_space`).
    pub free_space: NodeLocationRaw,

    /// Free list of key space (`btn_key_free_list`).
    pub key_free_list: NodeLocationRaw,

    /// Free list of value space (`btn_val_free_list`).
    pub value_free_list: NodeLocationRaw,
}

impl BTreeNodeRaw {
    pub fn is_root(&self) -> bool {
        self.flags.contains(BTreeNodeFlagsRaw::Root)
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(BTreeNodeFlagsRaw::Leaf)
    }

    pub fn is_fixed_kv_size(&self) -> bool {
        self.flags.contains(BTreeNodeFlagsRaw::FixedKeyValueSize)
    }
}

/// Static information about a B-tree (`btree_info_fixed_t`).
#[derive(Clone, Copy, Debug, DiskLayout)]
pub struct BTreeInfoFixedRaw {
    /// Tree flags (`bt_flags`).
    pub flags: BTreeFlagsRaw,

    /// Size of a node in bytes (`bt_node_size`).
    pub node_size: u32,

    /// Key size, or 0 for variable sized keys (`bt_key_size`).
    pub key_size: u32,

    /// Value size, or 0 for variable sized values (`bt_val_size`).
    pub value_size: u32,
}

impl BTreeInfoFixedRaw {
    /// Resolve how child node identifiers inside the tree are stored.
    pub fn node_oid_storage(&self) -> StorageClass {
        if self.flags.contains(BTreeFlagsRaw::Physical) {
            StorageClass::Physical
        } else if self.flags.contains(BTreeFlagsRaw::Ephemeral) {
            StorageClass::Ephemeral
        } else {
            StorageClass::Virtual
        }
    }
}

/// Information about a B-tree (`btree_info_t`), stored at the end of its root node.
#[derive(Clone, Copy, Debug, DiskLayout)]
pub struct BTreeInfoRaw {
    pub fixed: BTreeInfoFixedRaw,

    /// Longest key ever stored (`bt_longest_key`).
    pub longest_key: u32,

    /// Longest value ever stored (`bt_longest_val`).
    pub longest_value: u32,

    /// Number of keys in the tree (`bt_key_count`).
    pub key_count: u64,

    /// Number of nodes in the tree (`bt_node_count`).
    pub node_count: u64,
}

/// A B-tree node to serialize, for building fixtures.
///
/// Entries are written in order: keys forward from the start of the key
/// area, values backward from the end of the value area.
#[cfg(any(test, feature = "encode"))]
pub struct NodeSpec {
    pub oid: u64,
    pub xid: u64,
    pub root: bool,
    pub level: u16,
    pub storage: ObjectTypeFlags,
    pub subtype: ObjectType,
    /// Tree flags written into the root's info trailer.
    pub tree_flags: BTreeFlagsRaw,
    /// Fixed key and value sizes, or variable sized entries when `None`.
    pub fixed: Option<(u32, u32)>,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

#[cfg(any(test, feature = "encode"))]
fn region<'a>(
    block: &'a mut [u8],
    start: usize,
    length: usize,
) -> Result<&'a mut [u8], ParseError> {
    let available = block.len();
    block
        .get_mut(start..start + length)
        .ok_or(ParseError::InputTooSmall {
            needed: start + length,
            available,
        })
}

#[cfg(any(test, feature = "encode"))]
impl NodeSpec {
    /// Write the node over all of `block`, whose length is the node size.
    ///
    /// The object checksum is left zero.
    pub fn encode(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let node_size = block.len();
        let entry_size = if self.fixed.is_some() {
            KeyValueOffsetRaw::SIZE
        } else {
            KeyValueLocationRaw::SIZE
        };
        let toc_length = self.entries.len() * entry_size;
        let key_start = BTreeNodeRaw::SIZE + toc_length;
        let info_size = if self.root { BTREE_INFO_SIZE } else { 0 };
        let value_end = node_size
            .checked_sub(info_size)
            .ok_or(ParseError::InputTooSmall {
                needed: info_size,
                available: node_size,
            })?;

        let mut key_offset = 0usize;
        let mut value_offset = 0usize;

        for (index, (key, value)) in self.entries.iter().enumerate() {
            region(block, key_start + key_offset, key.len())?.copy_from_slice(key);
            value_offset += value.len();
            let value_start = value_end
                .checked_sub(value_offset)
                .ok_or(ParseError::FieldOutOfBounds { field: "value" })?;
            region(block, value_start, value.len())?.copy_from_slice(value);

            let toc = region(block, BTreeNodeRaw::SIZE + index * entry_size, entry_size)?;
            if self.fixed.is_some() {
                KeyValueOffsetRaw {
                    key: key_offset as u16,
                    value: value_offset as u16,
                }
                .encode(toc)?;
            } else {
                KeyValueLocationRaw {
                    key: NodeLocationRaw {
                        offset: key_offset as u16,
                        length: key.len() as u16,
                    },
                    value: NodeLocationRaw {
                        offset: value_offset as u16,
                        length: value.len() as u16,
                    },
                }
                .encode(toc)?;
            }

            key_offset += key.len();
        }

        let free_length = (value_end - value_offset)
            .checked_sub(key_start + key_offset)
            .ok_or(ParseError::FieldOutOfBounds { field: "free_space" })?;

        let mut flags = BTreeNodeFlagsRaw::empty();
        if self.root {
            flags |= BTreeNodeFlagsRaw::Root;
        }
        if self.level == 0 {
            flags |= BTreeNodeFlagsRaw::Leaf;
        }
        if self.fixed.is_some() {
            flags |= BTreeNodeFlagsRaw::FixedKeyValueSize;
        }

        let typ = if self.root {
            ObjectType::BTreeRoot
        } else {
            ObjectType::BTreeNode
        };

        BTreeNodeRaw {
            object: ObjectHeaderRaw {
                checksum: 0,
                identifier: self.oid.into(),
                transaction_identifier: self.xid.into(),
                typ: ObjectTypeValueRaw::new(typ, self.storage),
                subtype: ObjectTypeValueRaw::new(self.subtype, ObjectTypeFlags::empty()),
            },
            flags,
            level: self.level,
            number_keys: self.entries.len() as u32,
            table_space: NodeLocationRaw {
                offset: 0,
                length: toc_length as u16,
            },
            free_space: NodeLocationRaw {
                offset: key_offset as u16,
                length: free_length as u16,
            },
            key_free_list: NodeLocationRaw {
                offset: BTREE_INVALID_OFFSET,
                length: 0,
            },
            value_free_list: NodeLocationRaw {
                offset: BTREE_INVALID_OFFSET,
                length: 0,
            },
        }
        .encode(block)?;

        if self.root {
            let (key_size, value_size) = self.fixed.unwrap_or((0, 0));
            BTreeInfoRaw {
                fixed: BTreeInfoFixedRaw {
                    flags: self.tree_flags,
                    node_size: node_size as u32,
                    key_size,
                    value_size,
                },
                longest_key: key_size,
                longest_value: value_size,
                key_count: 0,
                node_count: 0,
            }
            .encode(region(block, value_end, BTREE_INFO_SIZE)?)?;
        }

        Ok(())
    }
}
