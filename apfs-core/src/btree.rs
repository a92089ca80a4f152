// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! B-tree interaction.

use crate::block::{Block, BlockReader};
use crate::error::{ApfsError, Result};
use crate::object_map::ObjectMap;
pub use apfs_types::btree::*;
use apfs_types::{
    common::{ObjectIdentifierRaw, PhysicalAddressRaw, TransactionIdentifierRaw},
    object::{ObjectType, StorageClass},
    DiskStruct,
};
use bytes::Bytes;
use log::{debug, trace};
use std::cmp::Ordering;
use std::ops::{Deref, Range};

/// Maximum number of levels followed from a root node.
pub const MAXIMUM_TREE_DEPTH: usize = 16;

/// Represents a key in a B-tree node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeKey {
    data: Bytes,
}

impl Deref for NodeKey {
    type Target = Bytes;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl From<Bytes> for NodeKey {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl NodeKey {
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

/// Represents a value in a B-tree node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeValue {
    data: Bytes,
}

impl Deref for NodeValue {
    type Target = Bytes;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl From<Bytes> for NodeValue {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl NodeValue {
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Interpret the value of an index node entry as a child identifier.
    pub fn as_oid(&self) -> Result<ObjectIdentifierRaw> {
        Ok(ObjectIdentifierRaw::decode(&self.data)?)
    }
}

/// How a leaf level search matches keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Only a key comparing equal matches.
    Exact,
    /// The greatest key comparing less than or equal matches.
    LessOrEqual,
}

/// A parsed B-tree node.
///
/// Holds the whole block. The data area follows the node header: table of
/// contents, keys, free space and values, then a [BTreeInfoRaw] on roots.
#[derive(Clone, Debug)]
pub struct BTreeNode {
    number: PhysicalAddressRaw,
    header: BTreeNodeRaw,
    data: Bytes,
}

impl Deref for BTreeNode {
    type Target = BTreeNodeRaw;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

fn span(data: &Bytes, range: Range<usize>, what: &'static str) -> Result<Bytes> {
    if range.start <= range.end && range.end <= data.len() {
        Ok(data.slice(range))
    } else {
        Err(ApfsError::BTreeMalformed(what))
    }
}

impl BTreeNode {
    /// Construct an instance from a block holding a B-tree node.
    pub fn from_block(block: Block) -> Result<Self> {
        debug!("block {} -> B-tree node", block.number());
        block.expect_object_type(
            &[ObjectType::BTreeRoot, ObjectType::BTreeNode],
            block.object_header()?.subtype.object_type(),
        )?;

        let header = BTreeNodeRaw::decode(&block)?;

        let node = Self {
            number: block.number(),
            header,
            data: block.bytes(),
        };

        // Surface a bad table of contents before anything uses the node.
        node.table_of_contents()?;

        Ok(node)
    }

    /// Block number this node was read from.
    pub fn block_number(&self) -> PhysicalAddressRaw {
        self.number
    }

    /// Transaction identifier of the node.
    pub fn transaction_identifier(&self) -> TransactionIdentifierRaw {
        self.header.object.transaction_identifier
    }

    /// Decode the [BTreeInfoRaw] trailing a root node.
    pub fn tree_info(&self) -> Result<Option<BTreeInfoRaw>> {
        if !self.is_root() {
            return Ok(None);
        }

        let start = self
            .data
            .len()
            .checked_sub(BTREE_INFO_SIZE)
            .ok_or(ApfsError::BTreeMalformed("root node too small for tree info"))?;

        Ok(Some(BTreeInfoRaw::decode(&self.data[start..])?))
    }

    fn table_of_contents(&self) -> Result<Bytes> {
        let start = BTreeNodeRaw::SIZE + self.table_space.offset as usize;
        let toc = span(
            &self.data,
            start..start + self.table_space.length as usize,
            "table of contents out of bounds",
        )?;

        let entry_size = if self.is_fixed_kv_size() {
            KeyValueOffsetRaw::SIZE
        } else {
            KeyValueLocationRaw::SIZE
        };

        if self.number_keys as usize * entry_size > toc.len() {
            return Err(ApfsError::BTreeMalformed("too many keys for table of contents"));
        }

        Ok(toc)
    }

    fn key_area_start(&self) -> usize {
        BTreeNodeRaw::SIZE + self.table_space.offset as usize + self.table_space.length as usize
    }

    fn value_area_end(&self) -> Result<usize> {
        if self.is_root() {
            self.data
                .len()
                .checked_sub(BTREE_INFO_SIZE)
                .ok_or(ApfsError::BTreeMalformed("root node too small for tree info"))
        } else {
            Ok(self.data.len())
        }
    }

    /// Number of entries in this node.
    pub fn len(&self) -> usize {
        self.number_keys as usize
    }

    pub fn is_empty(&self) -> bool {
        self.number_keys == 0
    }

    /// Obtain the key and value at `index`.
    ///
    /// `info` is the tree's [BTreeInfoRaw] from its root node.
    pub fn entry(&self, index: usize, info: &BTreeInfoRaw) -> Result<(NodeKey, NodeValue)> {
        if index >= self.len() {
            return Err(ApfsError::InvalidArgument("B-tree entry index out of range"));
        }

        let toc = self.table_of_contents()?;
        let key_start = self.key_area_start();
        let value_end = self.value_area_end()?;

        let (key_offset, key_length, value_offset, value_length) = if self.is_fixed_kv_size() {
            let kv = KeyValueOffsetRaw::decode(&toc[index * KeyValueOffsetRaw::SIZE..])?;
            let value_length = if self.is_leaf() {
                info.fixed.value_size as usize
            } else {
                BTREE_INDEX_VALUE_SIZE
            };

            (
                kv.key as usize,
                info.fixed.key_size as usize,
                kv.value,
                value_length,
            )
        } else {
            let kv = KeyValueLocationRaw::decode(&toc[index * KeyValueLocationRaw::SIZE..])?;

            (
                kv.key.offset as usize,
                kv.key.length as usize,
                kv.value.offset,
                kv.value.length as usize,
            )
        };

        let key_start = key_start + key_offset;
        let key = span(
            &self.data,
            key_start..key_start + key_length,
            "key out of bounds",
        )?;

        let value = if value_offset == BTREE_INVALID_OFFSET {
            trace!("ghost value at index {} of node {}", index, self.number);
            Bytes::new()
        } else {
            let start = value_end
                .checked_sub(value_offset as usize)
                .ok_or(ApfsError::BTreeMalformed("value offset out of bounds"))?;
            span(
                &self.data,
                start..start + value_length,
                "value out of bounds",
            )?
        };

        Ok((key.into(), value.into()))
    }

    /// Index of the last entry whose key compares less than or equal to the target.
    ///
    /// `compare` orders a stored key relative to the target. Keys in a node
    /// are sorted, so this is a binary search.
    fn floor_index(
        &self,
        info: &BTreeInfoRaw,
        compare: &impl Fn(&NodeKey) -> Result<Ordering>,
    ) -> Result<Option<(usize, Ordering)>> {
        let mut low = 0usize;
        let mut high = self.len();
        let mut found = None;

        while low < high {
            let middle = low + (high - low) / 2;
            let (key, _) = self.entry(middle, info)?;

            match compare(&key)? {
                Ordering::Greater => high = middle,
                Ordering::Equal => return Ok(Some((middle, Ordering::Equal))),
                Ordering::Less => {
                    found = Some((middle, Ordering::Less));
                    low = middle + 1;
                }
            }
        }

        Ok(found)
    }
}

/// A high-level interface to a B-tree.
#[derive(Clone, Debug)]
pub struct BTree {
    root: BTreeNode,
    info: BTreeInfoRaw,
}

impl BTree {
    /// Construct an instance from a block. Block must be a root node.
    pub fn from_block(block: Block) -> Result<Self> {
        debug!("block {} -> B-tree root", block.number());
        let root = BTreeNode::from_block(block)?;

        if root.object.typ.object_type() != ObjectType::BTreeRoot {
            return Err(ApfsError::BTreeNodeNotRoot);
        }
        let info = root.tree_info()?.ok_or(ApfsError::BTreeNodeNotRoot)?;

        Ok(Self { root, info })
    }

    pub fn root(&self) -> &BTreeNode {
        &self.root
    }

    pub fn info(&self) -> &BTreeInfoRaw {
        &self.info
    }

    /// Resolve and read the child node referenced by an index entry.
    fn child(
        &self,
        reader: &impl BlockReader,
        object_map: &impl ObjectMap,
        parent: &BTreeNode,
        value: &NodeValue,
    ) -> Result<BTreeNode> {
        let oid = value.as_oid()?;

        let address = match self.info.fixed.node_oid_storage() {
            StorageClass::Physical => PhysicalAddressRaw::from(oid),
            StorageClass::Ephemeral => {
                return Err(ApfsError::Unimplemented(
                    "resolving ephemeral IDs for B-tree walking",
                ));
            }
            StorageClass::Virtual => {
                object_map
                    .find_latest_oid(reader, oid.into(), self.root.transaction_identifier())?
                    .ok_or_else(|| ApfsError::VirtualObjectNotFound(oid.into()))?
                    .1
                    .address
            }
        };

        trace!("following B-tree child {} at block {}", oid, address);
        let node = BTreeNode::from_block(reader.get_block_validated(address)?)?;

        if node.level as usize + 1 != parent.level as usize {
            return Err(ApfsError::BTreeMalformed("child node level mismatch"));
        }
        if node.object.subtype != self.root.object.subtype {
            return Err(ApfsError::BTreeMalformed("child node subtype mismatch"));
        }

        Ok(node)
    }

    /// Search for a key.
    ///
    /// `compare` orders a stored key relative to the searched for key. Index
    /// nodes are descended through the last child whose key is less than or
    /// equal to the target.
    pub fn search(
        &self,
        reader: &impl BlockReader,
        object_map: &impl ObjectMap,
        compare: impl Fn(&NodeKey) -> Result<Ordering>,
        mode: SearchMode,
    ) -> Result<Option<(NodeKey, NodeValue)>> {
        let mut node = self.root.clone();

        for depth in 0..MAXIMUM_TREE_DEPTH {
            let Some((index, ordering)) = node.floor_index(&self.info, &compare)? else {
                return Ok(None);
            };

            if node.is_leaf() {
                trace!(
                    "B-tree leaf {} at depth {}: index {} ({:?})",
                    node.number,
                    depth,
                    index,
                    ordering
                );

                return match (mode, ordering) {
                    (SearchMode::Exact, Ordering::Equal) | (SearchMode::LessOrEqual, _) => {
                        Ok(Some(node.entry(index, &self.info)?))
                    }
                    (SearchMode::Exact, _) => Ok(None),
                };
            }

            let (_, value) = node.entry(index, &self.info)?;
            node = self.child(reader, object_map, &node, &value)?;
        }

        Err(ApfsError::BTreeTooDeep(MAXIMUM_TREE_DEPTH))
    }

    /// Call `cb` for every leaf entry, in key order.
    pub fn walk(
        &self,
        reader: &impl BlockReader,
        object_map: &impl ObjectMap,
        cb: &mut impl FnMut(NodeKey, NodeValue) -> Result<()>,
    ) -> Result<()> {
        self.walk_node(reader, object_map, &self.root, 0, cb)
    }

    fn walk_node(
        &self,
        reader: &impl BlockReader,
        object_map: &impl ObjectMap,
        node: &BTreeNode,
        depth: usize,
        cb: &mut impl FnMut(NodeKey, NodeValue) -> Result<()>,
    ) -> Result<()> {
        if depth >= MAXIMUM_TREE_DEPTH {
            return Err(ApfsError::BTreeTooDeep(MAXIMUM_TREE_DEPTH));
        }

        for index in 0..node.len() {
            let (key, value) = node.entry(index, &self.info)?;

            if node.is_leaf() {
                cb(key, value)?;
            } else {
                let child = self.child(reader, object_map, node, &value)?;
                self.walk_node(reader, object_map, &child, depth + 1, cb)?;
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::object_map::EmptyObjectMap;
    use apfs_types::object::ObjectTypeFlags;
    use std::collections::HashMap;

    fn u64_key(value: u64) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    fn compare_u64(target: u64) -> impl Fn(&NodeKey) -> Result<Ordering> {
        move |key: &NodeKey| Ok(u64::decode(key)?.cmp(&target))
    }

    /// Root at block 10 with two leaves at blocks 11 and 12, physical links.
    fn two_level_tree() -> Result<MemoryBlockReader> {
        let leaf = |oid: u64, keys: &[u64]| NodeSpec {
            oid,
            xid: 5,
            root: false,
            level: 0,
            storage: ObjectTypeFlags::Physical,
            subtype: ObjectType::Test,
            tree_flags: BTreeFlagsRaw::empty(),
            fixed: Some((8, 8)),
            entries: keys
                .iter()
                .map(|k| (u64_key(*k), u64_key(k * 100)))
                .collect(),
        };

        let root = NodeSpec {
            oid: 10,
            xid: 5,
            root: true,
            level: 1,
            storage: ObjectTypeFlags::Physical,
            subtype: ObjectType::Test,
            tree_flags: BTreeFlagsRaw::Physical,
            fixed: Some((8, 8)),
            entries: vec![(u64_key(10), u64_key(11)), (u64_key(50), u64_key(12))],
        };

        let mut blocks = HashMap::new();
        blocks.insert(10, sealed(&root)?);
        blocks.insert(11, sealed(&leaf(11, &[10, 20, 30]))?);
        blocks.insert(12, sealed(&leaf(12, &[50, 60]))?);

        Ok(MemoryBlockReader { blocks })
    }

    #[test]
    fn exact_search() -> Result<()> {
        let reader = two_level_tree()?;
        let tree = BTree::from_block(reader.get_block_validated(10u64)?)?;
        let om = EmptyObjectMap::default();

        let (key, value) = tree
            .search(&reader, &om, compare_u64(60), SearchMode::Exact)?
            .ok_or(ApfsError::InvalidArgument("missing"))?;
        assert_eq!(u64::decode(&key)?, 60);
        assert_eq!(u64::decode(&value)?, 6000);

        assert!(tree
            .search(&reader, &om, compare_u64(25), SearchMode::Exact)?
            .is_none());
        assert!(tree
            .search(&reader, &om, compare_u64(5), SearchMode::Exact)?
            .is_none());

        Ok(())
    }

    #[test]
    fn less_or_equal_search() -> Result<()> {
        let reader = two_level_tree()?;
        let tree = BTree::from_block(reader.get_block_validated(10u64)?)?;
        let om = EmptyObjectMap::default();

        let floor = |target| -> Result<Option<u64>> {
            Ok(
                match tree.search(&reader, &om, compare_u64(target), SearchMode::LessOrEqual)? {
                    Some((key, _)) => Some(u64::decode(&key)?),
                    None => None,
                },
            )
        };

        assert_eq!(floor(25)?, Some(20));
        assert_eq!(floor(49)?, Some(30));
        assert_eq!(floor(50)?, Some(50));
        assert_eq!(floor(1000)?, Some(60));
        assert_eq!(floor(9)?, None);

        Ok(())
    }

    #[test]
    fn walk_in_order() -> Result<()> {
        let reader = two_level_tree()?;
        let tree = BTree::from_block(reader.get_block_validated(10u64)?)?;

        let mut keys = vec![];
        tree.walk(&reader, &EmptyObjectMap::default(), &mut |k, _| {
            keys.push(u64::decode(&k)?);
            Ok(())
        })?;
        assert_eq!(keys, vec![10, 20, 30, 50, 60]);

        Ok(())
    }

    #[test]
    fn variable_sized_single_node() -> Result<()> {
        let root = NodeSpec {
            oid: 3,
            xid: 1,
            root: true,
            level: 0,
            storage: ObjectTypeFlags::Physical,
            subtype: ObjectType::Test,
            tree_flags: BTreeFlagsRaw::Physical,
            fixed: None,
            entries: vec![
                (b"apple".to_vec(), b"1".to_vec()),
                (b"kiwi".to_vec(), b"22".to_vec()),
                (b"pear".to_vec(), b"333".to_vec()),
            ],
        };
        let mut blocks = HashMap::new();
        blocks.insert(3, sealed(&root)?);
        let reader = MemoryBlockReader { blocks };

        let tree = BTree::from_block(reader.get_block_validated(3u64)?)?;
        assert!(tree.root().is_leaf());

        let (_, value) = tree
            .search(
                &reader,
                &EmptyObjectMap::default(),
                |k| Ok(k.as_ref().cmp(b"kiwi".as_ref())),
                SearchMode::Exact,
            )?
            .ok_or(ApfsError::InvalidArgument("missing"))?;
        assert_eq!(value.as_ref(), b"22");

        Ok(())
    }

    #[test]
    fn child_level_mismatch() -> Result<()> {
        let mut reader = two_level_tree()?;
        let bad_leaf = NodeSpec {
            oid: 12,
            xid: 5,
            root: false,
            level: 1,
            storage: ObjectTypeFlags::Physical,
            subtype: ObjectType::Test,
            tree_flags: BTreeFlagsRaw::empty(),
            fixed: Some((8, 8)),
            entries: vec![(u64_key(50), u64_key(11))],
        };
        reader.blocks.insert(12, sealed(&bad_leaf)?);

        let tree = BTree::from_block(reader.get_block_validated(10u64)?)?;
        let res = tree.search(
            &reader,
            &EmptyObjectMap::default(),
            compare_u64(50),
            SearchMode::Exact,
        );
        assert!(matches!(res, Err(ApfsError::BTreeMalformed(_))));

        Ok(())
    }

    #[test]
    fn child_checksum_failure() -> Result<()> {
        let mut reader = two_level_tree()?;
        if let Some(block) = reader.blocks.get_mut(&11) {
            block[300] ^= 0x01;
        }

        let tree = BTree::from_block(reader.get_block_validated(10u64)?)?;
        let res = tree.search(
            &reader,
            &EmptyObjectMap::default(),
            compare_u64(20),
            SearchMode::Exact,
        );
        assert!(matches!(res, Err(ApfsError::InvalidChecksum { .. })));

        Ok(())
    }

    #[test]
    fn non_root_rejected() -> Result<()> {
        let reader = two_level_tree()?;
        assert!(matches!(
            BTree::from_block(reader.get_block_validated(11u64)?),
            Err(ApfsError::BTreeNodeNotRoot)
        ));

        Ok(())
    }
}
