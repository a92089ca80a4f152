// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object maps.
//!
//! An object map translates a virtual object identifier and a transaction
//! identifier into the physical address of the object version that was
//! current at that transaction. Updates are copy-on-write: a new version
//! gets a new mapping with a larger transaction identifier and older
//! mappings stay in place.

use crate::block::{Block, BlockReadError, BlockReader};
use crate::btree::{BTree, SearchMode};
use crate::error::Result;
use apfs_types::common::{PhysicalAddressRaw, TransactionIdentifierRaw, VirtualObjectIdentifierRaw};
use apfs_types::object::{ObjectType, ObjectTypeFlags, ObjectTypeValueRaw};
pub use apfs_types::object_map::*;
use apfs_types::DiskStruct;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::Mutex;

/// Describes common behavior of an object map.
pub trait ObjectMap {
    /// Find the newest mapping for `oid` whose transaction identifier is at most `xid`.
    ///
    /// Mappings flagged as deleted are reported as not found.
    fn find_latest_oid(
        &self,
        reader: &impl BlockReader,
        oid: VirtualObjectIdentifierRaw,
        xid: TransactionIdentifierRaw,
    ) -> Result<Option<(ObjectMapKeyRaw, ObjectMapValueRaw)>>;

    /// Walk every mapping in key order.
    fn walk(
        &self,
        reader: &impl BlockReader,
        cb: &mut impl FnMut(ObjectMapKeyRaw, ObjectMapValueRaw) -> Result<()>,
    ) -> Result<()>;
}

/// Represents an empty object map.
///
/// Used where a tree only links to physical children.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyObjectMap {}

impl ObjectMap for EmptyObjectMap {
    fn find_latest_oid(
        &self,
        _reader: &impl BlockReader,
        _oid: VirtualObjectIdentifierRaw,
        _xid: TransactionIdentifierRaw,
    ) -> Result<Option<(ObjectMapKeyRaw, ObjectMapValueRaw)>> {
        Ok(None)
    }

    fn walk(
        &self,
        _reader: &impl BlockReader,
        _cb: &mut impl FnMut(ObjectMapKeyRaw, ObjectMapValueRaw) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Higher level interface for an object map.
#[derive(Clone, Debug)]
pub struct ObjectMapBlock {
    om: ObjectMapBlockRaw,
    btree: BTree,
}

impl ObjectMapBlock {
    /// Construct an instance from a read block and a block reader.
    ///
    /// The block must be a physical object map and its tree a B-tree root
    /// of object map entries. Both blocks must carry valid checksums.
    pub fn new(reader: &impl BlockReader, block: Block) -> Result<Self> {
        debug!("block {} -> object map", block.number());
        block.validate_checksum()?;
        block.expect_type(
            ObjectTypeValueRaw::new(ObjectType::ObjectMap, ObjectTypeFlags::Physical).0,
            0,
        )?;

        let om = ObjectMapBlockRaw::decode(&block)?;
        debug!("object map tree block: {}", om.tree_oid);

        let tree_block = reader.get_block_validated(om.tree_oid)?;
        tree_block.expect_object_type(&[ObjectType::BTreeRoot], ObjectType::ObjectMap)?;
        let btree = BTree::from_block(tree_block)?;

        Ok(Self { om, btree })
    }

    /// Obtain the object map header.
    pub fn header(&self) -> &ObjectMapBlockRaw {
        &self.om
    }

    /// Obtain a reference to the B-tree backing this object map.
    pub fn btree(&self) -> &BTree {
        &self.btree
    }
}

impl ObjectMap for ObjectMapBlock {
    fn find_latest_oid(
        &self,
        reader: &impl BlockReader,
        oid: VirtualObjectIdentifierRaw,
        xid: TransactionIdentifierRaw,
    ) -> Result<Option<(ObjectMapKeyRaw, ObjectMapValueRaw)>> {
        let target = ObjectMapKeyRaw { oid, xid };

        // The floor of (oid, xid) is the newest version not after xid, if
        // that entry still belongs to oid.
        let Some((key, value)) = self.btree.search(
            reader,
            &EmptyObjectMap::default(),
            |key| Ok(ObjectMapKeyRaw::decode(key)?.cmp(&target)),
            SearchMode::LessOrEqual,
        )?
        else {
            trace!("object map: no entry at or below {}/{}", oid, xid);
            return Ok(None);
        };

        let key = ObjectMapKeyRaw::decode(&key)?;
        if key.oid != oid {
            trace!("object map: {} has no version at or before {}", oid, xid);
            return Ok(None);
        }

        let value = ObjectMapValueRaw::decode(&value)?;
        if value.flags.contains(ObjectMapValueFlagsRaw::Deleted) {
            warn!(
                "object map: {} version {} is a deleted placeholder",
                key.oid, key.xid
            );
            return Ok(None);
        }

        trace!(
            "object map: {}/{} -> version {} at block {}",
            oid,
            xid,
            key.xid,
            value.address
        );

        Ok(Some((key, value)))
    }

    fn walk(
        &self,
        reader: &impl BlockReader,
        cb: &mut impl FnMut(ObjectMapKeyRaw, ObjectMapValueRaw) -> Result<()>,
    ) -> Result<()> {
        self.btree
            .walk(reader, &EmptyObjectMap::default(), &mut |key, value| {
                cb(
                    ObjectMapKeyRaw::decode(&key)?,
                    ObjectMapValueRaw::decode(&value)?,
                )
            })
    }
}

/// Resolves virtual object identifiers, remembering results.
///
/// Committed mappings never change, so a result for a given
/// `(oid, max_xid)` pair stays valid for the life of the resolver. The
/// cache is shared through `&self` and safe to use across threads.
#[derive(Debug)]
pub struct ObjectResolver {
    object_map: ObjectMapBlock,
    cache_enabled: bool,
    cache: Mutex<HashMap<(u64, u64), (ObjectMapKeyRaw, ObjectMapValueRaw)>>,
}

impl ObjectResolver {
    /// Construct a caching resolver over an object map.
    pub fn new(object_map: ObjectMapBlock) -> Self {
        Self::with_cache(object_map, true)
    }

    /// Construct a resolver, optionally without its address cache.
    pub fn with_cache(object_map: ObjectMapBlock, cache_enabled: bool) -> Self {
        Self {
            object_map,
            cache_enabled,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Read the object map at `address` and construct a resolver for it.
    pub fn open(
        reader: &impl BlockReader,
        address: impl Into<PhysicalAddressRaw>,
        cache_enabled: bool,
    ) -> Result<Self> {
        let block = reader.get_block(address)?;

        Ok(Self::with_cache(
            ObjectMapBlock::new(reader, block)?,
            cache_enabled,
        ))
    }

    pub fn object_map(&self) -> &ObjectMapBlock {
        &self.object_map
    }

    /// Number of cached resolutions.
    pub fn cached_entries(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.len())
            .unwrap_or_default()
    }

    /// Resolve `oid` as of transaction `max_xid` to a physical address.
    ///
    /// `Ok(None)` means no live version exists.
    pub fn resolve(
        &self,
        reader: &impl BlockReader,
        oid: impl Into<VirtualObjectIdentifierRaw>,
        max_xid: impl Into<TransactionIdentifierRaw>,
    ) -> Result<Option<PhysicalAddressRaw>> {
        Ok(self
            .find_latest_oid(reader, oid.into(), max_xid.into())?
            .map(|(_, value)| value.address))
    }
}

impl ObjectMap for ObjectResolver {
    fn find_latest_oid(
        &self,
        reader: &impl BlockReader,
        oid: VirtualObjectIdentifierRaw,
        xid: TransactionIdentifierRaw,
    ) -> Result<Option<(ObjectMapKeyRaw, ObjectMapValueRaw)>> {
        if !self.cache_enabled {
            return self.object_map.find_latest_oid(reader, oid, xid);
        }

        let cache_key = (oid.0, xid.0);

        if let Some(entry) = self
            .cache
            .lock()
            .map_err(|_| BlockReadError::Other("address cache lock poisoned"))?
            .get(&cache_key)
        {
            return Ok(Some(*entry));
        }

        let found = self.object_map.find_latest_oid(reader, oid, xid)?;

        if let Some(entry) = found {
            self.cache
                .lock()
                .map_err(|_| BlockReadError::Other("address cache lock poisoned"))?
                .insert(cache_key, entry);
        }

        Ok(found)
    }

    fn walk(
        &self,
        reader: &impl BlockReader,
        cb: &mut impl FnMut(ObjectMapKeyRaw, ObjectMapValueRaw) -> Result<()>,
    ) -> Result<()> {
        self.object_map.walk(reader, cb)
    }
}
