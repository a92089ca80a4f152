// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader configuration.

use crate::block::{BlockReader, CachingBlockReader, ReadSeek, StreamBlockReader};
use crate::btree::{BTree, NodeValue};
use crate::error::{ApfsError, Result};
use crate::name::{self, DirectoryRecordKey, NameQuery};
use crate::object_map::{ObjectMap, ObjectResolver};
use apfs_types::common::PhysicalAddressRaw;
use log::debug;

/// Smallest supported container block size.
pub const MINIMUM_BLOCK_SIZE: usize = 4096;

/// Largest supported container block size.
pub const MAXIMUM_BLOCK_SIZE: usize = 65536;

/// Settings for reading a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReaderConfig {
    /// Container block size in bytes.
    pub block_size: usize,
    /// Whether to keep read blocks in memory.
    pub block_cache: bool,
    /// Upper bound on cached blocks. `None` is unbounded.
    pub block_cache_capacity: Option<usize>,
    /// Whether to remember object map resolutions.
    pub address_cache: bool,
    /// Whether directory lookups ignore case.
    pub fold_case: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            block_size: MINIMUM_BLOCK_SIZE,
            block_cache: true,
            block_cache_capacity: Some(4096),
            address_cache: true,
            fold_case: false,
        }
    }
}

impl ReaderConfig {
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_block_cache(mut self, enabled: bool) -> Self {
        self.block_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_block_cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.block_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_address_cache(mut self, enabled: bool) -> Self {
        self.address_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_fold_case(mut self, enabled: bool) -> Self {
        self.fold_case = enabled;
        self
    }

    /// Ensure the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MINIMUM_BLOCK_SIZE..=MAXIMUM_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(ApfsError::InvalidArgument(
                "block size must be a power of two from 4096 to 65536",
            ));
        }

        Ok(())
    }

    /// Construct a block reader over `source` starting at its current position.
    pub fn open(
        &self,
        source: impl ReadSeek + 'static,
    ) -> Result<CachingBlockReader<StreamBlockReader>> {
        self.validate()?;

        let reader = StreamBlockReader::new(Box::new(source), self.block_size)?;
        let capacity = if self.block_cache {
            self.block_cache_capacity
        } else {
            Some(0)
        };
        debug!(
            "opened {} blocks of {} bytes; block cache capacity {:?}",
            reader.block_count(),
            self.block_size,
            capacity
        );

        Ok(CachingBlockReader::with_capacity(reader, capacity))
    }

    /// Construct an object resolver for the object map at `address`.
    pub fn object_resolver(
        &self,
        reader: &impl BlockReader,
        address: impl Into<PhysicalAddressRaw>,
    ) -> Result<ObjectResolver> {
        ObjectResolver::open(reader, address, self.address_cache)
    }

    /// Find a directory entry, ignoring case if [Self::fold_case] is set.
    pub fn lookup_directory_entry(
        &self,
        tree: &BTree,
        reader: &impl BlockReader,
        object_map: &impl ObjectMap,
        parent_id: u64,
        name: NameQuery<'_>,
        hashed: bool,
    ) -> Result<Option<(DirectoryRecordKey, NodeValue)>> {
        name::lookup_directory_entry(
            tree,
            reader,
            object_map,
            parent_id,
            name,
            self.fold_case,
            hashed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::name::testutil::fs_tree;
    use crate::object_map::EmptyObjectMap;
    use std::io::Cursor;

    #[test]
    fn defaults() -> Result<()> {
        let config = ReaderConfig::default();
        config.validate()?;
        assert_eq!(config.block_size, 4096);
        assert!(config.block_cache);
        assert_eq!(config.block_cache_capacity, Some(4096));
        assert!(config.address_cache);
        assert!(!config.fold_case);

        Ok(())
    }

    #[test]
    fn block_size_validation() {
        for size in [0, 512, 4095, 6144, 131072] {
            let err = ReaderConfig::default()
                .with_block_size(size)
                .validate()
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Argument);
        }

        for size in [4096, 8192, 16384, 65536] {
            assert!(ReaderConfig::default()
                .with_block_size(size)
                .validate()
                .is_ok());
        }
    }

    #[test]
    fn directory_lookup_case() -> Result<()> {
        let omap = EmptyObjectMap::default();

        let reader = fs_tree(true, false)?;
        let tree = BTree::from_block(reader.get_block_validated(7u64)?)?;
        let sensitive = ReaderConfig::default();
        assert!(sensitive
            .lookup_directory_entry(&tree, &reader, &omap, 2, "readme".into(), true)?
            .is_none());
        assert!(sensitive
            .lookup_directory_entry(&tree, &reader, &omap, 2, "README".into(), true)?
            .is_some());

        let reader = fs_tree(true, true)?;
        let tree = BTree::from_block(reader.get_block_validated(7u64)?)?;
        let insensitive = ReaderConfig::default().with_fold_case(true);
        let (key, _) = insensitive
            .lookup_directory_entry(&tree, &reader, &omap, 2, "readme".into(), true)?
            .ok_or(ApfsError::InvalidArgument("entry not found"))?;
        assert_eq!(key.name()?, "README");

        Ok(())
    }

    #[test]
    fn open_stream() -> Result<()> {
        let mut image = vec![0u8; 3 * 8192];
        image[8192] = 0x42;

        let reader = ReaderConfig::default()
            .with_block_size(8192)
            .open(Cursor::new(image.clone()))?;
        assert_eq!(reader.block_size(), 8192);
        assert_eq!(reader.inner().block_count(), 3);
        assert_eq!(reader.read_block_data(1u64)?[0], 0x42);

        let uncached = ReaderConfig::default()
            .with_block_cache(false)
            .open(Cursor::new(image))?;
        uncached.get_block(2u64)?;
        assert_eq!(uncached.cached_blocks(), 0);

        assert!(ReaderConfig::default()
            .with_block_size(1000)
            .open(Cursor::new(vec![]))
            .is_err());

        Ok(())
    }
}
