// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Object types.

use crate::common::{ObjectIdentifierRaw, TransactionIdentifierRaw};
use crate::DiskLayout;
use bitflags::bitflags;
use core::fmt::Debug;
use num_enum::{FromPrimitive, IntoPrimitive};

#[cfg(doc)]
use crate::{btree::*, chunk_info::*, object_map::*};

/// Mask of the object type bits in an object's type field (`OBJECT_TYPE_MASK`).
pub const OBJECT_TYPE_MASK: u32 = 0x0000ffff;

/// Mask of the storage flag bits in an object's type field (`OBJECT_TYPE_FLAGS_MASK`).
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xffff0000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ObjectType {
    /// As a type, an invalid object; as a subtype, an object with no subtype (`OBJECT_TYPE_INVALID`).
    Invalid = 0,

    /// A container superblock (`OBJECT_TYPE_NX_SUPERBLOCK`).
    ContainerSuperblock = 1,

    /// A B-tree root node (`OBJECT_TYPE_BTREE`).
    ///
    /// Values are [BTreeNodeRaw].
    BTreeRoot = 2,

    /// A B-tree node (`OBJECT_TYPE_BTREE_NODE`).
    ///
    /// Values are [BTreeNodeRaw].
    BTreeNode = 3,

    /// A space manager (`OBJECT_TYPE_SPACEMAN`).
    SpaceManagerHeader = 5,

    /// A chunk-info address block used by the space manager (`OBJECT_TYPE_SPACEMAN_CAB`).
    SpaceManagerChunkInformationAddressBlock = 6,

    /// A chunk-info block used by the space manager (`OBJECT_TYPE_SPACEMAN_CIB`).
    ///
    /// Values are [ChunkInfoBlockRaw].
    SpaceManagerChunkInformationBlock = 7,

    /// A free-space bitmap used by the space manager (`OBJECT_TYPE_SPACEMAN_BITMAP`).
    SpaceManagerBitmap = 8,

    /// Object map (`OBJECT_TYPE_OMAP`).
    ///
    /// As a type, an [ObjectMapBlockRaw].
    /// As a subtype, a tree that stores the records of an object map.
    ObjectMap = 11,

    /// A checkpoint map (`OBJECT_TYPE_CHECKPOINT_MAP`).
    CheckpointMap = 12,

    /// A volume (`OBJECT_TYPE_FS`).
    VolumeSuperblock = 13,

    /// A tree containing file-system records (`OBJECT_TYPE_FSTREE`).
    ///
    /// This type is used only as a subtype of a tree.
    FilesystemTree = 14,

    /// A tree containing extent references (`OBJECT_TYPE_BLOCKREFTREE`).
    ExtentReferenceTree = 15,

    /// A tree containing snapshot metadata for a volume (`OBJECT_TYPE_SNAPMETATREE`).
    SnapshotMetadataTree = 16,

    /// A tree containing information about snapshots of an object map (`OBJECT_TYPE_OMAP_SNAPSHOT`).
    ObjectMapSnapshot = 19,

    /// A B-tree of file extents (`OBJECT_TYPE_FEXT_TREE`).
    FileExtentsBTree = 31,

    /// Reserved for testing (`OBJECT_TYPE_TEST`).
    Test = 0xff,

    #[num_enum(catch_all)]
    Unknown(u32),
}

/// Represents the storage backend for an object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageClass {
    /// Physical storage.
    Physical,
    /// Ephemeral storage.
    Ephemeral,
    /// Virtual storage.
    Virtual,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub struct ObjectTypeFlags: u32 {
        /// A virtual object (`OBJ_VIRTUAL`).
        const Virtual = 0x0;

        /// An ephemeral object (`OBJ_EPHEMERAL`).
        const Ephemeral = 0x80000000;

        /// A physical object (`OBJ_PHYSICAL`).
        const Physical = 0x40000000;

        /// An object stored without an [ObjectHeaderRaw] header (`OBJ_NOHEADER`).
        const NoHeader = 0x20000000;

        /// An encrypted object (`OBJ_ENCRYPTED`).
        const Encrypted = 0x10000000;

        /// An ephemeral object that isn't persisted across unmounting (`OBJ_NONPERSISTENT`).
        const NonPersistent = 0x08000000;

        const _ = !0;
    }
}

impl ObjectTypeFlags {
    /// Obtain the enumerated storage class for this object.
    pub fn storage_class(&self) -> StorageClass {
        if self.contains(Self::Ephemeral) {
            StorageClass::Ephemeral
        } else if self.contains(Self::Physical) {
            StorageClass::Physical
        } else {
            StorageClass::Virtual
        }
    }
}

/// The 32-bit type word of an object: 16 bits of type plus 16 bits of flags.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, DiskLayout)]
pub struct ObjectTypeValueRaw(pub u32);

impl Debug for ObjectTypeValueRaw {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectTypeValue")
            .field("type", &self.object_type())
            .field("flags", &self.flags())
            .finish()
    }
}

impl From<u32> for ObjectTypeValueRaw {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl ObjectTypeValueRaw {
    /// Construct a type word from an object type and storage flags.
    pub fn new(typ: ObjectType, flags: ObjectTypeFlags) -> Self {
        Self((u32::from(typ) & OBJECT_TYPE_MASK) | (flags.bits() & OBJECT_TYPE_FLAGS_MASK))
    }

    /// Obtain the integer value of the object type.
    pub fn object_type_raw(&self) -> u32 {
        self.0 & OBJECT_TYPE_MASK
    }

    pub fn object_type(&self) -> ObjectType {
        ObjectType::from_primitive(self.object_type_raw())
    }

    /// Obtain the integer value of the object flags.
    pub fn flags_raw(&self) -> u32 {
        self.0 & OBJECT_TYPE_FLAGS_MASK
    }

    pub fn flags(&self) -> ObjectTypeFlags {
        ObjectTypeFlags::from_bits_retain(self.flags_raw())
    }
}

/// Common object header (`obj_phys_t`).
///
/// Prefixes every on-disk object. [Self::checksum] is the Fletcher-64
/// checksum of all bytes of the object following the checksum field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct ObjectHeaderRaw {
    /// Fletcher-64 checksum of the object (`o_cksum`).
    pub checksum: u64,
    /// The object's identifier (`o_oid`).
    pub identifier: ObjectIdentifierRaw,
    /// Identifier of the most recent transaction that modified the object (`o_xid`).
    pub transaction_identifier: TransactionIdentifierRaw,
    /// The object's type and flags (`o_type`).
    pub typ: ObjectTypeValueRaw,
    /// The object's subtype (`o_subtype`).
    pub subtype: ObjectTypeValueRaw,
}
