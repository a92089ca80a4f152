// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! File system record keys.

use crate::DiskLayout;
use core::cmp::Ordering;
use core::fmt::{Debug, Formatter};
use num_enum::{FromPrimitive, IntoPrimitive};

/// Mask of the object identifier bits in [FileSystemKeyRaw::obj_id_and_type] (`OBJ_ID_MASK`).
pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;

/// Mask of the record type bits in [FileSystemKeyRaw::obj_id_and_type] (`OBJ_TYPE_MASK`).
pub const OBJ_TYPE_MASK: u64 = 0xf000_0000_0000_0000;

/// Shift of the record type bits (`OBJ_TYPE_SHIFT`).
pub const OBJ_TYPE_SHIFT: u32 = 60;

/// Bits of a hashed directory key holding the name length (`J_DREC_LEN_MASK`).
pub const DREC_LEN_MASK: u32 = 0x0000_03ff;

/// Bits of a hashed directory key holding the name hash (`J_DREC_HASH_MASK`).
pub const DREC_HASH_MASK: u32 = 0xffff_fc00;

/// Shift of the hash bits of a hashed directory key (`J_DREC_HASH_SHIFT`).
pub const DREC_HASH_SHIFT: u32 = 10;

/// The type of a file system record (`j_obj_types`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FileSystemObjectType {
    /// Any record; only meaningful in queries (`APFS_TYPE_ANY`).
    Any = 0,
    SnapshotMetadata = 1,
    Extent = 2,
    Inode = 3,
    ExtendedAttribute = 4,
    SiblingLink = 5,
    DataStreamId = 6,
    CryptoState = 7,
    FileExtent = 8,
    /// A directory entry (`APFS_TYPE_DIR_REC`).
    DirectoryRecord = 9,
    DirectoryStats = 10,
    SnapshotName = 11,
    SiblingMap = 12,
    FileInfo = 13,
    /// Reserved or unknown values.
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Header at the start of every file system record key (`j_key_t`).
#[derive(Clone, Copy, Default, Eq, PartialEq, DiskLayout)]
pub struct FileSystemKeyRaw {
    /// Object identifier in the low 60 bits, record type in the high 4 (`obj_id_and_type`).
    pub obj_id_and_type: u64,
}

impl Debug for FileSystemKeyRaw {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FileSystemKey")
            .field(&self.id())
            .field(&self.object_type())
            .finish()
    }
}

impl FileSystemKeyRaw {
    pub fn new(id: u64, typ: FileSystemObjectType) -> Self {
        Self {
            obj_id_and_type: (id & OBJ_ID_MASK) | ((u8::from(typ) as u64) << OBJ_TYPE_SHIFT),
        }
    }

    /// The object identifier.
    pub fn id(&self) -> u64 {
        self.obj_id_and_type & OBJ_ID_MASK
    }

    /// The raw record type.
    pub fn typ(&self) -> u8 {
        ((self.obj_id_and_type & OBJ_TYPE_MASK) >> OBJ_TYPE_SHIFT) as u8
    }

    pub fn object_type(&self) -> FileSystemObjectType {
        FileSystemObjectType::from_primitive(self.typ())
    }
}

// Records sharing an identifier sort together, then by type.
impl Ord for FileSystemKeyRaw {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.id(), self.typ()).cmp(&(other.id(), other.typ()))
    }
}

impl PartialOrd for FileSystemKeyRaw {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed prefix of a directory entry key (`j_drec_key_t`).
///
/// `name_length` bytes of NUL-terminated UTF-8 follow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct DirectoryEntryRecordKeyRaw {
    pub header: FileSystemKeyRaw,

    /// Length of the name including the trailing NUL (`name_len`).
    pub name_length: u16,
}

/// Packed name length and hash of a [DirectoryEntryRecordHashedKeyRaw].
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, DiskLayout)]
pub struct DirectoryEntryRecordNameLengthAndHashRaw(pub u32);

impl Debug for DirectoryEntryRecordNameLengthAndHashRaw {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NameLengthAndHash")
            .field("length", &self.name_length())
            .field("hash", &self.hash())
            .finish()
    }
}

impl DirectoryEntryRecordNameLengthAndHashRaw {
    /// Pack a 22-bit hash and a 10-bit length.
    pub fn new(hash: u32, name_length: u32) -> Self {
        Self(((hash << DREC_HASH_SHIFT) & DREC_HASH_MASK) | (name_length & DREC_LEN_MASK))
    }

    /// Length of the name including the trailing NUL.
    pub fn name_length(&self) -> u32 {
        self.0 & DREC_LEN_MASK
    }

    pub fn hash(&self) -> u32 {
        (self.0 & DREC_HASH_MASK) >> DREC_HASH_SHIFT
    }
}

/// Fixed prefix of a directory entry key with a precomputed name hash (`j_drec_hashed_key_t`).
///
/// The NUL-terminated UTF-8 name follows.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct DirectoryEntryRecordHashedKeyRaw {
    pub header: FileSystemKeyRaw,
    pub name_length_and_hash: DirectoryEntryRecordNameLengthAndHashRaw,
}

/// Value of a directory entry record (`j_drec_val_t`), without extended fields.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct DirectoryEntryRecordValueRaw {
    /// Identifier of the inode this entry points to (`file_id`).
    pub file_id: u64,

    /// Time the entry was added to the directory, in nanoseconds since the epoch (`date_added`).
    pub date_added: u64,

    /// Low 4 bits hold the file type (`flags`).
    pub flags: u16,
}
