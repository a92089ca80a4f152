// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File name comparison and hashing.
//!
//! Names are compared one code point at a time, decoding lazily from the
//! stored bytes and the query. Case-insensitive comparison lower-cases each
//! code point on its own and keeps the original when lower-casing would
//! produce more than one code point. No normalization is applied, so
//! precomposed and decomposed forms of a character compare unequal.

use crate::block::BlockReader;
use crate::btree::{BTree, NodeKey, NodeValue, SearchMode};
use crate::checksum::crc32c;
use crate::error::{ApfsError, Result};
use crate::object_map::ObjectMap;
pub use apfs_types::filesystem::*;
use apfs_types::DiskStruct;
use bytes::Bytes;
use log::{debug, trace};
use std::char::DecodeUtf16;
use std::cmp::Ordering;
use std::iter::Copied;
use std::slice::Iter;

/// Mask for the hash stored in a hashed directory entry key.
pub const NAME_HASH_MASK: u32 = 0x003f_ffff;

/// A name to compare against stored names.
#[derive(Clone, Copy, Debug)]
pub enum NameQuery<'a> {
    Utf8(&'a [u8]),
    Utf16(&'a [u16]),
}

impl<'a> NameQuery<'a> {
    /// Iterate code points up to the first NUL or the end.
    pub fn code_points(&self) -> CodePoints<'a> {
        match *self {
            Self::Utf8(data) => CodePoints::Utf8 { data, offset: 0 },
            Self::Utf16(data) => CodePoints::Utf16(char::decode_utf16(data.iter().copied())),
        }
    }
}

impl<'a> From<&'a str> for NameQuery<'a> {
    fn from(value: &'a str) -> Self {
        Self::Utf8(value.as_bytes())
    }
}

/// Lazily decoded code points of a [NameQuery].
#[derive(Clone, Debug)]
pub enum CodePoints<'a> {
    Utf8 { data: &'a [u8], offset: usize },
    Utf16(DecodeUtf16<Copied<Iter<'a, u16>>>),
}

fn utf8_sequence_length(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7f => Some(1),
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

impl Iterator for CodePoints<'_> {
    type Item = Result<char>;

    fn next(&mut self) -> Option<Self::Item> {
        let c = match self {
            Self::Utf8 { data, offset } => {
                let lead = *data.get(*offset)?;

                let decoded = utf8_sequence_length(lead)
                    .and_then(|len| data.get(*offset..*offset + len))
                    .and_then(|sequence| std::str::from_utf8(sequence).ok())
                    .and_then(|s| s.chars().next());

                match decoded {
                    Some(c) => {
                        *offset += c.len_utf8();
                        Ok(c)
                    }
                    None => Err(ApfsError::StringNotUtf8),
                }
            }
            Self::Utf16(iter) => iter.next()?.map_err(|_| ApfsError::StringNotUtf16),
        };

        match c {
            Ok('\0') => None,
            res => Some(res),
        }
    }
}

/// Lower-case a code point when the result is a single code point.
fn fold(c: char) -> char {
    let mut lower = c.to_lowercase();

    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}

/// Compare a stored UTF-8 name to a query.
///
/// Returns the ordering of `stored` relative to `query`. Either side ends
/// at its first NUL. When one name is a prefix of the other, the longer
/// name is greater.
pub fn compare_name(stored: &[u8], query: NameQuery<'_>, fold_case: bool) -> Result<Ordering> {
    let mut left = NameQuery::Utf8(stored).code_points();
    let mut right = query.code_points();

    loop {
        match (left.next().transpose()?, right.next().transpose()?) {
            (None, None) => return Ok(Ordering::Equal),
            (None, Some(_)) => return Ok(Ordering::Less),
            (Some(_), None) => return Ok(Ordering::Greater),
            (Some(l), Some(r)) => {
                let (l, r) = if fold_case {
                    (fold(l), fold(r))
                } else {
                    (l, r)
                };

                match (l as u32).cmp(&(r as u32)) {
                    Ordering::Equal => {}
                    ordering => return Ok(ordering),
                }
            }
        }
    }
}

/// Compute the 22-bit hash stored in hashed directory entry keys.
///
/// This is the complemented CRC-32C of the name's code points as UTF-32LE,
/// after the same per code point case folding as [compare_name]. The
/// terminating NUL isn't hashed.
pub fn name_hash(name: NameQuery<'_>, fold_case: bool) -> Result<u32> {
    let mut crc = 0xffff_ffff;

    for c in name.code_points() {
        let c = if fold_case { fold(c?) } else { c? };
        crc = crc32c(&(c as u32).to_le_bytes(), crc);
    }

    Ok(!crc & NAME_HASH_MASK)
}

/// A decoded directory entry key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryRecordKey {
    header: FileSystemKeyRaw,
    hash: Option<u32>,
    name: Bytes,
}

impl DirectoryRecordKey {
    /// Decode a key from a file system tree.
    ///
    /// `hashed` selects the [DirectoryEntryRecordHashedKeyRaw] layout over
    /// [DirectoryEntryRecordKeyRaw]. Keys of other record types decode
    /// with an empty name.
    pub fn decode(key: &Bytes, hashed: bool) -> Result<Self> {
        let header = FileSystemKeyRaw::decode(key)?;

        if header.object_type() != FileSystemObjectType::DirectoryRecord {
            return Ok(Self {
                header,
                hash: None,
                name: Bytes::new(),
            });
        }

        let (hash, name_length, start) = if hashed {
            let raw = DirectoryEntryRecordHashedKeyRaw::decode(key)?;
            (
                Some(raw.name_length_and_hash.hash()),
                raw.name_length_and_hash.name_length() as usize,
                DirectoryEntryRecordHashedKeyRaw::SIZE,
            )
        } else {
            let raw = DirectoryEntryRecordKeyRaw::decode(key)?;
            (
                None,
                raw.name_length as usize,
                DirectoryEntryRecordKeyRaw::SIZE,
            )
        };

        let end = start + name_length;
        if end > key.len() {
            return Err(ApfsError::BTreeMalformed(
                "directory entry name out of bounds",
            ));
        }

        Ok(Self {
            header,
            hash,
            name: key.slice(start..end),
        })
    }

    /// Identifier of the directory holding the entry.
    pub fn parent_id(&self) -> u64 {
        self.header.id()
    }

    pub fn record_type(&self) -> FileSystemObjectType {
        self.header.object_type()
    }

    pub fn hash(&self) -> Option<u32> {
        self.hash
    }

    /// Name bytes as stored, including any trailing NUL.
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    /// The name as a string, without the trailing NUL.
    pub fn name(&self) -> Result<&str> {
        let name = self.name.strip_suffix(b"\0").unwrap_or(&self.name[..]);

        std::str::from_utf8(name).map_err(|_| ApfsError::StringNotUtf8)
    }

    /// Order this key relative to a directory entry being searched for.
    ///
    /// Keys sort by parent identifier, record type, hash (hashed keys
    /// only) and then name.
    pub fn compare_to(
        &self,
        parent_id: u64,
        hash: Option<u32>,
        name: NameQuery<'_>,
        fold_case: bool,
    ) -> Result<Ordering> {
        let target = FileSystemKeyRaw::new(parent_id, FileSystemObjectType::DirectoryRecord);

        match self.header.cmp(&target) {
            Ordering::Equal => {}
            ordering => return Ok(ordering),
        }

        if let (Some(stored), Some(wanted)) = (self.hash, hash) {
            match stored.cmp(&wanted) {
                Ordering::Equal => {}
                ordering => return Ok(ordering),
            }
        }

        compare_name(&self.name, name, fold_case)
    }
}

/// Find the directory entry called `name` in directory `parent_id`.
///
/// `hashed` says whether the tree uses hashed directory entry keys and
/// `fold_case` whether the volume is case-insensitive.
pub fn lookup_directory_entry(
    tree: &BTree,
    reader: &impl BlockReader,
    object_map: &impl ObjectMap,
    parent_id: u64,
    name: NameQuery<'_>,
    fold_case: bool,
    hashed: bool,
) -> Result<Option<(DirectoryRecordKey, NodeValue)>> {
    let hash = if hashed {
        Some(name_hash(name, fold_case)?)
    } else {
        None
    };
    debug!(
        "looking up {:?} in directory {} (hash {:?})",
        name, parent_id, hash
    );

    let found = tree.search(
        reader,
        object_map,
        |key: &NodeKey| {
            DirectoryRecordKey::decode(key, hashed)?.compare_to(parent_id, hash, name, fold_case)
        },
        SearchMode::Exact,
    )?;

    match found {
        Some((key, value)) => {
            let key = DirectoryRecordKey::decode(&key, hashed)?;
            trace!("found directory entry {:?}", key);
            Ok(Some((key, value)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Directory record fixtures.

    use super::*;
    use crate::btree::testutil::*;
    use crate::btree::BTreeFlagsRaw;
    use apfs_types::object::{ObjectType, ObjectTypeFlags};
    use apfs_types::DiskStructEncode;
    use std::collections::HashMap;

    pub fn drec_key(parent: u64, name: &str, hashed: bool, fold_case: bool) -> Result<Vec<u8>> {
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);

        let header = FileSystemKeyRaw::new(parent, FileSystemObjectType::DirectoryRecord);
        let mut key = if hashed {
            let mut key = vec![0u8; DirectoryEntryRecordHashedKeyRaw::SIZE];
            DirectoryEntryRecordHashedKeyRaw {
                header,
                name_length_and_hash: DirectoryEntryRecordNameLengthAndHashRaw::new(
                    name_hash(name.into(), fold_case)?,
                    name_bytes.len() as u32,
                ),
            }
            .encode(&mut key)?;
            key
        } else {
            let mut key = vec![0u8; DirectoryEntryRecordKeyRaw::SIZE];
            DirectoryEntryRecordKeyRaw {
                header,
                name_length: name_bytes.len() as u16,
            }
            .encode(&mut key)?;
            key
        };
        key.extend_from_slice(&name_bytes);

        Ok(key)
    }

    pub fn drec_value(file_id: u64) -> Result<Vec<u8>> {
        let mut value = vec![0u8; DirectoryEntryRecordValueRaw::SIZE];
        DirectoryEntryRecordValueRaw {
            file_id,
            date_added: 1_700_000_000_000_000_000,
            flags: 8,
        }
        .encode(&mut value)?;

        Ok(value)
    }

    /// A single leaf file system tree with entries for directories 2 and 3.
    pub fn fs_tree(hashed: bool, fold_case: bool) -> Result<MemoryBlockReader> {
        let mut inode_key = vec![0u8; 8];
        FileSystemKeyRaw::new(2, FileSystemObjectType::Inode).encode(&mut inode_key)?;

        let names = ["Makefile", "README", "main.rs", "zebra"];
        let mut records = names
            .iter()
            .enumerate()
            .map(|(i, name)| -> Result<_> {
                let key = drec_key(2, name, hashed, fold_case)?;
                let parsed = DirectoryRecordKey::decode(&Bytes::from(key.clone()), hashed)?;
                Ok((parsed.hash(), name.to_string(), key, drec_value(100 + i as u64)?))
            })
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut entries = vec![(inode_key, vec![0u8; 8])];
        entries.extend(records.into_iter().map(|(_, _, key, value)| (key, value)));
        entries.push((drec_key(3, "Makefile", hashed, fold_case)?, drec_value(200)?));

        let root = NodeSpec {
            oid: 7,
            xid: 1,
            root: true,
            level: 0,
            storage: ObjectTypeFlags::Physical,
            subtype: ObjectType::FilesystemTree,
            tree_flags: BTreeFlagsRaw::Physical,
            fixed: None,
            entries,
        };

        let mut blocks = HashMap::new();
        blocks.insert(7, sealed(&root)?);

        Ok(MemoryBlockReader { blocks })
    }
}
