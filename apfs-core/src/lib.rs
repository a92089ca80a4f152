// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object resolution and data integrity for Apple File System containers.
//!
//! Blocks are read through a [block::BlockReader] and every object is
//! checksum-verified before use. Virtual objects are located through the
//! copy-on-write object map ([object_map::ObjectResolver]). Compressed file
//! data is decoded by [compression], and directory entries are found with
//! the name comparison rules in [name].

pub mod bit_stream;
pub mod block;
pub mod btree;
pub mod checksum;
pub mod chunk_info;
pub mod compression;
pub mod config;
pub mod deflate;
pub mod error;
pub mod huffman;
pub mod name;
pub mod object {
    pub use apfs_types::object::*;
}
pub mod object_map;
pub mod unlock;

pub use apfs_types::common;
pub use apfs_types::{DiskStruct, ParseError};
pub use error::{ApfsError, ErrorKind, Result};
