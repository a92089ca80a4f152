// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transparent file compression (decmpfs).

use crate::DiskLayout;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Signature at the start of a compressed data header.
pub const COMPRESSED_DATA_SIGNATURE: [u8; 4] = *b"fpmc";

/// Size of every compressed chunk except the last, when stored in a resource fork.
pub const COMPRESSED_CHUNK_SIZE: usize = 65536;

/// How a compressed file's data is encoded and where it lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum CompressionMethod {
    /// Uncompressed data following the header.
    UncompressedAttribute = 1,
    /// zlib data following the header.
    ZlibAttribute = 3,
    /// zlib chunks in the resource fork.
    ZlibResourceFork = 4,
    /// No stored data; the file is all zeros.
    Sparse = 5,
    /// LZVN data following the header.
    LzvnAttribute = 7,
    /// LZVN chunks in the resource fork.
    LzvnResourceFork = 8,
    UncompressedAttributeV2 = 9,
    UncompressedResourceFork = 10,
    LzfseAttribute = 11,
    LzfseResourceFork = 12,
    #[num_enum(catch_all)]
    Unknown(u32),
}

impl CompressionMethod {
    /// Whether compressed bytes are stored in the resource fork instead of after the header.
    pub fn uses_resource_fork(&self) -> bool {
        matches!(
            self,
            Self::ZlibResourceFork
                | Self::LzvnResourceFork
                | Self::UncompressedResourceFork
                | Self::LzfseResourceFork
        )
    }
}

/// Header of the `com.apple.decmpfs` extended attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, DiskLayout)]
pub struct CompressedDataHeaderRaw {
    /// Always [COMPRESSED_DATA_SIGNATURE].
    pub signature: [u8; 4],
    pub compression_method: u32,
    pub uncompressed_data_size: u64,
}

impl CompressedDataHeaderRaw {
    pub fn method(&self) -> CompressionMethod {
        CompressionMethod::from_primitive(self.compression_method)
    }
}
