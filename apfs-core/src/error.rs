// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use apfs_types::common::VirtualObjectIdentifierRaw;
use apfs_types::ParseError;
use thiserror::Error;

/// Coarse classification of an [ApfsError].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The caller passed an invalid value.
    Argument,
    /// A buffer could not be allocated.
    Memory,
    /// Text could not be decoded.
    Conversion,
    /// Input data is corrupt, truncated or fails verification.
    Input,
    /// The operation is unsupported or cannot run in the current state.
    Runtime,
}

#[derive(Debug, Error)]
pub enum ApfsError {
    #[error("APFS parse error {0}")]
    ApfsParse(#[from] ParseError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("output buffer too small: need {needed} bytes; have {available}")]
    OutputTooSmall { needed: usize, available: usize },
    #[error("unable to allocate {0} bytes")]
    AllocationTooLarge(u64),
    #[error("invalid UTF-8 string data")]
    StringNotUtf8,
    #[error("invalid UTF-16 string data")]
    StringNotUtf16,
    #[error("invalid fletcher64 checksum: stored {stored:#018x}; computed {computed:#018x}")]
    InvalidChecksum { stored: u64, computed: u64 },
    #[error("invalid adler32 checksum: stored {stored:#010x}; computed {computed:#010x}")]
    InvalidAdler32 { stored: u32, computed: u32 },
    #[error("bit stream exhausted: requested {requested} bits; {available} available")]
    BitStreamExhausted { requested: usize, available: usize },
    #[error("invalid Huffman code: {0}")]
    Huffman(&'static str),
    #[error("invalid deflate stream: {0}")]
    Deflate(&'static str),
    #[error("invalid zlib header: {0}")]
    ZlibHeader(&'static str),
    #[error("invalid compressed data: {0}")]
    CompressedData(&'static str),
    #[error("LZFSE/LZVN decoding failed: {0}")]
    Lzfse(String),
    #[error("unexpected object type {actual:#010x}; expected {expected:#010x}")]
    UnexpectedObjectType { expected: u32, actual: u32 },
    #[error("unexpected object subtype {actual:#010x}; expected {expected:#010x}")]
    UnexpectedObjectSubtype { expected: u32, actual: u32 },
    #[error("malformed B-tree node: {0}")]
    BTreeMalformed(&'static str),
    #[error("B-tree node is not a root")]
    BTreeNodeNotRoot,
    #[error("B-tree exceeds maximum depth of {0}")]
    BTreeTooDeep(usize),
    #[error("virtual object id {0} not found")]
    VirtualObjectNotFound(VirtualObjectIdentifierRaw),
    #[error("unsupported compression method {0}")]
    UnsupportedCompressionMethod(u32),
    #[error("volume is locked")]
    VolumeLocked,
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
    #[error("block read error: {0}")]
    BlockRead(#[from] crate::block::BlockReadError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApfsError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::OutputTooSmall { .. } => ErrorKind::Argument,
            Self::AllocationTooLarge(_) => ErrorKind::Memory,
            Self::StringNotUtf8 | Self::StringNotUtf16 => ErrorKind::Conversion,
            Self::ApfsParse(_)
            | Self::InvalidChecksum { .. }
            | Self::InvalidAdler32 { .. }
            | Self::BitStreamExhausted { .. }
            | Self::Huffman(_)
            | Self::Deflate(_)
            | Self::ZlibHeader(_)
            | Self::CompressedData(_)
            | Self::Lzfse(_)
            | Self::UnexpectedObjectType { .. }
            | Self::UnexpectedObjectSubtype { .. }
            | Self::BTreeMalformed(_)
            | Self::BTreeNodeNotRoot
            | Self::BTreeTooDeep(_)
            | Self::VirtualObjectNotFound(_)
            | Self::BlockRead(_)
            | Self::Io(_) => ErrorKind::Input,
            Self::UnsupportedCompressionMethod(_) | Self::VolumeLocked | Self::Unimplemented(_) => {
                ErrorKind::Runtime
            }
        }
    }
}

pub type Result<T, E = ApfsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            ApfsError::InvalidArgument("x").kind(),
            ErrorKind::Argument
        );
        assert_eq!(
            ApfsError::InvalidChecksum {
                stored: 1,
                computed: 2
            }
            .kind(),
            ErrorKind::Input
        );
        assert_eq!(ApfsError::StringNotUtf8.kind(), ErrorKind::Conversion);
        assert_eq!(ApfsError::VolumeLocked.kind(), ErrorKind::Runtime);
        assert_eq!(
            ApfsError::from(ParseError::FieldOutOfBounds { field: "x" }).kind(),
            ErrorKind::Input
        );
    }
}
