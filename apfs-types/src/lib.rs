// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! APFS on-disk data structures.
//!
//! This crate defines the plain data structures stored on disk by the Apple
//! File System. It has no I/O and no behavior beyond decoding (and, for
//! tests, encoding) the byte layouts.
//!
//! Every structure implements [DiskStruct]. Its [DiskStruct::FIELDS] table
//! records each field's name, byte offset and width. Decoding slices the
//! input with that table, so the table is the single source of truth for
//! the binary contract. All integers are little-endian.

#![no_std]

#[cfg(any(test, feature = "encode"))]
extern crate alloc;

pub mod btree;
pub mod chunk_info;
pub mod common;
pub mod compression;
pub mod filesystem;
pub mod object;
pub mod object_map;

pub use apfs_derive::DiskLayout;

use core::fmt::{Display, Formatter};

/// Error when decoding or encoding an on-disk structure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The input buffer is shorter than the structure.
    InputTooSmall { needed: usize, available: usize },
    /// A field table entry lies outside the structure.
    FieldOutOfBounds { field: &'static str },
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InputTooSmall { needed, available } => f.write_fmt(format_args!(
                "input too small: need {} bytes; have {}",
                needed, available
            )),
            Self::FieldOutOfBounds { field } => {
                f.write_fmt(format_args!("field {} out of bounds", field))
            }
        }
    }
}

impl core::error::Error for ParseError {}

/// Fail unless `available` bytes can hold `needed` bytes.
pub fn ensure_len(available: usize, needed: usize) -> Result<(), ParseError> {
    if available < needed {
        Err(ParseError::InputTooSmall { needed, available })
    } else {
        Ok(())
    }
}

/// An entry in a structure's field table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldSpec {
    /// Field name as declared on the Rust struct.
    pub name: &'static str,
    /// Byte offset from the start of the structure.
    pub offset: usize,
    /// Width of the field in bytes.
    pub width: usize,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    /// The byte offset just past this field.
    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    /// Obtain the bytes backing this field.
    pub fn slice<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], ParseError> {
        data.get(self.offset..self.end())
            .ok_or(ParseError::FieldOutOfBounds { field: self.name })
    }

    /// Obtain the mutable bytes backing this field.
    pub fn slice_mut<'a>(&self, data: &'a mut [u8]) -> Result<&'a mut [u8], ParseError> {
        data.get_mut(self.offset..self.end())
            .ok_or(ParseError::FieldOutOfBounds { field: self.name })
    }
}

/// A data structure with a fixed on-disk layout.
pub trait DiskStruct: Sized {
    /// Size of the structure on disk, in bytes.
    const SIZE: usize;

    /// Field table describing the on-disk layout.
    const FIELDS: &'static [FieldSpec];

    /// Decode an instance from the leading bytes of `data`.
    ///
    /// Trailing bytes beyond [Self::SIZE] are ignored.
    fn decode(data: &[u8]) -> Result<Self, ParseError>;

    /// Look up a field table entry by name.
    fn field(name: &str) -> Option<&'static FieldSpec> {
        Self::FIELDS.iter().find(|f| f.name == name)
    }
}

/// Serialization of a [DiskStruct] back to its on-disk form.
///
/// Only available to tests and to consumers enabling the `encode` feature.
#[cfg(any(test, feature = "encode"))]
pub trait DiskStructEncode: DiskStruct {
    /// Write the structure to the leading bytes of `out`.
    fn encode(&self, out: &mut [u8]) -> Result<(), ParseError>;
}

macro_rules! disk_struct_int {
    ($($ty:ty),*) => {
        $(
            impl DiskStruct for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();
                const FIELDS: &'static [FieldSpec] = &[FieldSpec::new("value", 0, Self::SIZE)];

                fn decode(data: &[u8]) -> Result<Self, ParseError> {
                    ensure_len(data.len(), Self::SIZE)?;

                    let mut buf = [0u8; core::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&data[..Self::SIZE]);

                    Ok(<$ty>::from_le_bytes(buf))
                }
            }

            #[cfg(any(test, feature = "encode"))]
            impl DiskStructEncode for $ty {
                fn encode(&self, out: &mut [u8]) -> Result<(), ParseError> {
                    ensure_len(out.len(), Self::SIZE)?;
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());

                    Ok(())
                }
            }
        )*
    };
}

disk_struct_int!(u8, u16, u32, u64, i64);

impl<const N: usize> DiskStruct for [u8; N] {
    const SIZE: usize = N;
    const FIELDS: &'static [FieldSpec] = &[FieldSpec::new("bytes", 0, N)];

    fn decode(data: &[u8]) -> Result<Self, ParseError> {
        ensure_len(data.len(), N)?;

        let mut buf = [0u8; N];
        buf.copy_from_slice(&data[..N]);

        Ok(buf)
    }
}

#[cfg(any(test, feature = "encode"))]
impl<const N: usize> DiskStructEncode for [u8; N] {
    fn encode(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(out.len(), N)?;
        out[..N].copy_from_slice(self);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_little_endian() -> Result<(), ParseError> {
        assert_eq!(u32::decode(&[0x78, 0x56, 0x34, 0x12, 0xff])?, 0x12345678);

        let mut out = [0u8; 8];
        0x0102030405060708u64.encode(&mut out)?;
        assert_eq!(out, [8, 7, 6, 5, 4, 3, 2, 1]);

        assert_eq!(
            u64::decode(&[1, 2, 3]),
            Err(ParseError::InputTooSmall {
                needed: 8,
                available: 3
            })
        );

        Ok(())
    }

    #[test]
    fn field_spec_bounds() {
        let spec = FieldSpec::new("x", 4, 4);
        assert_eq!(spec.slice(&[0u8; 8]).map(|s| s.len()), Ok(4));
        assert_eq!(
            spec.slice(&[0u8; 7]),
            Err(ParseError::FieldOutOfBounds { field: "x" })
        );
    }
}
