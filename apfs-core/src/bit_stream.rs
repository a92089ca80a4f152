// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-level reading of byte streams.

use crate::error::{ApfsError, Result};
use log::trace;

/// How bits are packed into the bytes of a [BitStream].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageOrientation {
    /// Each byte is appended below the buffered bits and values come off the top (MSB-first).
    FrontToBack,
    /// Each byte is placed above the buffered bits and values come off the bottom (LSB-first).
    ///
    /// This is the deflate bit order.
    BackToFront,
}

/// Reads values of up to 32 bits from a byte slice.
#[derive(Clone, Debug)]
pub struct BitStream<'a> {
    byte_stream: &'a [u8],
    byte_stream_offset: usize,
    storage_orientation: StorageOrientation,
    bit_buffer: u64,
    bit_buffer_size: usize,
}

impl<'a> BitStream<'a> {
    pub fn new(byte_stream: &'a [u8], storage_orientation: StorageOrientation) -> Self {
        Self {
            byte_stream,
            byte_stream_offset: 0,
            storage_orientation,
            bit_buffer: 0,
            bit_buffer_size: 0,
        }
    }

    /// Offset of the next byte that will be pulled into the bit buffer.
    pub fn byte_offset(&self) -> usize {
        self.byte_stream_offset
    }

    pub fn storage_orientation(&self) -> StorageOrientation {
        self.storage_orientation
    }

    /// Number of bits currently buffered.
    pub fn buffered_bits(&self) -> usize {
        self.bit_buffer_size
    }

    /// Number of bits that can still be read.
    pub fn remaining_bits(&self) -> usize {
        self.bit_buffer_size + 8 * (self.byte_stream.len() - self.byte_stream_offset)
    }

    /// Read the next `n_bits` bits as an integer.
    ///
    /// Nothing is consumed when the request can't be satisfied.
    pub fn get_value(&mut self, n_bits: usize) -> Result<u32> {
        if n_bits > 32 {
            return Err(ApfsError::InvalidArgument("bit count exceeds 32"));
        }
        if n_bits == 0 {
            return Ok(0);
        }

        let available = self.remaining_bits();
        if available < n_bits {
            return Err(ApfsError::BitStreamExhausted {
                requested: n_bits,
                available,
            });
        }

        while self.bit_buffer_size < n_bits {
            let byte = self.byte_stream[self.byte_stream_offset] as u64;
            self.byte_stream_offset += 1;

            match self.storage_orientation {
                StorageOrientation::BackToFront => {
                    self.bit_buffer |= byte << self.bit_buffer_size;
                }
                StorageOrientation::FrontToBack => {
                    self.bit_buffer = (self.bit_buffer << 8) | byte;
                }
            }

            self.bit_buffer_size += 8;
        }

        let mask = (1u64 << n_bits) - 1;
        self.bit_buffer_size -= n_bits;

        let value = match self.storage_orientation {
            StorageOrientation::BackToFront => {
                let value = self.bit_buffer & mask;
                self.bit_buffer >>= n_bits;
                value
            }
            StorageOrientation::FrontToBack => {
                let value = (self.bit_buffer >> self.bit_buffer_size) & mask;
                self.bit_buffer &= (1u64 << self.bit_buffer_size) - 1;
                value
            }
        };

        Ok(value as u32)
    }

    /// Discard buffered bits up to the next byte boundary.
    pub fn skip_to_byte_boundary(&mut self) {
        let partial = self.bit_buffer_size % 8;

        if partial != 0 {
            trace!("bit stream discarding {} bits for alignment", partial);
            match self.storage_orientation {
                StorageOrientation::BackToFront => {
                    self.bit_buffer >>= partial;
                }
                StorageOrientation::FrontToBack => {
                    self.bit_buffer &= (1u64 << (self.bit_buffer_size - partial)) - 1;
                }
            }
            self.bit_buffer_size -= partial;
        }
    }

    /// Read `n` whole bytes after aligning to a byte boundary.
    ///
    /// The stream stays positioned after the returned bytes.
    pub fn read_aligned_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.skip_to_byte_boundary();

        // Return buffered whole bytes to the stream so the slice is contiguous.
        let buffered = self.bit_buffer_size / 8;
        self.byte_stream_offset -= buffered;
        self.bit_buffer = 0;
        self.bit_buffer_size = 0;

        let end = self
            .byte_stream_offset
            .checked_add(n)
            .filter(|end| *end <= self.byte_stream.len())
            .ok_or(ApfsError::BitStreamExhausted {
                requested: n.saturating_mul(8),
                available: 8 * (self.byte_stream.len() - self.byte_stream_offset),
            })?;

        let data = &self.byte_stream[self.byte_stream_offset..end];
        self.byte_stream_offset = end;

        Ok(data)
    }
}
