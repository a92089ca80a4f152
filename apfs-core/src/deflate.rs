// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deflate (RFC 1951) and zlib (RFC 1950) decompression.
//!
//! Output is written into a caller supplied buffer. Back-references copy
//! from earlier in that same buffer, so no separate window is kept.
//! Decoding stops at the end of the final block or once the buffer is
//! full, whichever happens first.

use crate::bit_stream::{BitStream, StorageOrientation};
use crate::error::{ApfsError, Result};
use crate::huffman::{fixed_trees, HuffmanTree};
use log::{trace, warn};

const LENGTH_BASES: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

const DISTANCE_BASES: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

const DISTANCE_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// Order in which code length code lengths are stored in a dynamic block header.
const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

const END_OF_BLOCK: u16 = 256;

/// Result of running the block decoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Inflated {
    /// Bytes written to the output buffer.
    written: usize,
    /// Whether the final block was fully decoded.
    complete: bool,
}

/// Tracks the write position in the output buffer.
struct Output<'a> {
    data: &'a mut [u8],
    offset: usize,
}

impl<'a> Output<'a> {
    fn is_full(&self) -> bool {
        self.offset == self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn push(&mut self, byte: u8) {
        self.data[self.offset] = byte;
        self.offset += 1;
    }

    /// Copy bytes from `distance` back, truncated to the free space.
    ///
    /// Overlapping copies repeat the pattern, so this goes byte by byte.
    fn copy_back(&mut self, distance: usize, length: usize) -> Result<()> {
        if distance > self.offset {
            return Err(ApfsError::Deflate("distance exceeds output produced"));
        }

        for _ in 0..length.min(self.remaining()) {
            self.data[self.offset] = self.data[self.offset - distance];
            self.offset += 1;
        }

        Ok(())
    }
}

/// Compute the Adler-32 checksum of data.
pub fn adler32(data: &[u8]) -> u32 {
    const MODULUS: u32 = 65521;
    // Largest run whose sums can't overflow a u32 between reductions.
    const RUN: usize = 5552;

    let mut a = 1u32;
    let mut b = 0u32;

    for run in data.chunks(RUN) {
        for byte in run {
            a += *byte as u32;
            b += a;
        }

        a %= MODULUS;
        b %= MODULUS;
    }

    (b << 16) | a
}

fn read_stored_block(stream: &mut BitStream, out: &mut Output) -> Result<bool> {
    let header = stream.read_aligned_bytes(4)?;
    let length = u16::from_le_bytes([header[0], header[1]]);
    let inverse = u16::from_le_bytes([header[2], header[3]]);

    if length != !inverse {
        return Err(ApfsError::Deflate("stored block length mismatch"));
    }

    let data = stream.read_aligned_bytes(length as usize)?;
    let count = data.len().min(out.remaining());
    out.data[out.offset..out.offset + count].copy_from_slice(&data[..count]);
    out.offset += count;

    Ok(count == data.len())
}

fn read_dynamic_trees(stream: &mut BitStream) -> Result<(HuffmanTree, HuffmanTree)> {
    let literal_codes = stream.get_value(5)? as usize + 257;
    let distance_codes = stream.get_value(5)? as usize + 1;
    let code_length_codes = stream.get_value(4)? as usize + 4;

    if literal_codes > 286 {
        return Err(ApfsError::Deflate("too many literal/length codes"));
    }
    if distance_codes > 30 {
        return Err(ApfsError::Deflate("too many distance codes"));
    }

    let mut code_length_lengths = [0u8; 19];
    for index in CODE_LENGTH_ORDER.iter().take(code_length_codes) {
        code_length_lengths[*index] = stream.get_value(3)? as u8;
    }
    let code_length_tree = HuffmanTree::from_code_lengths(&code_length_lengths)?;

    let total = literal_codes + distance_codes;
    let mut lengths = [0u8; 286 + 30];
    let mut index = 0;

    while index < total {
        let symbol = code_length_tree.decode(stream)?;

        let (value, repeat) = match symbol {
            0..=15 => (symbol as u8, 1),
            16 => {
                if index == 0 {
                    return Err(ApfsError::Deflate("repeat with no previous length"));
                }
                (lengths[index - 1], 3 + stream.get_value(2)? as usize)
            }
            17 => (0, 3 + stream.get_value(3)? as usize),
            18 => (0, 11 + stream.get_value(7)? as usize),
            _ => return Err(ApfsError::Deflate("invalid code length symbol")),
        };

        if index + repeat > total {
            return Err(ApfsError::Deflate("code lengths overrun"));
        }

        lengths[index..index + repeat].fill(value);
        index += repeat;
    }

    if lengths[END_OF_BLOCK as usize] == 0 {
        return Err(ApfsError::Deflate("missing end-of-block code"));
    }

    let literals = HuffmanTree::from_code_lengths(&lengths[..literal_codes])?;
    let distances = HuffmanTree::from_code_lengths(&lengths[literal_codes..total])?;

    Ok((literals, distances))
}

/// Decode one Huffman coded block. Returns false if the output filled first.
fn read_huffman_block(
    stream: &mut BitStream,
    out: &mut Output,
    literals: &HuffmanTree,
    distances: &HuffmanTree,
) -> Result<bool> {
    loop {
        let symbol = literals.decode(stream)?;

        if symbol == END_OF_BLOCK {
            return Ok(true);
        }
        if out.is_full() {
            return Ok(false);
        }

        if symbol < END_OF_BLOCK {
            out.push(symbol as u8);
            continue;
        }

        let index = (symbol - 257) as usize;
        if index >= LENGTH_BASES.len() {
            return Err(ApfsError::Deflate("invalid literal/length symbol"));
        }
        let length = LENGTH_BASES[index] as usize
            + stream.get_value(LENGTH_EXTRA_BITS[index] as usize)? as usize;

        let index = distances.decode(stream)? as usize;
        if index >= DISTANCE_BASES.len() {
            return Err(ApfsError::Deflate("invalid distance symbol"));
        }
        let distance = DISTANCE_BASES[index] as usize
            + stream.get_value(DISTANCE_EXTRA_BITS[index] as usize)? as usize;

        out.copy_back(distance, length)?;
    }
}

fn inflate(stream: &mut BitStream, data: &mut [u8]) -> Result<Inflated> {
    let mut out = Output { data, offset: 0 };

    loop {
        let last_block = stream.get_value(1)? == 1;
        let block_type = stream.get_value(2)?;
        trace!(
            "deflate block type {} (final: {}) at output offset {}",
            block_type,
            last_block,
            out.offset
        );

        let finished = match block_type {
            0 => read_stored_block(stream, &mut out)?,
            1 => {
                let (literals, distances) = fixed_trees();
                read_huffman_block(stream, &mut out, literals, distances)?
            }
            2 => {
                let (literals, distances) = read_dynamic_trees(stream)?;
                read_huffman_block(stream, &mut out, &literals, &distances)?
            }
            _ => return Err(ApfsError::Deflate("invalid block type")),
        };

        if !finished {
            return Ok(Inflated {
                written: out.offset,
                complete: false,
            });
        }

        if last_block {
            return Ok(Inflated {
                written: out.offset,
                complete: true,
            });
        }
    }
}

/// Decompress a raw deflate stream into `out`.
///
/// Returns the number of bytes written.
pub fn decompress(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut stream = BitStream::new(compressed, StorageOrientation::BackToFront);

    Ok(inflate(&mut stream, out)?.written)
}

fn read_zlib_header(stream: &mut BitStream) -> Result<()> {
    let header = stream.read_aligned_bytes(2)?;
    let (cmf, flg) = (header[0], header[1]);

    if cmf & 0x0f != 8 {
        return Err(ApfsError::ZlibHeader("unsupported compression method"));
    }
    if cmf >> 4 > 7 {
        return Err(ApfsError::ZlibHeader("window size too large"));
    }
    if ((cmf as u16) << 8 | flg as u16) % 31 != 0 {
        return Err(ApfsError::ZlibHeader("header check failed"));
    }
    if flg & 0x20 != 0 {
        return Err(ApfsError::ZlibHeader("preset dictionary not supported"));
    }

    Ok(())
}

/// Decompress a zlib wrapped deflate stream into `out`.
///
/// The Adler-32 trailer is verified when the final block was reached.
pub fn decompress_zlib(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut stream = BitStream::new(compressed, StorageOrientation::BackToFront);
    read_zlib_header(&mut stream)?;

    let inflated = inflate(&mut stream, out)?;

    if inflated.complete {
        let trailer = stream.read_aligned_bytes(4)?;
        let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = adler32(&out[..inflated.written]);

        if stored != computed {
            return Err(ApfsError::InvalidAdler32 { stored, computed });
        }
    } else {
        warn!(
            "zlib output buffer filled after {} bytes; trailer not verified",
            inflated.written
        );
    }

    Ok(inflated.written)
}
