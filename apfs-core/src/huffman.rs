// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical Huffman codes.

use crate::bit_stream::BitStream;
use crate::error::{ApfsError, Result};
use std::sync::OnceLock;

/// Longest code length a tree may contain.
pub const MAXIMUM_CODE_LENGTH: usize = 15;

/// A canonical Huffman code.
///
/// Stored as the number of codes of each length plus the symbols ordered
/// by (code length, symbol value). Codes of one length are consecutive
/// integers, so a code is decoded by walking those ranges one bit at a time.
#[derive(Clone, Debug)]
pub struct HuffmanTree {
    code_length_counts: [u16; MAXIMUM_CODE_LENGTH + 1],
    symbols: Vec<u16>,
}

impl HuffmanTree {
    /// Build a tree from the code length of each symbol.
    ///
    /// A length of 0 means the symbol is unused. Over-subscribed sets are
    /// rejected. Incomplete sets are accepted.
    pub fn from_code_lengths(code_lengths: &[u8]) -> Result<Self> {
        if code_lengths.len() > u16::MAX as usize {
            return Err(ApfsError::InvalidArgument("too many Huffman symbols"));
        }
        if code_lengths
            .iter()
            .any(|length| *length as usize > MAXIMUM_CODE_LENGTH)
        {
            return Err(ApfsError::Huffman("code length exceeds 15"));
        }

        let tree = Self::build(code_lengths);

        let mut left = 1i32;
        for count in &tree.code_length_counts[1..] {
            left <<= 1;
            left -= *count as i32;

            if left < 0 {
                return Err(ApfsError::Huffman("over-subscribed code lengths"));
            }
        }

        Ok(tree)
    }

    /// Build without validation. Lengths must not exceed [MAXIMUM_CODE_LENGTH].
    fn build(code_lengths: &[u8]) -> Self {
        let mut code_length_counts = [0u16; MAXIMUM_CODE_LENGTH + 1];
        for length in code_lengths {
            code_length_counts[*length as usize] += 1;
        }
        code_length_counts[0] = 0;

        let mut offsets = [0usize; MAXIMUM_CODE_LENGTH + 2];
        for length in 1..=MAXIMUM_CODE_LENGTH {
            offsets[length + 1] = offsets[length] + code_length_counts[length] as usize;
        }

        let mut symbols = vec![0u16; offsets[MAXIMUM_CODE_LENGTH + 1]];
        for (symbol, length) in code_lengths.iter().enumerate() {
            if *length != 0 {
                let slot = &mut offsets[*length as usize];
                symbols[*slot] = symbol as u16;
                *slot += 1;
            }
        }

        Self {
            code_length_counts,
            symbols,
        }
    }

    /// Number of symbols with a code.
    pub fn number_of_codes(&self) -> usize {
        self.symbols.len()
    }

    /// Decode the next symbol from the bit stream.
    pub fn decode(&self, bit_stream: &mut BitStream) -> Result<u16> {
        let mut code = 0i32;
        let mut first = 0i32;
        let mut index = 0i32;

        for count in &self.code_length_counts[1..] {
            code |= bit_stream.get_value(1)? as i32;
            let count = *count as i32;

            if code - first < count {
                return Ok(self.symbols[(index + code - first) as usize]);
            }

            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }

        Err(ApfsError::Huffman("undefined code"))
    }
}

/// The fixed literal/length and distance trees of deflate block type 1.
pub fn fixed_trees() -> &'static (HuffmanTree, HuffmanTree) {
    static TREES: OnceLock<(HuffmanTree, HuffmanTree)> = OnceLock::new();

    TREES.get_or_init(|| {
        let mut literals = [0u8; 288];
        literals[0..144].fill(8);
        literals[144..256].fill(9);
        literals[256..280].fill(7);
        literals[280..288].fill(8);

        // Distance codes 30 and 31 take part in the code but never occur.
        (HuffmanTree::build(&literals), HuffmanTree::build(&[5u8; 32]))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_stream::StorageOrientation;
    use crate::error::ErrorKind;

    #[test]
    fn decode_canonical() -> Result<()> {
        // A=2 B=1 C=3 D=3 gives B=0 A=10 C=110 D=111.
        let tree = HuffmanTree::from_code_lengths(&[2, 1, 3, 3])?;
        assert_eq!(tree.number_of_codes(), 4);

        // Codes are read MSB-first one bit at a time; bits fill each byte
        // from the low end. Sequence: D(111) B(0) A(10) C(110).
        // bit order: 1,1,1,0,1,0,1,1,0 -> byte0 = 0b11010111, byte1 = 0b0.
        let data = [0b1101_0111, 0b0000_0000];
        let mut stream = BitStream::new(&data, StorageOrientation::BackToFront);

        assert_eq!(tree.decode(&mut stream)?, 3);
        assert_eq!(tree.decode(&mut stream)?, 1);
        assert_eq!(tree.decode(&mut stream)?, 0);
        assert_eq!(tree.decode(&mut stream)?, 2);

        Ok(())
    }

    #[test]
    fn over_subscribed() {
        let err = HuffmanTree::from_code_lengths(&[1, 1, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        assert!(HuffmanTree::from_code_lengths(&[16]).is_err());
    }

    #[test]
    fn incomplete_accepted() -> Result<()> {
        // A single distance code of length 1.
        let tree = HuffmanTree::from_code_lengths(&[0, 1])?;

        let mut stream = BitStream::new(&[0b0000_0000], StorageOrientation::BackToFront);
        assert_eq!(tree.decode(&mut stream)?, 1);

        // Code 1 is unused; decoding walks all lengths and fails.
        let mut stream = BitStream::new(&[0xff, 0xff], StorageOrientation::BackToFront);
        assert!(matches!(
            tree.decode(&mut stream),
            Err(ApfsError::Huffman(_))
        ));

        Ok(())
    }

    #[test]
    fn empty_tree() {
        let tree = HuffmanTree::build(&[0u8; 30]);
        let mut stream = BitStream::new(&[0u8; 4], StorageOrientation::BackToFront);
        assert!(tree.decode(&mut stream).is_err());
    }

    #[test]
    fn fixed() -> Result<()> {
        let (literals, distances) = fixed_trees();
        assert_eq!(literals.number_of_codes(), 288);
        assert_eq!(distances.number_of_codes(), 32);

        // End of block is the 7-bit code 0000000.
        let mut stream = BitStream::new(&[0u8], StorageOrientation::BackToFront);
        assert_eq!(literals.decode(&mut stream)?, 256);

        Ok(())
    }
}
