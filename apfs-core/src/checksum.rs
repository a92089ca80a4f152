// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checksums protecting on-disk data.

use crate::error::{ApfsError, Result};

const CRC32C_POLYNOMIAL: u32 = 0x82f63b78;

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;

        while bit < 8 {
            crc = if crc & 1 != 0 {
                CRC32C_POLYNOMIAL ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

/// Compute a CRC-32C (Castagnoli) over `buffer` starting from `initial`.
///
/// The value is neither inverted on input nor on output. Callers wanting
/// the conventional CRC-32C pass `!0` and complement the result.
pub fn crc32c(buffer: &[u8], initial: u32) -> u32 {
    buffer.iter().fold(initial, |crc, byte| {
        CRC32C_TABLE[((crc ^ *byte as u32) & 0xff) as usize] ^ (crc >> 8)
    })
}

const FLETCHER_MODULUS: u64 = 0xffffffff;

/// Compute the Fletcher-64 checksum used by APFS objects.
///
/// `initial` seeds the two running sums: the low 32 bits seed the lower
/// sum and the high 32 bits the upper sum. Input is consumed as
/// little-endian 32-bit words so its length must be a multiple of 4.
pub fn fletcher64(buffer: &[u8], initial: u64) -> Result<u64> {
    if buffer.len() % 4 != 0 {
        return Err(ApfsError::InvalidArgument(
            "fletcher64 input length not a multiple of 4",
        ));
    }

    let mut lower = initial & 0xffffffff;
    let mut upper = initial >> 32;

    for word in buffer.chunks_exact(4) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as u64;
        lower = (lower + word) % FLETCHER_MODULUS;
        upper = (upper + lower) % FLETCHER_MODULUS;
    }

    let low = FLETCHER_MODULUS - ((lower + upper) % FLETCHER_MODULUS);
    let high = FLETCHER_MODULUS - ((lower + low) % FLETCHER_MODULUS);

    Ok((high << 32) | low)
}

/// Compute the checksum of an object: Fletcher-64 of everything after the stored checksum.
pub fn object_checksum(block: &[u8]) -> Result<u64> {
    let data = block
        .get(8..)
        .ok_or(ApfsError::InvalidArgument("object shorter than checksum field"))?;

    fletcher64(data, 0)
}

/// Obtain the checksum stored in the first 8 bytes of an object.
pub fn stored_object_checksum(block: &[u8]) -> Result<u64> {
    let mut stored = [0u8; 8];
    stored.copy_from_slice(
        block
            .get(0..8)
            .ok_or(ApfsError::InvalidArgument("object shorter than checksum field"))?,
    );

    Ok(u64::from_le_bytes(stored))
}

/// Verify the stored checksum of an object.
pub fn verify_object_checksum(block: &[u8]) -> Result<()> {
    let stored = stored_object_checksum(block)?;
    let computed = object_checksum(block)?;

    if stored == computed {
        Ok(())
    } else {
        Err(ApfsError::InvalidChecksum { stored, computed })
    }
}

/// Render a message digest as lowercase hex.
pub fn digest_hash_to_string(digest: &[u8]) -> String {
    hex::encode(digest)
}
