// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transparently compressed file data.
//!
//! A compressed file carries a `com.apple.decmpfs` attribute starting with a
//! [CompressedDataHeaderRaw]. Small files store their compressed bytes right
//! after the header. Larger files store 64 KiB chunks in the
//! `com.apple.ResourceFork` attribute behind a table of chunk locations.

use crate::deflate::decompress_zlib;
use crate::error::{ApfsError, Result};
use crate::unlock::VolumeUnlock;
pub use apfs_types::compression::*;
use apfs_types::DiskStruct;
use log::{debug, trace};

/// First byte of a deflate chunk stored without compression.
const ZLIB_RAW_MARKER: u8 = 0xff;

/// First byte of an LZVN chunk stored without compression.
///
/// This is also the LZVN end of stream opcode, which no real stream starts with.
const LZVN_RAW_MARKER: u8 = 0x06;

const LZVN_BLOCK_MAGIC: &[u8; 4] = b"bvxn";
const LZFSE_END_OF_STREAM_MAGIC: &[u8; 4] = b"bvx$";

/// Size of the resource header preceding a zlib resource fork's data.
const RESOURCE_HEADER_SIZE: usize = 16;

/// Parse the compressed data header at the start of `data`.
///
/// Returns `Ok(None)` if the signature doesn't match, meaning the data
/// isn't compressed.
pub fn read_compressed_header(data: &[u8]) -> Result<Option<CompressedDataHeaderRaw>> {
    if data.len() < CompressedDataHeaderRaw::SIZE {
        return Err(ApfsError::InvalidArgument(
            "compressed data header requires 16 bytes",
        ));
    }

    let header = CompressedDataHeaderRaw::decode(data)?;

    if header.signature != COMPRESSED_DATA_SIGNATURE {
        trace!("no compressed data signature: {:02x?}", header.signature);
        return Ok(None);
    }

    debug!(
        "compressed data: method {:?}; {} bytes uncompressed",
        header.method(),
        header.uncompressed_data_size
    );

    Ok(Some(header))
}

fn copy_stored(data: &[u8], out: &mut [u8]) -> usize {
    let count = data.len().min(out.len());
    out[..count].copy_from_slice(&data[..count]);

    count
}

/// Run the external LZFSE decoder.
///
/// The decoder can't tell a full output buffer from one that was too
/// small, so it decodes into a buffer one byte larger than needed.
fn decode_lzfse(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut scratch = vec![0u8; out.len() + 1];

    let written = lzfse::decode_buffer(compressed, &mut scratch)
        .map_err(|e| ApfsError::Lzfse(format!("{:?}", e)))?;

    if written > out.len() {
        return Err(ApfsError::CompressedData(
            "LZFSE data decodes past expected size",
        ));
    }

    out[..written].copy_from_slice(&scratch[..written]);

    Ok(written)
}

/// Decode a raw LZVN stream by framing it as a single LZVN block.
fn decode_lzvn(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    let raw_size = u32::try_from(out.len())
        .map_err(|_| ApfsError::InvalidArgument("LZVN output too large"))?;
    let payload_size = u32::try_from(compressed.len())
        .map_err(|_| ApfsError::InvalidArgument("LZVN input too large"))?;

    let mut framed = Vec::with_capacity(compressed.len() + 16);
    framed.extend_from_slice(LZVN_BLOCK_MAGIC);
    framed.extend_from_slice(&raw_size.to_le_bytes());
    framed.extend_from_slice(&payload_size.to_le_bytes());
    framed.extend_from_slice(compressed);
    framed.extend_from_slice(LZFSE_END_OF_STREAM_MAGIC);

    decode_lzfse(&framed, out)
}

/// Decode one unit of compressed data into `out`.
///
/// At most `uncompressed_size` bytes are produced. Returns the number of
/// bytes written.
pub fn decompress(
    method: CompressionMethod,
    compressed: &[u8],
    uncompressed_size: usize,
    out: &mut [u8],
) -> Result<usize> {
    if out.len() < uncompressed_size {
        return Err(ApfsError::OutputTooSmall {
            needed: uncompressed_size,
            available: out.len(),
        });
    }

    let out = &mut out[..uncompressed_size];

    match method {
        CompressionMethod::UncompressedAttribute
        | CompressionMethod::UncompressedAttributeV2
        | CompressionMethod::UncompressedResourceFork => Ok(copy_stored(compressed, out)),
        CompressionMethod::ZlibAttribute | CompressionMethod::ZlibResourceFork => {
            match compressed.first() {
                Some(&ZLIB_RAW_MARKER) => Ok(copy_stored(&compressed[1..], out)),
                Some(_) => decompress_zlib(compressed, out),
                None => Err(ApfsError::CompressedData("empty deflate data")),
            }
        }
        CompressionMethod::LzvnAttribute | CompressionMethod::LzvnResourceFork => {
            match compressed.first() {
                Some(&LZVN_RAW_MARKER) => Ok(copy_stored(&compressed[1..], out)),
                Some(_) => decode_lzvn(compressed, out),
                None => Err(ApfsError::CompressedData("empty LZVN data")),
            }
        }
        CompressionMethod::LzfseAttribute | CompressionMethod::LzfseResourceFork => {
            decode_lzfse(compressed, out)
        }
        CompressionMethod::Sparse => {
            out.fill(0);
            Ok(out.len())
        }
        CompressionMethod::Unknown(value) => Err(ApfsError::UnsupportedCompressionMethod(value)),
    }
}

/// Bytes `start..start + length` of `data`, failing on overflow or bounds.
fn span<'a>(
    data: &'a [u8],
    start: usize,
    length: usize,
    what: &'static str,
) -> Result<&'a [u8]> {
    start
        .checked_add(length)
        .and_then(|end| data.get(start..end))
        .ok_or(ApfsError::CompressedData(what))
}

fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    let b = span(data, offset, 4, "chunk table out of bounds")?;

    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u32_be(data: &[u8], offset: usize) -> Result<u32> {
    let b = span(data, offset, 4, "resource header out of bounds")?;

    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Locate the compressed chunks of a zlib resource fork.
fn zlib_fork_chunks(fork: &[u8]) -> Result<Vec<&[u8]>> {
    if fork.len() < RESOURCE_HEADER_SIZE {
        return Err(ApfsError::CompressedData("resource fork too small"));
    }

    // The data starts with its own length; the chunk table follows.
    let data_offset = read_u32_be(fork, 0)? as usize;
    let table = data_offset
        .checked_add(4)
        .ok_or(ApfsError::CompressedData("resource data offset overflow"))?;

    let count = read_u32_le(fork, table)? as usize;
    trace!(
        "zlib resource fork: data at {:#x}; {} chunks",
        data_offset,
        count
    );

    (0..count)
        .map(|i| {
            let entry = i
                .checked_mul(8)
                .and_then(|e| e.checked_add(table + 4))
                .ok_or(ApfsError::CompressedData("chunk table out of bounds"))?;
            let offset = read_u32_le(fork, entry)? as usize;
            let size = read_u32_le(fork, entry + 4)? as usize;

            let start = table
                .checked_add(offset)
                .ok_or(ApfsError::CompressedData("chunk out of bounds"))?;
            span(fork, start, size, "chunk out of bounds")
        })
        .collect()
}

/// Locate the compressed chunks of an LZVN, LZFSE or uncompressed resource fork.
fn offset_table_chunks(fork: &[u8]) -> Result<Vec<&[u8]>> {
    // The first offset points just past the table.
    let table_size = read_u32_le(fork, 0)? as usize;
    if table_size < 8 || table_size % 4 != 0 {
        return Err(ApfsError::CompressedData("invalid chunk offset table size"));
    }

    let offsets = (0..table_size / 4)
        .map(|i| read_u32_le(fork, i * 4).map(|o| o as usize))
        .collect::<Result<Vec<_>>>()?;
    trace!("resource fork chunk offsets: {:?}", offsets);

    offsets
        .windows(2)
        .map(|pair| {
            if pair[0] > pair[1] {
                return Err(ApfsError::CompressedData("chunk offsets not ascending"));
            }

            fork.get(pair[0]..pair[1])
                .ok_or(ApfsError::CompressedData("chunk out of bounds"))
        })
        .collect()
}

/// Allocate the output buffer for a file's data.
fn allocate(size: u64) -> Result<Vec<u8>> {
    let length = usize::try_from(size).map_err(|_| ApfsError::AllocationTooLarge(size))?;

    let mut data = Vec::new();
    data.try_reserve_exact(length)
        .map_err(|_| ApfsError::AllocationTooLarge(size))?;
    data.resize(length, 0);

    Ok(data)
}

/// A file whose data is transparently compressed.
#[derive(Clone, Debug)]
pub struct CompressedFile<'a> {
    header: CompressedDataHeaderRaw,
    inline: &'a [u8],
}

impl<'a> CompressedFile<'a> {
    /// Interpret a `com.apple.decmpfs` attribute value.
    ///
    /// Returns `Ok(None)` if the attribute doesn't describe compressed data.
    pub fn from_attribute(decmpfs: &'a [u8]) -> Result<Option<Self>> {
        Ok(read_compressed_header(decmpfs)?.map(|header| Self {
            header,
            inline: &decmpfs[CompressedDataHeaderRaw::SIZE..],
        }))
    }

    pub fn header(&self) -> &CompressedDataHeaderRaw {
        &self.header
    }

    pub fn method(&self) -> CompressionMethod {
        self.header.method()
    }

    /// Size of the file's data after decompression.
    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_data_size
    }

    /// Decode the whole file.
    ///
    /// `resource_fork` is the `com.apple.ResourceFork` attribute value and
    /// is required by methods storing data there.
    pub fn decompress(
        &self,
        resource_fork: Option<&[u8]>,
        unlock: &impl VolumeUnlock,
    ) -> Result<Vec<u8>> {
        unlock.ensure_unlocked()?;

        let method = self.method();
        if let CompressionMethod::Unknown(value) = method {
            return Err(ApfsError::UnsupportedCompressionMethod(value));
        }

        let mut data = allocate(self.uncompressed_size())?;

        if !method.uses_resource_fork() {
            let written = decompress(method, self.inline, data.len(), &mut data)?;
            if written != data.len() {
                return Err(ApfsError::CompressedData(
                    "inline data decodes to unexpected size",
                ));
            }

            return Ok(data);
        }

        let fork = resource_fork.ok_or(ApfsError::CompressedData(
            "compressed data requires a resource fork",
        ))?;

        let chunks = if method == CompressionMethod::ZlibResourceFork {
            zlib_fork_chunks(fork)?
        } else {
            offset_table_chunks(fork)?
        };

        let expected_chunks = data.len().div_ceil(COMPRESSED_CHUNK_SIZE);
        if chunks.len() != expected_chunks {
            return Err(ApfsError::CompressedData(
                "chunk count doesn't match uncompressed size",
            ));
        }

        for (index, (chunk, out)) in chunks
            .iter()
            .zip(data.chunks_mut(COMPRESSED_CHUNK_SIZE))
            .enumerate()
        {
            trace!(
                "decoding chunk {}: {} -> {} bytes",
                index,
                chunk.len(),
                out.len()
            );

            let expected = out.len();
            if decompress(method, chunk, expected, out)? != expected {
                return Err(ApfsError::CompressedData(
                    "chunk decodes to unexpected size",
                ));
            }
        }

        Ok(data)
    }

    /// Decode a compressed file from its attributes.
    ///
    /// The unlock state is checked before anything is decoded. Returns
    /// `Ok(None)` if `decmpfs` doesn't describe compressed data.
    pub fn decompress_all(
        decmpfs: &[u8],
        resource_fork: Option<&[u8]>,
        unlock: &impl VolumeUnlock,
    ) -> Result<Option<Vec<u8>>> {
        unlock.ensure_unlocked()?;

        match CompressedFile::from_attribute(decmpfs)? {
            Some(file) => Ok(Some(file.decompress(resource_fork, unlock)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::unlock::testutil::PasswordVolume;
    use crate::unlock::UnencryptedVolume;
    use flate2::{write::ZlibEncoder, Compression};
    use std::io::Write;

    const LZVN_TEXT: &[u8] = b"My compressed file\n";

    /// A large literal run followed by the end of stream opcode.
    const LZVN_FIXTURE: [u8; 29] = [
        0xe0, 0x03, b'M', b'y', b' ', b'c', b'o', b'm', b'p', b'r', b'e', b's', b's', b'e', b'd',
        b' ', b'f', b'i', b'l', b'e', b'\n', 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    fn header(method: u32, size: u64) -> Vec<u8> {
        let mut data = b"fpmc".to_vec();
        data.extend_from_slice(&method.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data
    }

    fn zlib(data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;

        Ok(encoder.finish()?)
    }

    fn lzfse_encode(data: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; data.len() + 4096];
        let size = lzfse::encode_buffer(data, &mut out)
            .map_err(|e| ApfsError::Lzfse(format!("{:?}", e)))?;
        out.truncate(size);

        Ok(out)
    }

    /// Text that compresses but isn't trivially repetitive.
    fn sample(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| b"abcdefghijklmnopqrstuvwxyz0123456789 \n"[(i * 7 + i / 91) % 38])
            .collect()
    }

    #[test]
    fn header_detection() -> Result<()> {
        let err = read_compressed_header(b"fpmc\x01").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);

        assert!(read_compressed_header(&[0u8; 16])?.is_none());

        let parsed = read_compressed_header(&header(7, 19))?
            .ok_or(ApfsError::InvalidArgument("missing header"))?;
        assert_eq!(parsed.method(), CompressionMethod::LzvnAttribute);
        assert_eq!(parsed.uncompressed_data_size, 19);

        Ok(())
    }

    #[test]
    fn lzvn_fixture() -> Result<()> {
        let mut out = [0u8; 19];
        let written = decompress(CompressionMethod::LzvnAttribute, &LZVN_FIXTURE, 19, &mut out)?;
        assert_eq!(written, 19);
        assert_eq!(&out, LZVN_TEXT);

        Ok(())
    }

    #[test]
    fn raw_markers() -> Result<()> {
        let mut stored = vec![LZVN_RAW_MARKER];
        stored.extend_from_slice(LZVN_TEXT);
        let mut out = [0u8; 19];
        assert_eq!(
            decompress(CompressionMethod::LzvnResourceFork, &stored, 19, &mut out)?,
            19
        );
        assert_eq!(&out, LZVN_TEXT);

        let mut stored = vec![ZLIB_RAW_MARKER];
        stored.extend_from_slice(b"plain");
        let mut out = [0u8; 5];
        assert_eq!(
            decompress(CompressionMethod::ZlibAttribute, &stored, 5, &mut out)?,
            5
        );
        assert_eq!(&out, b"plain");

        Ok(())
    }

    #[test]
    fn zlib_attribute() -> Result<()> {
        let data = sample(3000);
        let compressed = zlib(&data)?;

        let mut out = vec![0u8; 3000];
        assert_eq!(
            decompress(CompressionMethod::ZlibAttribute, &compressed, 3000, &mut out)?,
            3000
        );
        assert_eq!(out, data);

        Ok(())
    }

    #[test]
    fn lzfse_attribute() -> Result<()> {
        let data = sample(5000);
        let compressed = lzfse_encode(&data)?;

        let mut out = vec![0u8; 5000];
        assert_eq!(
            decompress(CompressionMethod::LzfseAttribute, &compressed, 5000, &mut out)?,
            5000
        );
        assert_eq!(out, data);

        Ok(())
    }

    #[test]
    fn store_and_sparse() -> Result<()> {
        let mut out = [0xaau8; 4];
        assert_eq!(
            decompress(CompressionMethod::UncompressedAttribute, b"abcd", 4, &mut out)?,
            4
        );
        assert_eq!(&out, b"abcd");

        let mut out = [0xaau8; 6];
        assert_eq!(decompress(CompressionMethod::Sparse, &[], 4, &mut out)?, 4);
        assert_eq!(out, [0, 0, 0, 0, 0xaa, 0xaa]);

        Ok(())
    }

    #[test]
    fn output_too_small_writes_nothing() {
        let mut out = [0xaau8; 3];
        let err =
            decompress(CompressionMethod::UncompressedAttribute, b"abcd", 4, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(out, [0xaa; 3]);
    }

    #[test]
    fn unknown_method() {
        let mut out = [0u8; 4];
        let err = decompress(CompressionMethod::Unknown(2), b"abcd", 4, &mut out).unwrap_err();
        assert!(matches!(err, ApfsError::UnsupportedCompressionMethod(2)));
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn inline_file() -> Result<()> {
        let mut decmpfs = header(7, 19);
        decmpfs.extend_from_slice(&LZVN_FIXTURE);

        let data = CompressedFile::decompress_all(&decmpfs, None, &UnencryptedVolume)?
            .ok_or(ApfsError::InvalidArgument("not compressed"))?;
        assert_eq!(data, LZVN_TEXT);

        assert!(CompressedFile::decompress_all(b"not a decmpfs attr", None, &UnencryptedVolume)?
            .is_none());

        Ok(())
    }

    #[test]
    fn locked_volume() {
        let mut decmpfs = header(7, 19);
        decmpfs.extend_from_slice(&LZVN_FIXTURE);

        let volume = PasswordVolume {
            password: "secret",
            locked: true,
        };

        let err = CompressedFile::decompress_all(&decmpfs, None, &volume).unwrap_err();
        assert!(matches!(err, ApfsError::VolumeLocked));
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    /// Build a zlib resource fork holding `chunks`.
    fn zlib_fork(chunks: &[Vec<u8>]) -> Vec<u8> {
        const DATA_OFFSET: usize = 0x100;

        let mut table = (chunks.len() as u32).to_le_bytes().to_vec();
        let mut offset = 4 + chunks.len() * 8;
        for chunk in chunks {
            table.extend_from_slice(&(offset as u32).to_le_bytes());
            table.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            offset += chunk.len();
        }
        for chunk in chunks {
            table.extend_from_slice(chunk);
        }

        let mut fork = vec![0u8; DATA_OFFSET];
        fork[0..4].copy_from_slice(&(DATA_OFFSET as u32).to_be_bytes());
        fork[8..12].copy_from_slice(&(table.len() as u32 + 4).to_be_bytes());
        fork.extend_from_slice(&(table.len() as u32).to_be_bytes());
        fork.extend_from_slice(&table);
        fork
    }

    /// Build an offset table resource fork holding `chunks`.
    fn offset_fork(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut offset = 4 * (chunks.len() + 1);
        let mut fork = (offset as u32).to_le_bytes().to_vec();
        for chunk in chunks {
            offset += chunk.len();
            fork.extend_from_slice(&(offset as u32).to_le_bytes());
        }
        for chunk in chunks {
            fork.extend_from_slice(chunk);
        }
        fork
    }

    #[test]
    fn zlib_resource_fork() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let data = sample(150_000);
        let mut chunks = data
            .chunks(COMPRESSED_CHUNK_SIZE)
            .map(zlib)
            .collect::<Result<Vec<_>>>()?;

        // Incompressible chunks are stored behind a marker byte.
        let mut stored = vec![ZLIB_RAW_MARKER];
        stored.extend_from_slice(&data[COMPRESSED_CHUNK_SIZE..2 * COMPRESSED_CHUNK_SIZE]);
        chunks[1] = stored;

        let fork = zlib_fork(&chunks);
        let decmpfs = header(4, data.len() as u64);

        let decoded = CompressedFile::decompress_all(&decmpfs, Some(&fork), &UnencryptedVolume)?
            .ok_or(ApfsError::InvalidArgument("not compressed"))?;
        assert_eq!(decoded.len(), data.len());
        assert!(decoded == data);

        Ok(())
    }

    #[test]
    fn lzfse_resource_fork() -> Result<()> {
        let data = sample(2 * COMPRESSED_CHUNK_SIZE + 17);
        let chunks = data
            .chunks(COMPRESSED_CHUNK_SIZE)
            .map(lzfse_encode)
            .collect::<Result<Vec<_>>>()?;

        let fork = offset_fork(&chunks);
        let file_header = header(12, data.len() as u64);
        let file = CompressedFile::from_attribute(&file_header)?
            .ok_or(ApfsError::InvalidArgument("not compressed"))?;
        assert_eq!(file.method(), CompressionMethod::LzfseResourceFork);

        let decoded = file.decompress(Some(&fork), &UnencryptedVolume)?;
        assert!(decoded == data);

        Ok(())
    }

    #[test]
    fn resource_fork_errors() -> Result<()> {
        let data = sample(COMPRESSED_CHUNK_SIZE + 1);
        let chunks = data
            .chunks(COMPRESSED_CHUNK_SIZE)
            .map(lzfse_encode)
            .collect::<Result<Vec<_>>>()?;
        let fork = offset_fork(&chunks);

        let file_header = header(12, data.len() as u64);
        let file = CompressedFile::from_attribute(&file_header)?
            .ok_or(ApfsError::InvalidArgument("not compressed"))?;

        assert!(matches!(
            file.decompress(None, &UnencryptedVolume),
            Err(ApfsError::CompressedData(_))
        ));

        // One chunk short of what the size requires.
        let short = offset_fork(&chunks[..1]);
        assert!(matches!(
            file.decompress(Some(&short), &UnencryptedVolume),
            Err(ApfsError::CompressedData(_))
        ));

        // Table pointing past the end of the fork.
        let truncated = &fork[..fork.len() - 10];
        assert!(matches!(
            file.decompress(Some(truncated), &UnencryptedVolume),
            Err(ApfsError::CompressedData(_))
        ));

        Ok(())
    }

    #[test]
    fn hostile_zlib_chunk_table() -> Result<()> {
        let file_header = header(4, 10);
        let file = CompressedFile::from_attribute(&file_header)?
            .ok_or(ApfsError::InvalidArgument("not compressed"))?;

        let decode = |fork: &[u8]| file.decompress(Some(fork), &UnencryptedVolume);

        // Data offset at the top of the address range.
        let mut fork = vec![0u8; RESOURCE_HEADER_SIZE];
        fork[0..4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&fork), Err(ApfsError::CompressedData(_))));

        // Maximal chunk count, offset and size.
        let mut fork = vec![0u8; 0x100];
        fork[0..4].copy_from_slice(&0x100u32.to_be_bytes());
        fork.extend_from_slice(&[0u8; 4]);
        fork.extend_from_slice(&u32::MAX.to_le_bytes());
        fork.extend_from_slice(&u32::MAX.to_le_bytes());
        fork.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&fork), Err(ApfsError::CompressedData(_))));

        assert!(matches!(
            span(&fork, usize::MAX - 1, 4, "overflow"),
            Err(ApfsError::CompressedData("overflow"))
        ));

        Ok(())
    }
}
