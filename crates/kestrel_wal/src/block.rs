//! Transaction block framing.
//!
//! Layout: a fixed 19-byte header — 4-byte magic (plain or compressed),
//! then three msgpack uints (payload length, previous-block CRC32
//! [reserved, written as zero, never validated], this-block CRC32) —
//! zero-padded to the fixed size, followed by the payload. The CRC covers
//! the payload exactly as stored, so validation happens before
//! decompression.

use std::io::Cursor;

use kestrel_common::error::WalError;

/// Magic for an uncompressed block.
pub const BLOCK_MAGIC_PLAIN: [u8; 4] = [0xb1, 0x0c, 0x0b, 0xb0];
/// Magic for a zstd-compressed block.
pub const BLOCK_MAGIC_ZSTD: [u8; 4] = [0xb1, 0x0c, 0x0b, 0xbc];
/// End-of-segment marker.
pub const EOF_MAGIC: [u8; 4] = [0xe0, 0xf0, 0xad, 0x5e];

/// Fixed block header size, including the zero padding.
pub const BLOCK_HEADER_SIZE: usize = 19;

const ZSTD_LEVEL: i32 = 3;

/// Parsed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub compressed: bool,
    pub len: usize,
    pub crc: u32,
}

/// Frame one block: compress the payload when it reaches the threshold
/// (one streaming compressor session per block), checksum, and prepend
/// the fixed header.
pub fn encode_block(payload: &[u8], compress_threshold: usize) -> Result<Vec<u8>, WalError> {
    let (magic, stored): (&[u8; 4], Vec<u8>) = if payload.len() >= compress_threshold {
        let compressed = zstd::stream::encode_all(Cursor::new(payload), ZSTD_LEVEL)
            .map_err(|e| WalError::Compression(e.to_string()))?;
        (&BLOCK_MAGIC_ZSTD, compressed)
    } else {
        (&BLOCK_MAGIC_PLAIN, payload.to_vec())
    };

    let crc = crc32fast::hash(&stored);
    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + stored.len());
    out.extend_from_slice(magic);
    rmp::encode::write_uint(&mut out, stored.len() as u64).expect("write to Vec");
    rmp::encode::write_uint(&mut out, 0).expect("write to Vec"); // reserved: previous CRC
    rmp::encode::write_uint(&mut out, crc as u64).expect("write to Vec");
    debug_assert!(out.len() <= BLOCK_HEADER_SIZE);
    out.resize(BLOCK_HEADER_SIZE, 0);
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Interpret the 4 bytes at `buf` as a block or EOF magic.
/// `None` means the bytes are not any known magic.
pub fn classify_magic(buf: &[u8]) -> Option<Magic> {
    if buf.len() < 4 {
        return None;
    }
    let four: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
    match four {
        BLOCK_MAGIC_PLAIN => Some(Magic::Plain),
        BLOCK_MAGIC_ZSTD => Some(Magic::Zstd),
        EOF_MAGIC => Some(Magic::Eof),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Plain,
    Zstd,
    Eof,
}

/// Decode a fixed-size block header. `buf` must hold at least
/// `BLOCK_HEADER_SIZE` bytes and start at a plain/compressed magic.
pub fn decode_block_header(buf: &[u8], offset: u64) -> Result<BlockHead, WalError> {
    if buf.len() < BLOCK_HEADER_SIZE {
        return Err(WalError::TruncatedHeader { offset });
    }
    let compressed = match classify_magic(buf) {
        Some(Magic::Plain) => false,
        Some(Magic::Zstd) => true,
        _ => return Err(WalError::BadMagic { offset }),
    };
    let mut cur = Cursor::new(&buf[4..BLOCK_HEADER_SIZE]);
    let len = read_uint(&mut cur, offset)?;
    let _prev_crc = read_uint(&mut cur, offset)?; // reserved, ignored
    let crc = read_uint(&mut cur, offset)?;
    Ok(BlockHead {
        compressed,
        len: len as usize,
        crc: crc as u32,
    })
}

fn read_uint(cur: &mut Cursor<&[u8]>, offset: u64) -> Result<u64, WalError> {
    let value = rmpv::decode::read_value(cur)
        .map_err(|_| WalError::TruncatedHeader { offset })?;
    value
        .as_u64()
        .ok_or(WalError::TruncatedHeader { offset })
}

/// Validate and unpack a block body: checksum first (unless `ignore_crc`),
/// then decompress or copy.
pub fn decode_block_body(
    head: &BlockHead,
    body: &[u8],
    ignore_crc: bool,
    offset: u64,
) -> Result<Vec<u8>, WalError> {
    if body.len() < head.len {
        return Err(WalError::TruncatedBody {
            offset,
            need: head.len,
            have: body.len(),
        });
    }
    let stored = &body[..head.len];
    if !ignore_crc {
        let computed = crc32fast::hash(stored);
        if computed != head.crc {
            return Err(WalError::Checksum {
                offset,
                stored: head.crc,
                computed,
            });
        }
    }
    if head.compressed {
        zstd::stream::decode_all(Cursor::new(stored))
            .map_err(|e| WalError::Compression(e.to_string()))
    } else {
        Ok(stored.to_vec())
    }
}
