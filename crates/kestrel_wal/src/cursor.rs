//! Forward-reading segment cursor.
//!
//! Two-stage buffering: a raw byte buffer fed by file reads, and a
//! decoded-rows buffer holding one block at a time. `next_tx` loads the
//! next block (validating magic and checksum); `next_row` hands out rows
//! and pulls blocks transparently.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use kestrel_common::error::WalError;
use kestrel_protocol::Row;

use crate::block::{self, Magic, BLOCK_HEADER_SIZE};
use crate::meta::SegmentMeta;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct CursorOptions {
    /// Accept blocks whose checksum does not match (forced recovery of a
    /// damaged file; the decoded rows may be wrong).
    pub ignore_crc: bool,
    /// Skip unrecognized spans by scanning byte-at-a-time for the next
    /// valid magic instead of failing.
    pub force_recovery: bool,
}

pub struct XlogCursor {
    file: File,
    path: PathBuf,
    meta: SegmentMeta,
    opts: CursorOptions,
    raw: Vec<u8>,
    raw_pos: usize,
    /// Absolute file offset of `raw[raw_pos]`.
    offset: u64,
    file_exhausted: bool,
    rows_buf: Vec<u8>,
    rows_pos: usize,
    eof_seen: bool,
}

impl XlogCursor {
    pub fn open(path: &Path, opts: CursorOptions) -> Result<XlogCursor, WalError> {
        let file = File::open(path)?;
        let mut cursor = XlogCursor {
            file,
            path: path.to_path_buf(),
            meta: SegmentMeta::new("LOG", "", Default::default()),
            opts,
            raw: Vec::new(),
            raw_pos: 0,
            offset: 0,
            file_exhausted: false,
            rows_buf: Vec::new(),
            rows_pos: 0,
            eof_seen: false,
        };
        loop {
            match SegmentMeta::parse(cursor.pending())? {
                Some((meta, consumed)) => {
                    cursor.meta = meta;
                    cursor.consume(consumed);
                    break;
                }
                None => {
                    if cursor.refill()? == 0 {
                        return Err(WalError::BadMeta("segment shorter than its header".into()));
                    }
                }
            }
        }
        Ok(cursor)
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pending(&self) -> &[u8] {
        &self.raw[self.raw_pos..]
    }

    fn consume(&mut self, n: usize) {
        self.raw_pos += n;
        self.offset += n as u64;
    }

    fn refill(&mut self) -> Result<usize, WalError> {
        if self.file_exhausted {
            return Ok(0);
        }
        if self.raw_pos > 0 {
            self.raw.drain(..self.raw_pos);
            self.raw_pos = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.file.read(&mut chunk)?;
        if n == 0 {
            self.file_exhausted = true;
        } else {
            self.raw.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Ensure at least `n` unconsumed bytes are buffered; returns the
    /// available count, which is smaller only at end of file.
    fn ensure(&mut self, n: usize) -> Result<usize, WalError> {
        while self.pending().len() < n {
            if self.refill()? == 0 {
                break;
            }
        }
        Ok(self.pending().len())
    }

    /// Load the next transaction block into the rows buffer. Returns
    /// `false` at a clean end of segment: either the EOF marker or, for a
    /// segment that is still being written (or died without closing), the
    /// plain end of file.
    pub fn next_tx(&mut self) -> Result<bool, WalError> {
        if self.eof_seen {
            return Ok(false);
        }
        loop {
            let available = self.ensure(4)?;
            if available == 0 {
                return Ok(false);
            }
            if available < 4 {
                return self.tail_error(WalError::TruncatedHeader { offset: self.offset });
            }
            match block::classify_magic(self.pending()) {
                Some(Magic::Eof) => {
                    self.consume(4);
                    self.ensure(1)?;
                    let trailing = self.pending().len();
                    if trailing > 0 {
                        return Err(WalError::TrailingGarbage { len: trailing });
                    }
                    self.eof_seen = true;
                    return Ok(false);
                }
                Some(Magic::Plain) | Some(Magic::Zstd) => {}
                None => {
                    if self.opts.force_recovery {
                        self.scan_to_magic()?;
                        continue;
                    }
                    return Err(WalError::BadMagic { offset: self.offset });
                }
            }

            let available = self.ensure(BLOCK_HEADER_SIZE)?;
            if available < BLOCK_HEADER_SIZE {
                return self.tail_error(WalError::TruncatedHeader { offset: self.offset });
            }
            let head_offset = self.offset;
            let head = block::decode_block_header(self.pending(), head_offset)?;

            let need = BLOCK_HEADER_SIZE + head.len;
            let available = self.ensure(need)?;
            if available < need {
                return self.tail_error(WalError::TruncatedBody {
                    offset: head_offset,
                    need: head.len,
                    have: available.saturating_sub(BLOCK_HEADER_SIZE),
                });
            }
            let body = &self.raw[self.raw_pos + BLOCK_HEADER_SIZE..self.raw_pos + need];
            match block::decode_block_body(&head, body, self.opts.ignore_crc, head_offset) {
                Ok(rows) => {
                    self.consume(need);
                    self.rows_buf = rows;
                    self.rows_pos = 0;
                    return Ok(true);
                }
                Err(e) => {
                    if self.opts.force_recovery {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "skipping damaged block"
                        );
                        self.consume(need);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Decode one row; loads the next block as needed. `None` at the end
    /// of the segment.
    pub fn next_row(&mut self) -> Result<Option<Row>, WalError> {
        loop {
            if self.rows_pos < self.rows_buf.len() {
                let (row, consumed) = Row::decode(&self.rows_buf[self.rows_pos..])
                    .map_err(|e| WalError::Codec(e.to_string()))?;
                self.rows_pos += consumed;
                return Ok(Some(row));
            }
            if !self.next_tx()? {
                return Ok(None);
            }
        }
    }

    /// Byte-at-a-time resync to the next recognizable magic.
    fn scan_to_magic(&mut self) -> Result<(), WalError> {
        let start = self.offset;
        loop {
            let available = self.ensure(4)?;
            if available < 4 {
                self.consume(available);
                break;
            }
            if block::classify_magic(self.pending()).is_some() {
                break;
            }
            self.consume(1);
        }
        tracing::warn!(
            path = %self.path.display(),
            from = start,
            to = self.offset,
            "skipped corrupted span"
        );
        Ok(())
    }

    /// A truncated tail is an error unless forced recovery is on, in which
    /// case the segment simply ends here.
    fn tail_error(&mut self, err: WalError) -> Result<bool, WalError> {
        if self.opts.force_recovery {
            tracing::warn!(path = %self.path.display(), error = %err, "truncated segment tail");
            self.eof_seen = true;
            return Ok(false);
        }
        Err(err)
    }
}
