//! Segment writer.
//!
//! Rows accumulate in a transaction buffer and are framed into one block
//! per commit boundary. A new segment is created under an `.inprogress`
//! suffix and renamed only once the metadata header is durable, so a
//! crash can never leave a half-named segment that recovery would trust.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use kestrel_common::error::WalError;
use kestrel_protocol::Row;

use crate::block::{encode_block, EOF_MAGIC};
use crate::meta::SegmentMeta;

/// Suffix for segments whose header is not yet durable.
pub const INPROGRESS_SUFFIX: &str = "inprogress";

#[derive(Debug, Clone, Copy)]
pub struct XlogWriterOptions {
    /// Payloads at/above this size are compressed.
    pub compress_threshold: usize,
    /// Flush the transaction buffer eagerly once it exceeds this, even
    /// inside an explicit transaction.
    pub autocommit_flush_bytes: usize,
    /// fsync after this many newly flushed bytes.
    pub sync_interval_bytes: u64,
}

impl Default for XlogWriterOptions {
    fn default() -> Self {
        Self {
            compress_threshold: 2 * 1024,
            autocommit_flush_bytes: 128 * 1024,
            sync_interval_bytes: 512 * 1024,
        }
    }
}

pub struct XlogWriter {
    file: File,
    path: PathBuf,
    /// Set while the file still carries the `.inprogress` name; `close`
    /// renames it to this final path.
    rename_on_close: Option<PathBuf>,
    meta: SegmentMeta,
    opts: XlogWriterOptions,
    /// Encoded rows waiting for the next block flush.
    tx_buf: Vec<u8>,
    in_tx: bool,
    /// Rows currently sitting in `tx_buf`.
    buffered_rows: u64,
    /// End of the last fully written block; truncation target on error.
    good_offset: u64,
    synced_offset: u64,
    since_sync: u64,
    rows_written: u64,
    closed: bool,
}

impl XlogWriter {
    /// Create a segment at `path`. The file is written under an
    /// `.inprogress` name and renamed once the header is on disk.
    pub fn create(
        path: &Path,
        meta: SegmentMeta,
        opts: XlogWriterOptions,
    ) -> Result<XlogWriter, WalError> {
        let mut writer = Self::create_inprogress(path, meta, opts)?;
        writer.file.sync_all()?;
        std::fs::rename(&writer.path, path)?;
        writer.path = path.to_path_buf();
        writer.rename_on_close = None;
        Ok(writer)
    }

    /// Create a segment that keeps its `.inprogress` name until `close`.
    /// Used for snapshots, where a half-written file must never be taken
    /// for a committed segment.
    pub fn create_inprogress(
        path: &Path,
        meta: SegmentMeta,
        opts: XlogWriterOptions,
    ) -> Result<XlogWriter, WalError> {
        let inprogress = inprogress_path(path);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&inprogress)?;
        let header = meta.encode();
        file.write_all(&header)?;
        let good_offset = header.len() as u64;
        Ok(XlogWriter {
            file,
            path: inprogress,
            rename_on_close: Some(path.to_path_buf()),
            meta,
            opts,
            tx_buf: Vec::new(),
            in_tx: false,
            buffered_rows: 0,
            good_offset,
            synced_offset: good_offset,
            since_sync: 0,
            rows_written: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Offset covered by the last fsync.
    pub fn synced_offset(&self) -> u64 {
        self.synced_offset
    }

    /// Append one row. Outside an explicit transaction the row is its own
    /// block and is flushed immediately; inside one, rows accumulate until
    /// commit or until the buffer crosses the autocommit threshold.
    pub fn write_row(&mut self, row: &Row) -> Result<(), WalError> {
        row.encode(&mut self.tx_buf);
        self.buffered_rows += 1;
        if !self.in_tx || self.tx_buf.len() >= self.opts.autocommit_flush_bytes {
            self.flush()?;
        }
        Ok(())
    }

    /// Start grouping rows into one block.
    pub fn tx_begin(&mut self) {
        self.in_tx = true;
    }

    /// End the transaction and flush its rows.
    pub fn tx_commit(&mut self) -> Result<u64, WalError> {
        self.in_tx = false;
        self.flush()
    }

    /// Discard rows buffered since the last flush. Rows already flushed by
    /// the autocommit threshold are on disk and are not undone here.
    pub fn tx_rollback(&mut self) {
        self.in_tx = false;
        self.buffered_rows = 0;
        self.tx_buf.clear();
    }

    /// Write the pending block. On any write error the file is truncated
    /// back to the last known-good offset — partial blocks never survive.
    pub fn flush(&mut self) -> Result<u64, WalError> {
        if self.tx_buf.is_empty() {
            return Ok(self.good_offset);
        }
        let block = encode_block(&self.tx_buf, self.opts.compress_threshold)?;
        match self.file.write_all(&block) {
            Ok(()) => {
                self.good_offset += block.len() as u64;
                self.since_sync += block.len() as u64;
                self.rows_written += self.buffered_rows;
                self.buffered_rows = 0;
                self.tx_buf.clear();
                self.maybe_sync()?;
                Ok(self.good_offset)
            }
            Err(e) => {
                self.buffered_rows = 0;
                self.tx_buf.clear();
                self.truncate_to_good();
                Err(WalError::Io(e))
            }
        }
    }

    fn maybe_sync(&mut self) -> Result<(), WalError> {
        if self.since_sync >= self.opts.sync_interval_bytes {
            self.file.sync_data()?;
            self.synced_offset = self.good_offset;
            self.since_sync = 0;
        }
        Ok(())
    }

    /// fsync unconditionally and advance the synced watermark.
    pub fn sync(&mut self) -> Result<u64, WalError> {
        self.file.sync_data()?;
        self.synced_offset = self.good_offset;
        self.since_sync = 0;
        Ok(self.synced_offset)
    }

    fn truncate_to_good(&mut self) {
        // Best effort: a failed truncate after a failed write leaves the
        // tail for the cursor's recovery scan to skip.
        if let Err(e) = self.file.set_len(self.good_offset) {
            tracing::warn!(path = %self.path.display(), error = %e, "WAL truncate failed");
        }
        if let Err(e) = self.file.seek(SeekFrom::Start(self.good_offset)) {
            tracing::warn!(path = %self.path.display(), error = %e, "WAL seek failed");
        }
    }

    /// Flush, write the end-of-segment marker and fsync. A writer created
    /// with `create_inprogress` is renamed to its final name only here.
    pub fn close(mut self) -> Result<(), WalError> {
        self.flush()?;
        self.file.write_all(&EOF_MAGIC)?;
        self.file.sync_data()?;
        if let Some(final_path) = self.rename_on_close.take() {
            std::fs::rename(&self.path, &final_path)?;
            self.path = final_path;
        }
        self.closed = true;
        Ok(())
    }

    /// Abandon the segment: drop the file handle and unlink the file.
    /// Only meaningful for `create_inprogress` writers (checkpoint abort).
    pub fn discard(mut self) {
        self.closed = true;
        self.tx_buf.clear();
        self.buffered_rows = 0;
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "discard unlink failed");
        }
    }
}

impl Drop for XlogWriter {
    fn drop(&mut self) {
        if !self.closed && !self.tx_buf.is_empty() {
            // An unflushed drop loses buffered rows by design (rollback),
            // but make it visible.
            tracing::warn!(
                path = %self.path.display(),
                rows = self.buffered_rows,
                "dropping WAL writer with unflushed rows"
            );
        }
    }
}

pub fn inprogress_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(INPROGRESS_SUFFIX);
    PathBuf::from(name)
}
