//! The write-ahead journal: lsn assignment and segment management over
//! the xlog writer.
//!
//! `write` is the durability step of commit. A failure before the block
//! reaches the file rolls the transaction back; an inconsistency found
//! after the block is written is unrecoverable by contract and aborts
//! the process, because the written intent may already be replicated.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use kestrel_common::error::EngineError;
use kestrel_common::types::{Lsn, ReplicaId};
use kestrel_common::vclock::Vclock;
use kestrel_protocol::Row;
use kestrel_wal::{CursorOptions, DirKind, XlogCursor, XlogDir, XlogWriterOptions};

#[derive(Debug, Clone, Copy)]
pub struct JournalOptions {
    pub writer: XlogWriterOptions,
    /// Rotate to a fresh segment after this many rows.
    pub max_rows_per_segment: u64,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            writer: XlogWriterOptions::default(),
            max_rows_per_segment: 500_000,
        }
    }
}

struct JournalInner {
    dir: XlogDir,
    writer: Option<kestrel_wal::XlogWriter>,
    vclock: Vclock,
}

pub struct Journal {
    replica_id: ReplicaId,
    opts: JournalOptions,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open the log directory, adopting `vclock` as the recovery point.
    /// Leftover `.inprogress` files from a crashed writer are removed.
    pub fn open(
        path: &Path,
        instance_uuid: &str,
        replica_id: ReplicaId,
        vclock: Vclock,
        opts: JournalOptions,
    ) -> Result<Journal, EngineError> {
        let dir = XlogDir::open(path, DirKind::Log, instance_uuid)?;
        let removed = dir.remove_inprogress()?;
        if removed > 0 {
            tracing::info!(removed, "removed stale in-progress log segments");
        }
        Ok(Journal {
            replica_id,
            opts,
            inner: Mutex::new(JournalInner {
                dir,
                writer: None,
                vclock,
            }),
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn vclock(&self) -> Vclock {
        self.inner.lock().vclock.clone()
    }

    /// Stamp and persist a transaction's rows as one block. Returns the
    /// vclock after the write.
    pub fn write(&self, rows: &mut [Row]) -> Result<Vclock, EngineError> {
        if rows.is_empty() {
            return Ok(self.vclock());
        }
        let mut inner = self.inner.lock();

        let base = inner.vclock.get(self.replica_id).0;
        let timestamp = unix_now();
        for (i, row) in rows.iter_mut().enumerate() {
            row.replica_id = self.replica_id;
            row.lsn = Lsn(base + 1 + i as i64);
            row.timestamp = timestamp;
        }

        self.ensure_writer(&mut *inner)?;
        let writer = inner.writer.as_mut().expect("writer just ensured");
        writer.tx_begin();
        for row in rows.iter() {
            if let Err(e) = writer.write_row(row) {
                // Nothing from this transaction reached the file: the
                // writer truncated back to the last good block.
                writer.tx_rollback();
                return Err(EngineError::Wal(e));
            }
        }
        if let Err(e) = writer.tx_commit() {
            return Err(EngineError::Wal(e));
        }

        // The block is on disk; from here the vclock must follow. A
        // regression now is a logic error we cannot roll back.
        for row in rows.iter() {
            if let Err(e) = inner.vclock.follow(row.replica_id, row.lsn) {
                panic!("vclock regression after durable write: {e}");
            }
        }

        if inner.writer.as_ref().map_or(0, |w| w.rows_written()) >= self.opts.max_rows_per_segment
        {
            self.rotate(&mut *inner);
        }
        Ok(inner.vclock.clone())
    }

    fn ensure_writer(&self, inner: &mut JournalInner) -> Result<(), EngineError> {
        if inner.writer.is_none() {
            let vclock = inner.vclock.clone();
            let writer = inner.dir.create_segment(&vclock, self.opts.writer)?;
            tracing::info!(path = %writer.path().display(), "new log segment");
            inner.writer = Some(writer);
        }
        Ok(())
    }

    fn rotate(&self, inner: &mut JournalInner) {
        if let Some(writer) = inner.writer.take() {
            let path = writer.path().to_path_buf();
            if let Err(e) = writer.close() {
                tracing::warn!(path = %path.display(), error = %e, "log segment close failed");
            }
        }
        // The next write creates the successor, named by the new vclock.
    }

    /// fsync the open segment and return the synced offset watermark.
    pub fn sync(&self) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock();
        match inner.writer.as_mut() {
            Some(writer) => Ok(writer.sync()?),
            None => Ok(0),
        }
    }

    /// Close the open segment cleanly (EOF marker + fsync).
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    // ── read-side access for replication and GC ─────────────────────────

    /// Snapshot of the segment index: (signature, vclock) in order.
    pub fn segments(&self) -> Vec<(i64, Vclock)> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.dir.scan() {
            tracing::warn!(error = %e, "log directory rescan failed");
        }
        inner
            .dir
            .segments()
            .map(|(sum, v)| (sum, v.clone()))
            .collect()
    }

    pub fn segment_covering(&self, target: &Vclock) -> Option<i64> {
        self.inner.lock().dir.segment_covering(target)
    }

    pub fn open_cursor(&self, sum: i64, opts: CursorOptions) -> Result<XlogCursor, EngineError> {
        Ok(self.inner.lock().dir.open_cursor(sum, opts)?)
    }

    /// Drop log segments fully covered by `watermark`.
    pub fn collect_garbage(&self, watermark: &Vclock) -> Result<Vec<PathBuf>, EngineError> {
        Ok(self.inner.lock().dir.collect_garbage(watermark)?)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::SpaceId;
    use kestrel_protocol::codec::Request;
    use rmpv::Value;

    fn row(key: u64) -> Row {
        Row::from_request(
            ReplicaId(0),
            Lsn(0),
            0.0,
            &Request::Replace {
                space_id: SpaceId(1),
                tuple: vec![Value::from(key)],
            },
        )
    }

    #[test]
    fn write_assigns_ascending_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(
            dir.path(),
            "test",
            ReplicaId(1),
            Vclock::new(),
            JournalOptions::default(),
        )
        .unwrap();

        let mut rows = vec![row(1), row(2), row(3)];
        let vclock = journal.write(&mut rows).unwrap();
        assert_eq!(rows[0].lsn, Lsn(1));
        assert_eq!(rows[2].lsn, Lsn(3));
        assert_eq!(vclock.get(ReplicaId(1)), Lsn(3));

        let mut more = vec![row(4)];
        journal.write(&mut more).unwrap();
        assert_eq!(more[0].lsn, Lsn(4));
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = Journal::open(
                dir.path(),
                "test",
                ReplicaId(1),
                Vclock::new(),
                JournalOptions::default(),
            )
            .unwrap();
            let mut rows = vec![row(10), row(11)];
            journal.write(&mut rows).unwrap();
            journal.close().unwrap();
        }
        let journal = Journal::open(
            dir.path(),
            "test",
            ReplicaId(1),
            Vclock::new(),
            JournalOptions::default(),
        )
        .unwrap();
        let segments = journal.segments();
        assert_eq!(segments.len(), 1);
        let mut cursor = journal
            .open_cursor(segments[0].0, CursorOptions::default())
            .unwrap();
        let mut lsns = Vec::new();
        while let Some(row) = cursor.next_row().unwrap() {
            lsns.push(row.lsn.0);
        }
        assert_eq!(lsns, vec![1, 2]);
    }

    #[test]
    fn rotation_after_max_rows() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(
            dir.path(),
            "test",
            ReplicaId(1),
            Vclock::new(),
            JournalOptions {
                max_rows_per_segment: 2,
                ..JournalOptions::default()
            },
        )
        .unwrap();
        for key in 0..6u64 {
            journal.write(&mut [row(key)]).unwrap();
        }
        // 2 rows per segment: three segments named 0, 2, 4.
        let sums: Vec<i64> = journal.segments().into_iter().map(|(s, _)| s).collect();
        assert_eq!(sums, vec![0, 2, 4]);
    }
}
