//! The in-memory engine.
//!
//! Statements take effect on the indexes as they execute, so commit is a
//! state flip and rollback replays the undo records. Checkpointing
//! freezes one read view per space at begin (non-blocking) and writes
//! them out during wait, so writers are never stalled by a snapshot.

use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::error::EngineError;
use kestrel_common::types::{Lsn, SpaceId};
use kestrel_common::vclock::Vclock;
use kestrel_index::{IteratorType, TreeIterator};
use kestrel_protocol::codec::Request;
use kestrel_protocol::Row;
use kestrel_wal::{XlogDir, XlogWriterOptions};

use crate::engine::{Engine, EngineKind};
use crate::schema::SchemaCache;
use crate::txn::Txn;

struct FrozenSpace {
    space_id: SpaceId,
    view: TreeIterator,
}

pub struct MemtxEngine {
    schema: Arc<SchemaCache>,
    snap_dir: Arc<Mutex<XlogDir>>,
    writer_opts: XlogWriterOptions,
    frozen: Mutex<Option<Vec<FrozenSpace>>>,
}

impl MemtxEngine {
    pub fn new(
        schema: Arc<SchemaCache>,
        snap_dir: Arc<Mutex<XlogDir>>,
        writer_opts: XlogWriterOptions,
    ) -> MemtxEngine {
        MemtxEngine {
            schema,
            snap_dir,
            writer_opts,
            frozen: Mutex::new(None),
        }
    }
}

impl Engine for MemtxEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Memtx
    }

    fn begin(&self, _txn: &mut Txn) -> Result<(), EngineError> {
        Ok(())
    }

    fn prepare(&self, _txn: &mut Txn) -> Result<(), EngineError> {
        // Conflicts surfaced at statement execution; nothing left to
        // validate here.
        Ok(())
    }

    fn commit(&self, txn: &mut Txn) {
        txn.mark_committed();
    }

    fn rollback(&self, txn: &mut Txn) {
        txn.undo();
    }

    fn begin_checkpoint(&self) -> Result<(), EngineError> {
        let mut frozen = self.frozen.lock();
        if frozen.is_some() {
            return Err(EngineError::CheckpointInProgress);
        }
        let mut views = Vec::new();
        for space in self.schema.spaces() {
            let mut view = space.primary().iterate(IteratorType::All, Vec::new());
            view.freeze();
            views.push(FrozenSpace {
                space_id: space.id(),
                view,
            });
        }
        *frozen = Some(views);
        Ok(())
    }

    fn wait_checkpoint(&self, vclock: &Vclock) -> Result<(), EngineError> {
        let views = match self.frozen.lock().take() {
            Some(views) => views,
            None => return Err(EngineError::CheckpointInProgress),
        };
        let mut writer = self.snap_dir.lock().begin_segment(vclock, self.writer_opts)?;
        tracing::info!(path = %writer.path().display(), "writing snapshot");

        let mut rows: u64 = 0;
        for mut frozen in views {
            writer.tx_begin();
            while let Some(tuple) = frozen.view.next() {
                let row = Row::from_request(
                    Default::default(),
                    Lsn(0),
                    0.0,
                    &Request::Replace {
                        space_id: frozen.space_id,
                        tuple: tuple.fields().to_vec(),
                    },
                );
                if let Err(e) = writer.write_row(&row) {
                    writer.discard();
                    return Err(EngineError::Wal(e));
                }
                rows += 1;
            }
            if let Err(e) = writer.tx_commit() {
                writer.discard();
                return Err(EngineError::Wal(e));
            }
        }
        if let Err(e) = writer.close() {
            return Err(EngineError::Wal(e));
        }
        self.snap_dir.lock().note_segment(vclock);
        tracing::info!(rows, signature = vclock.sum(), "snapshot complete");
        Ok(())
    }

    fn commit_checkpoint(&self, _vclock: &Vclock) {
        *self.frozen.lock() = None;
    }

    fn abort_checkpoint(&self) {
        *self.frozen.lock() = None;
    }

    fn collect_garbage(&self, _lsn: Lsn) {
        // Memtx keeps no per-lsn versions; segment GC is directory-level.
    }
}
