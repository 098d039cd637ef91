//! Checkpoint orchestration across all registered engines.
//!
//! Phases run uniformly: begin everywhere (non-blocking), wait
//! everywhere (writes the data), commit everywhere. Any failure before
//! commit aborts every engine, not just the failing one, so a partial
//! checkpoint set can never be mistaken for a complete one. Bookkeeping
//! and retention live beside the snapshot directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::error::EngineError;
use kestrel_common::vclock::Vclock;
use kestrel_wal::{CursorOptions, XlogCursor, XlogDir};

use crate::engine::EngineRegistry;

const BOOKKEEPING_FILE: &str = "checkpoints.bin";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CheckpointEntry {
    signature: i64,
    vclock: Vclock,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct CheckpointLog {
    entries: Vec<CheckpointEntry>,
}

impl CheckpointLog {
    fn read(dir: &Path) -> CheckpointLog {
        let path = dir.join(BOOKKEEPING_FILE);
        match std::fs::read(&path) {
            Ok(data) => match bincode::deserialize(&data) {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable checkpoint log, starting fresh");
                    CheckpointLog::default()
                }
            },
            Err(_) => CheckpointLog::default(),
        }
    }

    /// Atomic write: temp file then rename.
    fn write(&self, dir: &Path) -> std::io::Result<()> {
        let data = bincode::serialize(self).expect("checkpoint log serializes");
        let tmp = dir.join(format!("{BOOKKEEPING_FILE}.tmp"));
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, dir.join(BOOKKEEPING_FILE))?;
        Ok(())
    }
}

pub struct CheckpointManager {
    engines: Arc<EngineRegistry>,
    snap_dir: Arc<Mutex<XlogDir>>,
    data_dir: PathBuf,
    /// Checkpoints retained before garbage collection.
    retention: usize,
    in_progress: AtomicBool,
    log: Mutex<CheckpointLog>,
}

impl CheckpointManager {
    pub fn new(
        engines: Arc<EngineRegistry>,
        snap_dir: Arc<Mutex<XlogDir>>,
        data_dir: &Path,
        retention: usize,
    ) -> CheckpointManager {
        let log = CheckpointLog::read(data_dir);
        CheckpointManager {
            engines,
            snap_dir,
            data_dir: data_dir.to_path_buf(),
            retention: retention.max(1),
            in_progress: AtomicBool::new(false),
            log: Mutex::new(log),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// The vclock of the oldest retained checkpoint: logs below it are
    /// collectable (modulo relay acknowledgements).
    pub fn gc_floor(&self) -> Option<Vclock> {
        self.log.lock().entries.first().map(|e| e.vclock.clone())
    }

    pub fn latest(&self) -> Option<Vclock> {
        self.log.lock().entries.last().map(|e| e.vclock.clone())
    }

    /// The newest on-disk snapshot, by directory content (survives a
    /// lost bookkeeping file).
    pub fn latest_snapshot(&self) -> Option<(i64, Vclock)> {
        self.snap_dir
            .lock()
            .latest()
            .map(|(sum, vclock)| (sum, vclock.clone()))
    }

    pub fn open_snapshot_cursor(&self, sum: i64) -> Result<XlogCursor, EngineError> {
        Ok(self
            .snap_dir
            .lock()
            .open_cursor(sum, CursorOptions::default())?)
    }

    /// Run one checkpoint at `vclock` across every engine.
    pub fn checkpoint(&self, vclock: &Vclock) -> Result<(), EngineError> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(EngineError::CheckpointInProgress);
        }
        let result = self.run(vclock);
        self.in_progress.store(false, Ordering::Release);
        result
    }

    fn run(&self, vclock: &Vclock) -> Result<(), EngineError> {
        tracing::info!(signature = vclock.sum(), "checkpoint started");

        let mut begun = Vec::new();
        for engine in self.engines.iter() {
            match engine.begin_checkpoint() {
                Ok(()) => begun.push(Arc::clone(engine)),
                Err(e) => {
                    for engine in &begun {
                        engine.abort_checkpoint();
                    }
                    tracing::warn!(error = %e, "checkpoint begin failed, aborted");
                    return Err(e);
                }
            }
        }

        for engine in self.engines.iter() {
            if let Err(e) = engine.wait_checkpoint(vclock) {
                for engine in self.engines.iter() {
                    engine.abort_checkpoint();
                }
                tracing::warn!(error = %e, "checkpoint write failed, aborted everywhere");
                return Err(e);
            }
        }

        for engine in self.engines.iter() {
            engine.commit_checkpoint(vclock);
        }
        self.record(vclock);
        tracing::info!(signature = vclock.sum(), "checkpoint complete");
        Ok(())
    }

    /// Append the bookkeeping entry and apply the retention policy.
    /// Bookkeeping failures are logged, not raised: the snapshot itself
    /// is already durable and the log rebuilds from the directory.
    fn record(&self, vclock: &Vclock) {
        let mut log = self.log.lock();
        log.entries.push(CheckpointEntry {
            signature: vclock.sum(),
            vclock: vclock.clone(),
        });
        while log.entries.len() > self.retention {
            log.entries.remove(0);
        }
        if let Err(e) = log.write(&self.data_dir) {
            tracing::warn!(error = %e, "checkpoint bookkeeping write failed");
        }
        let floor = log.entries[0].vclock.clone();
        drop(log);

        match self.snap_dir.lock().collect_garbage(&floor) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(count = removed.len(), "old snapshots collected");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "snapshot garbage collection failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::error::EngineError;
    use kestrel_common::types::Lsn;
    use kestrel_common::vclock::Vclock;
    use kestrel_wal::DirKind;
    use parking_lot::Mutex as PlMutex;

    use crate::engine::{Engine, EngineKind};
    use crate::txn::Txn;

    /// Scripted engine: fails the configured phase, records the rest.
    struct ScriptedEngine {
        fail_begin: bool,
        fail_wait: bool,
        events: PlMutex<Vec<&'static str>>,
    }

    impl ScriptedEngine {
        fn new(fail_begin: bool, fail_wait: bool) -> ScriptedEngine {
            ScriptedEngine {
                fail_begin,
                fail_wait,
                events: PlMutex::new(Vec::new()),
            }
        }
    }

    impl Engine for ScriptedEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Memtx
        }
        fn begin(&self, _txn: &mut Txn) -> Result<(), EngineError> {
            Ok(())
        }
        fn prepare(&self, _txn: &mut Txn) -> Result<(), EngineError> {
            Ok(())
        }
        fn commit(&self, _txn: &mut Txn) {}
        fn rollback(&self, _txn: &mut Txn) {}
        fn begin_checkpoint(&self) -> Result<(), EngineError> {
            if self.fail_begin {
                return Err(EngineError::CheckpointInProgress);
            }
            self.events.lock().push("begin");
            Ok(())
        }
        fn wait_checkpoint(&self, _vclock: &Vclock) -> Result<(), EngineError> {
            if self.fail_wait {
                return Err(EngineError::CheckpointInProgress);
            }
            self.events.lock().push("wait");
            Ok(())
        }
        fn commit_checkpoint(&self, _vclock: &Vclock) {
            self.events.lock().push("commit");
        }
        fn abort_checkpoint(&self) {
            self.events.lock().push("abort");
        }
        fn collect_garbage(&self, _lsn: Lsn) {}
    }

    fn manager(engine: Arc<ScriptedEngine>, dir: &Path) -> CheckpointManager {
        let mut registry = EngineRegistry::new();
        registry.register(engine);
        let snap = XlogDir::open(dir, DirKind::Snap, "test").unwrap();
        CheckpointManager::new(Arc::new(registry), Arc::new(Mutex::new(snap)), dir, 2)
    }

    fn clock(lsn: i64) -> Vclock {
        let mut v = Vclock::new();
        v.reset(kestrel_common::types::ReplicaId(1), Lsn(lsn));
        v
    }

    #[test]
    fn happy_path_runs_all_phases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new(false, false));
        let mgr = manager(Arc::clone(&engine), dir.path());
        mgr.checkpoint(&clock(1)).unwrap();
        assert_eq!(*engine.events.lock(), vec!["begin", "wait", "commit"]);
        assert_eq!(mgr.latest(), Some(clock(1)));
    }

    #[test]
    fn wait_failure_aborts_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new(false, true));
        let mgr = manager(Arc::clone(&engine), dir.path());
        assert!(mgr.checkpoint(&clock(1)).is_err());
        assert_eq!(*engine.events.lock(), vec!["begin", "abort"]);
        assert_eq!(mgr.latest(), None);
        // The manager is reusable after an abort.
        assert!(!mgr.is_in_progress());
    }

    #[test]
    fn retention_keeps_last_n_and_moves_floor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new(false, false));
        let mgr = manager(engine, dir.path());
        for lsn in 1..=4 {
            mgr.checkpoint(&clock(lsn)).unwrap();
        }
        assert_eq!(mgr.gc_floor(), Some(clock(3)));
        assert_eq!(mgr.latest(), Some(clock(4)));
    }

    #[test]
    fn bookkeeping_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Arc::new(ScriptedEngine::new(false, false));
            let mgr = manager(engine, dir.path());
            mgr.checkpoint(&clock(5)).unwrap();
        }
        let engine = Arc::new(ScriptedEngine::new(false, false));
        let mgr = manager(engine, dir.path());
        assert_eq!(mgr.latest(), Some(clock(5)));
    }
}
