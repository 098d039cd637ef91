//! The storage engine seam.
//!
//! Engines are a closed set of kinds dispatched through a trait object;
//! a space names its engine at creation time. The registry runs the
//! transaction hooks and the checkpoint phases uniformly across every
//! registered engine.

use std::sync::Arc;

use kestrel_common::error::EngineError;
use kestrel_common::types::Lsn;
use kestrel_common::vclock::Vclock;

use crate::txn::Txn;

/// The closed set of engine kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Memtx,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Memtx => "memtx",
        }
    }
}

/// A storage engine. Transaction hooks run around each statement batch;
/// the checkpoint phases run under the orchestrator in `checkpoint`.
///
/// `commit` must not fail: once `prepare` succeeded and the rows are
/// durable in the log, the transaction's intent may already have been
/// replicated, so there is nothing left that is allowed to go wrong.
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn begin(&self, txn: &mut Txn) -> Result<(), EngineError>;
    fn prepare(&self, txn: &mut Txn) -> Result<(), EngineError>;
    fn commit(&self, txn: &mut Txn);
    fn rollback(&self, txn: &mut Txn);

    /// Start a checkpoint. Must not block: freezes read views only.
    fn begin_checkpoint(&self) -> Result<(), EngineError>;
    /// Write the checkpoint identified by `vclock`. May block.
    fn wait_checkpoint(&self, vclock: &Vclock) -> Result<(), EngineError>;
    fn commit_checkpoint(&self, vclock: &Vclock);
    fn abort_checkpoint(&self);

    /// Release engine-private resources older than `lsn`.
    fn collect_garbage(&self, lsn: Lsn);
}

/// Process-scoped registry of engines, created at startup and passed by
/// handle to whoever needs it.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> EngineRegistry {
        EngineRegistry::default()
    }

    /// Register an engine. Registration order is the checkpoint phase
    /// order.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        debug_assert!(self.get(engine.kind()).is_none(), "engine kind registered twice");
        self.engines.push(engine);
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn Engine>> {
        self.engines.iter().find(|e| e.kind() == kind).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Engine>> {
        self.engines.iter()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
