//! Storage engine layer: spaces over tree indexes, statement
//! transactions with undo, the write-ahead journal, checkpointing and
//! recovery, all routed through one request dispatch entry point.

pub mod checkpoint;
pub mod dispatch;
pub mod engine;
pub mod journal;
pub mod memtx;
pub mod recovery;
pub mod schema;
pub mod space;
pub mod txn;
pub mod update;

pub use dispatch::{
    AccessControl, AllowAll, Database, NoScripting, RelayTracker, ScriptBackend, SessionCtx,
};
pub use engine::{Engine, EngineKind, EngineRegistry};
pub use journal::{Journal, JournalOptions};
pub use schema::SchemaCache;
pub use space::{IndexDef, Space};
pub use txn::{Txn, TxnState};
