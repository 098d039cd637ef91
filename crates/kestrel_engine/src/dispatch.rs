//! Request dispatch: one decoded request in, tuples or a typed error out.
//!
//! The `Database` bundles the schema cache, engine registry, journal,
//! checkpoint orchestrator and function registry behind one `execute`
//! entry point. Only the transaction-processing context calls mutating
//! paths, so the storage layer below needs no cross-thread coordination
//! beyond its own containers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rmpv::Value;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::{EngineError, KestrelError};
use kestrel_common::types::{IndexId, Lsn, ReplicaId, SchemaVersion, SpaceId};
use kestrel_common::vclock::Vclock;
use kestrel_func::registry::{FuncPtr, FuncRegistry, ModuleBackend, ModuleHandle, ModuleRegistry};
use kestrel_common::error::FuncError;
use kestrel_index::{DupPolicy, IteratorType, Tuple};
use kestrel_protocol::codec::Request;
use kestrel_protocol::Row;
use kestrel_wal::{DirKind, XlogDir, XlogWriterOptions};

use crate::checkpoint::CheckpointManager;
use crate::engine::{Engine, EngineRegistry};
use crate::journal::{Journal, JournalOptions};
use crate::memtx::MemtxEngine;
use crate::recovery::{self, RecoveryOptions};
use crate::schema::SchemaCache;
use crate::space::Space;
use crate::txn::Txn;
use crate::update;

/// The single permission check collaborator. The default allows
/// everything and accepts any credentials.
pub trait AccessControl: Send + Sync {
    fn check(&self, user: &str, request: &Request) -> Result<(), EngineError>;
    fn authenticate(&self, user: &str, scramble: &[u8], salt: &[u8]) -> bool;
}

pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check(&self, _user: &str, _request: &Request) -> Result<(), EngineError> {
        Ok(())
    }

    fn authenticate(&self, _user: &str, _scramble: &[u8], _salt: &[u8]) -> bool {
        true
    }
}

/// The EVAL collaborator. The default refuses every expression; a real
/// scripting runtime plugs in here.
pub trait ScriptBackend: Send + Sync {
    fn eval(&self, expr: &str, args: &[Value]) -> Result<Vec<Value>, KestrelError>;
}

pub struct NoScripting;

impl ScriptBackend for NoScripting {
    fn eval(&self, _expr: &str, _args: &[Value]) -> Result<Vec<Value>, KestrelError> {
        Err(KestrelError::Func(FuncError::Call {
            name: "<eval>".into(),
            reason: "no scripting backend configured".into(),
        }))
    }
}

/// Backend used when dynamic library loading is not wired up.
pub struct NoDynamicLoading;

impl ModuleBackend for NoDynamicLoading {
    fn load(&self, path: &str) -> Result<ModuleHandle, FuncError> {
        Err(FuncError::Load {
            path: path.to_string(),
            reason: "dynamic loading not configured".into(),
        })
    }

    fn resolve(&self, _handle: ModuleHandle, symbol: &str) -> Result<FuncPtr, FuncError> {
        Err(FuncError::NoSuchSymbol(symbol.to_string()))
    }

    fn unload(&self, _handle: ModuleHandle) {}
}

/// Per-request session identity, owned by the connection.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub user: String,
}

impl Default for SessionCtx {
    fn default() -> Self {
        SessionCtx {
            user: "guest".into(),
        }
    }
}

/// Vclock acknowledgements from downstream replicas; their componentwise
/// minimum bounds log garbage collection.
#[derive(Default)]
pub struct RelayTracker {
    acks: DashMap<u64, Vclock>,
    seq: AtomicU64,
}

impl RelayTracker {
    pub fn register(&self) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.acks.insert(id, Vclock::new());
        id
    }

    pub fn ack(&self, relay: u64, vclock: Vclock) {
        self.acks.insert(relay, vclock);
    }

    pub fn unregister(&self, relay: u64) {
        self.acks.remove(&relay);
    }

    /// Componentwise minimum over all registered relays; `None` when no
    /// relay is connected (then only checkpoints bound GC).
    pub fn min_ack(&self) -> Option<Vclock> {
        let mut min: Option<Vclock> = None;
        for entry in self.acks.iter() {
            min = Some(match min {
                Some(current) => vclock_min(&current, entry.value()),
                None => entry.value().clone(),
            });
        }
        min
    }
}

fn vclock_min(a: &Vclock, b: &Vclock) -> Vclock {
    let mut out = Vclock::new();
    for (replica, lsn) in a.iter() {
        let low = lsn.0.min(b.get(replica).0);
        if low > 0 {
            out.reset(replica, Lsn(low));
        }
    }
    out
}

pub struct Database {
    schema: Arc<SchemaCache>,
    engines: Arc<EngineRegistry>,
    journal: Arc<Journal>,
    checkpoints: Arc<CheckpointManager>,
    funcs: Arc<FuncRegistry>,
    relays: Arc<RelayTracker>,
    access: Arc<dyn AccessControl>,
    scripts: Arc<dyn ScriptBackend>,
    instance_uuid: String,
    read_only: bool,
    txn_seq: AtomicU64,
}

impl Database {
    /// Assemble a full instance from configuration: bootstrap spaces,
    /// recover from the latest snapshot plus the log tail, then open the
    /// journal at the recovered vclock.
    pub fn open(config: &KestrelConfig) -> Result<Database, KestrelError> {
        let data_dir = Path::new(&config.server.data_dir);
        std::fs::create_dir_all(data_dir).map_err(|e| KestrelError::Internal(e.to_string()))?;
        let uuid = config.server.instance_uuid.clone();

        let schema = Arc::new(SchemaCache::new());
        let mut space_names = Vec::new();
        for cfg in &config.spaces {
            space_names.push(cfg.name.clone());
        }
        schema.bootstrap(&config.spaces)?;
        tracing::info!(spaces = ?space_names, "schema bootstrapped");

        let snap_dir = XlogDir::open(data_dir, DirKind::Snap, &uuid)?;
        snap_dir.remove_inprogress()?;
        let log_dir = XlogDir::open(data_dir, DirKind::Log, &uuid)?;
        let recovery_opts = RecoveryOptions {
            force_recovery: config.wal.force_recovery,
            ignore_crc: config.wal.force_recovery,
        };
        let recovered = recovery::run(&schema, &snap_dir, &log_dir, &recovery_opts)?;
        drop(log_dir);

        let writer_opts = XlogWriterOptions {
            compress_threshold: config.wal.compress_threshold,
            autocommit_flush_bytes: config.wal.autocommit_flush_bytes,
            sync_interval_bytes: config.wal.sync_interval_bytes,
        };
        let journal = Arc::new(Journal::open(
            data_dir,
            &uuid,
            ReplicaId(config.server.replica_id),
            recovered.vclock.clone(),
            JournalOptions {
                writer: writer_opts,
                max_rows_per_segment: config.wal.max_rows_per_segment,
            },
        )?);

        let snap_dir = Arc::new(Mutex::new(snap_dir));
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(MemtxEngine::new(
            Arc::clone(&schema),
            Arc::clone(&snap_dir),
            writer_opts,
        )));
        let engines = Arc::new(registry);

        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&engines),
            snap_dir,
            data_dir,
            config.snapshot.checkpoint_count,
        ));

        let funcs = Arc::new(FuncRegistry::new(Arc::new(ModuleRegistry::new(Arc::new(
            NoDynamicLoading,
        )))));
        let relays = Arc::new(RelayTracker::default());
        register_builtins(&funcs, &schema, &journal, &checkpoints, &relays, &uuid);

        Ok(Database {
            schema,
            engines,
            journal,
            checkpoints,
            funcs,
            relays,
            access: Arc::new(AllowAll),
            scripts: Arc::new(NoScripting),
            instance_uuid: uuid,
            read_only: config.server.read_only,
            txn_seq: AtomicU64::new(1),
        })
    }

    pub fn set_access_control(&mut self, access: Arc<dyn AccessControl>) {
        self.access = access;
    }

    pub fn set_script_backend(&mut self, scripts: Arc<dyn ScriptBackend>) {
        self.scripts = scripts;
    }

    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema.version()
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn funcs(&self) -> &Arc<FuncRegistry> {
        &self.funcs
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn relays(&self) -> &Arc<RelayTracker> {
        &self.relays
    }

    pub fn instance_uuid(&self) -> &str {
        &self.instance_uuid
    }

    pub fn vclock(&self) -> Vclock {
        self.journal.vclock()
    }

    pub fn authenticate(&self, user: &str, scramble: &[u8], salt: &[u8]) -> bool {
        self.access.authenticate(user, scramble, salt)
    }

    /// Execute one request. Exactly the paths a decoded frame can take;
    /// JOIN and SUBSCRIBE never reach here (the connection hands itself
    /// to the relay instead).
    pub fn execute(
        &self,
        schema_version: SchemaVersion,
        request: &Request,
        ctx: &SessionCtx,
    ) -> Result<Vec<Tuple>, KestrelError> {
        self.schema.check_version(schema_version)?;
        match request {
            Request::Ping => Ok(Vec::new()),
            Request::Select {
                space_id,
                index_id,
                iterator,
                key,
                limit,
                offset,
            } => self.select(*space_id, *index_id, *iterator, key, *limit, *offset),
            Request::Insert { space_id, tuple } => {
                self.replace_family(ctx, request, *space_id, tuple, DupPolicy::InsertOnly)
            }
            Request::Replace { space_id, tuple } => {
                self.replace_family(ctx, request, *space_id, tuple, DupPolicy::ReplaceOrInsert)
            }
            Request::Update {
                space_id,
                index_id,
                key,
                ops,
            } => self.update(ctx, request, *space_id, *index_id, key, ops),
            Request::Upsert {
                space_id,
                tuple,
                ops,
            } => self.upsert(ctx, request, *space_id, tuple, ops),
            Request::Delete {
                space_id,
                index_id,
                key,
            } => self.delete(ctx, request, *space_id, *index_id, key),
            Request::Call { function, args } => {
                self.access.check(&ctx.user, request)?;
                let values = self.funcs.call(function, args)?;
                Ok(values.into_iter().map(value_to_tuple).collect())
            }
            Request::Eval { expr, args } => {
                self.access.check(&ctx.user, request)?;
                let values = self.scripts.eval(expr, args)?;
                Ok(values.into_iter().map(value_to_tuple).collect())
            }
            Request::Vote => {
                let pairs = self
                    .vclock()
                    .iter()
                    .map(|(r, l)| (Value::from(r.0), Value::from(l.0)))
                    .collect();
                Ok(vec![Tuple::new(vec![Value::Map(pairs)])])
            }
            Request::Auth { .. } | Request::Join { .. } | Request::Subscribe { .. } => Err(
                KestrelError::Internal("request is handled by the connection layer".into()),
            ),
        }
    }

    fn select(
        &self,
        space_id: SpaceId,
        index_id: IndexId,
        iterator: u32,
        key: &[Value],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Tuple>, KestrelError> {
        let space = self.schema.space(space_id)?;
        let index = space.index(index_id)?;
        let itype = IteratorType::from_code(iterator)
            .ok_or(EngineError::UnsupportedIterator(iterator))?;
        let key = index.cmp_def().validate_key(key)?;
        let mut it = index.iterate(itype, key);
        for _ in 0..offset {
            if it.next().is_none() {
                return Ok(Vec::new());
            }
        }
        let mut out = Vec::new();
        while out.len() < limit as usize {
            match it.next() {
                Some(tuple) => out.push(tuple),
                None => break,
            }
        }
        Ok(out)
    }

    fn replace_family(
        &self,
        ctx: &SessionCtx,
        request: &Request,
        space_id: SpaceId,
        tuple: &[Value],
        policy: DupPolicy,
    ) -> Result<Vec<Tuple>, KestrelError> {
        let space = self.begin_dml(ctx, request, space_id)?;
        let tuple = Tuple::new(tuple.to_vec());
        self.run_txn(&space, |txn| {
            txn.execute_replace(&space, &tuple, policy, self.row_for(request))?;
            Ok(vec![tuple.clone()])
        })
    }

    fn update(
        &self,
        ctx: &SessionCtx,
        request: &Request,
        space_id: SpaceId,
        index_id: IndexId,
        key: &[Value],
        ops: &[Value],
    ) -> Result<Vec<Tuple>, KestrelError> {
        let space = self.begin_dml(ctx, request, space_id)?;
        let index = space.index(index_id)?;
        let key = index.cmp_def().validate_key(key)?;
        let old = match index.find(&key)? {
            Some(old) => old,
            None => return Ok(Vec::new()),
        };
        let new = update::apply_ops(&old, ops)?;
        self.check_primary_unchanged(&space, &old, &new)?;
        self.run_txn(&space, |txn| {
            txn.execute_replace(&space, &new, DupPolicy::ReplaceOnly, self.row_for(request))?;
            Ok(vec![new.clone()])
        })
    }

    fn upsert(
        &self,
        ctx: &SessionCtx,
        request: &Request,
        space_id: SpaceId,
        tuple: &[Value],
        ops: &[Value],
    ) -> Result<Vec<Tuple>, KestrelError> {
        let space = self.begin_dml(ctx, request, space_id)?;
        let tuple = Tuple::new(tuple.to_vec());
        let pk = space.primary().cmp_def().extract_key(&tuple)?;
        match space.primary().find(&pk)? {
            Some(old) => {
                let new = update::apply_ops(&old, ops)?;
                self.check_primary_unchanged(&space, &old, &new)?;
                self.run_txn(&space, |txn| {
                    txn.execute_replace(
                        &space,
                        &new,
                        DupPolicy::ReplaceOnly,
                        self.row_for(request),
                    )?;
                    Ok(Vec::new())
                })
            }
            None => self.run_txn(&space, |txn| {
                txn.execute_replace(
                    &space,
                    &tuple,
                    DupPolicy::InsertOnly,
                    self.row_for(request),
                )?;
                Ok(Vec::new())
            }),
        }
    }

    fn delete(
        &self,
        ctx: &SessionCtx,
        request: &Request,
        space_id: SpaceId,
        index_id: IndexId,
        key: &[Value],
    ) -> Result<Vec<Tuple>, KestrelError> {
        let space = self.begin_dml(ctx, request, space_id)?;
        let index = space.index(index_id)?;
        let key = index.cmp_def().validate_key(key)?;
        self.run_txn(&space, |txn| {
            let old = txn.execute_delete(&space, index_id, &key, self.row_for(request))?;
            Ok(old.into_iter().collect())
        })
    }

    fn begin_dml(
        &self,
        ctx: &SessionCtx,
        request: &Request,
        space_id: SpaceId,
    ) -> Result<Arc<Space>, KestrelError> {
        if self.read_only {
            return Err(EngineError::ReadOnly.into());
        }
        self.access.check(&ctx.user, request)?;
        Ok(self.schema.space(space_id)?)
    }

    /// One-statement transaction wrapper: begin, run, prepare, journal,
    /// commit. Any failure up to and including the journal write rolls
    /// the statement back; after the rows are durable, commit cannot
    /// fail.
    fn run_txn(
        &self,
        space: &Arc<Space>,
        body: impl FnOnce(&mut Txn) -> Result<Vec<Tuple>, KestrelError>,
    ) -> Result<Vec<Tuple>, KestrelError> {
        let engine = self
            .engines
            .get(space.engine())
            .ok_or_else(|| KestrelError::Internal("engine not registered".into()))?;
        let mut txn = Txn::new(self.txn_seq.fetch_add(1, Ordering::Relaxed));
        engine.begin(&mut txn)?;
        match body(&mut txn) {
            Ok(data) => {
                if let Err(e) = engine.prepare(&mut txn) {
                    engine.rollback(&mut txn);
                    return Err(e.into());
                }
                txn.mark_prepared();
                if let Err(e) = self.journal.write(txn.rows_mut()) {
                    engine.rollback(&mut txn);
                    return Err(e.into());
                }
                engine.commit(&mut txn);
                Ok(data)
            }
            Err(e) => {
                engine.rollback(&mut txn);
                Err(e)
            }
        }
    }

    fn row_for(&self, request: &Request) -> Row {
        // Replica id, lsn and timestamp are stamped by the journal.
        Row::from_request(ReplicaId(0), Lsn(0), 0.0, request)
    }

    fn check_primary_unchanged(
        &self,
        space: &Arc<Space>,
        old: &Tuple,
        new: &Tuple,
    ) -> Result<(), KestrelError> {
        let def = space.primary().cmp_def();
        if def.extract_key(old)? != def.extract_key(new)? {
            return Err(EngineError::UpdateOp("primary key update is not allowed".into()).into());
        }
        Ok(())
    }

    /// Take a checkpoint at the current vclock, then advance the garbage
    /// collection watermark.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        self.checkpoints.checkpoint(&self.journal.vclock())?;
        self.collect_garbage();
        Ok(())
    }

    /// Remove log segments no longer needed by recovery or any relay.
    pub fn collect_garbage(&self) {
        collect_garbage(&self.journal, &self.checkpoints, &self.relays);
    }
}

fn value_to_tuple(value: Value) -> Tuple {
    match value {
        Value::Array(fields) => Tuple::new(fields),
        other => Tuple::new(vec![other]),
    }
}

fn collect_garbage(
    journal: &Arc<Journal>,
    checkpoints: &Arc<CheckpointManager>,
    relays: &Arc<RelayTracker>,
) {
    let Some(mut watermark) = checkpoints.gc_floor() else {
        // Without a checkpoint every log row is still needed for
        // recovery.
        return;
    };
    if let Some(acks) = relays.min_ack() {
        watermark = vclock_min(&watermark, &acks);
    }
    match journal.collect_garbage(&watermark) {
        Ok(removed) if !removed.is_empty() => {
            tracing::info!(count = removed.len(), "log segments collected");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "log garbage collection failed"),
    }
}

fn register_builtins(
    funcs: &Arc<FuncRegistry>,
    schema: &Arc<SchemaCache>,
    journal: &Arc<Journal>,
    checkpoints: &Arc<CheckpointManager>,
    relays: &Arc<RelayTracker>,
    instance_uuid: &str,
) {
    {
        let journal = Arc::clone(journal);
        let checkpoints = Arc::clone(checkpoints);
        let relays = Arc::clone(relays);
        funcs.register_builtin(
            "kestrel.checkpoint",
            Arc::new(move |_args: &[Value]| {
                checkpoints
                    .checkpoint(&journal.vclock())
                    .map_err(|e| e.to_string())?;
                collect_garbage(&journal, &checkpoints, &relays);
                Ok(Vec::new())
            }),
        );
    }
    {
        let journal = Arc::clone(journal);
        let schema = Arc::clone(schema);
        let uuid = instance_uuid.to_string();
        funcs.register_builtin(
            "kestrel.info",
            Arc::new(move |_args: &[Value]| {
                let vclock = journal
                    .vclock()
                    .iter()
                    .map(|(r, l)| (Value::from(r.0), Value::from(l.0)))
                    .collect();
                Ok(vec![Value::Array(vec![
                    Value::from(uuid.as_str()),
                    Value::Map(vclock),
                    Value::from(schema.version().0),
                ])])
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::config::{IndexConfig, PartConfig, SpaceConfig};
    use kestrel_common::error::codes;

    fn test_config(dir: &Path) -> KestrelConfig {
        let mut config = KestrelConfig::default();
        config.server.data_dir = dir.display().to_string();
        config.spaces = vec![SpaceConfig {
            id: 512,
            name: "users".into(),
            indexes: vec![IndexConfig {
                id: 0,
                name: "primary".into(),
                unique: true,
                parts: vec![PartConfig {
                    field: 0,
                    field_type: "unsigned".into(),
                    nullable: false,
                }],
            }],
        }];
        config
    }

    fn insert(key: u64) -> Request {
        Request::Insert {
            space_id: SpaceId(512),
            tuple: vec![Value::from(key), Value::from("v")],
        }
    }

    fn select_all() -> Request {
        Request::Select {
            space_id: SpaceId(512),
            index_id: IndexId(0),
            iterator: IteratorType::All as u32,
            key: vec![],
            limit: u32::MAX,
            offset: 0,
        }
    }

    #[test]
    fn insert_select_duplicate_flow() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&test_config(dir.path())).unwrap();
        let ctx = SessionCtx::default();

        let out = db.execute(SchemaVersion(0), &insert(5), &ctx).unwrap();
        assert_eq!(out.len(), 1);

        let err = db.execute(SchemaVersion(0), &insert(5), &ctx).unwrap_err();
        assert_eq!(err.error_code(), codes::ER_TUPLE_FOUND);

        let rows = db.execute(SchemaVersion(0), &select_all(), &ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field(0), Some(&Value::from(5u64)));
    }

    #[test]
    fn stale_schema_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&test_config(dir.path())).unwrap();
        let stale = SchemaVersion(db.schema_version().0 + 7);
        let err = db
            .execute(stale, &insert(1), &SessionCtx::default())
            .unwrap_err();
        assert_eq!(err.error_code(), codes::ER_WRONG_SCHEMA_VERSION);
        // Unstamped requests pass.
        db.execute(SchemaVersion(0), &insert(1), &SessionCtx::default())
            .unwrap();
    }

    #[test]
    fn update_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&test_config(dir.path())).unwrap();
        let ctx = SessionCtx::default();
        db.execute(SchemaVersion(0), &insert(1), &ctx).unwrap();

        let update = Request::Update {
            space_id: SpaceId(512),
            index_id: IndexId(0),
            key: vec![Value::from(1u64)],
            ops: vec![Value::Array(vec![
                Value::from("="),
                Value::from(1u64),
                Value::from("patched"),
            ])],
        };
        let out = db.execute(SchemaVersion(0), &update, &ctx).unwrap();
        assert_eq!(out[0].field(1), Some(&Value::from("patched")));

        // Upsert of a missing key inserts the given tuple.
        let upsert = Request::Upsert {
            space_id: SpaceId(512),
            tuple: vec![Value::from(2u64), Value::from("fresh")],
            ops: vec![],
        };
        db.execute(SchemaVersion(0), &upsert, &ctx).unwrap();
        let rows = db
            .execute(SchemaVersion(0), &select_all(), &ctx)
            .unwrap();
        assert_eq!(rows.len(), 2);

        // Changing the primary key through update is refused.
        let bad = Request::Update {
            space_id: SpaceId(512),
            index_id: IndexId(0),
            key: vec![Value::from(1u64)],
            ops: vec![Value::Array(vec![
                Value::from("="),
                Value::from(0u64),
                Value::from(9u64),
            ])],
        };
        let err = db.execute(SchemaVersion(0), &bad, &ctx).unwrap_err();
        assert_eq!(err.error_code(), codes::ER_UPDATE_OP);
    }

    #[test]
    fn delete_returns_victim_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&test_config(dir.path())).unwrap();
        let ctx = SessionCtx::default();
        db.execute(SchemaVersion(0), &insert(7), &ctx).unwrap();

        let delete = Request::Delete {
            space_id: SpaceId(512),
            index_id: IndexId(0),
            key: vec![Value::from(7u64)],
        };
        let out = db.execute(SchemaVersion(0), &delete, &ctx).unwrap();
        assert_eq!(out.len(), 1);
        let out = db.execute(SchemaVersion(0), &delete, &ctx).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn read_only_instance_rejects_dml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.server.read_only = true;
        let db = Database::open(&config).unwrap();
        let err = db
            .execute(SchemaVersion(0), &insert(1), &SessionCtx::default())
            .unwrap_err();
        assert_eq!(err.error_code(), codes::ER_READ_ONLY);
        // Reads still work.
        db.execute(SchemaVersion(0), &select_all(), &SessionCtx::default())
            .unwrap();
    }

    #[test]
    fn builtin_call_and_unknown_function() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&test_config(dir.path())).unwrap();
        let ctx = SessionCtx::default();
        let info = db
            .execute(
                SchemaVersion(0),
                &Request::Call {
                    function: "kestrel.info".into(),
                    args: vec![],
                },
                &ctx,
            )
            .unwrap();
        assert_eq!(info.len(), 1);

        let err = db
            .execute(
                SchemaVersion(0),
                &Request::Call {
                    function: "missing".into(),
                    args: vec![],
                },
                &ctx,
            )
            .unwrap_err();
        assert_eq!(err.error_code(), codes::ER_NO_SUCH_FUNCTION);
    }

    #[test]
    fn select_limit_offset_and_bad_iterator() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&test_config(dir.path())).unwrap();
        let ctx = SessionCtx::default();
        for key in 1..=5u64 {
            db.execute(SchemaVersion(0), &insert(key), &ctx).unwrap();
        }
        let page = Request::Select {
            space_id: SpaceId(512),
            index_id: IndexId(0),
            iterator: IteratorType::All as u32,
            key: vec![],
            limit: 2,
            offset: 1,
        };
        let rows = db.execute(SchemaVersion(0), &page, &ctx).unwrap();
        let keys: Vec<u64> = rows
            .iter()
            .map(|t| t.field(0).unwrap().as_u64().unwrap())
            .collect();
        assert_eq!(keys, vec![2, 3]);

        let bad = Request::Select {
            space_id: SpaceId(512),
            index_id: IndexId(0),
            iterator: 99,
            key: vec![],
            limit: 1,
            offset: 0,
        };
        let err = db.execute(SchemaVersion(0), &bad, &ctx).unwrap_err();
        assert_eq!(err.error_code(), codes::ER_UNSUPPORTED_ITERATOR);
    }
}
