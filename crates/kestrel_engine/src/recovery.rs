//! Instance recovery: latest snapshot, then the log tail.
//!
//! Snapshot rows fill primaries only; secondaries are bulk-built once in
//! a single pass afterwards. Log rows replay through full index
//! maintenance with the recovered vclock filtering out rows the snapshot
//! already covers. A truncated tail on the newest segment is the normal
//! shape of a crash and ends replay with a warning.

use kestrel_common::error::{KestrelError, WalError};
use kestrel_common::vclock::Vclock;
use kestrel_index::{DupPolicy, Tuple};
use kestrel_protocol::codec::Request;
use kestrel_protocol::Row;
use kestrel_wal::{CursorOptions, XlogDir};

use crate::schema::SchemaCache;
use crate::update;

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryOptions {
    /// Resync past corrupted spans and accept truncated tails anywhere.
    pub force_recovery: bool,
    /// Accept blocks whose checksum does not match.
    pub ignore_crc: bool,
}

#[derive(Debug, Clone)]
pub struct Recovered {
    pub vclock: Vclock,
    /// Signature of the snapshot used, if any.
    pub snapshot: Option<i64>,
    pub rows_applied: u64,
}

/// Run recovery against a bootstrapped schema. Returns the vclock the
/// journal must resume from.
pub fn run(
    schema: &SchemaCache,
    snap_dir: &XlogDir,
    log_dir: &XlogDir,
    opts: &RecoveryOptions,
) -> Result<Recovered, KestrelError> {
    let cursor_opts = CursorOptions {
        ignore_crc: opts.ignore_crc,
        force_recovery: opts.force_recovery,
    };
    let mut vclock = Vclock::new();
    let mut rows_applied = 0u64;

    let snapshot = snap_dir.latest().map(|(sum, v)| (sum, v.clone()));
    if let Some((sum, snap_clock)) = &snapshot {
        tracing::info!(signature = sum, "recovering from snapshot");
        let mut cursor = snap_dir.open_cursor(*sum, cursor_opts)?;
        while let Some(row) = cursor.next_row()? {
            apply_snapshot_row(schema, &row)?;
            rows_applied += 1;
        }
        for space in schema.spaces() {
            space.rebuild_secondaries()?;
        }
        vclock = snap_clock.clone();
    }

    let segments: Vec<i64> = log_dir.segments().map(|(sum, _)| sum).collect();
    let first = log_dir.segment_covering(&vclock);
    let newest = segments.last().copied();
    for sum in segments {
        if let Some(first) = first {
            if sum < first {
                continue;
            }
        }
        let mut cursor = log_dir.open_cursor(sum, cursor_opts)?;
        loop {
            let row = match cursor.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(
                    e @ (WalError::TruncatedHeader { .. } | WalError::TruncatedBody { .. }),
                ) if Some(sum) == newest => {
                    // A crash can cut the newest segment mid-block; the
                    // writer's truncate-on-error protects everything
                    // before it.
                    tracing::warn!(signature = sum, error = %e, "log tail truncated, replay ends");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if row.lsn.0 <= vclock.get(row.replica_id).0 {
                continue;
            }
            match apply_log_row(schema, &row) {
                Ok(()) => {
                    vclock.follow(row.replica_id, row.lsn)?;
                    rows_applied += 1;
                }
                Err(e) => {
                    if opts.force_recovery {
                        tracing::warn!(lsn = row.lsn.0, error = %e, "skipping unreplayable row");
                        vclock.follow(row.replica_id, row.lsn)?;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    tracing::info!(
        rows = rows_applied,
        vclock = %vclock,
        "recovery complete"
    );
    Ok(Recovered {
        vclock,
        snapshot: snapshot.map(|(sum, _)| sum),
        rows_applied,
    })
}

fn apply_snapshot_row(schema: &SchemaCache, row: &Row) -> Result<(), KestrelError> {
    match row.to_request()? {
        Request::Replace { space_id, tuple } | Request::Insert { space_id, tuple } => {
            let space = match schema.space(space_id) {
                Ok(space) => space,
                Err(e) => {
                    // A space dropped from the configuration; its data
                    // has nowhere to go.
                    tracing::warn!(space = %space_id, error = %e, "snapshot row for unknown space skipped");
                    return Ok(());
                }
            };
            space.recover_replace(&Tuple::new(tuple))?;
            Ok(())
        }
        other => {
            tracing::warn!(request = ?other, "unexpected snapshot row type skipped");
            Ok(())
        }
    }
}

/// Replay one log row with full index maintenance.
fn apply_log_row(schema: &SchemaCache, row: &Row) -> Result<(), KestrelError> {
    let request = row.to_request()?;
    match &request {
        Request::Insert { space_id, tuple } => {
            let space = schema.space(*space_id)?;
            space.replace(&Tuple::new(tuple.clone()), DupPolicy::InsertOnly)?;
        }
        Request::Replace { space_id, tuple } => {
            let space = schema.space(*space_id)?;
            space.replace(&Tuple::new(tuple.clone()), DupPolicy::ReplaceOrInsert)?;
        }
        Request::Update {
            space_id,
            index_id,
            key,
            ops,
        } => {
            let space = schema.space(*space_id)?;
            let index = space.index(*index_id)?;
            let key = index.cmp_def().validate_key(key)?;
            if let Some(old) = index.find(&key)? {
                let new = update::apply_ops(&old, ops)?;
                space.replace(&new, DupPolicy::ReplaceOnly)?;
            }
        }
        Request::Upsert {
            space_id,
            tuple,
            ops,
        } => {
            let space = schema.space(*space_id)?;
            let tuple = Tuple::new(tuple.clone());
            let pk = space.primary().cmp_def().extract_key(&tuple)?;
            match space.primary().find(&pk)? {
                Some(old) => {
                    let new = update::apply_ops(&old, ops)?;
                    space.replace(&new, DupPolicy::ReplaceOnly)?;
                }
                None => {
                    space.replace(&tuple, DupPolicy::InsertOnly)?;
                }
            }
        }
        Request::Delete {
            space_id,
            index_id,
            key,
        } => {
            let space = schema.space(*space_id)?;
            let index = space.index(*index_id)?;
            let key = index.cmp_def().validate_key(key)?;
            space.delete(*index_id, &key)?;
        }
        other => {
            tracing::warn!(request = ?other, "non-DML log row skipped");
        }
    }
    Ok(())
}
