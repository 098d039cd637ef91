//! Transactions: a statement list with undo information.
//!
//! Statements apply to the indexes immediately (memtx style); the undo
//! records make rollback possible until the rows are durable. After a
//! successful prepare plus log write, commit only flips state.

use std::sync::Arc;

use kestrel_common::error::EngineError;
use kestrel_common::types::IndexId;
use kestrel_index::{DupPolicy, FieldValue, Tuple};
use kestrel_protocol::Row;

use crate::space::Space;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

/// One applied statement and its pre-image.
pub struct TxnStmt {
    space: Arc<Space>,
    new_tuple: Option<Tuple>,
    old_tuple: Option<Tuple>,
}

pub struct Txn {
    id: u64,
    state: TxnState,
    stmts: Vec<TxnStmt>,
    /// Log rows in statement order; lsns are assigned at journal write.
    rows: Vec<Row>,
}

impl Txn {
    pub fn new(id: u64) -> Txn {
        Txn {
            id,
            state: TxnState::Active,
            stmts: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    /// Apply a replace-family statement and record its undo info.
    pub fn execute_replace(
        &mut self,
        space: &Arc<Space>,
        tuple: &Tuple,
        policy: DupPolicy,
        row: Row,
    ) -> Result<Option<Tuple>, EngineError> {
        debug_assert_eq!(self.state, TxnState::Active);
        let old = space.replace(tuple, policy)?;
        self.stmts.push(TxnStmt {
            space: Arc::clone(space),
            new_tuple: Some(tuple.clone()),
            old_tuple: old.clone(),
        });
        self.rows.push(row);
        Ok(old)
    }

    /// Apply a delete statement. A miss is not an error and leaves no
    /// trace in the statement list or the log.
    pub fn execute_delete(
        &mut self,
        space: &Arc<Space>,
        index_id: IndexId,
        key: &[FieldValue],
        row: Row,
    ) -> Result<Option<Tuple>, EngineError> {
        debug_assert_eq!(self.state, TxnState::Active);
        let old = match space.delete(index_id, key)? {
            Some(old) => old,
            None => return Ok(None),
        };
        self.stmts.push(TxnStmt {
            space: Arc::clone(space),
            new_tuple: None,
            old_tuple: Some(old.clone()),
        });
        self.rows.push(row);
        Ok(Some(old))
    }

    pub fn mark_prepared(&mut self) {
        self.state = TxnState::Prepared;
    }

    pub fn mark_committed(&mut self) {
        self.state = TxnState::Committed;
    }

    /// Undo every statement in reverse order.
    pub fn undo(&mut self) {
        for stmt in self.stmts.drain(..).rev() {
            stmt.space
                .restore(stmt.new_tuple.as_ref(), stmt.old_tuple.as_ref());
        }
        self.rows.clear();
        self.state = TxnState::RolledBack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::space::IndexDef;
    use kestrel_common::types::{Lsn, ReplicaId, SpaceId};
    use kestrel_index::{FieldType, KeyDef, KeyPart};
    use kestrel_protocol::codec::Request;
    use rmpv::Value;

    fn space() -> Arc<Space> {
        Arc::new(
            Space::new(
                SpaceId(1),
                "t",
                EngineKind::Memtx,
                vec![IndexDef {
                    id: IndexId(0),
                    name: "primary".into(),
                    key_def: KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], true),
                }],
            )
            .unwrap(),
        )
    }

    fn row_for(space_id: SpaceId, key: u64) -> Row {
        Row::from_request(
            ReplicaId(0),
            Lsn(0),
            0.0,
            &Request::Replace {
                space_id,
                tuple: vec![Value::from(key)],
            },
        )
    }

    fn tup(key: u64) -> Tuple {
        Tuple::new(vec![Value::from(key)])
    }

    #[test]
    fn rollback_undoes_in_reverse() {
        let space = space();
        space.replace(&tup(1), DupPolicy::InsertOnly).unwrap();

        let mut txn = Txn::new(1);
        txn.execute_replace(
            &space,
            &Tuple::new(vec![Value::from(1u64), Value::from("v2")]),
            DupPolicy::ReplaceOrInsert,
            row_for(SpaceId(1), 1),
        )
        .unwrap();
        txn.execute_replace(&space, &tup(2), DupPolicy::InsertOnly, row_for(SpaceId(1), 2))
            .unwrap();
        txn.execute_delete(
            &space,
            IndexId(0),
            &[FieldValue::Unsigned(1)],
            row_for(SpaceId(1), 1),
        )
        .unwrap();
        assert_eq!(space.len(), 1);

        txn.undo();
        assert_eq!(txn.state(), TxnState::RolledBack);
        assert_eq!(space.len(), 1);
        assert_eq!(
            space.primary().find(&[FieldValue::Unsigned(1)]).unwrap().unwrap(),
            tup(1)
        );
    }

    #[test]
    fn delete_miss_leaves_no_row() {
        let space = space();
        let mut txn = Txn::new(1);
        let old = txn
            .execute_delete(
                &space,
                IndexId(0),
                &[FieldValue::Unsigned(9)],
                row_for(SpaceId(1), 9),
            )
            .unwrap();
        assert!(old.is_none());
        assert!(txn.is_empty());
        assert!(txn.rows_mut().is_empty());
    }
}
