//! Spaces: named tuple containers with one primary and any number of
//! secondary indexes.
//!
//! DML goes through the primary first; secondaries follow. A conflict in
//! any index undoes everything already applied, so no partial state is
//! ever visible, mirroring the per-index optimistic-insert discipline.

use std::sync::Arc;

use kestrel_common::config::SpaceConfig;
use kestrel_common::error::{EngineError, IndexError};
use kestrel_common::types::{IndexId, SpaceId};
use kestrel_index::{
    DupPolicy, FieldType, FieldValue, IteratorType, KeyDef, KeyPart, TreeIndex, Tuple,
};

use crate::engine::EngineKind;

/// Declared shape of one index.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    pub key_def: KeyDef,
}

pub struct Space {
    id: SpaceId,
    name: String,
    engine: EngineKind,
    defs: Vec<IndexDef>,
    /// Position i holds index id i; index 0 is the primary.
    indexes: Vec<Arc<TreeIndex>>,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("defs", &self.defs)
            .field("index_count", &self.indexes.len())
            .finish()
    }
}

impl Space {
    /// Create a space. The first definition is the primary and must be
    /// unique; non-unique secondaries get their comparator extended with
    /// the primary parts inside `TreeIndex`.
    pub fn new(
        id: SpaceId,
        name: impl Into<String>,
        engine: EngineKind,
        defs: Vec<IndexDef>,
    ) -> Result<Space, EngineError> {
        let name = name.into();
        let primary_def = defs
            .first()
            .ok_or_else(|| EngineError::SpaceDef(format!("space '{name}' has no indexes")))?;
        if !primary_def.key_def.unique {
            return Err(EngineError::SpaceDef(format!(
                "primary index of space '{name}' must be unique"
            )));
        }
        let mut indexes = Vec::with_capacity(defs.len());
        for (pos, def) in defs.iter().enumerate() {
            if def.id.0 as usize != pos {
                return Err(EngineError::SpaceDef(format!(
                    "index ids of space '{name}' must be dense from 0"
                )));
            }
            let primary = if pos == 0 { None } else { Some(&primary_def.key_def) };
            indexes.push(Arc::new(TreeIndex::new(
                name.clone(),
                def.name.clone(),
                def.key_def.clone(),
                primary,
            )));
        }
        Ok(Space {
            id,
            name,
            engine,
            defs,
            indexes,
        })
    }

    pub fn from_config(cfg: &SpaceConfig) -> Result<Space, EngineError> {
        let mut defs = Vec::with_capacity(cfg.indexes.len());
        for index in &cfg.indexes {
            let mut parts = Vec::with_capacity(index.parts.len());
            for part in &index.parts {
                let field_type = parse_field_type(&part.field_type).ok_or_else(|| {
                    EngineError::SpaceDef(format!(
                        "index '{}' part type '{}' is unknown",
                        index.name, part.field_type
                    ))
                })?;
                let mut key_part = KeyPart::new(part.field, field_type);
                key_part.nullable = part.nullable;
                parts.push(key_part);
            }
            defs.push(IndexDef {
                id: IndexId(index.id),
                name: index.name.clone(),
                key_def: KeyDef::new(parts, index.unique),
            });
        }
        Space::new(SpaceId(cfg.id), cfg.name.clone(), EngineKind::Memtx, defs)
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn primary(&self) -> &Arc<TreeIndex> {
        &self.indexes[0]
    }

    pub fn index(&self, id: IndexId) -> Result<&Arc<TreeIndex>, EngineError> {
        self.indexes
            .get(id.0 as usize)
            .ok_or(EngineError::NoSuchIndex {
                space: self.name.clone(),
                index: id,
            })
    }

    pub fn index_defs(&self) -> &[IndexDef] {
        &self.defs
    }

    pub fn len(&self) -> usize {
        self.primary().len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary().is_empty()
    }

    /// Apply a replace-family statement across all indexes. Returns the
    /// displaced tuple, if any. A conflict anywhere undoes every index
    /// already touched before the error surfaces.
    pub fn replace(
        &self,
        tuple: &Tuple,
        policy: DupPolicy,
    ) -> Result<Option<Tuple>, EngineError> {
        // Validate against every index up front so a bad tuple cannot
        // leave the indexes disagreeing.
        for index in &self.indexes {
            index.cmp_def().validate_tuple(tuple)?;
        }
        let old = self.primary().insert(tuple, policy)?;
        for (pos, index) in self.indexes.iter().enumerate().skip(1) {
            if let Some(old) = &old {
                index.remove_tuple(old)?;
            }
            if let Err(e) = index.insert(tuple, DupPolicy::InsertOnly) {
                self.undo_replace(tuple, old.as_ref(), pos);
                return Err(e.into());
            }
        }
        Ok(old)
    }

    /// Undo a partially applied replace: secondaries `1..failed` plus the
    /// primary go back to their pre-statement content.
    fn undo_replace(&self, tuple: &Tuple, old: Option<&Tuple>, failed: usize) {
        for index in self.indexes[1..failed].iter().rev() {
            if let Err(e) = index.remove_tuple(tuple) {
                tracing::error!(space = %self.name, error = %e, "replace undo failed");
            }
            if let Some(old) = old {
                if let Err(e) = index.insert(old, DupPolicy::ReplaceOrInsert) {
                    tracing::error!(space = %self.name, error = %e, "replace undo failed");
                }
            }
        }
        let undo = match old {
            Some(old) => self.primary().insert(old, DupPolicy::ReplaceOrInsert).map(|_| ()),
            None => self.primary().remove_tuple(tuple).map(|_| ()),
        };
        if let Err(e) = undo {
            tracing::error!(space = %self.name, error = %e, "replace undo failed");
        }
    }

    /// Remove the tuple found by a full key on a unique index. `None`
    /// when no tuple matches.
    pub fn delete(
        &self,
        index_id: IndexId,
        key: &[FieldValue],
    ) -> Result<Option<Tuple>, EngineError> {
        let index = self.index(index_id)?;
        let victim = match index.find(key)? {
            Some(tuple) => tuple,
            None => return Ok(None),
        };
        self.remove(&victim)?;
        Ok(Some(victim))
    }

    /// Remove a known-live tuple from every index.
    pub fn remove(&self, tuple: &Tuple) -> Result<(), EngineError> {
        for index in &self.indexes {
            index.remove_tuple(tuple)?;
        }
        Ok(())
    }

    /// Restore a statement's pre-image: drop `new` (if it was applied)
    /// and reinstate `old` (if one was displaced). Used by transaction
    /// rollback; failures here are internal bugs, logged not raised.
    pub fn restore(&self, new: Option<&Tuple>, old: Option<&Tuple>) {
        if let Some(new) = new {
            if let Err(e) = self.remove(new) {
                tracing::error!(space = %self.name, error = %e, "rollback remove failed");
            }
        }
        if let Some(old) = old {
            if let Err(e) = self.replace(old, DupPolicy::ReplaceOrInsert) {
                tracing::error!(space = %self.name, error = %e, "rollback reinstate failed");
            }
        }
    }

    /// Fast path for snapshot load: the primary only, secondaries are
    /// bulk-built afterwards by `rebuild_secondaries`.
    pub fn recover_replace(&self, tuple: &Tuple) -> Result<(), EngineError> {
        self.primary().insert(tuple, DupPolicy::ReplaceOrInsert)?;
        Ok(())
    }

    /// Two-phase bulk build of every secondary from the primary content.
    pub fn rebuild_secondaries(&self) -> Result<(), EngineError> {
        for index in self.indexes.iter().skip(1) {
            index.build_begin();
            let mut it = self.primary().iterate(IteratorType::All, Vec::new());
            it.freeze();
            while let Some(tuple) = it.next() {
                index.build_add(tuple)?;
            }
            index.build_end()?;
        }
        Ok(())
    }

    /// A copy of this space with one more secondary index, already built
    /// from the current primary content through a frozen iterator. The
    /// existing index handles are shared; the caller swaps the new value
    /// into the schema cache.
    pub fn with_new_index(&self, def: IndexDef) -> Result<Space, EngineError> {
        if def.id.0 as usize != self.indexes.len() {
            return Err(EngineError::SpaceDef(format!(
                "next index id for space '{}' is {}",
                self.name,
                self.indexes.len()
            )));
        }
        let index = Arc::new(TreeIndex::new(
            self.name.clone(),
            def.name.clone(),
            def.key_def.clone(),
            Some(&self.defs[0].key_def),
        ));
        index.build_begin();
        let mut it = self.primary().iterate(IteratorType::All, Vec::new());
        it.freeze();
        while let Some(tuple) = it.next() {
            index.build_add(tuple)?;
        }
        index.build_end()?;

        let mut defs = self.defs.clone();
        defs.push(def);
        let mut indexes = self.indexes.clone();
        indexes.push(index);
        Ok(Space {
            id: self.id,
            name: self.name.clone(),
            engine: self.engine,
            defs,
            indexes,
        })
    }
}

fn parse_field_type(name: &str) -> Option<FieldType> {
    match name {
        "unsigned" => Some(FieldType::Unsigned),
        "integer" => Some(FieldType::Integer),
        "double" => Some(FieldType::Double),
        "string" => Some(FieldType::String),
        "boolean" => Some(FieldType::Boolean),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn two_index_space() -> Space {
        // Primary on field 0 (unsigned), unique secondary on field 1 (string).
        Space::new(
            SpaceId(512),
            "users",
            EngineKind::Memtx,
            vec![
                IndexDef {
                    id: IndexId(0),
                    name: "primary".into(),
                    key_def: KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], true),
                },
                IndexDef {
                    id: IndexId(1),
                    name: "name".into(),
                    key_def: KeyDef::new(vec![KeyPart::new(1, FieldType::String)], true),
                },
            ],
        )
        .unwrap()
    }

    fn user(id: u64, name: &str) -> Tuple {
        Tuple::new(vec![Value::from(id), Value::from(name)])
    }

    #[test]
    fn replace_maintains_all_indexes() {
        let space = two_index_space();
        space.replace(&user(1, "ann"), DupPolicy::InsertOnly).unwrap();
        space.replace(&user(2, "bob"), DupPolicy::InsertOnly).unwrap();
        assert_eq!(space.len(), 2);
        let by_name = space
            .index(IndexId(1))
            .unwrap()
            .find(&[FieldValue::Str("bob".into())])
            .unwrap()
            .unwrap();
        assert_eq!(by_name, user(2, "bob"));

        // Replace swaps the secondary entry too.
        let old = space
            .replace(&user(2, "rob"), DupPolicy::ReplaceOrInsert)
            .unwrap();
        assert_eq!(old, Some(user(2, "bob")));
        let name_index = space.index(IndexId(1)).unwrap();
        assert!(name_index.find(&[FieldValue::Str("bob".into())]).unwrap().is_none());
        assert!(name_index.find(&[FieldValue::Str("rob".into())]).unwrap().is_some());
    }

    #[test]
    fn secondary_conflict_undoes_primary() {
        let space = two_index_space();
        space.replace(&user(1, "ann"), DupPolicy::InsertOnly).unwrap();
        // New primary key but a name already taken: the unique secondary
        // rejects it and nothing may change anywhere.
        let err = space.replace(&user(2, "ann"), DupPolicy::InsertOnly).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Index(IndexError::Duplicate { .. })
        ));
        assert_eq!(space.len(), 1);
        assert_eq!(space.index(IndexId(1)).unwrap().len(), 1);
        assert_eq!(
            space
                .primary()
                .find(&[FieldValue::Unsigned(1)])
                .unwrap()
                .unwrap(),
            user(1, "ann")
        );
    }

    #[test]
    fn delete_via_secondary_key() {
        let space = two_index_space();
        space.replace(&user(1, "ann"), DupPolicy::InsertOnly).unwrap();
        let gone = space
            .delete(IndexId(1), &[FieldValue::Str("ann".into())])
            .unwrap();
        assert_eq!(gone, Some(user(1, "ann")));
        assert!(space.is_empty());
        assert!(space.index(IndexId(1)).unwrap().is_empty());
        // Deleting again is a no-op.
        assert_eq!(
            space
                .delete(IndexId(1), &[FieldValue::Str("ann".into())])
                .unwrap(),
            None
        );
    }

    #[test]
    fn restore_brings_back_pre_image() {
        let space = two_index_space();
        space.replace(&user(1, "ann"), DupPolicy::InsertOnly).unwrap();
        let old = space
            .replace(&user(1, "anne"), DupPolicy::ReplaceOrInsert)
            .unwrap();
        space.restore(Some(&user(1, "anne")), old.as_ref());
        assert_eq!(
            space
                .primary()
                .find(&[FieldValue::Unsigned(1)])
                .unwrap()
                .unwrap(),
            user(1, "ann")
        );
    }

    #[test]
    fn snapshot_load_then_rebuild() {
        let space = two_index_space();
        for (id, name) in [(3u64, "c"), (1, "a"), (2, "b")] {
            space.recover_replace(&user(id, name)).unwrap();
        }
        // Secondaries are stale until rebuilt.
        assert_eq!(space.index(IndexId(1)).unwrap().len(), 0);
        space.rebuild_secondaries().unwrap();
        assert_eq!(space.index(IndexId(1)).unwrap().len(), 3);
    }

    #[test]
    fn with_new_index_builds_from_live_content() {
        let space = Space::new(
            SpaceId(1),
            "s",
            EngineKind::Memtx,
            vec![IndexDef {
                id: IndexId(0),
                name: "primary".into(),
                key_def: KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], true),
            }],
        )
        .unwrap();
        for id in [5u64, 2, 9] {
            space.replace(&user(id, "x"), DupPolicy::InsertOnly).unwrap();
        }
        let wider = space
            .with_new_index(IndexDef {
                id: IndexId(1),
                name: "name".into(),
                key_def: KeyDef::new(vec![KeyPart::new(1, FieldType::String)], false),
            })
            .unwrap();
        assert_eq!(wider.index(IndexId(1)).unwrap().len(), 3);
        // The shared primary handle keeps serving both space values.
        assert_eq!(wider.primary().len(), space.primary().len());
    }

    #[test]
    fn non_unique_primary_rejected() {
        let err = Space::new(
            SpaceId(1),
            "bad",
            EngineKind::Memtx,
            vec![IndexDef {
                id: IndexId(0),
                name: "primary".into(),
                key_def: KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], false),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SpaceDef(_)));
    }
}
