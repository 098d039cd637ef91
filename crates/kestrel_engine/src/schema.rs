//! Schema cache: space id → space, plus the schema version stamp.
//!
//! A process-scoped registry created at startup; requests stamped with a
//! stale version are rejected before dispatch so a client raced by DDL
//! retries with fresh metadata instead of operating on the wrong shape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use kestrel_common::config::SpaceConfig;
use kestrel_common::error::EngineError;
use kestrel_common::types::{SchemaVersion, SpaceId};

use crate::space::{IndexDef, Space};

pub struct SchemaCache {
    spaces: DashMap<u32, Arc<Space>>,
    by_name: DashMap<String, u32>,
    version: AtomicU64,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> SchemaCache {
        SchemaCache {
            spaces: DashMap::new(),
            by_name: DashMap::new(),
            version: AtomicU64::new(1),
        }
    }

    /// Create the spaces declared in the configuration. Runs before
    /// recovery so replayed rows find their targets.
    pub fn bootstrap(&self, configs: &[SpaceConfig]) -> Result<(), EngineError> {
        for cfg in configs {
            self.create_space(Space::from_config(cfg)?)?;
        }
        Ok(())
    }

    pub fn create_space(&self, space: Space) -> Result<Arc<Space>, EngineError> {
        let id = space.id();
        if self.spaces.contains_key(&id.0) || self.by_name.contains_key(space.name()) {
            return Err(EngineError::SpaceDef(format!(
                "space '{}' (id {}) already exists",
                space.name(),
                id
            )));
        }
        let space = Arc::new(space);
        self.by_name.insert(space.name().to_string(), id.0);
        self.spaces.insert(id.0, Arc::clone(&space));
        self.bump_version();
        Ok(space)
    }

    pub fn drop_space(&self, id: SpaceId) -> Result<(), EngineError> {
        let (_, space) = self
            .spaces
            .remove(&id.0)
            .ok_or(EngineError::NoSuchSpace(id))?;
        self.by_name.remove(space.name());
        self.bump_version();
        Ok(())
    }

    pub fn space(&self, id: SpaceId) -> Result<Arc<Space>, EngineError> {
        self.spaces
            .get(&id.0)
            .map(|s| Arc::clone(&s))
            .ok_or(EngineError::NoSuchSpace(id))
    }

    pub fn space_by_name(&self, name: &str) -> Option<Arc<Space>> {
        let id = self.by_name.get(name)?;
        self.spaces.get(&id).map(|s| Arc::clone(&s))
    }

    /// All spaces in id order (checkpoint and recovery iterate this).
    pub fn spaces(&self) -> Vec<Arc<Space>> {
        let mut all: Vec<Arc<Space>> = self.spaces.iter().map(|e| Arc::clone(&e)).collect();
        all.sort_by_key(|s| s.id());
        all
    }

    /// Add a secondary index to a space: the space value is rebuilt with
    /// the extra index (two-phase bulk build from the live primary) and
    /// swapped in; the schema version bumps so stale requests bounce.
    pub fn create_index(&self, space_id: SpaceId, def: IndexDef) -> Result<(), EngineError> {
        let current = self.space(space_id)?;
        let rebuilt = current.with_new_index(def)?;
        self.spaces.insert(space_id.0, Arc::new(rebuilt));
        self.bump_version();
        Ok(())
    }

    pub fn version(&self) -> SchemaVersion {
        SchemaVersion(self.version.load(Ordering::Acquire))
    }

    /// Zero means the request was not stamped; anything else must match.
    pub fn check_version(&self, requested: SchemaVersion) -> Result<(), EngineError> {
        let current = self.version();
        if requested.0 != 0 && requested != current {
            return Err(EngineError::SchemaVersionMismatch {
                requested: requested.0,
                current: current.0,
            });
        }
        Ok(())
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use kestrel_common::types::IndexId;
    use kestrel_index::{DupPolicy, FieldType, KeyDef, KeyPart, Tuple};
    use rmpv::Value;

    fn simple_space(id: u32, name: &str) -> Space {
        Space::new(
            SpaceId(id),
            name,
            EngineKind::Memtx,
            vec![IndexDef {
                id: IndexId(0),
                name: "primary".into(),
                key_def: KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], true),
            }],
        )
        .unwrap()
    }

    #[test]
    fn create_lookup_drop() {
        let cache = SchemaCache::new();
        cache.create_space(simple_space(512, "users")).unwrap();
        assert!(cache.space(SpaceId(512)).is_ok());
        assert!(cache.space_by_name("users").is_some());
        assert!(matches!(
            cache.space(SpaceId(9)),
            Err(EngineError::NoSuchSpace(_))
        ));
        cache.drop_space(SpaceId(512)).unwrap();
        assert!(cache.space(SpaceId(512)).is_err());
        assert!(cache.space_by_name("users").is_none());
    }

    #[test]
    fn duplicate_space_rejected() {
        let cache = SchemaCache::new();
        cache.create_space(simple_space(1, "a")).unwrap();
        assert!(cache.create_space(simple_space(1, "b")).is_err());
        assert!(cache.create_space(simple_space(2, "a")).is_err());
    }

    #[test]
    fn version_bumps_on_ddl_and_gates_requests() {
        let cache = SchemaCache::new();
        let v0 = cache.version();
        cache.create_space(simple_space(1, "a")).unwrap();
        let v1 = cache.version();
        assert!(v1 > v0);

        assert!(cache.check_version(SchemaVersion(0)).is_ok());
        assert!(cache.check_version(v1).is_ok());
        assert!(matches!(
            cache.check_version(v0),
            Err(EngineError::SchemaVersionMismatch { .. })
        ));
    }

    #[test]
    fn create_index_swaps_space_and_keeps_data() {
        let cache = SchemaCache::new();
        cache.create_space(simple_space(1, "a")).unwrap();
        let space = cache.space(SpaceId(1)).unwrap();
        space
            .replace(
                &Tuple::new(vec![Value::from(1u64), Value::from("x")]),
                DupPolicy::InsertOnly,
            )
            .unwrap();

        cache
            .create_index(
                SpaceId(1),
                IndexDef {
                    id: IndexId(1),
                    name: "by_name".into(),
                    key_def: KeyDef::new(vec![KeyPart::new(1, FieldType::String)], false),
                },
            )
            .unwrap();
        let rebuilt = cache.space(SpaceId(1)).unwrap();
        assert_eq!(rebuilt.index_defs().len(), 2);
        assert_eq!(rebuilt.index(IndexId(1)).unwrap().len(), 1);
    }
}
