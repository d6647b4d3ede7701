use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};

use sheetwright_core::{
    field_value::FieldValue,
    ids::*,
    ledger::{BonusLedger, Contribution},
    state::{CanonicalState, DerivedFields, EntitySnapshot, SubEntity},
};

use crate::error::StorageError;
use crate::traits::DocumentStore;

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn require_rows(changed: usize, what: impl FnOnce() -> String) -> Result<(), StorageError> {
    if changed == 0 {
        Err(StorageError::NotFound(what()))
    } else {
        Ok(())
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn require_entity(&self, entity_id: EntityId) -> Result<(), StorageError> {
        if self.entity_exists(entity_id)? {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("entity {entity_id}")))
        }
    }

    fn load_fields(&self, entity_id: EntityId) -> Result<BTreeMap<String, FieldValue>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT field_key, value FROM fields WHERE entity_id = ?1")?;
        let rows = stmt.query_map([entity_id.as_bytes().as_slice()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut fields = BTreeMap::new();
        for row in rows {
            let (key, bytes) = row?;
            fields.insert(key, FieldValue::from_msgpack(&bytes)?);
        }
        Ok(fields)
    }

    fn load_collections(
        &self,
        entity_id: EntityId,
    ) -> Result<BTreeMap<String, BTreeMap<SubEntityId, SubEntity>>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM sub_entities WHERE entity_id = ?1")?;
        let rows = stmt.query_map([entity_id.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut collections: BTreeMap<String, BTreeMap<SubEntityId, SubEntity>> = BTreeMap::new();
        for row in rows {
            let sub: SubEntity = rmp_serde::from_slice(&row?)?;
            collections
                .entry(sub.collection.clone())
                .or_default()
                .insert(sub.id, sub);
        }
        Ok(collections)
    }

    fn load_ledger(&self, entity_id: EntityId) -> Result<BonusLedger, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT provenance, contribution FROM ledger WHERE entity_id = ?1")?;
        let rows = stmt.query_map([entity_id.as_bytes().as_slice()], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut ledger = BonusLedger::new();
        for row in rows {
            let (tag, bytes) = row?;
            let tag = ProvenanceTag::from_bytes(to_array::<16>(tag, "provenance")?);
            let contribution: Contribution = rmp_serde::from_slice(&bytes)?;
            ledger.record(tag, contribution);
        }
        Ok(ledger)
    }
}

impl DocumentStore for SqliteStore {
    fn insert_entity(&mut self, snapshot: &EntitySnapshot) -> Result<(), StorageError> {
        let id = snapshot.entity_id.as_bytes().as_slice();
        let tx = self.conn.transaction()?;
        let result = tx.execute(
            "INSERT INTO entities (entity_id, revision) VALUES (?1, ?2)",
            rusqlite::params![id, snapshot.revision as i64],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::EntityCollision {
                    entity_id: snapshot.entity_id.to_string(),
                });
            }
            Err(e) => return Err(StorageError::Sqlite(e)),
        }

        for (key, value) in &snapshot.canonical.fields {
            tx.execute(
                "INSERT INTO fields (entity_id, field_key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, key, value.to_msgpack()?],
            )?;
        }
        for sub in snapshot.canonical.sub_entities() {
            tx.execute(
                "INSERT INTO sub_entities (entity_id, sub_id, collection, body) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id,
                    sub.id.as_bytes().as_slice(),
                    sub.collection,
                    rmp_serde::to_vec(sub)?,
                ],
            )?;
        }
        for (tag, contribution) in snapshot.canonical.ledger.entries() {
            tx.execute(
                "INSERT INTO ledger (entity_id, provenance, contribution) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, tag.as_bytes().as_slice(), rmp_serde::to_vec(contribution)?],
            )?;
        }
        tx.execute(
            "INSERT INTO derived (entity_id, body) VALUES (?1, ?2)",
            rusqlite::params![id, rmp_serde::to_vec(&snapshot.derived)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_entity(&self, entity_id: EntityId) -> Result<Option<EntitySnapshot>, StorageError> {
        let revision: Option<i64> = self
            .conn
            .query_row(
                "SELECT revision FROM entities WHERE entity_id = ?1",
                [entity_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(revision) = revision else {
            return Ok(None);
        };

        let derived_bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT body FROM derived WHERE entity_id = ?1",
                [entity_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        let derived = match derived_bytes {
            Some(bytes) => rmp_serde::from_slice(&bytes)?,
            None => DerivedFields::default(),
        };

        Ok(Some(EntitySnapshot {
            entity_id,
            revision: revision as u64,
            canonical: CanonicalState {
                fields: self.load_fields(entity_id)?,
                collections: self.load_collections(entity_id)?,
                ledger: self.load_ledger(entity_id)?,
            },
            derived,
        }))
    }

    fn entity_exists(&self, entity_id: EntityId) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM entities WHERE entity_id = ?1",
                [entity_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_field(
        &mut self,
        entity_id: EntityId,
        field_key: &str,
        value: Option<&FieldValue>,
    ) -> Result<(), StorageError> {
        self.require_entity(entity_id)?;
        let id = entity_id.as_bytes().as_slice();
        match value {
            Some(value) => {
                self.conn.execute(
                    "INSERT INTO fields (entity_id, field_key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT (entity_id, field_key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![id, field_key, value.to_msgpack()?],
                )?;
            }
            None => {
                self.conn.execute(
                    "DELETE FROM fields WHERE entity_id = ?1 AND field_key = ?2",
                    rusqlite::params![id, field_key],
                )?;
            }
        }
        Ok(())
    }

    fn put_sub_entity(&mut self, entity_id: EntityId, sub: &SubEntity) -> Result<(), StorageError> {
        self.require_entity(entity_id)?;
        self.conn.execute(
            "INSERT INTO sub_entities (entity_id, sub_id, collection, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, sub_id) DO UPDATE SET collection = excluded.collection, body = excluded.body",
            rusqlite::params![
                entity_id.as_bytes().as_slice(),
                sub.id.as_bytes().as_slice(),
                sub.collection,
                rmp_serde::to_vec(sub)?,
            ],
        )?;
        Ok(())
    }

    fn remove_sub_entity(
        &mut self,
        entity_id: EntityId,
        collection: &str,
        sub_id: SubEntityId,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "DELETE FROM sub_entities WHERE entity_id = ?1 AND sub_id = ?2 AND collection = ?3",
            rusqlite::params![
                entity_id.as_bytes().as_slice(),
                sub_id.as_bytes().as_slice(),
                collection,
            ],
        )?;
        require_rows(changed, || format!("sub-entity {sub_id} in {collection}"))
    }

    fn put_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
        contribution: &Contribution,
    ) -> Result<(), StorageError> {
        self.require_entity(entity_id)?;
        self.conn.execute(
            "INSERT INTO ledger (entity_id, provenance, contribution) VALUES (?1, ?2, ?3)
             ON CONFLICT (entity_id, provenance) DO UPDATE SET contribution = excluded.contribution",
            rusqlite::params![
                entity_id.as_bytes().as_slice(),
                provenance.as_bytes().as_slice(),
                rmp_serde::to_vec(contribution)?,
            ],
        )?;
        Ok(())
    }

    fn remove_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "DELETE FROM ledger WHERE entity_id = ?1 AND provenance = ?2",
            rusqlite::params![entity_id.as_bytes().as_slice(), provenance.as_bytes().as_slice()],
        )?;
        require_rows(changed, || format!("ledger entry {provenance}"))
    }

    fn write_derived(
        &mut self,
        entity_id: EntityId,
        derived: &DerivedFields,
        revision: u64,
    ) -> Result<(), StorageError> {
        let id = entity_id.as_bytes().as_slice();
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE entities SET revision = ?1 WHERE entity_id = ?2",
            rusqlite::params![revision as i64, id],
        )?;
        require_rows(changed, || format!("entity {entity_id}"))?;
        tx.execute(
            "INSERT INTO derived (entity_id, body) VALUES (?1, ?2)
             ON CONFLICT (entity_id) DO UPDATE SET body = excluded.body",
            rusqlite::params![id, rmp_serde::to_vec(derived)?],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetwright_core::{
        ledger::Grant,
        rules::{BonusCategory, RuleElement},
        state::EffectInstance,
    };

    fn sample() -> EntitySnapshot {
        let mut canonical = CanonicalState::default();
        canonical.fields.insert("name".into(), FieldValue::Text("Ilsa".into()));
        canonical.fields.insert("strength".into(), FieldValue::Integer(14));
        let sub_id = SubEntityId::new();
        let effect = EffectInstance::new(RuleElement::StatBonus {
            target: "armor_class".into(),
            category: BonusCategory::non_stacking("armor"),
            amount: 4,
        });
        canonical.ledger.record(
            effect.provenance,
            Contribution {
                carrier: sub_id,
                grants: vec![Grant::Bonus {
                    target: "armor_class".into(),
                    category: BonusCategory::non_stacking("armor"),
                    amount: 4,
                    condition: None,
                }],
            },
        );
        canonical.insert_sub_entity(SubEntity {
            id: sub_id,
            collection: "gear".into(),
            fields: BTreeMap::from([("name".to_string(), FieldValue::Text("chain shirt".into()))]),
            effects: vec![effect],
        });
        EntitySnapshot {
            entity_id: EntityId::new(),
            revision: 1,
            canonical,
            derived: DerivedFields::default(),
        }
    }

    #[test]
    fn insert_then_load_is_identical() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let snapshot = sample();
        store.insert_entity(&snapshot).unwrap();
        assert_eq!(store.load_entity(snapshot.entity_id).unwrap(), Some(snapshot));
    }

    #[test]
    fn duplicate_insert_collides() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let snapshot = sample();
        store.insert_entity(&snapshot).unwrap();
        assert!(matches!(
            store.insert_entity(&snapshot),
            Err(StorageError::EntityCollision { .. })
        ));
    }

    #[test]
    fn field_writes_and_clears() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let snapshot = sample();
        let id = snapshot.entity_id;
        store.insert_entity(&snapshot).unwrap();

        store.set_field(id, "level", Some(&FieldValue::Integer(3))).unwrap();
        store.set_field(id, "name", None).unwrap();
        let loaded = store.load_entity(id).unwrap().unwrap();
        assert_eq!(loaded.field("level"), Some(&FieldValue::Integer(3)));
        assert_eq!(loaded.field("name"), None);
    }

    #[test]
    fn writes_to_unknown_entity_fail() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = EntityId::new();
        assert!(matches!(
            store.set_field(id, "x", Some(&FieldValue::Null)),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.write_derived(id, &DerivedFields::default(), 2),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn removing_missing_rows_is_not_found() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let snapshot = sample();
        store.insert_entity(&snapshot).unwrap();
        assert!(matches!(
            store.remove_sub_entity(snapshot.entity_id, "gear", SubEntityId::new()),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.remove_ledger_entry(snapshot.entity_id, ProvenanceTag::new()),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.db");
        let path = path.to_str().unwrap();
        let snapshot = sample();
        {
            let mut store = SqliteStore::open(path).unwrap();
            store.insert_entity(&snapshot).unwrap();
            store
                .write_derived(snapshot.entity_id, &DerivedFields::default(), 2)
                .unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        let loaded = store.load_entity(snapshot.entity_id).unwrap().unwrap();
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.canonical, snapshot.canonical);
    }

    #[test]
    fn schema_version_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheets.db");
        let path = path.to_str().unwrap();
        drop(SqliteStore::open(path).unwrap());
        let store = SqliteStore::open(path).unwrap();
        let versions: Vec<i32> = store
            .conn
            .prepare("SELECT version FROM schema_version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(versions, vec![crate::schema::SCHEMA_VERSION]);
    }
}
