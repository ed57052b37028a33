//! The catalog: databases, collections, schemas and index metadata.

use otterbrix_core::{CollectionName, Error, Result, Schema, StorageKind};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Index metadata as the catalog records it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    /// Index name
    pub name: String,
    /// Key column path
    pub column: String,
    /// Unique flag
    pub unique: bool,
}

/// One collection's catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    /// Column schema
    pub schema: Schema,
    /// Memory-resident or disk-backed
    pub storage: StorageKind,
    /// Registered indexes
    pub indexes: Vec<IndexDef>,
}

#[derive(Debug, Default)]
struct CatalogInner {
    databases: BTreeMap<String, BTreeMap<String, CollectionEntry>>,
}

/// In-memory catalog behind a read-write lock.
///
/// Lookups are synchronous for the dispatcher; schema changes take the
/// write lock briefly. Durability comes from catalog WAL records, not
/// from the catalog itself.
#[derive(Debug, Default)]
pub struct Catalog {
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Register a database.
    pub fn create_database(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.databases.contains_key(name) {
            return Err(Error::DatabaseAlreadyExists {
                name: name.to_string(),
            });
        }
        inner.databases.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    /// Remove a database, returning the collections it held.
    pub fn drop_database(&self, name: &str) -> Result<Vec<CollectionName>> {
        let mut inner = self.inner.write();
        let collections = inner
            .databases
            .remove(name)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: name.to_string(),
            })?;
        Ok(collections
            .into_keys()
            .map(|collection| CollectionName::new(name, collection))
            .collect())
    }

    /// Whether a database exists.
    pub fn has_database(&self, name: &str) -> bool {
        self.inner.read().databases.contains_key(name)
    }

    /// Register a collection under an existing database.
    pub fn create_collection(
        &self,
        name: &CollectionName,
        schema: Schema,
        storage: StorageKind,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let database = inner
            .databases
            .get_mut(&name.database)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: name.database.clone(),
            })?;
        if database.contains_key(&name.collection) {
            return Err(Error::CollectionAlreadyExists {
                name: name.to_string(),
            });
        }
        database.insert(
            name.collection.clone(),
            CollectionEntry {
                schema,
                storage,
                indexes: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove a collection.
    pub fn drop_collection(&self, name: &CollectionName) -> Result<()> {
        let mut inner = self.inner.write();
        let database = inner
            .databases
            .get_mut(&name.database)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: name.database.clone(),
            })?;
        database
            .remove(&name.collection)
            .ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })?;
        Ok(())
    }

    /// Copy of a collection's entry.
    pub fn collection(&self, name: &CollectionName) -> Result<CollectionEntry> {
        let inner = self.inner.read();
        inner
            .databases
            .get(&name.database)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: name.database.clone(),
            })?
            .get(&name.collection)
            .cloned()
            .ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })
    }

    /// Whether a collection exists.
    pub fn has_collection(&self, name: &CollectionName) -> bool {
        self.collection(name).is_ok()
    }

    /// Record an index on a collection.
    pub fn add_index(&self, name: &CollectionName, index: IndexDef) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .databases
            .get_mut(&name.database)
            .and_then(|db| db.get_mut(&name.collection))
            .ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })?;
        if entry.indexes.iter().any(|i| i.name == index.name) {
            return Err(Error::IndexCreate {
                what: format!("index {} already exists on {}", index.name, name),
            });
        }
        entry.indexes.push(index);
        Ok(())
    }

    /// Remove an index record. Returns whether it existed.
    pub fn remove_index(&self, name: &CollectionName, index_name: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let entry = inner
            .databases
            .get_mut(&name.database)
            .and_then(|db| db.get_mut(&name.collection))
            .ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })?;
        let before = entry.indexes.len();
        entry.indexes.retain(|i| i.name != index_name);
        Ok(entry.indexes.len() != before)
    }

    /// Every collection in name order.
    pub fn all_collections(&self) -> Vec<(CollectionName, CollectionEntry)> {
        let inner = self.inner.read();
        inner
            .databases
            .iter()
            .flat_map(|(database, collections)| {
                collections.iter().map(move |(collection, entry)| {
                    (CollectionName::new(database, collection), entry.clone())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otterbrix_core::{ColumnDefinition, LogicalType};

    fn schema() -> Schema {
        Schema::new(vec![ColumnDefinition::new("a", LogicalType::BigInt)])
    }

    #[test]
    fn database_lifecycle() {
        let catalog = Catalog::new();
        catalog.create_database("db").unwrap();
        assert!(catalog.has_database("db"));
        assert!(matches!(
            catalog.create_database("db"),
            Err(Error::DatabaseAlreadyExists { .. })
        ));
        assert!(catalog.drop_database("db").unwrap().is_empty());
        assert!(!catalog.has_database("db"));
        assert!(matches!(
            catalog.drop_database("db"),
            Err(Error::DatabaseNotExists { .. })
        ));
    }

    #[test]
    fn collection_requires_database() {
        let catalog = Catalog::new();
        let name = CollectionName::new("db", "t");
        assert!(matches!(
            catalog.create_collection(&name, schema(), StorageKind::Memory),
            Err(Error::DatabaseNotExists { .. })
        ));

        catalog.create_database("db").unwrap();
        catalog
            .create_collection(&name, schema(), StorageKind::Disk)
            .unwrap();
        assert!(catalog.has_collection(&name));
        assert_eq!(
            catalog.collection(&name).unwrap().storage,
            StorageKind::Disk
        );
        assert!(matches!(
            catalog.create_collection(&name, schema(), StorageKind::Memory),
            Err(Error::CollectionAlreadyExists { .. })
        ));
    }

    #[test]
    fn drop_database_lists_collections() {
        let catalog = Catalog::new();
        catalog.create_database("db").unwrap();
        for coll in ["a", "b"] {
            catalog
                .create_collection(
                    &CollectionName::new("db", coll),
                    schema(),
                    StorageKind::Memory,
                )
                .unwrap();
        }
        let dropped = catalog.drop_database("db").unwrap();
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn index_records() {
        let catalog = Catalog::new();
        let name = CollectionName::new("db", "t");
        catalog.create_database("db").unwrap();
        catalog
            .create_collection(&name, schema(), StorageKind::Memory)
            .unwrap();

        catalog
            .add_index(
                &name,
                IndexDef {
                    name: "idx_a".to_string(),
                    column: "a".to_string(),
                    unique: false,
                },
            )
            .unwrap();
        assert_eq!(catalog.collection(&name).unwrap().indexes.len(), 1);
        assert!(catalog
            .add_index(
                &name,
                IndexDef {
                    name: "idx_a".to_string(),
                    column: "a".to_string(),
                    unique: false,
                }
            )
            .is_err());
        assert!(catalog.remove_index(&name, "idx_a").unwrap());
        assert!(!catalog.remove_index(&name, "idx_a").unwrap());
    }
}
