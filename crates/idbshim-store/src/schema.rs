//! Store and index metadata as persisted in `__sys__`

use std::collections::BTreeMap;

use idbshim_codec::{escape_index_name, escape_store_name, sql, CodecConfig};
use serde::{Deserialize, Serialize};

use crate::backend::{Row, SqlBackend, SqlValue};
use crate::error::ShimError;
use crate::keys::KeyPath;
use crate::migrations::STORE_TABLE;
use crate::ShimResult;

/// One entry of a store's index list. Deleted indexes stay in the list as
/// tombstones because their column is still on the data table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// Options for `ObjectStore::create_index`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub unique: bool,
    pub multi_entry: bool,
}

/// Options for `Connection::create_object_store`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
}

/// Cached metadata for one object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoreRecord {
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    /// Every index ever created under a still-existing column, by name
    pub indexes: BTreeMap<String, IndexRecord>,
}

impl StoreRecord {
    pub fn new(name: String, options: StoreOptions) -> Self {
        Self {
            name,
            key_path: options.key_path,
            auto_increment: options.auto_increment,
            indexes: BTreeMap::new(),
        }
    }

    pub fn live_index(&self, name: &str) -> Option<&IndexRecord> {
        self.indexes.get(name).filter(|i| !i.deleted)
    }

    pub fn live_indexes(&self) -> impl Iterator<Item = &IndexRecord> {
        self.indexes.values().filter(|i| !i.deleted)
    }

    /// Quoted data table name.
    pub fn table(&self, codec: &CodecConfig) -> ShimResult<String> {
        Ok(sql::quote(&escape_store_name(&self.name, codec)?))
    }

    pub fn index_list_json(&self) -> ShimResult<String> {
        Ok(serde_json::to_string(&self.indexes)?)
    }

    pub fn key_path_json(&self) -> ShimResult<SqlValue> {
        Ok(match &self.key_path {
            Some(kp) => SqlValue::Text(serde_json::to_string(kp)?),
            None => SqlValue::Null,
        })
    }

    fn from_row(row: &Row) -> ShimResult<Self> {
        let text = |column: &str| row.by_name(column).and_then(SqlValue::as_str);
        let name = text("name")
            .ok_or_else(|| corrupt("store row without a name"))?
            .to_string();
        let key_path = text("keyPath")
            .map(serde_json::from_str::<KeyPath>)
            .transpose()?;
        let auto_increment = row
            .by_name("autoInc")
            .and_then(SqlValue::as_i64)
            .unwrap_or(0)
            != 0;
        let indexes = match text("indexList") {
            Some(list) => serde_json::from_str(list)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            name,
            key_path,
            auto_increment,
            indexes,
        })
    }
}

/// Quoted `I_` column name of an index.
pub(crate) fn index_column(name: &str, codec: &CodecConfig) -> ShimResult<String> {
    Ok(sql::quote(&escape_index_name(name, codec)?))
}

/// Read every store record of a database.
pub(crate) async fn load_schema(
    backend: &dyn SqlBackend,
) -> ShimResult<BTreeMap<String, StoreRecord>> {
    let sql = format!("SELECT name, keyPath, autoInc, indexList FROM {STORE_TABLE}");
    let rows = backend
        .execute(&sql, &[])
        .await
        .map_err(|e| ShimError::backend("Could not read object store metadata", e))?;
    rows.rows
        .iter()
        .map(|row| StoreRecord::from_row(row).map(|record| (record.name.clone(), record)))
        .collect()
}

fn corrupt(reason: &str) -> ShimError {
    ShimError::Backend {
        context: "Corrupt object store metadata".to_string(),
        message: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_list_keeps_tombstones() {
        let mut store = StoreRecord::new(
            "people".to_string(),
            StoreOptions {
                key_path: Some("id".into()),
                auto_increment: false,
            },
        );
        store.indexes.insert(
            "byTag".to_string(),
            IndexRecord {
                name: "byTag".to_string(),
                key_path: "tags".into(),
                unique: false,
                multi_entry: true,
                deleted: true,
            },
        );

        let list: serde_json::Value =
            serde_json::from_str(&store.index_list_json().unwrap()).unwrap();
        assert_eq!(
            list,
            json!({"byTag": {
                "name": "byTag",
                "keyPath": "tags",
                "unique": false,
                "multiEntry": true,
                "deleted": true
            }})
        );
        assert!(store.live_index("byTag").is_none());
        assert_eq!(store.live_indexes().count(), 0);
    }

    #[test]
    fn test_table_and_column_names_are_escaped() {
        let codec = CodecConfig::default();
        let store = StoreRecord::new("People".to_string(), StoreOptions::default());
        assert_eq!(store.table(&codec).unwrap(), "\"S_^People\"");
        assert_eq!(index_column("byTag", &codec).unwrap(), "\"I_by^Tag\"");
    }
}
