//! Object store handle bound to a transaction

use futures::FutureExt;
use idbshim_codec::graph;
use idbshim_codec::Value;
use tracing::debug;

use crate::backend::SqlValue;
use crate::error::ShimError;
use crate::index::{self, Index, IndexBuild};
use crate::keys::{
    can_inject_key, encode_index_key, encode_key, evaluate_index_key, evaluate_key_path,
    inject_key, Key, KeyPath,
};
use crate::migrations::STORE_TABLE;
use crate::schema::{index_column, IndexOptions, IndexRecord, StoreRecord};
use crate::transaction::{OpContext, Request, Transaction, TransactionMode};
use crate::ShimResult;

/// Largest key the generator hands out (2^53).
const MAX_GENERATED_KEY: i64 = 9_007_199_254_740_992;

/// One object store as seen from one transaction.
#[derive(Clone)]
pub struct ObjectStore {
    transaction: Transaction,
    name: String,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("transaction", &self.transaction.id())
            .finish()
    }
}

struct PendingWrite {
    store: StoreRecord,
    table: String,
    columns: Vec<(IndexRecord, String)>,
    value: Value,
    key: Option<Key>,
    no_overwrite: bool,
}

impl ObjectStore {
    pub(crate) fn new(transaction: Transaction, name: String) -> Self {
        Self { transaction, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.record().ok().and_then(|r| r.key_path)
    }

    pub fn auto_increment(&self) -> bool {
        self.record().map(|r| r.auto_increment).unwrap_or(false)
    }

    /// Sorted names of the live indexes.
    pub fn index_names(&self) -> Vec<String> {
        self.record()
            .map(|r| r.live_indexes().map(|i| i.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Insert or replace a record. `key` is only allowed for stores without
    /// a key path.
    pub fn put(&self, value: impl Into<Value>, key: Option<Key>) -> ShimResult<Request<Key>> {
        self.write(value.into(), key, false)
    }

    /// Insert a record; fails with `Constraint` when the key is taken.
    pub fn add(&self, value: impl Into<Value>, key: Option<Key>) -> ShimResult<Request<Key>> {
        self.write(value.into(), key, true)
    }

    pub fn get(&self, key: impl Into<Key>) -> ShimResult<Request<Option<Value>>> {
        self.transaction.ensure_active()?;
        let key = valid_key(key.into())?;
        let table = self.table()?;
        self.transaction.enqueue(move |ctx| {
            async move {
                let rows = ctx
                    .execute(
                        &format!("SELECT value FROM {table} WHERE key = ?"),
                        &[SqlValue::from(encode_key(&key))],
                    )
                    .await
                    .map_err(|e| ShimError::backend("Could not read record", e))?;
                rows.first()
                    .and_then(|row| row.get(0))
                    .and_then(SqlValue::as_str)
                    .map(graph::from_str)
                    .transpose()
                    .map_err(ShimError::from)
            }
            .boxed()
        })
    }

    /// Number of records in the store.
    pub fn count(&self) -> ShimResult<Request<u64>> {
        self.transaction.ensure_active()?;
        let table = self.table()?;
        self.transaction.enqueue(move |ctx| {
            async move {
                let rows = ctx
                    .execute(&format!("SELECT COUNT(*) FROM {table}"), &[])
                    .await
                    .map_err(|e| ShimError::backend("Could not count records", e))?;
                Ok(rows
                    .first()
                    .and_then(|row| row.get(0))
                    .and_then(SqlValue::as_i64)
                    .unwrap_or(0) as u64)
            }
            .boxed()
        })
    }

    pub fn delete(&self, key: impl Into<Key>) -> ShimResult<Request<()>> {
        self.transaction.ensure_active()?;
        self.ensure_writable()?;
        let key = valid_key(key.into())?;
        let table = self.table()?;
        self.transaction.enqueue(move |ctx| {
            async move {
                ctx.execute(
                    &format!("DELETE FROM {table} WHERE key = ?"),
                    &[SqlValue::from(encode_key(&key))],
                )
                .await
                .map_err(|e| ShimError::backend("Could not delete record", e))?;
                Ok(())
            }
            .boxed()
        })
    }

    /// Add an index and backfill it from the existing records. Resolves to
    /// this store.
    pub fn create_index(
        &self,
        name: &str,
        key_path: impl Into<KeyPath>,
        options: IndexOptions,
    ) -> ShimResult<Request<ObjectStore>> {
        self.ensure_version_change()?;
        let record = self.record()?;
        let key_path = key_path.into();
        if !key_path.is_valid() {
            return Err(ShimError::Syntax(format!(
                "The keyPath argument contains an invalid key path: {key_path:?}"
            )));
        }
        if record.live_index(name).is_some() {
            return Err(ShimError::Constraint(format!(
                "Index \"{name}\" already exists on object store \"{}\"",
                self.name
            )));
        }
        if options.multi_entry && key_path.is_sequence() {
            return Err(ShimError::InvalidAccess(
                "A multi-entry index cannot use an array key path".to_string(),
            ));
        }

        let codec = self.transaction.connection().config().snapshot().codec;
        let table = record.table(&codec)?;
        let column = index_column(name, &codec)?;
        let column_exists = record.indexes.contains_key(name);
        let index = IndexRecord {
            name: name.to_string(),
            key_path,
            unique: options.unique,
            multi_entry: options.multi_entry,
            deleted: false,
        };
        let index_list = self
            .transaction
            .connection()
            .update_store(&self.name, |r| {
                r.indexes.insert(index.name.clone(), index.clone());
                r.index_list_json()
            })
            .ok_or_else(|| self.deleted())??;
        debug!(store = %self.name, index = name, column_exists, "Creating index");

        let build = IndexBuild {
            store: self.name.clone(),
            table,
            column,
            index,
            column_exists,
            index_list,
        };
        let store = self.clone();
        self.transaction.enqueue(move |ctx| {
            async move {
                index::create_index_column(&ctx, build).await?;
                Ok(store)
            }
            .boxed()
        })
    }

    /// Retire an index. Its column stays on the table for reuse.
    pub fn delete_index(&self, name: &str) -> ShimResult<Request<ObjectStore>> {
        self.ensure_version_change()?;
        let record = self.record()?;
        if record.live_index(name).is_none() {
            return Err(ShimError::NotFound(format!(
                "No index named \"{name}\" on object store \"{}\"",
                self.name
            )));
        }
        let index_list = self
            .transaction
            .connection()
            .update_store(&self.name, |r| {
                if let Some(index) = r.indexes.get_mut(name) {
                    index.deleted = true;
                }
                r.index_list_json()
            })
            .ok_or_else(|| self.deleted())??;
        debug!(store = %self.name, index = name, "Deleting index");

        let store_name = self.name.clone();
        let index_name = name.to_string();
        let store = self.clone();
        self.transaction.enqueue(move |ctx| {
            async move {
                index::retire_index(&ctx, &store_name, &index_name, index_list).await?;
                Ok(store)
            }
            .boxed()
        })
    }

    pub fn index(&self, name: &str) -> ShimResult<Index> {
        let record = self.record()?;
        if record.live_index(name).is_none() {
            return Err(ShimError::NotFound(format!(
                "No index named \"{name}\" on object store \"{}\"",
                self.name
            )));
        }
        Ok(Index::new(self.clone(), name.to_string()))
    }

    pub(crate) fn record(&self) -> ShimResult<StoreRecord> {
        self.transaction
            .connection()
            .store_record(&self.name)
            .ok_or_else(|| self.deleted())
    }

    fn table(&self) -> ShimResult<String> {
        let codec = self.transaction.connection().config().snapshot().codec;
        self.record()?.table(&codec)
    }

    fn deleted(&self) -> ShimError {
        ShimError::InvalidState(format!("Object store \"{}\" has been deleted", self.name))
    }

    fn ensure_writable(&self) -> ShimResult<()> {
        if self.transaction.mode() == TransactionMode::ReadOnly {
            return Err(ShimError::ReadOnly(
                "The transaction is read-only".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_version_change(&self) -> ShimResult<()> {
        if self.transaction.mode() != TransactionMode::VersionChange {
            return Err(ShimError::InvalidState(
                "Indexes can only be changed during a version change".to_string(),
            ));
        }
        self.transaction.ensure_active()
    }

    fn write(&self, value: Value, key: Option<Key>, no_overwrite: bool) -> ShimResult<Request<Key>> {
        self.transaction.ensure_active()?;
        self.ensure_writable()?;
        let record = self.record()?;
        let key = key.map(valid_key).transpose()?;

        match (&record.key_path, &key) {
            (Some(_), Some(_)) => {
                return Err(ShimError::Data(
                    "The object store uses in-line keys and a key was supplied".to_string(),
                ))
            }
            (None, None) if !record.auto_increment => {
                return Err(ShimError::Data(
                    "The object store uses out-of-line keys and no key was supplied".to_string(),
                ))
            }
            _ => {}
        }

        let value = graph::structured_clone(&value)?;
        let key = match &record.key_path {
            Some(key_path) => {
                let evaluated = evaluate_key_path(&value, key_path);
                let injectable = record.auto_increment
                    && matches!(key_path, KeyPath::Single(path) if can_inject_key(&value, path));
                if evaluated.is_none() && !injectable {
                    return Err(ShimError::Data(
                        "Evaluating the object store's key path did not yield a key".to_string(),
                    ));
                }
                evaluated
            }
            None => key,
        };

        let codec = self.transaction.connection().config().snapshot().codec;
        let table = record.table(&codec)?;
        let columns = record
            .live_indexes()
            .map(|index| Ok((index.clone(), index_column(&index.name, &codec)?)))
            .collect::<ShimResult<Vec<_>>>()?;

        let write = PendingWrite {
            store: record,
            table,
            columns,
            value,
            key,
            no_overwrite,
        };
        self.transaction
            .enqueue(move |ctx| write_record(ctx, write).boxed())
    }
}

fn valid_key(key: Key) -> ShimResult<Key> {
    if key.is_valid() {
        Ok(key)
    } else {
        Err(ShimError::Data("The parameter is not a valid key".to_string()))
    }
}

async fn write_record(ctx: OpContext, write: PendingWrite) -> ShimResult<Key> {
    let store = &write.store;
    let context = format!("Could not write to object store \"{}\"", store.name);

    let key = match write.key {
        Some(key) => {
            if let (true, Key::Number(n)) = (store.auto_increment, &key) {
                bump_generator(&ctx, &store.name, *n).await?;
            }
            key
        }
        None => {
            let key = Key::Number(next_generated_key(&ctx, &store.name).await? as f64);
            if let Some(KeyPath::Single(path)) = &store.key_path {
                inject_key(&write.value, path, &key)?;
            }
            key
        }
    };
    let encoded = encode_key(&key);

    if write.no_overwrite {
        let existing = ctx
            .execute(
                &format!("SELECT 1 FROM {} WHERE key = ?", write.table),
                &[SqlValue::from(encoded.as_str())],
            )
            .await
            .map_err(|e| ShimError::backend(&context, e))?;
        if !existing.rows.is_empty() {
            return Err(ShimError::Constraint(format!(
                "A record with this key already exists in object store \"{}\"",
                store.name
            )));
        }
    }

    let mut entries = Vec::with_capacity(write.columns.len());
    for (index, column) in &write.columns {
        let entry = evaluate_index_key(&write.value, &index.key_path, index.multi_entry)
            .map(|k| encode_index_key(&k, index.multi_entry))
            .filter(|e| !e.is_empty());
        if let (true, false, Some(entry)) = (index.unique, index.multi_entry, &entry) {
            let clash = ctx
                .execute(
                    &format!(
                        "SELECT 1 FROM {} WHERE {column} = ? AND key != ? LIMIT 1",
                        write.table
                    ),
                    &[SqlValue::from(entry.as_str()), SqlValue::from(encoded.as_str())],
                )
                .await
                .map_err(|e| ShimError::backend(&context, e))?;
            if !clash.rows.is_empty() {
                return Err(ShimError::Constraint(format!(
                    "Unique index \"{}\" already holds this key",
                    index.name
                )));
            }
        }
        entries.push(SqlValue::from(entry));
    }

    let column_list: String = write
        .columns
        .iter()
        .map(|(_, column)| format!(", {column}"))
        .collect();
    let placeholders = ", ?".repeat(write.columns.len());
    let sql = format!(
        "INSERT OR REPLACE INTO {} (key, value{column_list}) VALUES (?, ?{placeholders})",
        write.table
    );
    let mut params = vec![
        SqlValue::from(encoded),
        SqlValue::from(graph::to_string(&write.value)?),
    ];
    params.extend(entries);
    ctx.execute(&sql, &params)
        .await
        .map_err(|e| ShimError::backend(&context, e))?;
    Ok(key)
}

async fn read_generator(ctx: &OpContext, store: &str) -> ShimResult<i64> {
    let rows = ctx
        .execute(
            &format!("SELECT currNum FROM {STORE_TABLE} WHERE name = ?"),
            &[SqlValue::from(store)],
        )
        .await
        .map_err(|e| ShimError::backend("Could not read the key generator", e))?;
    Ok(rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(SqlValue::as_i64)
        .unwrap_or(1))
}

async fn write_generator(ctx: &OpContext, store: &str, next: i64) -> ShimResult<()> {
    ctx.execute(
        &format!("UPDATE {STORE_TABLE} SET currNum = ? WHERE name = ?"),
        &[SqlValue::from(next), SqlValue::from(store)],
    )
    .await
    .map_err(|e| ShimError::backend("Could not update the key generator", e))?;
    Ok(())
}

async fn next_generated_key(ctx: &OpContext, store: &str) -> ShimResult<i64> {
    let current = read_generator(ctx, store).await?;
    if current > MAX_GENERATED_KEY {
        return Err(ShimError::Constraint(
            "The key generator has reached its maximum".to_string(),
        ));
    }
    write_generator(ctx, store, current + 1).await?;
    Ok(current)
}

/// Explicit numeric keys at or above the generator push it past them.
async fn bump_generator(ctx: &OpContext, store: &str, key: f64) -> ShimResult<()> {
    let current = read_generator(ctx, store).await?;
    if key >= current as f64 {
        let next = (key.floor() + 1.0).min(MAX_GENERATED_KEY as f64 + 1.0) as i64;
        write_generator(ctx, store, next).await?;
    }
    Ok(())
}
