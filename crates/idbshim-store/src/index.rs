//! Index synchronization engine
//!
//! Each index owns one nullable `I_<escaped name>` column on its store's
//! data table, holding the encoded index key of every record whose key
//! path evaluates to a key. The store's `indexList` in `__sys__` is the
//! authoritative description of those columns.
//!
//! Deleting an index only marks it deleted in `indexList`; the column stays
//! and a later index of the same name reuses it after clearing it.
//!
//! Multi-entry columns hold the concatenated encodings of the distinct
//! array elements, so key lookups cannot be a plain equality test. A
//! `LIKE '%<encoded key>%'` filter narrows the candidate rows and every
//! candidate is checked again after decoding its column. The pattern is
//! only a prefilter: SQLite's `LIKE` folds ASCII case and a substring may
//! straddle two element encodings.

use futures::FutureExt;
use idbshim_codec::{graph, sql, Value};
use tracing::{debug, info};

use crate::backend::SqlValue;
use crate::error::ShimError;
use crate::keys::{
    decode_index_key, decode_key, encode_index_key, encode_key, evaluate_index_key, Key, KeyPath,
    KeyQuery,
};
use crate::migrations::STORE_TABLE;
use crate::schema::{index_column, IndexRecord};
use crate::store::ObjectStore;
use crate::transaction::{OpContext, Request};
use crate::ShimResult;

/// Everything a create-index operation needs once it reaches the queue.
pub(crate) struct IndexBuild {
    pub store: String,
    /// Quoted data table
    pub table: String,
    /// Quoted index column
    pub column: String,
    pub index: IndexRecord,
    /// An index of this name was deleted earlier and left its column behind
    pub column_exists: bool,
    /// Serialized index list including the new index
    pub index_list: String,
}

/// Add (or reuse) the column, persist the index list and backfill.
pub(crate) async fn create_index_column(ctx: &OpContext, build: IndexBuild) -> ShimResult<()> {
    let IndexBuild {
        store,
        table,
        column,
        index,
        column_exists,
        index_list,
    } = build;
    let context = format!("Could not create index \"{}\"", index.name);
    let fail = |e| ShimError::backend(&context, e);

    if column_exists {
        ctx.execute(&format!("UPDATE {table} SET {column} = NULL"), &[])
            .await
            .map_err(fail)?;
    } else {
        ctx.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} BLOB"), &[])
            .await
            .map_err(fail)?;
    }

    write_index_list(ctx, &store, index_list).await.map_err(|e| match e {
        ShimError::Backend { message, .. } => ShimError::Backend {
            context: context.clone(),
            message,
        },
        other => other,
    })?;

    let rows = ctx
        .execute(&format!("SELECT key, value FROM {table}"), &[])
        .await
        .map_err(fail)?;

    let mut indexed = 0usize;
    for row in &rows.rows {
        let (Some(key), Some(text)) = (
            row.get(0).and_then(SqlValue::as_str),
            row.get(1).and_then(SqlValue::as_str),
        ) else {
            continue;
        };
        let value = graph::from_str(text)?;
        let Some(index_key) = evaluate_index_key(&value, &index.key_path, index.multi_entry)
        else {
            continue;
        };
        let entry = encode_index_key(&index_key, index.multi_entry);
        if entry.is_empty() {
            continue;
        }
        ctx.execute(
            &format!("UPDATE {table} SET {column} = ? WHERE key = ?"),
            &[SqlValue::from(entry), SqlValue::from(key)],
        )
        .await
        .map_err(fail)?;
        indexed += 1;
    }

    if index.unique && !index.multi_entry {
        let duplicates = ctx
            .execute(
                &format!(
                    "SELECT {column} FROM {table} WHERE {column} NOT NULL \
                     GROUP BY {column} HAVING COUNT(*) > 1 LIMIT 1"
                ),
                &[],
            )
            .await
            .map_err(fail)?;
        if !duplicates.rows.is_empty() {
            return Err(ShimError::Constraint(format!(
                "Unique index \"{}\" cannot be built: existing records share a key",
                index.name
            )));
        }
    }

    info!(
        store = %store,
        index = %index.name,
        rows = rows.rows.len(),
        indexed,
        reused_column = column_exists,
        "✓ index created"
    );
    Ok(())
}

/// Persist the index list with the index marked deleted.
pub(crate) async fn retire_index(
    ctx: &OpContext,
    store: &str,
    index: &str,
    index_list: String,
) -> ShimResult<()> {
    write_index_list(ctx, store, index_list)
        .await
        .map_err(|e| match e {
            ShimError::Backend { message, .. } => ShimError::Backend {
                context: format!("Could not delete index \"{index}\""),
                message,
            },
            other => other,
        })?;
    info!(store, index, "✓ index deleted, column retained");
    Ok(())
}

async fn write_index_list(ctx: &OpContext, store: &str, index_list: String) -> ShimResult<()> {
    ctx.execute(
        &format!("UPDATE {STORE_TABLE} SET indexList = ? WHERE name = ?"),
        &[SqlValue::from(index_list), SqlValue::from(store)],
    )
    .await?;
    Ok(())
}

/// One row that satisfied an index query.
struct IndexHit {
    key: String,
    value: String,
    /// Encoded index key the row sorts under: the column itself, or the
    /// smallest matching element of a multi-entry column
    position: String,
    /// Number of index entries of the row the query matched
    entries: usize,
}

/// Rows of `table` whose index column matches `query`, in index order.
async fn fetch(
    ctx: &OpContext,
    table: &str,
    column: &str,
    multi_entry: bool,
    query: Option<&KeyQuery>,
) -> ShimResult<Vec<IndexHit>> {
    let mut sql = format!("SELECT key, value, {column} FROM {table} WHERE {column} NOT NULL");
    let mut params = Vec::new();
    match (query, multi_entry) {
        (None, _) | (Some(KeyQuery::Range(_)), true) => {}
        (Some(KeyQuery::Key(key)), false) => {
            sql.push_str(&format!(" AND {column} = ?"));
            params.push(SqlValue::from(encode_key(key)));
        }
        (Some(KeyQuery::Key(key)), true) => {
            sql.push_str(&format!(" AND {column} LIKE ? ESCAPE '{}'", sql::LIKE_ESCAPE));
            params.push(SqlValue::from(sql::like_contains(&encode_key(key))));
        }
        (Some(KeyQuery::Range(range)), false) => {
            if let Some(lower) = &range.lower {
                let op = if range.lower_open { ">" } else { ">=" };
                sql.push_str(&format!(" AND {column} {op} ?"));
                params.push(SqlValue::from(encode_key(lower)));
            }
            if let Some(upper) = &range.upper {
                let op = if range.upper_open { "<" } else { "<=" };
                sql.push_str(&format!(" AND {column} {op} ?"));
                params.push(SqlValue::from(encode_key(upper)));
            }
        }
    }
    sql.push_str(&format!(" ORDER BY {column}, key"));

    let rows = ctx
        .execute(&sql, &params)
        .await
        .map_err(|e| ShimError::backend("Could not read index", e))?;

    let mut hits = Vec::with_capacity(rows.rows.len());
    for row in &rows.rows {
        let (Some(key), Some(value), Some(entry)) = (
            row.get(0).and_then(SqlValue::as_str),
            row.get(1).and_then(SqlValue::as_str),
            row.get(2).and_then(SqlValue::as_str),
        ) else {
            continue;
        };
        let (position, entries) = if multi_entry {
            let matching: Vec<Key> = decode_index_key(entry, true)?
                .into_iter()
                .filter(|k| query.map_or(true, |q| q.matches(k)))
                .collect();
            let Some(first) = matching.iter().min_by(|a, b| a.compare(b)) else {
                continue;
            };
            (encode_key(first), matching.len())
        } else {
            (entry.to_string(), 1)
        };
        hits.push(IndexHit {
            key: key.to_string(),
            value: value.to_string(),
            position,
            entries,
        });
    }
    // Each multi-entry row sits at its first matching element, not at the
    // start of its column.
    if multi_entry {
        hits.sort_by(|a, b| (&a.position, &a.key).cmp(&(&b.position, &b.key)));
    }
    debug!(candidates = rows.rows.len(), hits = hits.len(), "Index fetch");
    Ok(hits)
}

/// An index as seen from one transaction.
#[derive(Clone)]
pub struct Index {
    store: ObjectStore,
    name: String,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("store", &self.store.name())
            .finish()
    }
}

impl Index {
    pub(crate) fn new(store: ObjectStore, name: String) -> Self {
        Self { store, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.record().ok().map(|i| i.key_path)
    }

    pub fn unique(&self) -> bool {
        self.record().map(|i| i.unique).unwrap_or(false)
    }

    pub fn multi_entry(&self) -> bool {
        self.record().map(|i| i.multi_entry).unwrap_or(false)
    }

    /// First matching record in index order. Without a query, the first
    /// indexed record.
    pub fn get(&self, query: Option<KeyQuery>) -> ShimResult<Request<Option<Value>>> {
        self.run(query, |hits| {
            hits.first()
                .map(|hit| graph::from_str(&hit.value))
                .transpose()
                .map_err(ShimError::from)
        })
    }

    /// Primary key of the first matching record.
    pub fn get_key(&self, query: Option<KeyQuery>) -> ShimResult<Request<Option<Key>>> {
        self.run(query, |hits| {
            hits.first().map(|hit| decode_key(&hit.key)).transpose()
        })
    }

    /// Matching index entries. A multi-entry record counts once per
    /// matching element.
    pub fn count(&self, query: Option<KeyQuery>) -> ShimResult<Request<u64>> {
        self.run(query, |hits| {
            Ok(hits.iter().map(|hit| hit.entries as u64).sum())
        })
    }

    fn record(&self) -> ShimResult<IndexRecord> {
        self.store
            .record()?
            .live_index(&self.name)
            .cloned()
            .ok_or_else(|| {
                ShimError::InvalidState(format!("Index \"{}\" has been deleted", self.name))
            })
    }

    fn run<T, F>(&self, query: Option<KeyQuery>, finish: F) -> ShimResult<Request<T>>
    where
        T: Send + 'static,
        F: FnOnce(Vec<IndexHit>) -> ShimResult<T> + Send + 'static,
    {
        let transaction = self.store.transaction();
        transaction.ensure_active()?;
        if let Some(query) = &query {
            query.validate()?;
        }
        let index = self.record()?;
        let codec = transaction.connection().config().snapshot().codec;
        let table = self.store.record()?.table(&codec)?;
        let column = index_column(&index.name, &codec)?;

        transaction.enqueue(move |ctx| {
            async move {
                let hits = fetch(&ctx, &table, &column, index.multi_entry, query.as_ref()).await?;
                finish(hits)
            }
            .boxed()
        })
    }
}
