//! Warehouse gateway (dimension transactions + fact appends) and the persisted
//! commodity name cache.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use mandi_core::{
    DimensionKey, DimensionRecord, DimensionRow, DimensionTable, FactRow, Value, ValueKind,
    DATE_DIM, COMMODITY_DIM, FACT_TABLE, MARKET_DIM,
};
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const FACT_COLUMNS: usize = 6;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
    #[error("row shape does not match table {table}")]
    Shape { table: &'static str },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl WarehouseError {
    /// Lost-race signals: another writer committed the same natural key, or the
    /// database aborted us to keep concurrent transactions serializable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WarehouseError::UniqueViolation { .. } | WarehouseError::Conflict(_)
        )
    }
}

impl From<sqlx::Error> for WarehouseError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let table = db_err.table().unwrap_or("unknown").to_string();
            if db_err.is_unique_violation() {
                return WarehouseError::UniqueViolation {
                    table,
                    detail: db_err.message().to_string(),
                };
            }
            if db_err.is_foreign_key_violation() {
                return WarehouseError::ForeignKey(db_err.message().to_string());
            }
            // serialization_failure / deadlock_detected
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return WarehouseError::Conflict(db_err.message().to_string());
            }
        }
        WarehouseError::Database(err)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub inserted: u64,
    /// Rows whose natural key was already present when the insert ran.
    pub skipped: u64,
}

/// One dimension transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait DimensionTx: Send {
    async fn read_all(&mut self, table: &DimensionTable) -> Result<Vec<DimensionRow>, WarehouseError>;

    /// Inserts the records whose natural key is absent; surrogate ids are assigned by
    /// the store.
    async fn insert_if_absent(
        &mut self,
        table: &DimensionTable,
        rows: &[DimensionRecord],
    ) -> Result<InsertOutcome, WarehouseError>;

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError>;

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn begin(&self) -> Result<Box<dyn DimensionTx>, WarehouseError>;

    /// Appends one batch of fact rows atomically. Existing facts are never touched.
    async fn append_facts(&self, rows: &[FactRow]) -> Result<u64, WarehouseError>;

    async fn read_all(&self, table: &DimensionTable) -> Result<Vec<DimensionRow>, WarehouseError> {
        let mut tx = self.begin().await?;
        let rows = tx.read_all(table).await;
        tx.rollback().await?;
        rows
    }
}

fn check_shape(table: &DimensionTable, rows: &[DimensionRecord]) -> Result<(), WarehouseError> {
    if rows.iter().all(|row| table.accepts(row)) {
        Ok(())
    } else {
        Err(WarehouseError::Shape { table: table.name })
    }
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), WarehouseError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("warehouse migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn DimensionTx>, WarehouseError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgDimensionTx { tx }))
    }

    async fn append_facts(&self, rows: &[FactRow]) -> Result<u64, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut appended = 0u64;
        for chunk in rows.chunks(MAX_BIND_PARAMS / FACT_COLUMNS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {FACT_TABLE} (date_id, market_id, commodity_id, min_price, max_price, modal_price) "
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.date_id)
                    .push_bind(row.market_id)
                    .push_bind(row.commodity_id)
                    .push_bind(row.min_price)
                    .push_bind(row.max_price)
                    .push_bind(row.modal_price);
            });
            appended += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(appended)
    }
}

pub struct PgDimensionTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn decode_pg_row(table: &DimensionTable, row: &PgRow) -> Result<DimensionRow, WarehouseError> {
    let decode = |name: &str, kind: ValueKind| -> Result<Value, sqlx::Error> {
        Ok(match kind {
            ValueKind::Text => Value::Text(row.try_get::<String, _>(name)?),
            ValueKind::Int => Value::Int(row.try_get::<i64, _>(name)?),
            ValueKind::Date => Value::Date(row.try_get::<NaiveDate, _>(name)?),
        })
    };
    let key = table
        .key_columns
        .iter()
        .map(|c| decode(c.name, c.kind))
        .collect::<Result<Vec<_>, _>>()?;
    let attributes = table
        .attribute_columns
        .iter()
        .map(|c| decode(c.name, c.kind))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DimensionRow {
        id: row.try_get(table.id_column)?,
        key: DimensionKey::new(key),
        attributes,
    })
}

fn column_list(table: &DimensionTable) -> String {
    table.columns().map(|c| c.name).collect::<Vec<_>>().join(", ")
}

#[async_trait]
impl DimensionTx for PgDimensionTx {
    async fn read_all(&mut self, table: &DimensionTable) -> Result<Vec<DimensionRow>, WarehouseError> {
        let sql = format!(
            "SELECT {}, {} FROM {}",
            table.id_column,
            column_list(table),
            table.name
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(|row| decode_pg_row(table, row)).collect()
    }

    async fn insert_if_absent(
        &mut self,
        table: &DimensionTable,
        rows: &[DimensionRecord],
    ) -> Result<InsertOutcome, WarehouseError> {
        check_shape(table, rows)?;
        let width = table.key_columns.len() + table.attribute_columns.len();
        let key_list = table
            .key_columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ");

        let mut outcome = InsertOutcome::default();
        for chunk in rows.chunks(MAX_BIND_PARAMS / width.max(1)) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table.name, column_list(table)));
            qb.push_values(chunk, |mut b, row| {
                for value in row.values() {
                    match value {
                        Value::Text(s) => b.push_bind(s.clone()),
                        Value::Int(i) => b.push_bind(*i),
                        Value::Date(d) => b.push_bind(*d),
                    };
                }
            });
            qb.push(format!(" ON CONFLICT ({key_list}) DO NOTHING"));
            let inserted = qb.build().execute(&mut *self.tx).await?.rows_affected();
            outcome.inserted += inserted;
            outcome.skipped += chunk.len() as u64 - inserted;
        }
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    rows: Vec<DimensionRow>,
    index: HashMap<DimensionKey, i64>,
    ids: HashSet<i64>,
    next_id: i64,
}

impl MemoryTable {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<&'static str, MemoryTable>,
    facts: Vec<FactRow>,
}

impl MemoryState {
    fn contains_id(&self, table: &str, id: i64) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.ids.contains(&id))
    }
}

/// In-process warehouse with the same contract as the Postgres one: natural keys are
/// unique per table, ids come from per-table sequences that are not rolled back, and a
/// transaction that loses a race is rejected at commit with `UniqueViolation`.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn facts(&self) -> Vec<FactRow> {
        self.state.lock().await.facts.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn DimensionTx>, WarehouseError> {
        Ok(Box::new(MemoryDimensionTx {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn append_facts(&self, rows: &[FactRow]) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        for row in rows {
            for (table, id) in [
                (DATE_DIM.name, row.date_id),
                (MARKET_DIM.name, row.market_id),
                (COMMODITY_DIM.name, row.commodity_id),
            ] {
                if !state.contains_id(table, id) {
                    return Err(WarehouseError::ForeignKey(format!(
                        "{FACT_TABLE} references missing {table} id {id}"
                    )));
                }
            }
        }
        state.facts.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

pub struct MemoryDimensionTx {
    state: Arc<Mutex<MemoryState>>,
    staged: Vec<(&'static str, DimensionRow)>,
}

#[async_trait]
impl DimensionTx for MemoryDimensionTx {
    async fn read_all(&mut self, table: &DimensionTable) -> Result<Vec<DimensionRow>, WarehouseError> {
        let state = self.state.lock().await;
        let mut rows = state
            .tables
            .get(table.name)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        rows.extend(
            self.staged
                .iter()
                .filter(|(name, _)| *name == table.name)
                .map(|(_, row)| row.clone()),
        );
        Ok(rows)
    }

    async fn insert_if_absent(
        &mut self,
        table: &DimensionTable,
        rows: &[DimensionRecord],
    ) -> Result<InsertOutcome, WarehouseError> {
        check_shape(table, rows)?;
        let mut state = self.state.lock().await;
        let committed = state.tables.entry(table.name).or_default();
        let mut staged_keys = self
            .staged
            .iter()
            .filter(|(name, _)| *name == table.name)
            .map(|(_, row)| row.key.clone())
            .collect::<HashSet<_>>();

        let mut outcome = InsertOutcome::default();
        for record in rows {
            if committed.index.contains_key(&record.key) || staged_keys.contains(&record.key) {
                outcome.skipped += 1;
                continue;
            }
            let id = committed.allocate_id();
            staged_keys.insert(record.key.clone());
            self.staged.push((
                table.name,
                DimensionRow {
                    id,
                    key: record.key.clone(),
                    attributes: record.attributes.clone(),
                },
            ));
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError> {
        let this = *self;
        let mut state = this.state.lock().await;
        for (name, row) in &this.staged {
            let conflict = state
                .tables
                .get(name)
                .is_some_and(|t| t.index.contains_key(&row.key));
            if conflict {
                return Err(WarehouseError::UniqueViolation {
                    table: (*name).to_string(),
                    detail: format!("natural key {} already committed", row.key),
                });
            }
        }
        for (name, row) in this.staged {
            let table = state.tables.entry(name).or_default();
            table.index.insert(row.key.clone(), row.id);
            table.ids.insert(row.id);
            table.rows.push(row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError> {
        debug!(discarded = self.staged.len(), "memory transaction rolled back");
        Ok(())
    }
}

/// Persisted raw-label -> canonical-name mapping. Entries are only ever added and a
/// mapping that is already persisted is never overwritten.
#[derive(Debug, Clone)]
pub struct CommodityNameCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl CommodityNameCache {
    /// Loads the cache file; a missing file is an empty cache.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = read_cache_file(&path).await?.unwrap_or_default();
        debug!(path = %path.display(), entries = entries.len(), "loaded commodity name cache");
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, raw: &str) -> Option<&str> {
        self.entries.get(raw).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `false` (and leaves the cache untouched) when `raw` is already mapped.
    pub fn insert_if_absent(&mut self, raw: impl Into<String>, canonical: impl Into<String>) -> bool {
        let raw = raw.into();
        if self.entries.contains_key(&raw) {
            return false;
        }
        self.entries.insert(raw, canonical.into());
        self.dirty = true;
        true
    }

    /// Merges with whatever is on disk now (disk entries win) and atomically rewrites
    /// the file. Returns the number of entries persisted.
    pub async fn flush(&mut self) -> anyhow::Result<usize> {
        if !self.dirty {
            return Ok(self.entries.len());
        }
        if let Some(on_disk) = read_cache_file(&self.path).await? {
            for (raw, canonical) in on_disk {
                self.entries.insert(raw, canonical);
            }
        }

        let bytes = serde_json::to_vec_pretty(&self.entries).context("serializing commodity name cache")?;
        write_atomically(&self.path, &bytes).await?;
        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.entries.len(), "flushed commodity name cache");
        Ok(self.entries.len())
    }
}

async fn read_cache_file(path: &Path) -> anyhow::Result<Option<BTreeMap<String, String>>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking cache path {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Some(BTreeMap::new()));
    }
    let entries = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(entries))
}

/// Writes through a uniquely named temp file in the target directory, then renames it
/// over the target.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandi_core::STATE_DIM;
    use tempfile::tempdir;

    fn state(name: &str) -> DimensionRecord {
        DimensionRecord::new(vec![Value::Text(name.to_string())], Vec::new())
    }

    #[tokio::test]
    async fn memory_insert_skips_existing_and_repeated_keys() {
        let warehouse = MemoryWarehouse::new();
        let mut tx = warehouse.begin().await.unwrap();
        let outcome = tx
            .insert_if_absent(&STATE_DIM, &[state("Kerala"), state("Kerala "), state("Goa")])
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome { inserted: 2, skipped: 1 });
        tx.commit().await.unwrap();

        let mut tx = warehouse.begin().await.unwrap();
        let outcome = tx.insert_if_absent(&STATE_DIM, &[state("Goa")]).await.unwrap();
        assert_eq!(outcome, InsertOutcome { inserted: 0, skipped: 1 });
        tx.commit().await.unwrap();

        assert_eq!(warehouse.read_all(&STATE_DIM).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_commit_rejects_a_key_committed_by_another_transaction() {
        let warehouse = MemoryWarehouse::new();
        let mut slow = warehouse.begin().await.unwrap();
        slow.insert_if_absent(&STATE_DIM, &[state("Punjab")]).await.unwrap();

        let mut fast = warehouse.begin().await.unwrap();
        fast.insert_if_absent(&STATE_DIM, &[state("Punjab")]).await.unwrap();
        fast.commit().await.unwrap();

        let err = slow.commit().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert_eq!(warehouse.read_all(&STATE_DIM).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_rollback_discards_staged_rows_but_not_sequence() {
        let warehouse = MemoryWarehouse::new();
        let mut tx = warehouse.begin().await.unwrap();
        tx.insert_if_absent(&STATE_DIM, &[state("Bihar")]).await.unwrap();
        assert_eq!(tx.read_all(&STATE_DIM).await.unwrap().len(), 1);
        tx.rollback().await.unwrap();
        assert!(warehouse.read_all(&STATE_DIM).await.unwrap().is_empty());

        let mut tx = warehouse.begin().await.unwrap();
        tx.insert_if_absent(&STATE_DIM, &[state("Bihar")]).await.unwrap();
        let rows = tx.read_all(&STATE_DIM).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(rows[0].id, 2);
    }

    #[tokio::test]
    async fn memory_rejects_rows_of_the_wrong_shape() {
        let warehouse = MemoryWarehouse::new();
        let mut tx = warehouse.begin().await.unwrap();
        let err = tx
            .insert_if_absent(&STATE_DIM, &[DimensionRecord::new(vec![Value::Int(1)], vec![])])
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Shape { table: "state_dim" }));
    }

    #[tokio::test]
    async fn memory_facts_require_existing_dimension_ids() {
        let warehouse = MemoryWarehouse::new();
        let err = warehouse
            .append_facts(&[FactRow {
                date_id: 1,
                market_id: 1,
                commodity_id: 1,
                min_price: 1.0,
                max_price: 3.0,
                modal_price: 2.0,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::ForeignKey(_)));
        assert!(warehouse.facts().await.is_empty());
    }

    #[tokio::test]
    async fn missing_cache_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let cache = CommodityNameCache::load(dir.path().join("absent.json")).await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cache_never_overwrites_existing_mappings() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("commodity_mapping.json");

        let mut first = CommodityNameCache::load(&path).await.unwrap();
        assert!(first.insert_if_absent("Bhindi", "Okra"));
        assert!(!first.insert_if_absent("Bhindi", "Ladies Finger"));
        assert_eq!(first.get("Bhindi"), Some("Okra"));

        // A second worker loaded before the first one flushed.
        let mut second = CommodityNameCache::load(&path).await.unwrap();
        assert!(second.insert_if_absent("Bhindi", "Lady Finger"));
        assert!(second.insert_if_absent("Arhar", "Pigeon Pea"));

        first.flush().await.unwrap();
        second.flush().await.unwrap();

        let reloaded = CommodityNameCache::load(&path).await.unwrap();
        assert_eq!(reloaded.get("Bhindi"), Some("Okra"));
        assert_eq!(reloaded.get("Arhar"), Some("Pigeon Pea"));
        assert_eq!(second.get("Bhindi"), Some("Okra"));
    }
}
