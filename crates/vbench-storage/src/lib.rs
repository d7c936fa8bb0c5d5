//! Remote table store, spreadsheet I/O and atomic local exports for vbench.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Postgres, QueryBuilder, Row, TypeInfo};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use vbench_core::{Cell, Table, TableError};

pub const CRATE_NAME: &str = "vbench-storage";

/// Postgres caps a statement at 65535 bind parameters.
const PG_BIND_LIMIT: usize = 65_535;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no connection configured for logical database `{0}`")]
    UnknownDatabase(String),
    #[error("column `{column}` has unsupported type {type_name}; cast it in the query")]
    UnsupportedColumnType { column: String, type_name: String },
    #[error("no result registered for query on `{database}`: {sql}")]
    UnknownQuery { database: String, sql: String },
    #[error("table `{table}` has columns {existing:?}; cannot append rows with {incoming:?}")]
    SchemaMismatch {
        table: String,
        existing: Vec<String>,
        incoming: Vec<String>,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop and recreate the destination table.
    Replace,
    Append,
}

#[async_trait]
pub trait QueryStore: Send + Sync {
    async fn query_table(&self, database: &str, sql: &str) -> Result<Table, StoreError>;
}

#[async_trait]
pub trait TableWriter: Send + Sync {
    /// Returns the number of rows written.
    async fn push_table(
        &self,
        table: &Table,
        destination: &str,
        database: &str,
        mode: WriteMode,
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlColumnType {
    BigInt,
    Double,
    Boolean,
    Text,
}

impl SqlColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlColumnType::BigInt => "BIGINT",
            SqlColumnType::Double => "DOUBLE PRECISION",
            SqlColumnType::Boolean => "BOOLEAN",
            SqlColumnType::Text => "TEXT",
        }
    }
}

/// Narrowest SQL type that holds every non-null cell of each column.
pub fn infer_column_types(table: &Table) -> Vec<SqlColumnType> {
    (0..table.columns().len())
        .map(|idx| {
            let mut inferred: Option<SqlColumnType> = None;
            for cell in table.rows().iter().map(|row| &row[idx]) {
                let cell_type = match cell {
                    Cell::Null => continue,
                    Cell::Int(_) => SqlColumnType::BigInt,
                    Cell::Float(_) => SqlColumnType::Double,
                    Cell::Bool(_) => SqlColumnType::Boolean,
                    Cell::Text(_) => SqlColumnType::Text,
                };
                inferred = Some(match (inferred, cell_type) {
                    (None, t) => t,
                    (Some(a), b) if a == b => a,
                    (Some(SqlColumnType::BigInt), SqlColumnType::Double)
                    | (Some(SqlColumnType::Double), SqlColumnType::BigInt) => SqlColumnType::Double,
                    _ => SqlColumnType::Text,
                });
                if inferred == Some(SqlColumnType::Text) {
                    break;
                }
            }
            inferred.unwrap_or(SqlColumnType::Text)
        })
        .collect()
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes each dot-separated part of a possibly schema-qualified name.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

pub fn create_table_sql(
    target: &str,
    table: &Table,
    types: &[SqlColumnType],
    if_not_exists: bool,
) -> String {
    let columns = table
        .columns()
        .iter()
        .zip(types)
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.as_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    format!("CREATE TABLE {guard}{target} ({columns})")
}

fn raw_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Text(v) => Some(v.clone()),
        other => Some(other.to_string()),
    }
}

/// sqlx/Postgres implementation; one lazily opened pool per logical database.
#[derive(Debug)]
pub struct PgStore {
    databases: HashMap<String, String>,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PgStore {
    pub fn new(databases: HashMap<String, String>) -> Self {
        Self {
            databases,
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool_for(&self, database: &str) -> Result<PgPool, StoreError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(database) {
            return Ok(pool.clone());
        }
        let url = self
            .databases
            .get(database)
            .ok_or_else(|| StoreError::UnknownDatabase(database.to_string()))?;
        let pool = PgPoolOptions::new().max_connections(1).connect(url).await?;
        pools.insert(database.to_string(), pool.clone());
        Ok(pool)
    }
}

fn decode_pg_cell(row: &PgRow, idx: usize) -> Result<Cell, StoreError> {
    let column = &row.columns()[idx];
    let cell: Cell = match column.type_info().name() {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(i64::from).into(),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.into(),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => {
            row.try_get::<Option<String>, _>(idx)?.into()
        }
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|v| v.to_rfc3339())
            .into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
            .into(),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|v| v.to_string())
            .into(),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)?
            .map(|v| v.to_string())
            .into(),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(|v| v.to_string())
            .into(),
        other => {
            return Err(StoreError::UnsupportedColumnType {
                column: column.name().to_string(),
                type_name: other.to_string(),
            })
        }
    };
    Ok(cell)
}

#[async_trait]
impl QueryStore for PgStore {
    async fn query_table(&self, database: &str, sql: &str) -> Result<Table, StoreError> {
        let pool = self.pool_for(database).await?;
        let rows = sqlx::query(sql).fetch_all(&pool).await?;

        let columns = match rows.first() {
            Some(first) => first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect::<Vec<_>>(),
            None => {
                let described = (&pool).describe(sql).await?;
                described
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect::<Vec<_>>()
            }
        };

        let mut table = Table::new(columns)?;
        for row in &rows {
            let cells = (0..row.columns().len())
                .map(|idx| decode_pg_cell(row, idx))
                .collect::<Result<Vec<_>, _>>()?;
            table.push_row(cells)?;
        }
        debug!(database, rows = table.len(), "query returned");
        Ok(table)
    }
}

#[async_trait]
impl TableWriter for PgStore {
    async fn push_table(
        &self,
        table: &Table,
        destination: &str,
        database: &str,
        mode: WriteMode,
    ) -> Result<u64, StoreError> {
        debug!(destination, database, rows = table.len(), ?mode, "pushing table");
        let pool = self.pool_for(database).await?;
        let target = quote_qualified(destination);
        let types = infer_column_types(table);

        let mut tx = pool.begin().await?;
        match mode {
            WriteMode::Replace => {
                let drop_sql = format!("DROP TABLE IF EXISTS {target}");
                sqlx::query(&drop_sql).execute(&mut *tx).await?;
                let create_sql = create_table_sql(&target, table, &types, false);
                sqlx::query(&create_sql).execute(&mut *tx).await?;
            }
            WriteMode::Append => {
                let create_sql = create_table_sql(&target, table, &types, true);
                sqlx::query(&create_sql).execute(&mut *tx).await?;
            }
        }

        let mut written = 0u64;
        if !table.columns().is_empty() {
            let column_list = table
                .columns()
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let rows_per_chunk = (PG_BIND_LIMIT / table.columns().len()).max(1);

            for chunk in table.rows().chunks(rows_per_chunk) {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("INSERT INTO {target} ({column_list}) "));
                builder.push_values(chunk, |mut values, row| {
                    for (cell, ty) in row.iter().zip(&types) {
                        match ty {
                            SqlColumnType::BigInt => {
                                values.push_bind(match cell {
                                    Cell::Int(v) => Some(*v),
                                    _ => None,
                                });
                            }
                            SqlColumnType::Double => {
                                values.push_bind(cell.as_f64());
                            }
                            SqlColumnType::Boolean => {
                                values.push_bind(match cell {
                                    Cell::Bool(v) => Some(*v),
                                    _ => None,
                                });
                            }
                            SqlColumnType::Text => {
                                values.push_bind(raw_text(cell));
                            }
                        }
                    }
                });
                written += builder.build().execute(&mut *tx).await?.rows_affected();
            }
        }

        tx.commit().await?;
        Ok(written)
    }
}

/// In-memory store: canned query results plus written tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queries: HashMap<(String, String), Table>,
    tables: Mutex<BTreeMap<(String, String), Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_result(
        mut self,
        database: impl Into<String>,
        sql: impl AsRef<str>,
        table: Table,
    ) -> Self {
        self.queries
            .insert((database.into(), sql.as_ref().trim().to_string()), table);
        self
    }

    pub async fn table(&self, database: &str, name: &str) -> Option<Table> {
        self.tables
            .lock()
            .await
            .get(&(database.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl QueryStore for MemoryStore {
    async fn query_table(&self, database: &str, sql: &str) -> Result<Table, StoreError> {
        self.queries
            .get(&(database.to_string(), sql.trim().to_string()))
            .cloned()
            .ok_or_else(|| StoreError::UnknownQuery {
                database: database.to_string(),
                sql: sql.trim().to_string(),
            })
    }
}

#[async_trait]
impl TableWriter for MemoryStore {
    async fn push_table(
        &self,
        table: &Table,
        destination: &str,
        database: &str,
        mode: WriteMode,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let key = (database.to_string(), destination.to_string());
        if mode == WriteMode::Append {
            if let Some(existing) = tables.get_mut(&key) {
                if existing.columns() != table.columns() {
                    return Err(StoreError::SchemaMismatch {
                        table: destination.to_string(),
                        existing: existing.columns().to_vec(),
                        incoming: table.columns().to_vec(),
                    });
                }
                for row in table.rows() {
                    existing.push_row(row.clone())?;
                }
                return Ok(table.len() as u64);
            }
        }
        tables.insert(key, table.clone());
        Ok(table.len() as u64)
    }
}

fn data_to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Null,
        Data::Int(v) => Cell::Int(*v),
        Data::Float(v) => Cell::Float(*v),
        Data::Bool(v) => Cell::Bool(*v),
        Data::String(v) => Cell::Text(v.clone()),
        other => Cell::Text(other.to_string()),
    }
}

/// Reads one sheet (the first when `sheet` is `None`); row one is the header.
pub fn read_workbook_table(path: &Path, sheet: Option<&str>) -> anyhow::Result<Table> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("opening workbook {}", path.display()))?;
    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .with_context(|| format!("workbook {} has no sheets", path.display()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("reading sheet `{sheet_name}` of {}", path.display()))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::default());
    };
    let columns = header
        .iter()
        .enumerate()
        .map(|(idx, cell)| {
            let name = cell.to_string().trim().to_string();
            if name.is_empty() {
                format!("unnamed_{idx}")
            } else {
                name
            }
        })
        .collect::<Vec<_>>();

    let mut table = Table::new(columns)
        .with_context(|| format!("header of sheet `{sheet_name}` in {}", path.display()))?;
    for row in rows {
        table.push_row(row.iter().map(data_to_cell).collect())?;
    }
    Ok(table)
}

/// Renders a table as a single-sheet xlsx document with a bold header row.
pub fn workbook_bytes(table: &Table, sheet_name: &str) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name)?;

    for (col, name) in table.columns().iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, name, &header_format)?;
    }
    for (row_idx, row) in table.rows().iter().enumerate() {
        let r = (row_idx + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            let c = col as u16;
            match cell {
                Cell::Null => {}
                Cell::Bool(v) => {
                    sheet.write_boolean(r, c, *v)?;
                }
                Cell::Int(v) => {
                    sheet.write_number(r, c, *v as f64)?;
                }
                Cell::Float(v) if v.is_finite() => {
                    sheet.write_number(r, c, *v)?;
                }
                Cell::Float(_) => {}
                Cell::Text(v) => {
                    sheet.write_string(r, c, v)?;
                }
            }
        }
    }
    workbook.save_to_buffer()
}

#[derive(Debug, Clone)]
pub struct StoredExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Local export root. Files are replaced whole through a temp-file rename.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub async fn write_bytes(
        &self,
        relative: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredExport> {
        let relative_path = relative.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp export {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredExport {
            content_hash: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(columns: &[&str], rows: Vec<Vec<Cell>>) -> Table {
        Table::with_rows(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    #[test]
    fn export_hashing_is_stable() {
        let hash = ExportStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn export_writes_replace_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path());

        let first = store
            .write_bytes("processed/products.xlsx", b"first")
            .await
            .expect("first write");
        let second = store
            .write_bytes("processed/products.xlsx", b"second run")
            .await
            .expect("second write");

        assert_eq!(first.absolute_path, second.absolute_path);
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(std::fs::read(&second.absolute_path).unwrap(), b"second run");
        let leftovers = std::fs::read_dir(dir.path().join("processed"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn column_types_widen_to_fit_all_cells() {
        let t = table(
            &["ints", "mixed_num", "flags", "text", "empty", "ean"],
            vec![
                vec![
                    Cell::Int(1),
                    Cell::Int(1),
                    Cell::Bool(true),
                    Cell::from("a"),
                    Cell::Null,
                    Cell::from("0000000000055"),
                ],
                vec![
                    Cell::Null,
                    Cell::Float(2.5),
                    Cell::Bool(false),
                    Cell::Int(3),
                    Cell::Null,
                    Cell::from("7501234567890"),
                ],
            ],
        );
        assert_eq!(
            infer_column_types(&t),
            vec![
                SqlColumnType::BigInt,
                SqlColumnType::Double,
                SqlColumnType::Boolean,
                SqlColumnType::Text,
                SqlColumnType::Text,
                SqlColumnType::Text,
            ]
        );
        assert_eq!(
            create_table_sql(&quote_qualified("data.products_variety_ba"), &t, &infer_column_types(&t), false),
            "CREATE TABLE \"data\".\"products_variety_ba\" (\"ints\" BIGINT, \"mixed_num\" DOUBLE PRECISION, \"flags\" BOOLEAN, \"text\" TEXT, \"empty\" TEXT, \"ean\" TEXT)"
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("BA_ean"), "\"BA_ean\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn memory_store_replace_overwrites_and_append_extends() {
        let store = MemoryStore::new();
        let first = table(&["id"], vec![vec![Cell::Int(1)], vec![Cell::Int(2)]]);
        let second = table(&["id"], vec![vec![Cell::Int(3)]]);

        store
            .push_table(&first, "products", "data", WriteMode::Replace)
            .await
            .unwrap();
        store
            .push_table(&second, "products", "data", WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(store.table("data", "products").await.unwrap().len(), 1);

        store
            .push_table(&first, "products", "data", WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(store.table("data", "products").await.unwrap().len(), 3);

        let other = table(&["sku"], vec![]);
        let err = store
            .push_table(&other, "products", "data", WriteMode::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn memory_store_rejects_unregistered_queries() {
        let store = MemoryStore::new().with_query_result(
            "data",
            "select 1",
            table(&["one"], vec![vec![Cell::Int(1)]]),
        );
        assert_eq!(store.query_table("data", "  select 1 ").await.unwrap().len(), 1);
        assert!(matches!(
            store.query_table("prod", "select 1").await,
            Err(StoreError::UnknownQuery { .. })
        ));
    }

    #[test]
    fn workbook_written_here_reads_back_with_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("scraped.xlsx");
        let source = table(
            &["ean", "product_name", "normal_price"],
            vec![
                vec![Cell::from("55"), Cell::from("Jabón"), Cell::Float(19.5)],
                vec![Cell::from("N/A"), Cell::Null, Cell::Int(7)],
            ],
        );
        std::fs::write(&path, workbook_bytes(&source, "products").unwrap()).unwrap();

        let read = read_workbook_table(&path, None).unwrap();
        assert_eq!(read.columns(), source.columns());
        assert_eq!(read.len(), 2);
        assert_eq!(read.rows()[0][0], Cell::from("55"));
        assert_eq!(read.rows()[0][2].as_f64(), Some(19.5));
        assert!(read.rows()[1][1].is_null());
        assert_eq!(read.rows()[1][2].as_f64(), Some(7.0));
    }

    #[test]
    fn blank_header_cells_get_positional_names() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blank_headers.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "ean").unwrap();
        sheet.write_string(0, 1, "").unwrap();
        sheet.write_string(0, 2, "  ").unwrap();
        sheet.write_string(1, 0, "55").unwrap();
        sheet.write_number(1, 1, 1.0).unwrap();
        sheet.write_number(1, 2, 2.0).unwrap();
        std::fs::write(&path, workbook.save_to_buffer().unwrap()).unwrap();

        let read = read_workbook_table(&path, None).unwrap();
        assert_eq!(read.columns(), ["ean", "unnamed_1", "unnamed_2"]);
        assert_eq!(read.len(), 1);
    }
}
