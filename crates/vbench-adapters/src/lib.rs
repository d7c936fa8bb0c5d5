//! Store profiles and catalog sources: how each retailer's rows become product records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vbench_core::{normalize_identifier, Catalog, Cell, ColumnMapping, ProductRecord, StoreId, Table};
use vbench_storage::{read_workbook_table, QueryStore, StoreError};

pub const CRATE_NAME: &str = "vbench-adapters";

pub const QUERY_INTERNAL_CATALOG: &str = r#"
SELECT p.id::bigint AS id,
       p.sku,
       p.gtin::text AS gtin,
       p.name,
       p.price::float8 AS price,
       pcm.id::bigint AS cat_id,
       cat.name AS category
  FROM netamx.product p
  LEFT JOIN netamx.product_category_mapping pcm ON p.id = pcm.product_id
  LEFT JOIN netamx.category cat ON pcm.category_id = cat.id
 WHERE p.sku NOT LIKE '%F1%'
   AND p.sku NOT LIKE '%F2%'
   AND p.sku NOT LIKE '%SP%'
   AND p.sku NOT LIKE '%LB%'
   AND p.deprecated <> 1
   AND p.deleted <> 1
   AND p.published = 1
 ORDER BY p.id DESC
"#;

pub const QUERY_AURRERA_SCRAPER: &str = r#"
SELECT ean::text AS ean,
       product_id::text AS product_id,
       product_name,
       category,
       subcategory,
       normal_price::float8 AS normal_price,
       current_price::float8 AS current_price,
       url,
       scraping_datetime
  FROM dataprocessing.benchmark_aurrera
 ORDER BY scraping_datetime DESC
"#;

pub const QUERY_CHEDRAUI_SCRAPER: &str = r#"
SELECT upc::text AS upc,
       product_name,
       input_category,
       category,
       sub_category_1,
       sub_category_2,
       normal_price::float8 AS normal_price,
       url
  FROM dataprocessing.benchmark_chedraui
"#;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("column `{column}` not found; available columns: {available:?}")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Where a store's scraped catalog comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrapedSource {
    Query { database: String, sql: String },
    /// Scraper spreadsheet; relative paths resolve against the workspace root.
    Workbook {
        path: PathBuf,
        #[serde(default)]
        sheet: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartTarget {
    pub path: PathBuf,
    pub title: String,
}

/// Output destinations; local paths are relative to the export root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTargets {
    pub remote_database: String,
    pub remote_table: String,
    pub full_table: PathBuf,
    #[serde(default)]
    pub coincidence_table: Option<PathBuf>,
    #[serde(default)]
    pub external_only_table: Option<PathBuf>,
    #[serde(default)]
    pub chart: Option<ChartTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreProfile {
    pub store: StoreId,
    pub display_name: String,
    pub column_prefix: String,
    pub source: ScrapedSource,
    pub columns: ColumnMapping,
    pub exports: ExportTargets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalCatalogProfile {
    pub column_prefix: String,
    pub database: String,
    pub sql: String,
    pub columns: ColumnMapping,
}

impl Default for InternalCatalogProfile {
    fn default() -> Self {
        Self {
            column_prefix: "NETA".to_string(),
            database: "prod".to_string(),
            sql: QUERY_INTERNAL_CATALOG.trim().to_string(),
            columns: ColumnMapping {
                identifier: "gtin".to_string(),
                name: "name".to_string(),
                category: "category".to_string(),
                subcategories: Vec::new(),
                normal_price: Some("price".to_string()),
                current_price: None,
                url: None,
                extra: vec!["id".to_string(), "sku".to_string(), "cat_id".to_string()],
            },
        }
    }
}

pub fn aurrera_profile() -> StoreProfile {
    StoreProfile {
        store: StoreId::Aurrera,
        display_name: "Bodega Aurrerá".to_string(),
        column_prefix: "BA".to_string(),
        source: ScrapedSource::Query {
            database: "data".to_string(),
            sql: QUERY_AURRERA_SCRAPER.trim().to_string(),
        },
        columns: ColumnMapping {
            identifier: "ean".to_string(),
            name: "product_name".to_string(),
            category: "category".to_string(),
            subcategories: vec!["subcategory".to_string()],
            normal_price: Some("normal_price".to_string()),
            current_price: Some("current_price".to_string()),
            url: Some("url".to_string()),
            extra: Vec::new(),
        },
        exports: ExportTargets {
            remote_database: "data".to_string(),
            remote_table: "products_variety_ba".to_string(),
            full_table: PathBuf::from("processed/aurrera_neta_products.xlsx"),
            coincidence_table: Some(PathBuf::from("interim/ba_products_coincidence.xlsx")),
            external_only_table: Some(PathBuf::from("interim/ba_products_no_coincidence.xlsx")),
            chart: Some(ChartTarget {
                path: PathBuf::from("figures/ba_coincidences.svg"),
                title: "Coincidences with the internal catalog by Bodega Aurrerá category"
                    .to_string(),
            }),
        },
    }
}

pub fn chedraui_profile() -> StoreProfile {
    StoreProfile {
        store: StoreId::Chedraui,
        display_name: "Chedraui".to_string(),
        column_prefix: "CH".to_string(),
        source: ScrapedSource::Query {
            database: "data".to_string(),
            sql: QUERY_CHEDRAUI_SCRAPER.trim().to_string(),
        },
        columns: ColumnMapping {
            identifier: "upc".to_string(),
            name: "product_name".to_string(),
            category: "input_category".to_string(),
            subcategories: vec![
                "category".to_string(),
                "sub_category_1".to_string(),
                "sub_category_2".to_string(),
            ],
            normal_price: Some("normal_price".to_string()),
            current_price: None,
            url: Some("url".to_string()),
            extra: Vec::new(),
        },
        exports: ExportTargets {
            remote_database: "data".to_string(),
            remote_table: "products_variety_chedraui".to_string(),
            full_table: PathBuf::from("processed/chedraui_products.xlsx"),
            coincidence_table: None,
            external_only_table: None,
            chart: None,
        },
    }
}

pub fn profile_for_store(store: StoreId) -> StoreProfile {
    match store {
        StoreId::Aurrera => aurrera_profile(),
        StoreId::Chedraui => chedraui_profile(),
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn describe(&self) -> String;
    async fn fetch_table(&self) -> Result<Table, AdapterError>;
}

pub struct QueryCatalogSource {
    store: Arc<dyn QueryStore>,
    database: String,
    sql: String,
}

impl QueryCatalogSource {
    pub fn new(store: Arc<dyn QueryStore>, database: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
            sql: sql.into(),
        }
    }
}

#[async_trait]
impl CatalogSource for QueryCatalogSource {
    fn describe(&self) -> String {
        format!("query on `{}`", self.database)
    }

    async fn fetch_table(&self) -> Result<Table, AdapterError> {
        Ok(self.store.query_table(&self.database, &self.sql).await?)
    }
}

#[derive(Debug, Clone)]
pub struct WorkbookCatalogSource {
    path: PathBuf,
    sheet: Option<String>,
}

impl WorkbookCatalogSource {
    pub fn new(path: impl Into<PathBuf>, sheet: Option<String>) -> Self {
        Self {
            path: path.into(),
            sheet,
        }
    }
}

#[async_trait]
impl CatalogSource for WorkbookCatalogSource {
    fn describe(&self) -> String {
        format!("workbook {}", self.path.display())
    }

    async fn fetch_table(&self) -> Result<Table, AdapterError> {
        let path = self.path.clone();
        let sheet = self.sheet.clone();
        let table = tokio::task::spawn_blocking(move || read_workbook_table(&path, sheet.as_deref()))
            .await
            .context("joining workbook reader")??;
        Ok(table)
    }
}

pub fn scraped_source(
    profile: &StoreProfile,
    store: Arc<dyn QueryStore>,
    workspace_root: &Path,
) -> Box<dyn CatalogSource> {
    match &profile.source {
        ScrapedSource::Query { database, sql } => {
            Box::new(QueryCatalogSource::new(store, database.clone(), sql.clone()))
        }
        ScrapedSource::Workbook { path, sheet } => Box::new(WorkbookCatalogSource::new(
            workspace_root.join(path),
            sheet.clone(),
        )),
    }
}

pub fn internal_source(
    profile: &InternalCatalogProfile,
    store: Arc<dyn QueryStore>,
) -> Box<dyn CatalogSource> {
    Box::new(QueryCatalogSource::new(
        store,
        profile.database.clone(),
        profile.sql.clone(),
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogLoad {
    pub catalog: Catalog,
    pub rows_read: usize,
    /// Rows whose identifier was not numeric.
    pub dropped: usize,
}

/// Grouping keys compare exactly, so category text is kept as-is.
fn exact_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Text(v) => Some(v.clone()),
        other => Some(other.to_string()),
    }
}

/// Maps raw rows through a column mapping, dropping rows without a numeric identifier.
pub fn catalog_from_table(
    table: &Table,
    prefix: &str,
    columns: &ColumnMapping,
) -> Result<CatalogLoad, AdapterError> {
    let locate = |name: &str| {
        table
            .column_index(name)
            .ok_or_else(|| AdapterError::MissingColumn {
                column: name.to_string(),
                available: table.columns().to_vec(),
            })
    };

    let identifier_idx = locate(&columns.identifier)?;
    let name_idx = locate(&columns.name)?;
    let category_idx = locate(&columns.category)?;
    let subcategory_idx = columns
        .subcategories
        .iter()
        .map(|c| locate(c))
        .collect::<Result<Vec<_>, _>>()?;
    let normal_price_idx = columns.normal_price.as_deref().map(locate).transpose()?;
    let current_price_idx = columns.current_price.as_deref().map(locate).transpose()?;
    let url_idx = columns.url.as_deref().map(locate).transpose()?;
    let extra_idx = columns
        .extra
        .iter()
        .map(|c| locate(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(table.len());
    let mut dropped = 0usize;
    for row in table.rows() {
        let Some(identifier) = normalize_identifier(&row[identifier_idx]) else {
            dropped += 1;
            continue;
        };
        records.push(ProductRecord {
            identifier,
            name: row[name_idx].as_text(),
            category: exact_text(&row[category_idx]),
            subcategories: subcategory_idx.iter().map(|&i| row[i].as_text()).collect(),
            normal_price: normal_price_idx.and_then(|i| row[i].as_f64()),
            current_price: current_price_idx.and_then(|i| row[i].as_f64()),
            url: url_idx.and_then(|i| row[i].as_text()),
            extra: extra_idx.iter().map(|&i| row[i].clone()).collect(),
        });
    }

    Ok(CatalogLoad {
        catalog: Catalog {
            prefix: prefix.to_string(),
            columns: columns.clone(),
            records,
        },
        rows_read: table.len(),
        dropped,
    })
}

pub async fn load_catalog(
    source: &dyn CatalogSource,
    prefix: &str,
    columns: &ColumnMapping,
) -> Result<CatalogLoad, AdapterError> {
    let table = source.fetch_table().await?;
    catalog_from_table(&table, prefix, columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vbench_storage::{workbook_bytes, MemoryStore};

    fn scraped_table() -> Table {
        Table::with_rows(
            vec![
                "ean".into(),
                "product_name".into(),
                "category".into(),
                "subcategory".into(),
                "normal_price".into(),
                "current_price".into(),
                "url".into(),
            ],
            vec![
                vec![
                    Cell::from("55"),
                    Cell::from("Jabón"),
                    Cell::from("Limpieza"),
                    Cell::from("Baño"),
                    Cell::Float(21.0),
                    Cell::Float(19.5),
                    Cell::from("https://example.test/jabon"),
                ],
                vec![
                    Cell::from("N/A"),
                    Cell::from("Bolsa"),
                    Cell::from("Limpieza"),
                    Cell::Null,
                    Cell::Null,
                    Cell::Null,
                    Cell::Null,
                ],
                vec![
                    Cell::Float(7501234567890.0),
                    Cell::from("Papas"),
                    Cell::from("Botanas"),
                    Cell::from("Papas fritas"),
                    Cell::from("15.0"),
                    Cell::Null,
                    Cell::Null,
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn rows_are_normalized_and_bad_identifiers_dropped() {
        let profile = aurrera_profile();
        let load = catalog_from_table(&scraped_table(), &profile.column_prefix, &profile.columns)
            .unwrap();

        assert_eq!(load.rows_read, 3);
        assert_eq!(load.dropped, 1);
        let ids = load
            .catalog
            .records
            .iter()
            .map(|r| r.identifier.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["0000000000055", "7501234567890"]);

        let soap = &load.catalog.records[0];
        assert_eq!(soap.name.as_deref(), Some("Jabón"));
        assert_eq!(soap.category.as_deref(), Some("Limpieza"));
        assert_eq!(soap.subcategories, vec![Some("Baño".to_string())]);
        assert_eq!(soap.normal_price, Some(21.0));
        assert_eq!(soap.current_price, Some(19.5));
        assert_eq!(load.catalog.records[1].normal_price, Some(15.0));
        assert_eq!(load.catalog.prefix, "BA");
    }

    #[test]
    fn missing_mapped_column_is_an_error() {
        let profile = chedraui_profile();
        let err = catalog_from_table(&scraped_table(), "CH", &profile.columns).unwrap_err();
        match err {
            AdapterError::MissingColumn { column, available } => {
                assert_eq!(column, "upc");
                assert!(available.contains(&"ean".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn builtin_profiles_match_their_store() {
        for store in StoreId::ALL {
            assert_eq!(profile_for_store(store).store, store);
        }
        assert_ne!(
            aurrera_profile().exports.remote_table,
            chedraui_profile().exports.remote_table
        );
        assert_eq!(InternalCatalogProfile::default().column_prefix, "NETA");
    }

    #[tokio::test]
    async fn query_source_reads_through_the_store() {
        let internal = InternalCatalogProfile::default();
        let table = Table::with_rows(
            vec![
                "id".into(),
                "sku".into(),
                "gtin".into(),
                "name".into(),
                "price".into(),
                "cat_id".into(),
                "category".into(),
            ],
            vec![vec![
                Cell::Int(10),
                Cell::from("SKU-10"),
                Cell::from("1234567890123"),
                Cell::from("Soap Internal"),
                Cell::Float(20.0),
                Cell::Int(3),
                Cell::from("Higiene"),
            ]],
        )
        .unwrap();
        let store: Arc<dyn QueryStore> =
            Arc::new(MemoryStore::new().with_query_result("prod", &internal.sql, table));

        let source = internal_source(&internal, store);
        let load = load_catalog(source.as_ref(), &internal.column_prefix, &internal.columns)
            .await
            .unwrap();
        assert_eq!(load.catalog.records.len(), 1);
        let record = &load.catalog.records[0];
        assert_eq!(record.identifier, "1234567890123");
        assert_eq!(
            record.extra,
            vec![Cell::Int(10), Cell::from("SKU-10"), Cell::Int(3)]
        );
    }

    #[tokio::test]
    async fn workbook_source_resolves_against_workspace_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/raw")).unwrap();
        std::fs::write(
            dir.path().join("data/raw/aurrera.xlsx"),
            workbook_bytes(&scraped_table(), "Sheet1").unwrap(),
        )
        .unwrap();

        let mut profile = aurrera_profile();
        profile.source = ScrapedSource::Workbook {
            path: PathBuf::from("data/raw/aurrera.xlsx"),
            sheet: None,
        };
        let store: Arc<dyn QueryStore> = Arc::new(MemoryStore::new());
        let source = scraped_source(&profile, store, dir.path());
        assert!(source.describe().contains("aurrera.xlsx"));

        let load = load_catalog(source.as_ref(), &profile.column_prefix, &profile.columns)
            .await
            .unwrap();
        assert_eq!(load.rows_read, 3);
        assert_eq!(load.dropped, 1);
        assert_eq!(load.catalog.records[1].identifier, "7501234567890");
    }
}
