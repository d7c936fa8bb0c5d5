//! Core catalog model plus the identifier, ordering and matching rules for vbench.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vbench-core";

/// Canonical EAN-13 width every identifier is padded to.
pub const IDENTIFIER_WIDTH: usize = 13;

/// Display order carried by rows that have no external product.
pub const MISSING_DISPLAY_ORDER: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreId {
    Aurrera,
    Chedraui,
}

impl StoreId {
    pub const ALL: [StoreId; 2] = [StoreId::Aurrera, StoreId::Chedraui];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreId::Aurrera => "aurrera",
            StoreId::Chedraui => "chedraui",
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        StoreId::ALL
            .into_iter()
            .find(|store| store.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownStore(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown store `{0}`; expected one of: aurrera, chedraui")]
    UnknownStore(String),
    #[error("no profile configured for store `{0}`")]
    MissingProfile(StoreId),
    #[error("store `{0}` is configured more than once")]
    DuplicateProfile(StoreId),
}

/// One value of a tabular collaborator result.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Text rendering used for name/category/url style fields; blank text counts as absent.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Bool(v) => Some(v.to_string()),
            Cell::Int(v) => Some(v.to_string()),
            Cell::Float(v) => Some(format_float(*v)),
            Cell::Text(v) => {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) if v.is_finite() => Some(*v),
            Cell::Text(v) => v.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => f.write_str(&format_float(*v)),
            Cell::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}

fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("row has {actual} cells but the table has {expected} columns")]
    RowWidth { expected: usize, actual: usize },
    #[error("duplicate column name `{0}`")]
    DuplicateColumn(String),
}

/// Named columns with rows of equal width.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Result<Self, TableError> {
        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(TableError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns)?;
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn filter_rows(&self, keep: impl Fn(&[Cell]) -> bool) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|row| keep(row)).cloned().collect(),
        }
    }
}

/// Source column names a catalog is read from; export headers reuse them behind a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub identifier: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
    #[serde(default)]
    pub normal_price: Option<String>,
    #[serde(default)]
    pub current_price: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    pub identifier: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub subcategories: Vec<Option<String>>,
    pub normal_price: Option<f64>,
    pub current_price: Option<f64>,
    pub url: Option<String>,
    /// Pass-through values, aligned with `ColumnMapping::extra`.
    pub extra: Vec<Cell>,
}

impl ProductRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            category: None,
            subcategories: Vec::new(),
            normal_price: None,
            current_price: None,
            url: None,
            extra: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Records from one system together with the layout they were read with.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    pub prefix: String,
    pub columns: ColumnMapping,
    pub records: Vec<ProductRecord>,
}

/// True when `raw` is an unsigned integer literal once surrounding whitespace is removed.
pub fn is_numeric_identifier(raw: &str) -> bool {
    let trimmed = raw.trim();
    !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit())
}

/// Left-pads with zeros up to 13 characters. Longer values pass through untouched.
pub fn pad_to_13(raw: &str) -> String {
    if raw.chars().count() >= IDENTIFIER_WIDTH {
        return raw.to_string();
    }
    format!("{raw:0>width$}", width = IDENTIFIER_WIDTH)
}

/// Validates and pads a typed identifier cell; `None` means the row gets dropped.
pub fn normalize_identifier(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Text(raw) => {
            let trimmed = raw.trim();
            is_numeric_identifier(trimmed).then(|| pad_to_13(trimmed))
        }
        Cell::Int(v) if *v >= 0 => Some(pad_to_13(&v.to_string())),
        // Spreadsheet readers hand EANs back as floats.
        Cell::Float(v) if v.is_finite() && *v >= 0.0 && v.fract() == 0.0 => {
            Some(pad_to_13(&format!("{v:.0}")))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedProduct {
    pub display_order: usize,
    pub record: ProductRecord,
}

/// Named categories sort lexically; the null category sorts after all of them.
fn compare_category(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Numbers each category group from zero in incoming row order, then sorts by
/// (category, display order).
pub fn assign_display_order(records: Vec<ProductRecord>) -> Vec<OrderedProduct> {
    let mut counters: HashMap<Option<String>, usize> = HashMap::new();
    let mut ordered = records
        .into_iter()
        .map(|record| {
            let next = counters.entry(record.category.clone()).or_default();
            let display_order = *next;
            *next += 1;
            OrderedProduct {
                display_order,
                record,
            }
        })
        .collect::<Vec<_>>();

    ordered.sort_by(|a, b| {
        compare_category(a.record.category.as_deref(), b.record.category.as_deref())
            .then(a.display_order.cmp(&b.display_order))
    });
    ordered
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Membership {
    ExternalOnly,
    InternalOnly,
    Both,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::ExternalOnly => "external-only",
            Membership::InternalOnly => "internal-only",
            Membership::Both => "both",
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchRow {
    pub identifier: String,
    pub external: Option<OrderedProduct>,
    pub internal: Option<ProductRecord>,
    pub membership: Membership,
}

impl MatchRow {
    pub fn category(&self) -> Option<&str> {
        self.external
            .as_ref()
            .and_then(|p| p.record.category.as_deref())
    }

    pub fn display_order(&self) -> i64 {
        self.external
            .as_ref()
            .map(|p| p.display_order as i64)
            .unwrap_or(MISSING_DISPLAY_ORDER)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipCounts {
    pub both: usize,
    pub external_only: usize,
    pub internal_only: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchReport {
    pub rows: Vec<MatchRow>,
    /// Identifiers seen more than once in the external catalog.
    pub duplicate_external: Vec<String>,
    /// Identifiers seen more than once in the internal catalog.
    pub duplicate_internal: Vec<String>,
}

impl MatchReport {
    pub fn counts(&self) -> MembershipCounts {
        let mut counts = MembershipCounts::default();
        for row in &self.rows {
            match row.membership {
                Membership::Both => counts.both += 1,
                Membership::ExternalOnly => counts.external_only += 1,
                Membership::InternalOnly => counts.internal_only += 1,
            }
        }
        counts
    }

    pub fn rows_with(&self, membership: Membership) -> impl Iterator<Item = &MatchRow> {
        self.rows.iter().filter(move |r| r.membership == membership)
    }
}

fn duplicated_identifiers<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for id in ids {
        *seen.entry(id).or_default() += 1;
    }
    seen.into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, _)| id.to_string())
        .collect()
}

/// Full outer join on identifier. Repeated identifiers expand into every
/// external × internal pairing.
pub fn match_catalogs(external: &[OrderedProduct], internal: &[ProductRecord]) -> MatchReport {
    let mut internal_index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, record) in internal.iter().enumerate() {
        internal_index
            .entry(record.identifier.as_str())
            .or_default()
            .push(idx);
    }

    let mut matched = vec![false; internal.len()];
    let mut rows = Vec::with_capacity(external.len() + internal.len());

    for product in external {
        match internal_index.get(product.record.identifier.as_str()) {
            Some(indices) => {
                for &idx in indices {
                    matched[idx] = true;
                    rows.push(MatchRow {
                        identifier: product.record.identifier.clone(),
                        external: Some(product.clone()),
                        internal: Some(internal[idx].clone()),
                        membership: Membership::Both,
                    });
                }
            }
            None => rows.push(MatchRow {
                identifier: product.record.identifier.clone(),
                external: Some(product.clone()),
                internal: None,
                membership: Membership::ExternalOnly,
            }),
        }
    }

    for (record, _) in internal.iter().zip(&matched).filter(|(_, m)| !**m) {
        rows.push(MatchRow {
            identifier: record.identifier.clone(),
            external: None,
            internal: Some(record.clone()),
            membership: Membership::InternalOnly,
        });
    }

    rows.sort_by(|a, b| {
        a.external
            .is_none()
            .cmp(&b.external.is_none())
            .then(compare_category(a.category(), b.category()))
            .then(a.display_order().cmp(&b.display_order()))
            .then_with(|| a.identifier.cmp(&b.identifier))
    });

    MatchReport {
        rows,
        duplicate_external: duplicated_identifiers(
            external.iter().map(|p| p.record.identifier.as_str()),
        ),
        duplicate_internal: duplicated_identifiers(internal.iter().map(|r| r.identifier.as_str())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCoincidence {
    pub category: String,
    pub total: usize,
    pub coincident: usize,
    pub percent: f64,
}

/// Share of each external category's rows that also exist internally, highest first.
pub fn coincidence_by_category(rows: &[MatchRow]) -> Vec<CategoryCoincidence> {
    let mut tally: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for row in rows {
        let Some(category) = row.category() else {
            continue;
        };
        let entry = tally.entry(category).or_default();
        entry.0 += 1;
        if row.membership == Membership::Both {
            entry.1 += 1;
        }
    }

    let mut out = tally
        .into_iter()
        .map(|(category, (total, coincident))| CategoryCoincidence {
            category: category.to_string(),
            total,
            coincident,
            percent: coincident as f64 * 100.0 / total as f64,
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.percent.total_cmp(&a.percent));
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryCrosswalk {
    /// Internal category -> external categories its coincident products came from.
    pub mappings: BTreeMap<String, Vec<String>>,
    /// External categories with no coincident product at all.
    pub unmatched_external: Vec<String>,
}

pub fn category_crosswalk(rows: &[MatchRow]) -> CategoryCrosswalk {
    let mut mappings: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut coincident_external: BTreeSet<&str> = BTreeSet::new();
    let mut all_external: BTreeSet<&str> = BTreeSet::new();

    for row in rows {
        let external_category = row.category();
        if let Some(category) = external_category {
            all_external.insert(category);
        }
        if row.membership != Membership::Both {
            continue;
        }
        let Some(external_category) = external_category else {
            continue;
        };
        coincident_external.insert(external_category);
        if let Some(internal_category) = row
            .internal
            .as_ref()
            .and_then(|r| r.category.as_deref())
        {
            mappings
                .entry(internal_category.to_string())
                .or_default()
                .insert(external_category.to_string());
        }
    }

    CategoryCrosswalk {
        mappings: mappings
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect(),
        unmatched_external: all_external
            .difference(&coincident_external)
            .map(|c| c.to_string())
            .collect(),
    }
}
