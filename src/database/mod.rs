mod postgres;
mod sql;
mod sqlite;

pub use self::{postgres::Postgres, sqlite::Sqlite};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use url::Url;

/// `_eventtype` of rows projected from event logs.
pub const LOG_EVENT: &str = "LogEvent";
/// `_eventtype` of the bookkeeping rows in [`BLOCKS_TABLE`].
pub const BLOCK_EVENT: &str = "BlockEvent";
/// Bookkeeping table with one row per block when enabled.
pub const BLOCKS_TABLE: &str = "_eventsql_blocks";

/// SQL type of a mapped column.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int,
    /// Arbitrary precision integer. Read back as decimal text.
    Numeric,
    Bool,
    Text,
    Bytes,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

/// The shape of a projected table.
///
/// Every table additionally has the columns `_height`, `_txindex`,
/// `_logindex`, `_eventtype` and `_eventname` before the mapped columns.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    /// Mapped columns forming the primary key. When empty, rows are keyed by
    /// `(_height, _txindex, _logindex)`.
    #[serde(default)]
    pub key: Vec<String>,
}

impl TableSchema {
    /// Schema of the [`BLOCKS_TABLE`] bookkeeping table.
    pub fn blocks() -> Self {
        Self {
            name: BLOCKS_TABLE.to_owned(),
            columns: vec![Column {
                name: "_timestamp".to_owned(),
                ty: ColumnType::Int,
            }],
            key: Vec::new(),
        }
    }
}

/// A value stored in a column.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
    Bytes(#[serde(with = "hex::serde")] Vec<u8>),
}

/// A projected row. `cells` are in the order of the table's columns.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Row {
    pub height: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub event_type: String,
    pub event_name: String,
    pub cells: Vec<Cell>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TableRows {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

/// All rows derived from one block. This is the unit of atomic commit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct Projection {
    pub height: u64,
    pub timestamp: u64,
    pub tables: Vec<TableRows>,
}

/// A row as read back from the database, by column name.
pub type RowData = BTreeMap<String, Cell>;

/// The rows committed for one block height, by table.
#[derive(Clone, Debug, Default, Serialize, Eq, PartialEq)]
pub struct BlockRows {
    pub height: u64,
    pub tables: BTreeMap<String, Vec<RowData>>,
}

/// How long the commit history used by [`Database::restore`] is kept.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Retention {
    #[default]
    Unbounded,
    /// History older than this is pruned on commit. Restoring to a point
    /// before the pruned horizon fails.
    Window(Duration),
}

impl Retention {
    /// The commit time in unix microseconds before which history is pruned.
    fn horizon(&self, now: i64) -> Option<i64> {
        match self {
            Retention::Unbounded => None,
            Retention::Window(window) => {
                let window = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
                Some(now.saturating_sub(window))
            }
        }
    }
}

/// Abstraction over specific SQL like backends.
///
/// All methods either succeed in full or error without having applied any
/// changes. This is accomplished by using SQL transactions.
pub trait Database: Send {
    /// The height of the last committed projection, if any.
    fn checkpoint(&mut self) -> BoxFuture<'_, Result<Option<u64>>>;

    /// Writes every row of the projection and advances the checkpoint.
    ///
    /// Tables are created when first referenced and missing columns are
    /// added to existing tables. Rows are upserted by their table's key, so
    /// committing the same projection again does not duplicate rows. The
    /// checkpoint never decreases.
    fn commit<'a>(&'a mut self, projection: &'a Projection) -> BoxFuture<'a, Result<()>>;

    /// Reads the rows committed at exactly `height` from all projected
    /// tables. `None` if no projection was committed for that height.
    fn block(&mut self, height: u64) -> BoxFuture<'_, Result<Option<BlockRows>>>;

    /// Replays the commit history up to and including `at` into a fresh set
    /// of tables prefixed with `label`. Live tables and the live checkpoint
    /// are left untouched.
    ///
    /// Errors:
    ///
    /// - `label` is not a valid table name prefix.
    /// - A restore with the same `label` already exists.
    /// - History before `at` has been pruned.
    fn restore<'a>(&'a mut self, at: DateTime<Utc>, label: &'a str) -> BoxFuture<'a, Result<()>>;
}

impl<D> Database for Box<D>
where
    D: Database + ?Sized,
{
    fn checkpoint(&mut self) -> BoxFuture<'_, Result<Option<u64>>> {
        (**self).checkpoint()
    }

    fn commit<'a>(&'a mut self, projection: &'a Projection) -> BoxFuture<'a, Result<()>> {
        (**self).commit(projection)
    }

    fn block(&mut self, height: u64) -> BoxFuture<'_, Result<Option<BlockRows>>> {
        (**self).block(height)
    }

    fn restore<'a>(&'a mut self, at: DateTime<Utc>, label: &'a str) -> BoxFuture<'a, Result<()>> {
        (**self).restore(at, label)
    }
}

/// Opens the backend for a database URL: `sqlite://...` or
/// `postgresql://...`.
pub async fn open(url: &Url, retention: Retention) -> Result<Box<dyn Database>> {
    let database: Box<dyn Database> = match url.scheme() {
        "sqlite" => Box::new(Sqlite::open(url)?.with_retention(retention)),
        "postgres" | "postgresql" => Box::new(
            Postgres::connect(url.as_str())
                .await?
                .with_retention(retention),
        ),
        scheme => anyhow::bail!("unsupported database scheme {scheme}"),
    };
    Ok(database)
}

/// Validates a user provided table, column or restore label name and returns
/// its lower case form. Names starting with an underscore are reserved for
/// internal tables and columns. `__` and a trailing underscore are reserved
/// for the `<label>__<table>` names of restored tables.
pub fn sql_name(name: &str) -> Option<String> {
    let name = name.to_ascii_lowercase();
    let mut chars = name.chars();
    let first = chars.next()?;
    if !first.is_ascii_lowercase() || name.contains("__") || name.ends_with('_') {
        return None;
    }
    chars
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        .then_some(name)
}

/// Folds projections, in commit order, into a single projection that replays
/// to the same table state. Used to compact history past the retention window.
fn fold(projections: impl IntoIterator<Item = Projection>) -> Projection {
    let mut folded = Projection::default();
    for projection in projections {
        folded.height = folded.height.max(projection.height);
        folded.timestamp = projection.timestamp;
        for table in projection.tables {
            let last = folded
                .tables
                .iter_mut()
                .rev()
                .find(|last| last.schema.name == table.schema.name);
            match last {
                Some(last) if last.schema == table.schema => last.rows.extend(table.rows),
                _ => folded.tables.push(table),
            }
        }
    }
    folded
}

fn label_name(label: &str) -> Result<String> {
    sql_name(label).with_context(|| format!("invalid restore label '{label}'"))
}

/// Names of the tables a restore under `label` writes: its checkpoint and
/// every table of the replayed projections.
fn restore_targets<'a>(
    label: &str,
    projections: impl IntoIterator<Item = &'a Projection>,
) -> BTreeSet<String> {
    projections
        .into_iter()
        .flat_map(|projection| &projection.tables)
        .map(|table| table.schema.name.as_str())
        .chain([sql::CHECKPOINT_TABLE])
        .map(|table| sql::table_name(label, table))
        .collect()
}

fn micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{what} out of bounds"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn schema(name: &str, columns: &[(&str, ColumnType)]) -> TableSchema {
        TableSchema {
            name: name.to_owned(),
            columns: columns
                .iter()
                .map(|(name, ty)| Column {
                    name: name.to_string(),
                    ty: *ty,
                })
                .collect(),
            key: Vec::new(),
        }
    }

    pub fn row(height: u64, log_index: u64, cells: Vec<Cell>) -> Row {
        Row {
            height,
            transaction_index: 0,
            log_index,
            event_type: LOG_EVENT.to_owned(),
            event_name: "UpdateTestEvents".to_owned(),
            cells,
        }
    }

    pub fn projection(height: u64, tables: Vec<(TableSchema, Vec<Row>)>) -> Projection {
        Projection {
            height,
            timestamp: 1_600_000_000 + height,
            tables: tables
                .into_iter()
                .map(|(schema, rows)| TableRows { schema, rows })
                .collect(),
        }
    }

    #[test]
    fn names() {
        assert_eq!(sql_name("EventTest").as_deref(), Some("eventtest"));
        assert_eq!(sql_name("RESTORED").as_deref(), Some("restored"));
        assert_eq!(sql_name("a_1").as_deref(), Some("a_1"));
        assert_eq!(sql_name(""), None);
        assert_eq!(sql_name("_internal"), None);
        assert_eq!(sql_name("1st"), None);
        assert_eq!(sql_name("drop table;"), None);
        assert_eq!(sql_name("restored__eventtest"), None);
        assert_eq!(sql_name("restored_"), None);
    }

    #[test]
    fn retention_horizon() {
        assert_eq!(Retention::Unbounded.horizon(1_000), None);
        assert_eq!(
            Retention::Window(Duration::from_millis(1)).horizon(5_000),
            Some(4_000)
        );
        assert_eq!(
            Retention::Window(Duration::MAX).horizon(5_000),
            Some(5_000 - i64::MAX)
        );
    }

    #[test]
    fn fold_keeps_replay_order() {
        let narrow = schema("t", &[("a", ColumnType::Int)]);
        let wide = schema("t", &[("a", ColumnType::Int), ("b", ColumnType::Text)]);
        let other = schema("u", &[]);
        let folded = fold([
            projection(1, vec![(narrow.clone(), vec![row(1, 0, vec![Cell::Int(1)])])]),
            projection(
                2,
                vec![
                    (narrow.clone(), vec![row(2, 0, vec![Cell::Int(2)])]),
                    (other.clone(), vec![row(2, 1, vec![])]),
                ],
            ),
            projection(
                3,
                vec![(wide.clone(), vec![row(3, 0, vec![Cell::Int(3), Cell::Null])])],
            ),
        ]);

        assert_eq!(folded.height, 3);
        assert_eq!(folded.timestamp, 1_600_000_003);
        let tables = folded
            .tables
            .iter()
            .map(|table| (&table.schema, table.rows.len()))
            .collect::<Vec<_>>();
        assert_eq!(tables, [(&narrow, 2), (&other, 1), (&wide, 1)]);
    }

    #[test]
    fn projection_history_encoding() {
        let projection = projection(
            7,
            vec![(
                schema("t", &[("a", ColumnType::Bytes), ("b", ColumnType::Text)]),
                vec![row(
                    7,
                    0,
                    vec![Cell::Bytes(vec![0xf3, 0x6e]), Cell::Text("x".to_owned())],
                )],
            )],
        );
        let json = serde_json::to_string(&projection).unwrap();
        assert!(json.contains(r#"{"Bytes":"f36e"}"#), "{json}");
        assert_eq!(
            serde_json::from_str::<Projection>(&json).unwrap(),
            projection
        );
    }
}
