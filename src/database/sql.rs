//! SQL statements shared by the database backends.

use super::{Column, ColumnType, TableSchema};
use std::fmt::Write;

pub const CHECKPOINT_TABLE: &str = "_eventsql_checkpoint";
pub const HISTORY_TABLE: &str = "_eventsql_history";
pub const TABLES_TABLE: &str = "_eventsql_tables";
pub const META_TABLE: &str = "_eventsql_meta";

/// `_eventsql_meta` key of the commit time before which history was folded.
pub const HORIZON_KEY: &str = "horizon";

/// Columns that every projected table has, in order.
pub const FIXED_COLUMNS: [&str; 5] = ["_height", "_txindex", "_logindex", "_eventtype", "_eventname"];
const LOG_KEY: [&str; 3] = ["_height", "_txindex", "_logindex"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn param(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Postgres => format!("${index}"),
        }
    }

    fn integer(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres => "BIGINT",
        }
    }

    /// The declared type of a mapped column.
    ///
    /// SQLite declares booleans as `INT` so they can be told apart from
    /// `INTEGER` columns when reading rows back.
    pub fn column_type(self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (Dialect::Sqlite, ColumnType::Int) => "INTEGER",
            (Dialect::Sqlite, ColumnType::Bool) => "INT",
            (Dialect::Sqlite, ColumnType::Numeric | ColumnType::Text) => "TEXT",
            (Dialect::Sqlite, ColumnType::Bytes) => "BLOB",
            (Dialect::Postgres, ColumnType::Int) => "BIGINT",
            (Dialect::Postgres, ColumnType::Bool) => "BOOLEAN",
            (Dialect::Postgres, ColumnType::Numeric) => "NUMERIC",
            (Dialect::Postgres, ColumnType::Text) => "TEXT",
            (Dialect::Postgres, ColumnType::Bytes) => "BYTEA",
        }
    }

    fn value(self, index: usize, ty: ColumnType) -> String {
        match (self, ty) {
            (Dialect::Postgres, ColumnType::Numeric) => format!("${index}::text::numeric"),
            _ => self.param(index),
        }
    }

    fn strict(self) -> &'static str {
        match self {
            Dialect::Sqlite => " STRICT",
            Dialect::Postgres => "",
        }
    }
}

pub fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

/// The name of `table` in the destination identified by `prefix`. The live
/// tables have an empty prefix. Validated names never contain `__` nor end
/// with `_`, so a prefixed name can't be a live table or belong to another
/// prefix.
pub fn table_name(prefix: &str, table: &str) -> String {
    if prefix.is_empty() {
        table.to_owned()
    } else {
        format!("{prefix}__{table}")
    }
}

pub fn create_checkpoint(dialect: Dialect, name: &str) -> String {
    let integer = dialect.integer();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (height {integer} PRIMARY KEY NOT NULL, committed_at \
         {integer} NOT NULL){};",
        quote(name),
        dialect.strict(),
    )
}

/// Statements creating the internal tables of the live destination.
pub fn create_internal(dialect: Dialect) -> Vec<String> {
    let integer = dialect.integer();
    let strict = dialect.strict();
    let id = match dialect {
        Dialect::Sqlite => "INTEGER PRIMARY KEY",
        Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
    };
    vec![
        create_checkpoint(dialect, CHECKPOINT_TABLE),
        format!(
            "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (id {id}, height {integer} NOT NULL, \
             committed_at {integer} NOT NULL, projection TEXT NOT NULL){strict};"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {HISTORY_TABLE}_committed_at ON {HISTORY_TABLE} \
             (committed_at);"
        ),
        format!("CREATE TABLE IF NOT EXISTS {TABLES_TABLE} (name TEXT PRIMARY KEY NOT NULL){strict};"),
        format!(
            "CREATE TABLE IF NOT EXISTS {META_TABLE} (key TEXT PRIMARY KEY NOT NULL, value \
             {integer} NOT NULL){strict};"
        ),
    ]
}

pub fn create_table(dialect: Dialect, name: &str, schema: &TableSchema) -> String {
    let integer = dialect.integer();
    let mut sql = String::new();
    write!(
        &mut sql,
        "CREATE TABLE IF NOT EXISTS {} (_height {integer} NOT NULL, _txindex {integer} NOT NULL, \
         _logindex {integer} NOT NULL, _eventtype TEXT NOT NULL, _eventname TEXT NOT NULL, ",
        quote(name)
    )
    .unwrap();
    for column in &schema.columns {
        write!(
            &mut sql,
            "{} {}, ",
            quote(&column.name),
            dialect.column_type(column.ty)
        )
        .unwrap();
    }
    write!(&mut sql, "PRIMARY KEY({})){};", key(schema), dialect.strict()).unwrap();
    sql
}

pub fn add_column(dialect: Dialect, name: &str, column: &Column) -> String {
    let if_not_exists = match dialect {
        Dialect::Sqlite => "",
        Dialect::Postgres => "IF NOT EXISTS ",
    };
    format!(
        "ALTER TABLE {} ADD COLUMN {if_not_exists}{} {};",
        quote(name),
        quote(&column.name),
        dialect.column_type(column.ty)
    )
}

/// Inserts a row, replacing the non-key columns of an existing row with the
/// same key.
///
/// Parameters:
/// - 1..=5: the fixed columns
/// - 5 + n: n-th mapped column
pub fn upsert(dialect: Dialect, name: &str, schema: &TableSchema) -> String {
    let columns = FIXED_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain(schema.columns.iter().map(|column| quote(&column.name)))
        .collect::<Vec<_>>();
    let values = (1..=FIXED_COLUMNS.len())
        .map(|index| dialect.param(index))
        .chain(
            schema
                .columns
                .iter()
                .enumerate()
                .map(|(i, column)| dialect.value(FIXED_COLUMNS.len() + i + 1, column.ty)),
        )
        .collect::<Vec<_>>();
    let key_columns = key_columns(schema);
    let updates = columns
        .iter()
        .filter(|column| !key_columns.contains(column))
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>();
    format!(
        "INSERT INTO {} ({}) VALUES({}) ON CONFLICT({}) DO UPDATE SET {};",
        quote(name),
        columns.join(", "),
        values.join(", "),
        key(schema),
        updates.join(", "),
    )
}

/// Selects the rows of one height. `columns` are the table's mapped columns
/// as found in the database.
pub fn select_block(dialect: Dialect, name: &str, columns: &[(String, ColumnType)]) -> String {
    let columns = FIXED_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain(columns.iter().map(|(column, ty)| match (dialect, ty) {
            (Dialect::Postgres, ColumnType::Numeric) => format!("{}::text", quote(column)),
            _ => quote(column),
        }))
        .collect::<Vec<_>>();
    format!(
        "SELECT {} FROM {} WHERE _height = {} ORDER BY _txindex, _logindex;",
        columns.join(", "),
        quote(name),
        dialect.param(1),
    )
}

/// Unquoted primary key columns of a table, in key order.
pub fn primary_key(schema: &TableSchema) -> Vec<&str> {
    if schema.key.is_empty() {
        LOG_KEY.to_vec()
    } else {
        schema.key.iter().map(String::as_str).collect()
    }
}

fn key_columns(schema: &TableSchema) -> Vec<String> {
    if schema.key.is_empty() {
        LOG_KEY.iter().map(|column| column.to_string()).collect()
    } else {
        schema.key.iter().map(|column| quote(column)).collect()
    }
}

fn key(schema: &TableSchema) -> String {
    key_columns(schema).join(", ")
}
