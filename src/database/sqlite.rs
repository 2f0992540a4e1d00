use super::{
    fold, label_name, micros, restore_targets,
    sql::{self, Dialect, CHECKPOINT_TABLE, HORIZON_KEY},
    to_i64, BlockRows, Cell, ColumnType, Database, Projection, Retention, RowData, TableRows,
    TableSchema,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use rusqlite::{
    types::{ToSqlOutput, Value as SqlValue, ValueRef as SqlValueRef},
    Connection, OpenFlags, OptionalExtension, ToSql, Transaction,
};
use std::{
    collections::{HashMap, HashSet},
    env,
};
use url::Url;

const DIALECT: Dialect = Dialect::Sqlite;

const GET_CHECKPOINT: &str = "SELECT MAX(height) FROM _eventsql_checkpoint;";
const HAS_HEIGHT: &str = "SELECT COUNT(*) > 0 FROM _eventsql_checkpoint WHERE height = ?1;";
const SET_CHECKPOINT: &str = "INSERT INTO _eventsql_checkpoint (height, committed_at) VALUES(?1, \
                              ?2) ON CONFLICT(height) DO UPDATE SET committed_at = \
                              excluded.committed_at;";
const GET_TABLES: &str = "SELECT name FROM _eventsql_tables ORDER BY name;";
const REGISTER_TABLE: &str =
    "INSERT INTO _eventsql_tables (name) VALUES(?1) ON CONFLICT(name) DO NOTHING;";
const APPEND_HISTORY: &str =
    "INSERT INTO _eventsql_history (height, committed_at, projection) VALUES(?1, ?2, ?3);";
const GET_HISTORY: &str = "SELECT committed_at, projection FROM _eventsql_history WHERE \
                           committed_at <= ?1 ORDER BY committed_at, id;";
const GET_EXPIRED_HISTORY: &str = "SELECT committed_at, projection FROM _eventsql_history WHERE \
                                   committed_at < ?1 ORDER BY committed_at, id;";
const DELETE_HISTORY: &str = "DELETE FROM _eventsql_history WHERE committed_at <= ?1;";
const GET_HORIZON: &str = "SELECT value FROM _eventsql_meta WHERE key = ?1;";
const SET_HORIZON: &str = "INSERT INTO _eventsql_meta (key, value) VALUES(?1, ?2) ON \
                           CONFLICT(key) DO UPDATE SET value = excluded.value;";
const TABLE_EXISTS: &str =
    "SELECT COUNT(*) > 0 FROM sqlite_schema WHERE type = 'table' AND name = ?1;";

pub struct Sqlite {
    connection: Connection,
    retention: Retention,
    /// Invariant: tables in the map exist in the database with at least
    /// these columns.
    ///
    /// Only updated once the transaction that created the tables commits.
    tables: Tables,
}

/// Known columns by table name.
type Tables = HashMap<String, HashSet<String>>;

impl Sqlite {
    pub fn new(connection: Connection) -> Result<Self> {
        for statement in sql::create_internal(DIALECT) {
            connection
                .execute(&statement, ())
                .with_context(|| format!("execute {statement}"))?;
        }

        for statement in [
            GET_CHECKPOINT,
            SET_CHECKPOINT,
            REGISTER_TABLE,
            APPEND_HISTORY,
            GET_HORIZON,
            SET_HORIZON,
            TABLE_EXISTS,
        ] {
            connection
                .prepare_cached(statement)
                .with_context(|| format!("prepare {statement}"))?;
        }

        Ok(Self {
            connection,
            retention: Retention::default(),
            tables: Default::default(),
        })
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Opens a new SQLite database backend for the specified URL. The expected
    /// URL format is `sqlite://[/path[?query]]`. For example:
    ///
    /// - `sqlite://` to open an in-memory connection
    /// - `sqlite:///relative/foo.db` to open the file `relative/foo.db`
    /// - `sqlite:////absolute/foo.db` to open the file `/absolute/foo.db`
    ///
    /// Additionally, query string parameters can be set to configure database
    /// connection options. See <https://www.sqlite.org/uri.html> for supported
    /// query string parameters.
    pub fn open(url: &Url) -> Result<Self> {
        anyhow::ensure!(url.scheme() == "sqlite", "not an sqlite:// URL");
        anyhow::ensure!(
            url.has_authority() && url.authority() == "",
            "sqlite:// URL requires empty authority"
        );
        anyhow::ensure!(
            url.fragment().is_none(),
            "sqlite:// URL does not support fragments"
        );

        if url.path().is_empty() {
            tracing::debug!("opening in-memory database");
            return Self::new(Connection::open_in_memory()?);
        };

        // SQLite 3 supports connection strings as file:// URLs, convert our
        // `sqlite://` to that.
        let path = url
            .path()
            .strip_prefix('/')
            .context("sqlite:// URL path not prefixed with /")?;
        let mut file = Url::from_file_path(env::current_dir()?.join(path))
            .ok()
            .context("invalid sqlite:// URL file path")?;
        if let Some(query) = url.query() {
            file.set_query(Some(query));
        }

        tracing::debug!(%file, "opening database");
        let connection = Connection::open_with_flags(
            file.as_str(),
            OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
        )?;

        Self::new(connection)
    }

    #[cfg(test)]
    /// Create a temporary in memory database for tests.
    pub fn new_for_test() -> Self {
        Self::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[cfg(test)]
    pub fn row_count(&self, table: &str) -> i64 {
        self.connection
            .query_row(
                &format!("SELECT COUNT(*) FROM {};", sql::quote(table)),
                (),
                |row| row.get(0),
            )
            .unwrap()
    }

    fn checkpoint_(&self) -> Result<Option<u64>> {
        let height: Option<i64> = self
            .connection
            .prepare_cached(GET_CHECKPOINT)
            .context("prepare_cached GET_CHECKPOINT")?
            .query_row((), |row| row.get(0))
            .context("query GET_CHECKPOINT")?;
        height
            .map(|height| height.try_into().context("checkpoint out of bounds"))
            .transpose()
    }

    fn commit_(&mut self, projection: &Projection) -> Result<()> {
        let committed_at = micros(Utc::now());
        let horizon = self.retention.horizon(committed_at);
        let mut tables = self.tables.clone();

        let transaction = self.connection.transaction().context("transaction")?;
        write(&transaction, &mut tables, "", projection, committed_at)?;
        transaction
            .prepare_cached(APPEND_HISTORY)
            .context("prepare_cached APPEND_HISTORY")?
            .execute((
                to_i64(projection.height, "height")?,
                committed_at,
                serde_json::to_string(projection).context("serialize projection")?,
            ))
            .context("execute APPEND_HISTORY")?;
        if let Some(horizon) = horizon {
            compact(&transaction, horizon).context("compact history")?;
        }
        transaction.commit().context("commit")?;

        self.tables = tables;
        Ok(())
    }

    fn block_(&self, height: u64) -> Result<Option<BlockRows>> {
        let height_ = to_i64(height, "height")?;
        let committed: bool = self
            .connection
            .prepare_cached(HAS_HEIGHT)
            .context("prepare_cached HAS_HEIGHT")?
            .query_row((height_,), |row| row.get(0))
            .context("query HAS_HEIGHT")?;
        if !committed {
            return Ok(None);
        }

        let names = self
            .connection
            .prepare_cached(GET_TABLES)
            .context("prepare_cached GET_TABLES")?
            .query_map((), |row| row.get::<_, String>(0))
            .context("query GET_TABLES")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read GET_TABLES")?;

        let mut block = BlockRows {
            height,
            tables: Default::default(),
        };
        for name in names {
            let columns = table_columns(&self.connection, &name)?;
            let mapped = columns[sql::FIXED_COLUMNS.len().min(columns.len())..]
                .iter()
                .map(|(name, ty)| (name.clone(), ty.unwrap_or(ColumnType::Text)))
                .collect::<Vec<_>>();
            let sql = sql::select_block(DIALECT, &name, &mapped);
            let mut statement = self
                .connection
                .prepare_cached(&sql)
                .with_context(|| format!("prepare_cached {sql}"))?;
            let mut rows = statement.query((height_,)).context("query select_block")?;
            let mut table = Vec::new();
            while let Some(row) = rows.next().context("next row")? {
                let mut data = RowData::new();
                for (i, (column, ty)) in columns.iter().enumerate() {
                    data.insert(column.clone(), read_cell(row.get_ref(i)?, *ty)?);
                }
                table.push(data);
            }
            if !table.is_empty() {
                block.tables.insert(name, table);
            }
        }
        Ok(Some(block))
    }

    fn restore_(&mut self, at: DateTime<Utc>, label: &str) -> Result<()> {
        let label = label_name(label)?;
        let at_ = micros(at);

        let transaction = self.connection.transaction().context("transaction")?;
        if let Some(horizon) = horizon(&transaction)? {
            anyhow::ensure!(
                at_ >= horizon,
                "history before {} has been compacted",
                DateTime::<Utc>::from_timestamp_micros(horizon).unwrap_or_default()
            );
        }
        let history = transaction
            .prepare_cached(GET_HISTORY)
            .context("prepare_cached GET_HISTORY")?
            .query_map((at_,), |row| Ok((row.get(0)?, row.get(1)?)))
            .context("query GET_HISTORY")?
            .collect::<rusqlite::Result<Vec<(i64, String)>>>()
            .context("read GET_HISTORY")?
            .into_iter()
            .map(|(committed_at, projection)| {
                let projection = serde_json::from_str::<Projection>(&projection)
                    .context("deserialize projection")?;
                Ok((committed_at, projection))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(%label, %at, entries = history.len(), "replaying history");

        let registered = transaction
            .prepare_cached(GET_TABLES)
            .context("prepare_cached GET_TABLES")?
            .query_map((), |row| row.get::<_, String>(0))
            .context("query GET_TABLES")?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .context("read GET_TABLES")?;
        let targets = restore_targets(&label, history.iter().map(|(_, projection)| projection));
        for name in targets {
            anyhow::ensure!(
                !registered.contains(&name) && !table_exists(&transaction, &name)?,
                "restore '{label}' would overwrite existing table {name}"
            );
        }

        let checkpoint = sql::table_name(&label, CHECKPOINT_TABLE);
        transaction
            .execute(&sql::create_checkpoint(DIALECT, &checkpoint), ())
            .context("create restore checkpoint")?;
        let mut tables = Tables::new();
        for (committed_at, projection) in &history {
            write(&transaction, &mut tables, &label, projection, *committed_at)?;
        }
        transaction.commit().context("commit")
    }
}

impl Database for Sqlite {
    fn checkpoint(&mut self) -> BoxFuture<'_, Result<Option<u64>>> {
        future::ready(self.checkpoint_()).boxed()
    }

    fn commit<'a>(&'a mut self, projection: &'a Projection) -> BoxFuture<'a, Result<()>> {
        future::ready(self.commit_(projection)).boxed()
    }

    fn block(&mut self, height: u64) -> BoxFuture<'_, Result<Option<BlockRows>>> {
        future::ready(self.block_(height)).boxed()
    }

    fn restore<'a>(&'a mut self, at: DateTime<Utc>, label: &'a str) -> BoxFuture<'a, Result<()>> {
        future::ready(self.restore_(at, label)).boxed()
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(SqlValue::Null),
            Cell::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Cell::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
            Cell::Text(v) => ToSqlOutput::Borrowed(SqlValueRef::Text(v.as_bytes())),
            Cell::Bytes(v) => ToSqlOutput::Borrowed(SqlValueRef::Blob(v)),
        })
    }
}

/// Writes the rows of a projection and its checkpoint into the destination
/// identified by `prefix`. `tables` is updated with the tables and columns
/// ensured along the way.
fn write(
    con: &Transaction,
    tables: &mut Tables,
    prefix: &str,
    projection: &Projection,
    committed_at: i64,
) -> Result<()> {
    let height = to_i64(projection.height, "height")?;
    for TableRows { schema, rows } in &projection.tables {
        let name = sql::table_name(prefix, &schema.name);
        ensure_table(con, tables, &name, schema)
            .with_context(|| format!("ensure table {name}"))?;
        if prefix.is_empty() {
            con.prepare_cached(REGISTER_TABLE)
                .context("prepare_cached REGISTER_TABLE")?
                .execute((&name,))
                .context("execute REGISTER_TABLE")?;
        }

        let sql = sql::upsert(DIALECT, &name, schema);
        let mut statement = con
            .prepare_cached(&sql)
            .with_context(|| format!("prepare_cached {sql}"))?;
        for row in rows {
            anyhow::ensure!(
                row.cells.len() == schema.columns.len(),
                "row has {} cells but table {name} has {} columns",
                row.cells.len(),
                schema.columns.len()
            );
            let height = to_i64(row.height, "height")?;
            let transaction_index = to_i64(row.transaction_index, "transaction index")?;
            let log_index = to_i64(row.log_index, "log index")?;
            let fixed: [&dyn ToSql; 5] = [
                &height,
                &transaction_index,
                &log_index,
                &row.event_type,
                &row.event_name,
            ];
            let params = rusqlite::params_from_iter(
                fixed
                    .into_iter()
                    .chain(row.cells.iter().map(|cell| cell as &dyn ToSql)),
            );
            statement
                .execute(params)
                .with_context(|| format!("upsert into {name}"))?;
        }
    }

    let checkpoint = sql::table_name(prefix, CHECKPOINT_TABLE);
    let sql = SET_CHECKPOINT.replacen(CHECKPOINT_TABLE, &checkpoint, 1);
    con.prepare_cached(&sql)
        .context("prepare_cached SET_CHECKPOINT")?
        .execute((height, committed_at))
        .context("execute SET_CHECKPOINT")?;
    Ok(())
}

/// Creates the table if needed and adds mapped columns it is missing.
fn ensure_table(
    con: &Transaction,
    tables: &mut Tables,
    name: &str,
    schema: &TableSchema,
) -> Result<()> {
    if !tables.contains_key(name) {
        let sql = sql::create_table(DIALECT, name, schema);
        tracing::debug!("creating table:\n{}", sql);
        con.execute(&sql, ()).context("execute create_table")?;
        let key = primary_key(con, name)?;
        anyhow::ensure!(
            key == sql::primary_key(schema),
            "table {name} has primary key ({}) but is mapped with key ({})",
            key.join(", "),
            sql::primary_key(schema).join(", ")
        );
        let columns = table_columns(con, name)?
            .into_iter()
            .map(|(column, _)| column)
            .collect();
        tables.insert(name.to_owned(), columns);
    }

    let known = tables
        .get_mut(name)
        .ok_or_else(|| anyhow!("table {name} not ensured"))?;
    for column in &schema.columns {
        if known.contains(&column.name) {
            continue;
        }
        let sql = sql::add_column(DIALECT, name, column);
        tracing::debug!("adding column:\n{}", sql);
        con.execute(&sql, ()).context("execute add_column")?;
        known.insert(column.name.clone());
    }
    Ok(())
}

/// The primary key columns of a table in key order.
fn primary_key(con: &Connection, name: &str) -> Result<Vec<String>> {
    let mut statement = con
        .prepare(&format!("PRAGMA table_info({});", sql::quote(name)))
        .context("prepare table_info")?;
    let mut key = statement
        .query_map((), |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))
        .context("query table_info")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read table_info")?;
    // `pk` is the 1-based position in the key, 0 for other columns.
    key.retain(|(position, _)| *position > 0);
    key.sort();
    Ok(key.into_iter().map(|(_, column)| column).collect())
}

/// The columns of a table in order with the type of mapped columns. Fixed
/// columns have no mapped type.
fn table_columns(con: &Connection, name: &str) -> Result<Vec<(String, Option<ColumnType>)>> {
    let mut statement = con
        .prepare(&format!("PRAGMA table_info({});", sql::quote(name)))
        .context("prepare table_info")?;
    let columns = statement
        .query_map((), |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .context("query table_info")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read table_info")?;
    Ok(columns
        .into_iter()
        .map(|(column, declared)| {
            let ty = if sql::FIXED_COLUMNS.contains(&column.as_str()) {
                None
            } else {
                Some(match declared.as_str() {
                    "INTEGER" => ColumnType::Int,
                    "INT" => ColumnType::Bool,
                    "BLOB" => ColumnType::Bytes,
                    _ => ColumnType::Text,
                })
            };
            (column, ty)
        })
        .collect())
}

fn read_cell(value: SqlValueRef, ty: Option<ColumnType>) -> Result<Cell> {
    Ok(match value {
        SqlValueRef::Null => Cell::Null,
        SqlValueRef::Integer(v) if ty == Some(ColumnType::Bool) => Cell::Bool(v != 0),
        SqlValueRef::Integer(v) => Cell::Int(v),
        SqlValueRef::Text(v) => Cell::Text(String::from_utf8(v.to_vec()).context("text column")?),
        SqlValueRef::Blob(v) => Cell::Bytes(v.to_vec()),
        SqlValueRef::Real(_) => anyhow::bail!("unexpected real value"),
    })
}

fn table_exists(con: &Connection, name: &str) -> Result<bool> {
    con.prepare_cached(TABLE_EXISTS)
        .context("prepare_cached TABLE_EXISTS")?
        .query_row((name,), |row| row.get(0))
        .context("query TABLE_EXISTS")
}

fn horizon(con: &Connection) -> Result<Option<i64>> {
    con.prepare_cached(GET_HORIZON)
        .context("prepare_cached GET_HORIZON")?
        .query_row((HORIZON_KEY,), |row| row.get(0))
        .optional()
        .context("query GET_HORIZON")
}

/// Folds history committed before `horizon` into a single entry.
fn compact(con: &Transaction, horizon: i64) -> Result<()> {
    let expired = con
        .prepare_cached(GET_EXPIRED_HISTORY)
        .context("prepare_cached GET_EXPIRED_HISTORY")?
        .query_map((horizon,), |row| Ok((row.get(0)?, row.get(1)?)))
        .context("query GET_EXPIRED_HISTORY")?
        .collect::<rusqlite::Result<Vec<(i64, String)>>>()
        .context("read GET_EXPIRED_HISTORY")?;
    let Some(&(last, _)) = expired.last() else {
        return Ok(());
    };
    if expired.len() < 2 {
        return Ok(());
    }

    let folded = fold(
        expired
            .into_iter()
            .map(|(_, projection)| serde_json::from_str(&projection))
            .collect::<serde_json::Result<Vec<Projection>>>()
            .context("deserialize projection")?,
    );
    con.prepare_cached(DELETE_HISTORY)
        .context("prepare_cached DELETE_HISTORY")?
        .execute((last,))
        .context("execute DELETE_HISTORY")?;
    con.prepare_cached(APPEND_HISTORY)
        .context("prepare_cached APPEND_HISTORY")?
        .execute((
            to_i64(folded.height, "height")?,
            last,
            serde_json::to_string(&folded).context("serialize projection")?,
        ))
        .context("execute APPEND_HISTORY")?;
    con.prepare_cached(SET_HORIZON)
        .context("prepare_cached SET_HORIZON")?
        .execute((HORIZON_KEY, last))
        .context("execute SET_HORIZON")?;
    tracing::debug!(horizon = last, "compacted history");
    Ok(())
}
