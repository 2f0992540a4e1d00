use {
    super::{
        fold, label_name, micros, restore_targets,
        sql::{self, Dialect, CHECKPOINT_TABLE, HORIZON_KEY},
        to_i64, BlockRows, Cell, ColumnType, Database, Projection, Retention, RowData, TableRows,
        TableSchema,
    },
    anyhow::{anyhow, Context, Result},
    bytes::BytesMut,
    chrono::{DateTime, Utc},
    futures::{future::BoxFuture, FutureExt},
    std::{
        collections::{HashMap, HashSet},
        error::Error,
    },
    tokio_postgres::{
        types::{to_sql_checked, IsNull, ToSql, Type},
        Transaction,
    },
};

const DIALECT: Dialect = Dialect::Postgres;

const GET_CHECKPOINT: &str = "SELECT MAX(height) FROM _eventsql_checkpoint;";
const HAS_HEIGHT: &str = "SELECT COUNT(*) > 0 FROM _eventsql_checkpoint WHERE height = $1;";
const SET_CHECKPOINT: &str = "INSERT INTO _eventsql_checkpoint (height, committed_at) VALUES($1, \
                              $2) ON CONFLICT(height) DO UPDATE SET committed_at = \
                              excluded.committed_at;";
const GET_TABLES: &str = "SELECT name FROM _eventsql_tables ORDER BY name;";
const REGISTER_TABLE: &str =
    "INSERT INTO _eventsql_tables (name) VALUES($1) ON CONFLICT(name) DO NOTHING;";
const APPEND_HISTORY: &str =
    "INSERT INTO _eventsql_history (height, committed_at, projection) VALUES($1, $2, $3);";
const GET_HISTORY: &str = "SELECT committed_at, projection FROM _eventsql_history WHERE \
                           committed_at <= $1 ORDER BY committed_at, id;";
const GET_EXPIRED_HISTORY: &str = "SELECT committed_at, projection FROM _eventsql_history WHERE \
                                   committed_at < $1 ORDER BY committed_at, id;";
const DELETE_HISTORY: &str = "DELETE FROM _eventsql_history WHERE committed_at <= $1;";
const GET_HORIZON: &str = "SELECT value FROM _eventsql_meta WHERE key = $1;";
const SET_HORIZON: &str = "INSERT INTO _eventsql_meta (key, value) VALUES($1, $2) ON \
                           CONFLICT(key) DO UPDATE SET value = excluded.value;";
const TABLE_EXISTS: &str = "SELECT COUNT(*) > 0 FROM information_schema.tables WHERE \
                            table_schema = current_schema() AND table_name::text = $1;";
const TABLE_PRIMARY_KEY: &str = "SELECT kcu.column_name::text FROM \
                                 information_schema.table_constraints tc JOIN \
                                 information_schema.key_column_usage kcu ON \
                                 kcu.constraint_name = tc.constraint_name AND kcu.table_schema \
                                 = tc.table_schema AND kcu.table_name = tc.table_name WHERE \
                                 tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = \
                                 current_schema() AND tc.table_name::text = $1 ORDER BY \
                                 kcu.ordinal_position;";
const TABLE_COLUMNS: &str = "SELECT column_name::text, data_type::text FROM \
                             information_schema.columns WHERE table_schema = current_schema() \
                             AND table_name::text = $1 ORDER BY ordinal_position;";

pub struct Postgres {
    client: tokio_postgres::Client,
    retention: Retention,
    /// Invariant: tables in the map exist in the database with at least
    /// these columns.
    ///
    /// Only updated once the transaction that created the tables commits.
    tables: Tables,
}

/// Known columns by table name.
type Tables = HashMap<String, HashSet<String>>;

impl Postgres {
    pub async fn connect(params: &str) -> Result<Self> {
        tracing::debug!("opening postgres database");
        let (client, connection) = tokio_postgres::connect(params, tokio_postgres::NoTls)
            .await
            .context("connect client")?;

        // The connection object performs the actual communication with the database,
        // so spawn it off to run on its own.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(?err, "postgres connection error");
            }
        });

        for statement in sql::create_internal(DIALECT) {
            client
                .execute(&statement, &[])
                .await
                .with_context(|| format!("execute {statement}"))?;
        }

        for statement in [GET_CHECKPOINT, SET_CHECKPOINT, APPEND_HISTORY] {
            client
                .prepare(statement)
                .await
                .with_context(|| format!("prepare {statement}"))?;
        }

        Ok(Self {
            client,
            retention: Retention::default(),
            tables: Default::default(),
        })
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    async fn commit_(&mut self, projection: &Projection) -> Result<()> {
        let committed_at = micros(Utc::now());
        let horizon = self.retention.horizon(committed_at);
        let mut tables = self.tables.clone();

        let transaction = self.client.transaction().await.context("transaction")?;
        write(&transaction, &mut tables, "", projection, committed_at).await?;
        let height = to_i64(projection.height, "height")?;
        let serialized = serde_json::to_string(projection).context("serialize projection")?;
        transaction
            .execute(APPEND_HISTORY, &[&height, &committed_at, &serialized])
            .await
            .context("execute APPEND_HISTORY")?;
        if let Some(horizon) = horizon {
            compact(&transaction, horizon)
                .await
                .context("compact history")?;
        }
        transaction.commit().await.context("commit")?;

        self.tables = tables;
        Ok(())
    }

    async fn block_(&mut self, height: u64) -> Result<Option<BlockRows>> {
        let height_ = to_i64(height, "height")?;
        let transaction = self.client.transaction().await.context("transaction")?;
        let committed: bool = transaction
            .query_one(HAS_HEIGHT, &[&height_])
            .await
            .context("query HAS_HEIGHT")?
            .try_get(0)?;
        if !committed {
            return Ok(None);
        }

        let names = transaction
            .query(GET_TABLES, &[])
            .await
            .context("query GET_TABLES")?
            .into_iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()?;

        let mut block = BlockRows {
            height,
            tables: Default::default(),
        };
        for name in names {
            let columns = table_columns(&transaction, &name).await?;
            let mapped = columns[sql::FIXED_COLUMNS.len().min(columns.len())..]
                .iter()
                .map(|(name, ty)| (name.clone(), ty.unwrap_or(ColumnType::Text)))
                .collect::<Vec<_>>();
            let sql = sql::select_block(DIALECT, &name, &mapped);
            let rows = transaction
                .query(&sql, &[&height_])
                .await
                .with_context(|| format!("query {sql}"))?;
            let mut table = Vec::new();
            for row in rows {
                let mut data = RowData::new();
                for (i, (column, ty)) in columns.iter().enumerate() {
                    data.insert(column.clone(), read_cell(&row, i, *ty)?);
                }
                table.push(data);
            }
            if !table.is_empty() {
                block.tables.insert(name, table);
            }
        }
        transaction.commit().await.context("commit")?;
        Ok(Some(block))
    }

    async fn restore_(&mut self, at: DateTime<Utc>, label: &str) -> Result<()> {
        let label = label_name(label)?;
        let at_ = micros(at);

        let transaction = self.client.transaction().await.context("transaction")?;
        let horizon: Option<i64> = transaction
            .query_opt(GET_HORIZON, &[&HORIZON_KEY])
            .await
            .context("query GET_HORIZON")?
            .map(|row| row.try_get(0))
            .transpose()?;
        if let Some(horizon) = horizon {
            anyhow::ensure!(
                at_ >= horizon,
                "history before {} has been compacted",
                DateTime::<Utc>::from_timestamp_micros(horizon).unwrap_or_default()
            );
        }
        let history = transaction
            .query(GET_HISTORY, &[&at_])
            .await
            .context("query GET_HISTORY")?
            .into_iter()
            .map(|row| {
                let committed_at: i64 = row.try_get(0)?;
                let projection: Projection =
                    serde_json::from_str(row.try_get(1)?).context("deserialize projection")?;
                Ok((committed_at, projection))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(%label, %at, entries = history.len(), "replaying history");

        let registered = transaction
            .query(GET_TABLES, &[])
            .await
            .context("query GET_TABLES")?
            .into_iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<HashSet<_>, _>>()?;
        let targets = restore_targets(&label, history.iter().map(|(_, projection)| projection));
        for name in targets {
            let exists: bool = transaction
                .query_one(TABLE_EXISTS, &[&name])
                .await
                .context("query TABLE_EXISTS")?
                .try_get(0)?;
            anyhow::ensure!(
                !registered.contains(&name) && !exists,
                "restore '{label}' would overwrite existing table {name}"
            );
        }

        let checkpoint = sql::table_name(&label, CHECKPOINT_TABLE);
        transaction
            .execute(&sql::create_checkpoint(DIALECT, &checkpoint), &[])
            .await
            .context("create restore checkpoint")?;
        let mut tables = Tables::new();
        for (committed_at, projection) in &history {
            write(&transaction, &mut tables, &label, projection, *committed_at).await?;
        }
        transaction.commit().await.context("commit")
    }
}

impl Database for Postgres {
    fn checkpoint(&mut self) -> BoxFuture<'_, Result<Option<u64>>> {
        async move {
            let height: Option<i64> = self
                .client
                .query_one(GET_CHECKPOINT, &[])
                .await
                .context("query GET_CHECKPOINT")?
                .try_get(0)?;
            height
                .map(|height| height.try_into().context("checkpoint out of bounds"))
                .transpose()
        }
        .boxed()
    }

    fn commit<'a>(&'a mut self, projection: &'a Projection) -> BoxFuture<'a, Result<()>> {
        self.commit_(projection).boxed()
    }

    fn block(&mut self, height: u64) -> BoxFuture<'_, Result<Option<BlockRows>>> {
        self.block_(height).boxed()
    }

    fn restore<'a>(&'a mut self, at: DateTime<Utc>, label: &'a str) -> BoxFuture<'a, Result<()>> {
        self.restore_(at, label).boxed()
    }
}

impl ToSql for Cell {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Cell::Null => Ok(IsNull::Yes),
            Cell::Int(v) => v.to_sql_checked(ty, out),
            Cell::Bool(v) => v.to_sql_checked(ty, out),
            Cell::Text(v) => v.to_sql_checked(ty, out),
            Cell::Bytes(v) => v.to_sql_checked(ty, out),
        }
    }

    // Mismatches are reported by the inner value's type check.
    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Writes the rows of a projection and its checkpoint into the destination
/// identified by `prefix`. `tables` is updated with the tables and columns
/// ensured along the way.
async fn write(
    transaction: &Transaction<'_>,
    tables: &mut Tables,
    prefix: &str,
    projection: &Projection,
    committed_at: i64,
) -> Result<()> {
    let height = to_i64(projection.height, "height")?;
    for TableRows { schema, rows } in &projection.tables {
        let name = sql::table_name(prefix, &schema.name);
        ensure_table(transaction, tables, &name, schema)
            .await
            .with_context(|| format!("ensure table {name}"))?;
        if prefix.is_empty() {
            transaction
                .execute(REGISTER_TABLE, &[&name])
                .await
                .context("execute REGISTER_TABLE")?;
        }

        let sql = sql::upsert(DIALECT, &name, schema);
        let statement = transaction
            .prepare(&sql)
            .await
            .with_context(|| format!("prepare {sql}"))?;
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
            let params: Vec<&(dyn ToSql + Sync)> = [
                &height as &(dyn ToSql + Sync),
                &transaction_index,
                &log_index,
                &row.event_type,
                &row.event_name,
            ]
            .into_iter()
            .chain(row.cells.iter().map(|cell| cell as &(dyn ToSql + Sync)))
            .collect();
            transaction
                .execute(&statement, &params)
                .await
                .with_context(|| format!("upsert into {name}"))?;
        }
    }

    let checkpoint = sql::table_name(prefix, CHECKPOINT_TABLE);
    let sql = SET_CHECKPOINT.replacen(CHECKPOINT_TABLE, &checkpoint, 1);
    transaction
        .execute(&sql, &[&height, &committed_at])
        .await
        .context("execute SET_CHECKPOINT")?;
    Ok(())
}

/// Creates the table if needed and adds mapped columns it is missing.
async fn ensure_table(
    transaction: &Transaction<'_>,
    tables: &mut Tables,
    name: &str,
    schema: &TableSchema,
) -> Result<()> {
    if !tables.contains_key(name) {
        let sql = sql::create_table(DIALECT, name, schema);
        tracing::debug!("creating table:\n{}", sql);
        transaction
            .execute(&sql, &[])
            .await
            .context("execute create_table")?;
        let key = transaction
            .query(TABLE_PRIMARY_KEY, &[&name])
            .await
            .context("query TABLE_PRIMARY_KEY")?
            .into_iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()?;
        anyhow::ensure!(
            key == sql::primary_key(schema),
            "table {name} has primary key ({}) but is mapped with key ({})",
            key.join(", "),
            sql::primary_key(schema).join(", ")
        );
        let columns = table_columns(transaction, name)
            .await?
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
        transaction
            .execute(&sql, &[])
            .await
            .context("execute add_column")?;
        known.insert(column.name.clone());
    }
    Ok(())
}

/// The columns of a table in order with the type of mapped columns. Fixed
/// columns have no mapped type.
async fn table_columns(
    transaction: &Transaction<'_>,
    name: &str,
) -> Result<Vec<(String, Option<ColumnType>)>> {
    let rows = transaction
        .query(TABLE_COLUMNS, &[&name])
        .await
        .context("query TABLE_COLUMNS")?;
    rows.into_iter()
        .map(|row| -> Result<_> {
            let column: String = row.try_get(0)?;
            let data_type: String = row.try_get(1)?;
            let ty = if sql::FIXED_COLUMNS.contains(&column.as_str()) {
                None
            } else {
                Some(match data_type.as_str() {
                    "bigint" => ColumnType::Int,
                    "boolean" => ColumnType::Bool,
                    "numeric" => ColumnType::Numeric,
                    "bytea" => ColumnType::Bytes,
                    _ => ColumnType::Text,
                })
            };
            Ok((column, ty))
        })
        .collect()
}

fn read_cell(row: &tokio_postgres::Row, index: usize, ty: Option<ColumnType>) -> Result<Cell> {
    let cell = match ty {
        None if index < 3 => row.try_get::<_, Option<i64>>(index)?.map(Cell::Int),
        None => row.try_get::<_, Option<String>>(index)?.map(Cell::Text),
        Some(ColumnType::Int) => row.try_get::<_, Option<i64>>(index)?.map(Cell::Int),
        Some(ColumnType::Bool) => row.try_get::<_, Option<bool>>(index)?.map(Cell::Bool),
        Some(ColumnType::Numeric | ColumnType::Text) => {
            row.try_get::<_, Option<String>>(index)?.map(Cell::Text)
        }
        Some(ColumnType::Bytes) => row.try_get::<_, Option<Vec<u8>>>(index)?.map(Cell::Bytes),
    };
    Ok(cell.unwrap_or(Cell::Null))
}

/// Folds history committed before `horizon` into a single entry.
async fn compact(transaction: &Transaction<'_>, horizon: i64) -> Result<()> {
    let expired = transaction
        .query(GET_EXPIRED_HISTORY, &[&horizon])
        .await
        .context("query GET_EXPIRED_HISTORY")?;
    if expired.len() < 2 {
        return Ok(());
    }

    let mut last = 0_i64;
    let mut projections = Vec::with_capacity(expired.len());
    for row in expired {
        last = row.try_get(0)?;
        let projection: Projection =
            serde_json::from_str(row.try_get(1)?).context("deserialize projection")?;
        projections.push(projection);
    }
    let folded = fold(projections);
    let height = to_i64(folded.height, "height")?;
    let serialized = serde_json::to_string(&folded).context("serialize projection")?;

    transaction
        .execute(DELETE_HISTORY, &[&last])
        .await
        .context("execute DELETE_HISTORY")?;
    transaction
        .execute(APPEND_HISTORY, &[&height, &last, &serialized])
        .await
        .context("execute APPEND_HISTORY")?;
    transaction
        .execute(SET_HORIZON, &[&HORIZON_KEY, &last])
        .await
        .context("execute SET_HORIZON")?;
    tracing::debug!(horizon = last, "compacted history");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{projection, row, schema};

    // Tests require a local PostgreSQL server reachable as the current user.
    async fn connect() -> Postgres {
        let params = format!("postgresql://{}@localhost", whoami::username());
        let mut postgres = Postgres::connect(&params).await.unwrap();
        clear(&mut postgres).await;
        postgres
    }

    async fn clear(postgres: &mut Postgres) {
        let tables = postgres
            .client
            .query(
                "SELECT table_name::text FROM information_schema.tables WHERE table_schema = \
                 current_schema() AND table_name NOT LIKE '\\_eventsql\\_%';",
                &[],
            )
            .await
            .unwrap();
        for table in tables {
            let name: String = table.get(0);
            postgres
                .client
                .execute(&format!("DROP TABLE {};", sql::quote(&name)), &[])
                .await
                .unwrap();
        }
        for table in [
            CHECKPOINT_TABLE,
            sql::HISTORY_TABLE,
            sql::TABLES_TABLE,
            sql::META_TABLE,
        ] {
            postgres
                .client
                .execute(&format!("DELETE FROM {table};"), &[])
                .await
                .unwrap();
        }
    }

    fn alltypes(height: u64) -> Projection {
        projection(
            height,
            vec![(
                schema(
                    "alltypes",
                    &[
                        ("i", ColumnType::Int),
                        ("n", ColumnType::Numeric),
                        ("b", ColumnType::Bool),
                        ("t", ColumnType::Text),
                        ("r", ColumnType::Bytes),
                    ],
                ),
                vec![row(
                    height,
                    0,
                    vec![
                        Cell::Int(-1),
                        Cell::Text("340282366920938463463374607431768211456".to_owned()),
                        Cell::Bool(true),
                        Cell::Text("hello".to_owned()),
                        Cell::Null,
                    ],
                )],
            )],
        )
    }

    #[ignore]
    #[tokio::test]
    async fn commit_and_read_block() {
        let mut postgres = connect().await;
        postgres.commit(&alltypes(2)).await.unwrap();
        postgres.commit(&alltypes(2)).await.unwrap();
        assert_eq!(postgres.checkpoint().await.unwrap(), Some(2));

        let block = postgres.block(2).await.unwrap().unwrap();
        let rows = &block.tables["alltypes"];
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0]["n"],
            Cell::Text("340282366920938463463374607431768211456".to_owned())
        );
        assert_eq!(rows[0]["b"], Cell::Bool(true));
        assert_eq!(rows[0]["r"], Cell::Null);
        assert_eq!(postgres.block(3).await.unwrap(), None);
    }

    #[ignore]
    #[tokio::test]
    async fn failed_commit_is_atomic() {
        let mut postgres = connect().await;
        postgres.commit(&alltypes(2)).await.unwrap();

        let mut bad = alltypes(3);
        bad.tables[0].rows[0].cells[0] = Cell::Text("not a number".to_owned());
        assert!(postgres.commit(&bad).await.is_err());
        assert_eq!(postgres.checkpoint().await.unwrap(), Some(2));
        assert_eq!(postgres.block(3).await.unwrap(), None);
    }

    #[ignore]
    #[tokio::test]
    async fn rejects_existing_table_with_other_key() {
        let mut postgres = connect().await;
        let unkeyed = alltypes(2);
        postgres
            .client
            .execute(
                &sql::create_table(DIALECT, "alltypes", &unkeyed.tables[0].schema),
                &[],
            )
            .await
            .unwrap();

        let mut keyed = alltypes(2);
        keyed.tables[0].schema.key = vec!["t".to_owned()];
        let err = postgres.commit(&keyed).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("alltypes"), "{message}");
        assert!(message.contains("primary key"), "{message}");
        assert_eq!(postgres.checkpoint().await.unwrap(), None);

        postgres.commit(&unkeyed).await.unwrap();
        assert_eq!(postgres.checkpoint().await.unwrap(), Some(2));
    }

    #[ignore]
    #[tokio::test]
    async fn restore() {
        let mut postgres = connect().await;
        postgres.commit(&alltypes(2)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let between = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        postgres.commit(&alltypes(3)).await.unwrap();

        postgres.restore(between, "Between").await.unwrap();
        let count: i64 = postgres
            .client
            .query_one("SELECT COUNT(*) FROM between__alltypes;", &[])
            .await
            .unwrap()
            .get(0);
        assert_eq!(count, 1);
        assert!(postgres.restore(between, "between").await.is_err());
        assert_eq!(postgres.checkpoint().await.unwrap(), Some(3));

        postgres
            .client
            .execute("CREATE TABLE other__alltypes (x BIGINT);", &[])
            .await
            .unwrap();
        let err = postgres.restore(between, "other").await.unwrap_err();
        assert!(err.to_string().contains("other__alltypes"), "{err}");
    }
}
