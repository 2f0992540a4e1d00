//! Routing of decoded events into table rows.

use crate::{
    abi::Abi,
    database::{Cell, ColumnType, Projection, Row, TableRows, TableSchema, BLOCK_EVENT, LOG_EVENT},
    decoder::{self, DecodeError, Value},
    source::Block,
    spec::{Spec, TableSpec},
};
use solabi::ethprim::{I256, U256};

/// `_eventname` of the blocks bookkeeping rows.
const BLOCK_EVENT_NAME: &str = "Block";

/// Builds the projection of a block.
///
/// Logs that fail to decode or to convert to their columns are dropped with a
/// log message. Tables without rows are left out of the projection.
pub fn project(spec: &Spec, abi: &Abi, block: &Block) -> Projection {
    let mut rows = vec![Vec::new(); spec.tables().len()];
    for log in &block.logs {
        let fields = match decoder::decode(log, abi) {
            Ok(fields) => fields,
            Err(err @ DecodeError::UnknownSignature(_)) => {
                tracing::debug!(%err, height = block.height, log = log.log_index, "skipping log");
                continue;
            }
            Err(err) => {
                tracing::warn!(?err, height = block.height, log = log.log_index, "dropping log");
                continue;
            }
        };

        let Some(signature) = log.signature() else {
            continue;
        };
        for (index, table) in spec.routes(signature) {
            if !table.contract.matches(&log.address) {
                continue;
            }
            match cells(table, &fields) {
                Ok(cells) => rows[index].push(Row {
                    height: block.height,
                    transaction_index: log.transaction_index,
                    log_index: log.log_index,
                    event_type: LOG_EVENT.to_owned(),
                    event_name: table.event.clone(),
                    cells,
                }),
                Err(err) => tracing::warn!(
                    %err,
                    table = %table.schema.name,
                    height = block.height,
                    log = log.log_index,
                    "dropping row"
                ),
            }
        }
    }

    let mut tables = spec
        .tables()
        .iter()
        .zip(rows)
        .filter(|(_, rows)| !rows.is_empty())
        .map(|(table, rows)| TableRows {
            schema: table.schema.clone(),
            rows,
        })
        .collect::<Vec<_>>();
    if spec.blocks() {
        tables.push(TableRows {
            schema: TableSchema::blocks(),
            rows: vec![Row {
                height: block.height,
                transaction_index: 0,
                log_index: 0,
                event_type: BLOCK_EVENT.to_owned(),
                event_name: BLOCK_EVENT_NAME.to_owned(),
                cells: vec![i64::try_from(block.timestamp).map_or(Cell::Null, Cell::Int)],
            }],
        });
    }

    Projection {
        height: block.height,
        timestamp: block.timestamp,
        tables,
    }
}

fn cells(table: &TableSpec, fields: &decoder::Fields) -> Result<Vec<Cell>, String> {
    table
        .fields
        .iter()
        .zip(&table.schema.columns)
        .map(|(field, column)| match fields.get(field) {
            Some(value) => cell(value, column.ty)
                .ok_or_else(|| format!("field {field} doesn't fit column type {:?}", column.ty)),
            None => Ok(Cell::Null),
        })
        .collect()
}

/// Converts a decoded value to a column value. `None` if the value doesn't
/// fit the column type.
pub fn cell(value: &Value, ty: ColumnType) -> Option<Cell> {
    let cell = match (ty, value) {
        (ColumnType::Int, Value::Int(v)) => Cell::Int(to_i64(v.to_be_bytes(), true)?),
        (ColumnType::Int, Value::Uint(v)) => Cell::Int(to_i64(v.to_be_bytes(), false)?),
        (ColumnType::Int, Value::Bool(v)) => Cell::Int(i64::from(*v)),

        (ColumnType::Numeric, Value::Int(v)) => Cell::Text(v.to_string()),
        (ColumnType::Numeric, Value::Uint(v)) => Cell::Text(v.to_string()),

        (ColumnType::Bool, Value::Bool(v)) => Cell::Bool(*v),
        (ColumnType::Bool, Value::Int(v)) => Cell::Bool(*v != I256::ZERO),
        (ColumnType::Bool, Value::Uint(v)) => Cell::Bool(*v != U256::ZERO),

        (ColumnType::Text, Value::String(v)) => Cell::Text(v.clone()),
        (ColumnType::Text, Value::Address(v)) => Cell::Text(decoder::to_hex(&v.0)),
        (ColumnType::Text, Value::Int(v)) => Cell::Text(v.to_string()),
        (ColumnType::Text, Value::Uint(v)) => Cell::Text(v.to_string()),
        (ColumnType::Text, Value::Bool(v)) => Cell::Text(v.to_string()),
        (ColumnType::Text, Value::Bytes(v)) => {
            let len = v.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
            Cell::Text(decoder::utf8_or_hex(&v[..len]))
        }

        (ColumnType::Bytes, Value::Bytes(v)) => Cell::Bytes(v.clone()),
        (ColumnType::Bytes, Value::String(v)) => Cell::Bytes(v.as_bytes().to_vec()),
        (ColumnType::Bytes, Value::Address(v)) => Cell::Bytes(v.0.to_vec()),
        (ColumnType::Bytes, Value::Int(v)) => Cell::Bytes(v.to_be_bytes().to_vec()),
        (ColumnType::Bytes, Value::Uint(v)) => Cell::Bytes(v.to_be_bytes().to_vec()),

        _ => return None,
    };
    Some(cell)
}

/// Converts a big endian 256-bit integer to an `i64` if it is in range.
fn to_i64(bytes: [u8; 32], signed: bool) -> Option<i64> {
    let (high, low) = bytes.split_at(24);
    let value = i64::from_be_bytes(low.try_into().ok()?);
    let fill = if value < 0 { 0xff } else { 0 };
    (high.iter().all(|b| *b == fill) && (signed || value >= 0)).then_some(value)
}
