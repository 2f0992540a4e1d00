//! Mapping spec loading and validation.
//!
//! A mapping spec declares, per event, the destination table and which event
//! fields are stored in which columns. It is validated against the ABI once
//! at startup so that routing never has to deal with unknown fields.

use crate::{
    abi::Abi,
    database::{self, Column, ColumnType, TableSchema},
};
use serde::Deserialize;
use solabi::{
    abi::EventField,
    ethprim::{Address, Digest},
    value::ValueKind,
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("failed to read mapping spec {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed mapping spec")]
    Toml(#[from] toml::de::Error),
    #[error("malformed mapping spec")]
    Json(#[from] serde_json::Error),
    #[error("table #{0} has an empty name")]
    EmptyTableName(usize),
    #[error("invalid table or column name '{0}'")]
    InvalidName(String),
    #[error("duplicate table '{0}'")]
    DuplicateTable(String),
    #[error("table '{table}' maps unknown event '{event}'")]
    UnknownEvent { table: String, event: String },
    #[error("table '{table}' maps ambiguous event '{event}', use its full signature")]
    AmbiguousEvent { table: String, event: String },
    #[error("table '{table}' has duplicate column '{column}'")]
    DuplicateColumn { table: String, column: String },
    #[error("table '{table}' maps unknown field '{field}' of event {event}")]
    UnknownField {
        table: String,
        event: String,
        field: String,
    },
    #[error("table '{table}' can't store field '{field}' of type {kind} as {ty:?}")]
    IncompatibleType {
        table: String,
        field: String,
        kind: String,
        ty: ColumnType,
    },
    #[error("table '{table}' key column '{column}' is not mapped")]
    UnknownKeyColumn { table: String, column: String },
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Contract {
    #[default]
    #[serde(with = "contract")]
    All,
    Address(Address),
}

impl Contract {
    pub fn matches(&self, address: &Address) -> bool {
        match self {
            Contract::All => true,
            Contract::Address(contract) => contract == address,
        }
    }
}

/// A validated mapping spec.
#[derive(Debug)]
pub struct Spec {
    tables: Vec<TableSpec>,
    blocks: bool,
    /// Indices into `tables` by event signature.
    routes: HashMap<[u8; 32], Vec<usize>>,
}

/// The mapping of one event to one table.
#[derive(Debug)]
pub struct TableSpec {
    pub schema: TableSchema,
    /// Name of the mapped event.
    pub event: String,
    pub signature: Digest,
    pub contract: Contract,
    /// Event field for each column of the schema.
    pub fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Description {
    #[serde(default)]
    blocks: bool,
    #[serde(default, rename = "table")]
    tables: Vec<TableDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableDescription {
    name: String,
    event: String,
    #[serde(default)]
    contract: Contract,
    #[serde(default)]
    key: Vec<String>,
    #[serde(default, rename = "column")]
    columns: Vec<ColumnDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ColumnDescription {
    field: String,
    /// Defaults to the field name.
    name: Option<String>,
    #[serde(rename = "type")]
    ty: ColumnType,
}

impl Spec {
    /// Loads a mapping spec file. Files ending in `.json` are read as JSON,
    /// anything else as TOML. `blocks` enables the blocks bookkeeping table
    /// in addition to the file's own `blocks` flag.
    pub fn load(path: &Path, abi: &Abi, blocks: bool) -> Result<Self, SpecError> {
        let contents = fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_owned(),
            source,
        })?;
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => Self::from_json(&contents, abi, blocks),
            _ => Self::from_toml(&contents, abi, blocks),
        }
    }

    pub fn from_toml(toml: &str, abi: &Abi, blocks: bool) -> Result<Self, SpecError> {
        Self::new(toml::from_str(toml)?, abi, blocks)
    }

    pub fn from_json(json: &str, abi: &Abi, blocks: bool) -> Result<Self, SpecError> {
        Self::new(serde_json::from_str(json)?, abi, blocks)
    }

    fn new(description: Description, abi: &Abi, blocks: bool) -> Result<Self, SpecError> {
        let mut tables = Vec::with_capacity(description.tables.len());
        let mut names = HashSet::new();
        let mut routes = HashMap::<_, Vec<_>>::new();
        for (index, table) in description.tables.into_iter().enumerate() {
            let table = TableSpec::new(index, table, abi)?;
            if !names.insert(table.schema.name.clone()) {
                return Err(SpecError::DuplicateTable(table.schema.name));
            }
            routes.entry(table.signature.0).or_default().push(index);
            tables.push(table);
        }

        Ok(Self {
            tables,
            blocks: blocks || description.blocks,
            routes,
        })
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// The tables, with their index, an event with the given signature is
    /// projected into.
    pub fn routes(&self, signature: &Digest) -> impl Iterator<Item = (usize, &TableSpec)> + '_ {
        self.routes
            .get(&signature.0)
            .into_iter()
            .flatten()
            .map(|index| (*index, &self.tables[*index]))
    }

    /// Whether a row per block is recorded in the blocks bookkeeping table.
    pub fn blocks(&self) -> bool {
        self.blocks
    }
}

impl TableSpec {
    fn new(index: usize, table: TableDescription, abi: &Abi) -> Result<Self, SpecError> {
        if table.name.is_empty() {
            return Err(SpecError::EmptyTableName(index));
        }
        let name = name(&table.name)?;

        let entry = match abi.find(&table.event)[..] {
            [entry] => entry,
            [] => {
                return Err(SpecError::UnknownEvent {
                    table: name,
                    event: table.event,
                })
            }
            _ => {
                return Err(SpecError::AmbiguousEvent {
                    table: name,
                    event: table.event,
                })
            }
        };

        let mut columns = Vec::with_capacity(table.columns.len());
        let mut fields = Vec::with_capacity(table.columns.len());
        for column in table.columns {
            let column_name = self::name(column.name.as_deref().unwrap_or(&column.field))?;
            if columns.iter().any(|c: &Column| c.name == column_name) {
                return Err(SpecError::DuplicateColumn {
                    table: name,
                    column: column_name,
                });
            }
            let input = entry
                .input(&column.field)
                .ok_or_else(|| SpecError::UnknownField {
                    table: name.clone(),
                    event: entry.name().to_owned(),
                    field: column.field.clone(),
                })?;
            if !compatible(input, column.ty) {
                return Err(SpecError::IncompatibleType {
                    table: name,
                    field: column.field,
                    kind: input.field.kind.to_string(),
                    ty: column.ty,
                });
            }
            columns.push(Column {
                name: column_name,
                ty: column.ty,
            });
            fields.push(column.field);
        }

        let key = table
            .key
            .iter()
            .map(|column| {
                let column = column.to_ascii_lowercase();
                if columns.iter().any(|c| c.name == column) {
                    Ok(column)
                } else {
                    Err(SpecError::UnknownKeyColumn {
                        table: name.clone(),
                        column,
                    })
                }
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            schema: TableSchema { name, columns, key },
            event: entry.name().to_owned(),
            signature: entry.signature,
            contract: table.contract,
            fields,
        })
    }
}

fn name(name: &str) -> Result<String, SpecError> {
    database::sql_name(name).ok_or_else(|| SpecError::InvalidName(name.to_owned()))
}

/// Whether decoded values of an event input can be converted to a column
/// type.
fn compatible(input: &EventField, ty: ColumnType) -> bool {
    // Dynamic and composite indexed values decode to the hash of their
    // encoding.
    let kind = if input.indexed && !input.field.kind.is_primitive() {
        &ValueKind::Bytes
    } else {
        &input.field.kind
    };
    match (kind, ty) {
        (ValueKind::Array(_) | ValueKind::FixedArray(..) | ValueKind::Tuple(_), _) => false,
        (_, ColumnType::Text) => true,
        (ValueKind::Int(_) | ValueKind::Uint(_), _) => true,
        (ValueKind::Bool, ColumnType::Int | ColumnType::Bool) => true,
        (
            ValueKind::Address
            | ValueKind::Bytes
            | ValueKind::FixedBytes(_)
            | ValueKind::Function
            | ValueKind::String,
            ColumnType::Bytes,
        ) => true,
        _ => false,
    }
}

mod contract {
    use serde::{de, Deserialize, Deserializer};
    use std::borrow::Cow;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Cow::<str>::deserialize(deserializer)?;
        (s == "*")
            .then_some(())
            .ok_or_else(|| de::Error::custom("expected '*' string"))
    }
}
