//! ABI description loading.
//!
//! This module turns Solidity JSON ABI files into the set of event entries
//! that the decoder looks up by binary signature. Only `event` entries are
//! kept; functions, constructors and errors are ignored.

use crate::decoder::Decoder;
use serde::Deserialize;
use solabi::{
    abi::{EventDescriptor, EventField},
    ethprim::Digest,
    value::ValueKind,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("failed to read ABI file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ABI description")]
    Json(#[from] serde_json::Error),
    #[error("event '{event}' has invalid type '{ty}'")]
    InvalidType { event: String, ty: String },
    #[error("event '{0}' is anonymous, which isn't supported")]
    Anonymous(String),
    #[error("ABI contains an event without a name")]
    Unnamed,
    #[error("event '{0}' has more than 3 indexed fields")]
    TooManyIndexed(String),
}

/// One contract event: its descriptor, binary signature and decoder.
#[derive(Debug)]
pub struct AbiEntry {
    pub descriptor: EventDescriptor,
    /// Keccak-256 of the canonical declaration, emitted as the first topic.
    pub signature: Digest,
    pub decoder: Decoder,
}

impl AbiEntry {
    pub fn new(mut descriptor: EventDescriptor) -> Result<Self, AbiError> {
        if descriptor.name.is_empty() {
            return Err(AbiError::Unnamed);
        }
        let signature = descriptor
            .selector()
            .map(Digest)
            .ok_or_else(|| AbiError::Anonymous(descriptor.name.clone()))?;
        for (i, input) in descriptor.inputs.iter_mut().enumerate() {
            if input.field.name.is_empty() {
                input.field.name = format!("arg{i}");
            }
        }
        let decoder = Decoder::new(&descriptor)
            .map_err(|_| AbiError::TooManyIndexed(descriptor.name.clone()))?;
        Ok(Self {
            descriptor,
            signature,
            decoder,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The canonical declaration, for example `Transfer(address,address,uint256)`.
    pub fn canonical(&self) -> String {
        self.descriptor.canonical().to_string()
    }

    pub fn inputs(&self) -> &[EventField] {
        &self.descriptor.inputs
    }

    pub fn input(&self, name: &str) -> Option<&EventField> {
        self.inputs().iter().find(|input| input.field.name == name)
    }
}

/// The loaded set of ABI entries, keyed by signature.
#[derive(Debug, Default)]
pub struct Abi {
    entries: Vec<AbiEntry>,
    by_signature: HashMap<[u8; 32], usize>,
}

impl Abi {
    /// Loads and combines several JSON ABI files.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, AbiError> {
        let mut abi = Self::default();
        for path in paths {
            let path = path.as_ref();
            let json = fs::read_to_string(path).map_err(|source| AbiError::Io {
                path: path.to_owned(),
                source,
            })?;
            abi.extend_from_json(&json)?;
        }
        Ok(abi)
    }

    pub fn from_json(json: &str) -> Result<Self, AbiError> {
        let mut abi = Self::default();
        abi.extend_from_json(json)?;
        Ok(abi)
    }

    /// Adds the events of a JSON ABI. Both a bare ABI array and a compiler
    /// artifact with an `abi` field are accepted.
    pub fn extend_from_json(&mut self, json: &str) -> Result<(), AbiError> {
        let items = match serde_json::from_str::<JsonAbi>(json)? {
            JsonAbi::Items(items) => items,
            JsonAbi::Artifact { abi } => abi,
        };
        for item in items {
            if item.get("type").and_then(serde_json::Value::as_str) != Some("event") {
                continue;
            }
            check_types(&item)?;
            let descriptor = serde_json::from_value::<EventDescriptor>(item)?;
            self.insert(AbiEntry::new(descriptor)?);
        }
        Ok(())
    }

    /// Adds an entry. The same event declared in several files is kept once.
    pub fn insert(&mut self, entry: AbiEntry) {
        if self.by_signature.contains_key(&entry.signature.0) {
            return;
        }
        self.by_signature
            .insert(entry.signature.0, self.entries.len());
        self.entries.push(entry);
    }

    pub fn get(&self, signature: &Digest) -> Option<&AbiEntry> {
        self.by_signature
            .get(&signature.0)
            .map(|index| &self.entries[*index])
    }

    /// Finds the entries matching an event reference, which is either a bare
    /// name or a full canonical declaration like `Transfer(address,uint256)`.
    pub fn find(&self, event: &str) -> Vec<&AbiEntry> {
        if event.contains('(') {
            self.entries
                .iter()
                .filter(|entry| entry.canonical() == event)
                .collect()
        } else {
            self.entries
                .iter()
                .filter(|entry| entry.name() == event)
                .collect()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AbiEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonAbi {
    Items(Vec<serde_json::Value>),
    Artifact { abi: Vec<serde_json::Value> },
}

/// solabi reads type names it does not know as library enums (`uint8`),
/// which would silently change the event signature.
fn check_types(item: &serde_json::Value) -> Result<(), AbiError> {
    let inputs = item
        .get("inputs")
        .and_then(serde_json::Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    match inputs.iter().find(|input| !known_type(input)) {
        Some(input) => Err(AbiError::InvalidType {
            event: item
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            ty: input
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        None => Ok(()),
    }
}

fn known_type(param: &serde_json::Value) -> bool {
    let Some(ty) = param.get("type").and_then(serde_json::Value::as_str) else {
        return false;
    };
    match ty.strip_prefix("tuple") {
        // Array suffixes of a tuple are checked on a stand-in element type.
        Some(suffix) => {
            format!("bool{suffix}").parse::<ValueKind>().is_ok()
                && param
                    .get("components")
                    .and_then(serde_json::Value::as_array)
                    .is_some_and(|components| components.iter().all(known_type))
        }
        None => ty.parse::<ValueKind>().is_ok(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use solabi::ethprim::keccak;

    /// ABI of the contract used throughout the tests. Mirrors a contract with
    /// an `addEvent(bytes32 name, string description)` method.
    pub const EVENTS_TEST_ABI: &str = r#"[
        {
            "type": "function",
            "name": "addEvent",
            "inputs": [
                {"name": "name", "type": "bytes32"},
                {"name": "description", "type": "string"}
            ],
            "outputs": [],
            "stateMutability": "nonpayable"
        },
        {
            "type": "event",
            "name": "UpdateTestEvents",
            "anonymous": false,
            "inputs": [
                {"indexed": true, "name": "name", "type": "bytes32"},
                {"indexed": false, "name": "key", "type": "bytes32"},
                {"indexed": false, "name": "description", "type": "string"},
                {"indexed": false, "name": "count", "type": "uint256"}
            ]
        },
        {
            "type": "event",
            "name": "Transfer",
            "inputs": [
                {"indexed": true, "name": "from", "type": "address"},
                {"indexed": true, "name": "to", "type": "address"},
                {"indexed": false, "name": "value", "type": "uint256"}
            ]
        }
    ]"#;

    #[test]
    fn loads_events_only() {
        let abi = Abi::from_json(EVENTS_TEST_ABI).unwrap();
        assert_eq!(abi.len(), 2);
        let names = abi.iter().map(AbiEntry::name).collect::<Vec<_>>();
        assert_eq!(names, ["UpdateTestEvents", "Transfer"]);
    }

    #[test]
    fn signature_is_keccak_of_canonical_declaration() {
        let abi = Abi::from_json(EVENTS_TEST_ABI).unwrap();
        let transfer = abi.find("Transfer")[0];
        assert_eq!(transfer.canonical(), "Transfer(address,address,uint256)");
        assert_eq!(transfer.signature, keccak!("Transfer(address,address,uint256)"));
        assert_eq!(
            abi.get(&keccak!("Transfer(address,address,uint256)"))
                .unwrap()
                .name(),
            "Transfer"
        );
    }

    #[test]
    fn find_by_full_signature() {
        let abi = Abi::from_json(EVENTS_TEST_ABI).unwrap();
        assert_eq!(
            abi.find("UpdateTestEvents(bytes32,bytes32,string,uint256)")
                .len(),
            1
        );
        assert!(abi.find("UpdateTestEvents(bytes32)").is_empty());
        assert!(abi.find("Missing").is_empty());
    }

    #[test]
    fn composite_types() {
        let json = r#"{"abi": [{
            "type": "event",
            "name": "Settled",
            "inputs": [
                {"name": "", "type": "uint"},
                {"name": "pairs", "type": "tuple[2][]", "components": [
                    {"name": "a", "type": "address"},
                    {"name": "b", "type": "bytes"}
                ]},
                {"name": "flags", "type": "bool[3]"}
            ]
        }]}"#;
        let abi = Abi::from_json(json).unwrap();
        let entry = abi.find("Settled")[0];
        assert_eq!(
            entry.canonical(),
            "Settled(uint256,(address,bytes)[2][],bool[3])"
        );
        assert_eq!(entry.inputs()[0].field.name, "arg0");
        assert!(!entry.inputs()[1].field.kind.is_primitive());
        assert_eq!(
            entry.input("flags").unwrap().field.kind,
            ValueKind::FixedArray(3, Box::new(ValueKind::Bool))
        );
    }

    #[test]
    fn invalid_types() {
        for ty in ["uint7", "int264", "bytes0", "bytes33", "uint8[", "float", "tuple[x]"] {
            let json = format!(
                r#"[{{"type": "event", "name": "E", "inputs": [{{"name": "x", "type": "{ty}"}}]}}]"#
            );
            assert!(
                matches!(Abi::from_json(&json), Err(AbiError::InvalidType { .. })),
                "{ty}"
            );
        }
    }

    #[test]
    fn rejects_anonymous_events() {
        let json = r#"[{"type": "event", "name": "E", "anonymous": true, "inputs": []}]"#;
        assert!(matches!(Abi::from_json(json), Err(AbiError::Anonymous(_))));
    }

    #[test]
    fn rejects_unnamed_events_and_too_many_indexed_fields() {
        let json = r#"[{"type": "event", "name": "", "inputs": []}]"#;
        assert!(matches!(Abi::from_json(json), Err(AbiError::Unnamed)));

        let json = r#"[{"type": "event", "name": "E", "inputs": [
            {"name": "a", "type": "uint256", "indexed": true},
            {"name": "b", "type": "uint256", "indexed": true},
            {"name": "c", "type": "uint256", "indexed": true},
            {"name": "d", "type": "uint256", "indexed": true}
        ]}]"#;
        assert!(matches!(
            Abi::from_json(json),
            Err(AbiError::TooManyIndexed(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(Abi::from_json("{"), Err(AbiError::Json(_))));
    }

    #[test]
    fn deduplicates_identical_events() {
        let mut abi = Abi::from_json(EVENTS_TEST_ABI).unwrap();
        abi.extend_from_json(EVENTS_TEST_ABI).unwrap();
        assert_eq!(abi.len(), 2);
    }
}
