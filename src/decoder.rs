//! Module implementing event decoding logic. This module is responsible for
//! taking a raw log and decoding it into named event fields.

use crate::{abi::Abi, source::RawLog};
use solabi::{
    abi::EventDescriptor,
    decode::DecodeError as DataError,
    ethprim::{Address, I256, U256},
    log::{Log, Topics},
    value::{self, EventEncoder, EventIndexError, ValueKind},
};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("log has no topics")]
    MissingSignature,
    #[error("unknown signature 0x{}", hex::encode(.0))]
    UnknownSignature([u8; 32]),
    #[error("event {event} expects {expected} topics but log has {actual}")]
    TopicCount {
        event: String,
        expected: usize,
        actual: usize,
    },
    #[error("event {event} has malformed data")]
    Data {
        event: String,
        #[source]
        source: DataError,
    },
}

/// A decoded event field value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    Int(I256),
    Uint(U256),
    Bool(bool),
    Address(Address),
    Bytes(Vec<u8>),
    String(String),
}

/// Decoded fields by name. Composite fields are decoded but have no column
/// representation, so they are absent.
pub type Fields = BTreeMap<String, Value>;

/// Decoder for the logs of a single event.
pub struct Decoder {
    encoder: EventEncoder,
    indexed: usize,
    /// Fields declared as `string`, decoded as `bytes` so that invalid UTF-8
    /// can fall back to hex.
    strings: Vec<bool>,
}

impl Decoder {
    pub fn new(event: &EventDescriptor) -> Result<Self, EventIndexError> {
        let indexed = event.inputs.iter().filter(|input| input.indexed).count();
        if indexed >= Topics::MAX_LEN {
            return Err(EventIndexError);
        }

        // The signature topic is matched by the ABI lookup, and the encoder
        // would compute it from the remapped kinds, so the remaining topics
        // are decoded as an anonymous event.
        let mut event = event.clone();
        event.anonymous = true;
        let strings = event
            .inputs
            .iter_mut()
            .map(|input| {
                let string = input.field.kind == ValueKind::String;
                strings_as_bytes(&mut input.field.kind);
                string && !input.indexed
            })
            .collect();

        Ok(Self {
            encoder: EventEncoder::new(&event)?,
            indexed,
            strings,
        })
    }

    /// Decodes the topics after the signature and the data of a log.
    fn decode(&self, log: &RawLog) -> Result<Vec<Option<Value>>, DataError> {
        let mut topics = Topics::default();
        for topic in log.topics.iter().skip(1).take(self.indexed) {
            topics.push_word(topic.0);
        }
        let log = Log {
            topics,
            data: Cow::Borrowed(&log.data),
        };

        let values = self.encoder.decode(&log)?;
        Ok(values
            .iter()
            .zip(&self.strings)
            .map(|(value, string)| convert(value, *string))
            .collect())
    }
}

impl Debug for Decoder {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("indexed", &self.indexed)
            .field("strings", &self.strings)
            .finish_non_exhaustive()
    }
}

/// Decodes a raw log with the ABI entry matching its signature.
pub fn decode(log: &RawLog, abi: &Abi) -> Result<Fields, DecodeError> {
    let signature = log.signature().ok_or(DecodeError::MissingSignature)?;
    let entry = abi
        .get(signature)
        .ok_or(DecodeError::UnknownSignature(signature.0))?;

    let expected = entry.decoder.indexed + 1;
    if log.topics.len() != expected {
        return Err(DecodeError::TopicCount {
            event: entry.name().to_owned(),
            expected,
            actual: log.topics.len(),
        });
    }

    let values = entry
        .decoder
        .decode(log)
        .map_err(|source| DecodeError::Data {
            event: entry.name().to_owned(),
            source,
        })?;
    Ok(entry
        .inputs()
        .iter()
        .zip(values)
        .filter_map(|(input, value)| Some((input.field.name.clone(), value?)))
        .collect())
}

/// Converts bytes into a string, substituting a `0x` prefixed hex encoding of
/// the raw bytes when they are not valid UTF-8. Text columns of the
/// destination store only accept valid UTF-8, so this keeps a single bad
/// payload from failing the whole block.
pub fn utf8_or_hex(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            tracing::debug!(len = bytes.len(), "invalid UTF-8, using hex fallback");
            to_hex(bytes)
        }
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn strings_as_bytes(kind: &mut ValueKind) {
    match kind {
        ValueKind::String => *kind = ValueKind::Bytes,
        ValueKind::Array(kind) | ValueKind::FixedArray(_, kind) => strings_as_bytes(kind),
        ValueKind::Tuple(kinds) => kinds.iter_mut().for_each(strings_as_bytes),
        _ => {}
    }
}

/// Indexed dynamic and composite values arrive as the hash of their encoding,
/// which solabi hands back as `bytes32`.
fn convert(value: &value::Value, string: bool) -> Option<Value> {
    let value = match value {
        value::Value::Int(v) => Value::Int(v.get()),
        value::Value::Uint(v) => Value::Uint(v.get()),
        value::Value::Bool(v) => Value::Bool(*v),
        value::Value::Address(v) => Value::Address(*v),
        value::Value::FixedBytes(v) => Value::Bytes(v.as_bytes().to_vec()),
        value::Value::Function(v) => Value::Bytes([&v.address.0[..], &v.selector.0[..]].concat()),
        value::Value::Bytes(v) if string => Value::String(utf8_or_hex(v)),
        value::Value::Bytes(v) => Value::Bytes(v.clone()),
        value::Value::String(v) => Value::String(v.clone()),
        value::Value::FixedArray(_) | value::Value::Array(_) | value::Value::Tuple(_) => {
            return None
        }
    };
    Some(value)
}
