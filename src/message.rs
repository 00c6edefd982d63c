//! Immutable typed messages
//!
//! A [`Message`] is an ordered mapping from field name to [`FieldValue`]. The same type
//! is used for outbound publish payloads and inbound deliveries. Messages are cheap to
//! clone (the field map is shared) and cannot be modified once built.
//!
//! # Wire form
//!
//! Messages travel as JSON objects:
//!
//! | value      | encoding                     |
//! |------------|------------------------------|
//! | string     | JSON string                  |
//! | integer    | JSON integer                 |
//! | double     | `{"_d_": 1.5}`               |
//! | timestamp  | `{"_m_": <epoch millis>}`    |
//! | message    | nested JSON object           |
//!
//! ```rust
//! use channel_client::message::Message;
//!
//! let message = Message::builder()
//!     .string("_dest", "sample")
//!     .long("count", 3)
//!     .build();
//!
//! assert_eq!(message.destination(), Some("sample"));
//! assert_eq!(message.to_string(), r#"{"_dest":"sample","count":3}"#);
//! ```

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Reserved field naming the logical destination of a message
pub const DESTINATION_FIELD: &str = "_dest";

const DOUBLE_TAG: &str = "_d_";
const MILLIS_TAG: &str = "_m_";

/// Typed value of a message field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Long(i64),
    Double(f64),
    DateTime(DateTime<Utc>),
    Message(Message),
}

impl FieldValue {
    fn to_json(&self) -> Value {
        match self {
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Long(n) => Value::from(*n),
            FieldValue::Double(d) => {
                let mut tagged = Map::new();
                tagged.insert(DOUBLE_TAG.to_string(), Value::from(*d));
                Value::Object(tagged)
            }
            FieldValue::DateTime(t) => {
                let mut tagged = Map::new();
                tagged.insert(MILLIS_TAG.to_string(), Value::from(t.timestamp_millis()));
                Value::Object(tagged)
            }
            FieldValue::Message(m) => m.to_json(),
        }
    }

    fn from_json(field: &str, value: &Value) -> Result<Self, MessageError> {
        let unsupported = || MessageError::UnsupportedValue {
            field: field.to_string(),
        };

        match value {
            Value::String(s) => Ok(FieldValue::String(s.clone())),
            Value::Number(n) => match n.as_i64() {
                Some(long) => Ok(FieldValue::Long(long)),
                None => n.as_f64().map(FieldValue::Double).ok_or_else(unsupported),
            },
            Value::Object(object) if object.len() == 1 && object.contains_key(DOUBLE_TAG) => object
                .get(DOUBLE_TAG)
                .and_then(Value::as_f64)
                .map(FieldValue::Double)
                .ok_or_else(unsupported),
            Value::Object(object) if object.len() == 1 && object.contains_key(MILLIS_TAG) => object
                .get(MILLIS_TAG)
                .and_then(Value::as_i64)
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(FieldValue::DateTime)
                .ok_or_else(unsupported),
            Value::Object(_) => Message::from_json(value).map(FieldValue::Message),
            Value::Null | Value::Bool(_) | Value::Array(_) => Err(unsupported()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::DateTime(value)
    }
}

impl From<Message> for FieldValue {
    fn from(value: Message) -> Self {
        FieldValue::Message(value)
    }
}

/// Reasons a message cannot be published or decoded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessageError {
    #[error("Field names must not be empty")]
    EmptyFieldName,

    #[error("Field '_dest' must be a string")]
    InvalidDestination,

    #[error("Field '{field}' holds a non-finite double")]
    NonFiniteDouble { field: String },

    #[error("Field '{field}' holds an unsupported value")]
    UnsupportedValue { field: String },

    #[error("Message must be a JSON object")]
    NotAnObject,
}

/// Immutable ordered mapping from field name to typed value
///
/// Fields are kept sorted by name, so iteration and encoding follow name order
/// rather than insertion order.
#[derive(Clone, Default, PartialEq)]
pub struct Message {
    fields: Arc<BTreeMap<String, FieldValue>>,
}

impl Message {
    /// Start building a new message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Field value by name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(FieldValue::Long(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(FieldValue::Double(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            Some(FieldValue::DateTime(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn get_message(&self, name: &str) -> Option<&Message> {
        match self.get(name) {
            Some(FieldValue::Message(m)) => Some(m),
            _ => None,
        }
    }

    /// Logical destination carried in the reserved `_dest` field
    pub fn destination(&self) -> Option<&str> {
        self.get_string(DESTINATION_FIELD)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterate fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check that the message can be put on the wire
    pub fn validate(&self) -> Result<(), MessageError> {
        for (name, value) in self.fields.iter() {
            if name.is_empty() {
                return Err(MessageError::EmptyFieldName);
            }
            match value {
                FieldValue::Double(d) if !d.is_finite() => {
                    return Err(MessageError::NonFiniteDouble {
                        field: name.clone(),
                    });
                }
                FieldValue::Message(nested) => nested.validate()?,
                _ => {}
            }
        }

        match self.get(DESTINATION_FIELD) {
            None | Some(FieldValue::String(_)) => Ok(()),
            Some(_) => Err(MessageError::InvalidDestination),
        }
    }

    /// Encode into the JSON wire form
    pub fn to_json(&self) -> Value {
        let object = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect::<Map<String, Value>>();
        Value::Object(object)
    }

    /// Decode from the JSON wire form
    pub fn from_json(value: &Value) -> Result<Self, MessageError> {
        let object = value.as_object().ok_or(MessageError::NotAnObject)?;
        let mut fields = BTreeMap::new();
        for (name, raw) in object {
            fields.insert(name.clone(), FieldValue::from_json(name, raw)?);
        }
        Ok(Self {
            fields: Arc::new(fields),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.iter()).finish()
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_json(&value).map_err(D::Error::custom)
    }
}

/// Builder collecting fields before freezing them into a [`Message`]
///
/// Setting the same field twice keeps the last value.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    fields: BTreeMap<String, FieldValue>,
}

impl MessageBuilder {
    pub fn field<N: Into<String>, V: Into<FieldValue>>(mut self, name: N, value: V) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn string<N: Into<String>, V: Into<String>>(self, name: N, value: V) -> Self {
        self.field(name, FieldValue::String(value.into()))
    }

    pub fn long<N: Into<String>>(self, name: N, value: i64) -> Self {
        self.field(name, FieldValue::Long(value))
    }

    pub fn double<N: Into<String>>(self, name: N, value: f64) -> Self {
        self.field(name, FieldValue::Double(value))
    }

    pub fn timestamp<N: Into<String>>(self, name: N, value: DateTime<Utc>) -> Self {
        self.field(name, FieldValue::DateTime(value))
    }

    pub fn message<N: Into<String>>(self, name: N, value: Message) -> Self {
        self.field(name, FieldValue::Message(value))
    }

    /// Shorthand for the reserved `_dest` field
    pub fn destination<V: Into<String>>(self, destination: V) -> Self {
        self.string(DESTINATION_FIELD, destination)
    }

    pub fn build(self) -> Message {
        Message {
            fields: Arc::new(self.fields),
        }
    }
}
