//! Content matchers
//!
//! A matcher is a JSON object of per-field constraints. A message satisfies the matcher
//! when it satisfies every constraint:
//!
//! - `"field": "text"` - field is a string equal to `text`
//! - `"field": 42` - field is an integer equal to `42`
//! - `"field": true` - field is present, any value
//! - `"field": false` - field is absent
//!
//! Absent fields never satisfy an equality constraint. The empty matcher `{}` matches
//! every message.

use crate::message::{FieldValue, Message, DESTINATION_FIELD};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Matcher parse failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatcherError {
    #[error("Matcher is not valid JSON: {0}")]
    Syntax(String),

    #[error("Matcher must be a JSON object")]
    NotAnObject,

    #[error("Matcher field names must not be empty")]
    EmptyFieldName,

    #[error("Unsupported constraint for field '{0}'")]
    UnsupportedConstraint(String),
}

/// Constraint on a single field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Equals(String),
    EqualsLong(i64),
    Present,
    Absent,
}

impl Constraint {
    fn is_satisfied_by(&self, value: Option<&FieldValue>) -> bool {
        match (self, value) {
            (Constraint::Present, present) => present.is_some(),
            (Constraint::Absent, present) => present.is_none(),
            (Constraint::Equals(expected), Some(FieldValue::String(actual))) => expected == actual,
            (Constraint::EqualsLong(expected), Some(FieldValue::Long(actual))) => {
                expected == actual
            }
            _ => false,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Constraint::Equals(s) => Value::String(s.clone()),
            Constraint::EqualsLong(n) => Value::from(*n),
            Constraint::Present => Value::Bool(true),
            Constraint::Absent => Value::Bool(false),
        }
    }
}

/// Parsed content matcher
///
/// Two matchers are equal when they impose the same constraints, regardless of how
/// their text was formatted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Matcher {
    constraints: BTreeMap<String, Constraint>,
}

impl Matcher {
    /// Parse matcher text such as `{"_dest":"sample"}`
    pub fn parse(text: &str) -> Result<Self, MatcherError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MatcherError::Syntax(e.to_string()))?;
        let object = value.as_object().ok_or(MatcherError::NotAnObject)?;

        let mut constraints = BTreeMap::new();
        for (field, raw) in object {
            if field.is_empty() {
                return Err(MatcherError::EmptyFieldName);
            }
            let constraint = match raw {
                Value::String(s) => Constraint::Equals(s.clone()),
                Value::Number(n) => n
                    .as_i64()
                    .map(Constraint::EqualsLong)
                    .ok_or_else(|| MatcherError::UnsupportedConstraint(field.clone()))?,
                Value::Bool(true) => Constraint::Present,
                Value::Bool(false) => Constraint::Absent,
                _ => return Err(MatcherError::UnsupportedConstraint(field.clone())),
            };
            constraints.insert(field.clone(), constraint);
        }

        Ok(Self { constraints })
    }

    /// Matcher selecting every message published to `destination`
    pub fn destination(destination: &str) -> Self {
        let mut constraints = BTreeMap::new();
        constraints.insert(
            DESTINATION_FIELD.to_string(),
            Constraint::Equals(destination.to_string()),
        );
        Self { constraints }
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.constraints
            .iter()
            .all(|(field, constraint)| constraint.is_satisfied_by(message.get(field)))
    }

    pub fn constraints(&self) -> impl Iterator<Item = (&str, &Constraint)> {
        self.constraints.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

impl FromStr for Matcher {
    type Err = MatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Matcher::parse(s)
    }
}

/// Canonical JSON text of the matcher
impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object = self
            .constraints
            .iter()
            .map(|(field, constraint)| (field.clone(), constraint.to_json()))
            .collect::<Map<String, Value>>();
        write!(f, "{}", Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_to(dest: &str) -> Message {
        Message::builder().destination(dest).long("n", 1).build()
    }

    #[test]
    fn test_destination_matcher() {
        let matcher = Matcher::parse(r#"{"_dest":"sample"}"#).unwrap();

        assert!(matcher.matches(&message_to("sample")));
        assert!(!matcher.matches(&message_to("other")));
        assert!(!matcher.matches(&Message::builder().long("n", 1).build()));
    }

    #[test]
    fn test_destination_constructor_equals_parsed() {
        assert_eq!(
            Matcher::destination("sample"),
            Matcher::parse(r#"{ "_dest" : "sample" }"#).unwrap()
        );
        assert_eq!(Matcher::destination("sample").to_string(), r#"{"_dest":"sample"}"#);
    }

    #[test]
    fn test_presence_constraints() {
        let present = Matcher::parse(r#"{"urgent":true}"#).unwrap();
        let absent = Matcher::parse(r#"{"urgent":false}"#).unwrap();
        let flagged = Message::builder().string("urgent", "yes").build();
        let plain = Message::builder().string("other", "x").build();

        assert!(present.matches(&flagged));
        assert!(!present.matches(&plain));
        assert!(absent.matches(&plain));
        assert!(!absent.matches(&flagged));
    }

    #[test]
    fn test_integer_constraint_does_not_match_strings() {
        let matcher = Matcher::parse(r#"{"n":1}"#).unwrap();
        assert!(matcher.matches(&Message::builder().long("n", 1).build()));
        assert!(!matcher.matches(&Message::builder().string("n", "1").build()));
        assert!(!matcher.matches(&Message::builder().long("n", 2).build()));
    }

    #[test]
    fn test_empty_matcher_matches_everything() {
        let matcher = Matcher::parse("{}").unwrap();
        assert!(matcher.is_empty());
        assert!(matcher.matches(&Message::default()));
        assert!(matcher.matches(&message_to("anything")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Matcher::parse("{\"_dest\":"),
            Err(MatcherError::Syntax(_))
        ));
        assert_eq!(Matcher::parse("[1]"), Err(MatcherError::NotAnObject));
        assert_eq!(
            Matcher::parse(r#"{"":"x"}"#),
            Err(MatcherError::EmptyFieldName)
        );
        assert_eq!(
            Matcher::parse(r#"{"ratio":1.5}"#),
            Err(MatcherError::UnsupportedConstraint("ratio".to_string()))
        );
        assert_eq!(
            Matcher::parse(r#"{"x":null}"#),
            Err(MatcherError::UnsupportedConstraint("x".to_string()))
        );
    }

    #[test]
    fn test_from_str() {
        let matcher: Matcher = r#"{"_dest":"a","n":2}"#.parse().unwrap();
        assert_eq!(matcher.constraints().count(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn destination_matcher_matches_only_its_destination(
                wanted in "[a-z]{1,12}",
                actual in "[a-z]{1,12}"
            ) {
                // Property: a destination matcher selects exactly the messages sent there
                let matcher = Matcher::destination(&wanted);
                prop_assert_eq!(matcher.matches(&message_to(&actual)), wanted == actual);
            }

            #[test]
            fn canonical_text_parses_back_to_the_same_matcher(
                dest in "[ -~]{0,16}",
                n in any::<i64>(),
                flag in any::<bool>()
            ) {
                let text = serde_json::json!({ "_dest": dest, "n": n, "flag": flag }).to_string();
                let matcher = Matcher::parse(&text).unwrap();
                let reparsed = Matcher::parse(&matcher.to_string()).unwrap();
                prop_assert_eq!(matcher, reparsed);
            }

            #[test]
            fn empty_matcher_matches_any_message(dest in ".*", n in any::<i64>()) {
                let message = Message::builder().destination(dest).long("n", n).build();
                prop_assert!(Matcher::default().matches(&message));
            }
        }
    }
}
