//! Events carried through the source.

use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An opaque payload plus string attributes.
///
/// Records are never modified once created; consumers that need to drop or
/// rewrite attributes work on a copy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventRecord {
    body: Bytes,
    attributes: HashMap<String, String>,
}

/// JSON-lines wire form used to load events from files.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    body: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl EventRecord {
    /// Create an event with no attributes.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add or replace one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add or replace several attributes.
    pub fn with_attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Payload bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// All attributes.
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// One attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Decode a record from its JSON wire form:
    /// `{"body": "<text>", "attributes": {"k": "v"}}`.
    pub fn from_json(line: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(line)?;
        Ok(Self {
            body: Bytes::from(wire.body),
            attributes: wire.attributes,
        })
    }

    /// Encode the record in its JSON wire form. Non-UTF-8 payload bytes are
    /// replaced.
    pub fn to_json(&self) -> Result<String> {
        let wire = WireEvent {
            body: String::from_utf8_lossy(&self.body).into_owned(),
            attributes: self.attributes.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, SerializationError};

    #[test]
    fn test_builder_methods() {
        let event = EventRecord::new("payload")
            .with_attribute("host", "host1")
            .with_attributes([("foo", "bar"), ("host", "host2")]);

        assert_eq!(event.body().as_ref(), b"payload");
        assert_eq!(event.attributes().len(), 2);
        assert_eq!(event.attribute("host"), Some("host2"));
        assert_eq!(event.attribute("missing"), None);
    }

    #[test]
    fn test_from_json() {
        let event =
            EventRecord::from_json(r#"{"body": "hello", "attributes": {"rowID": "r1"}}"#).unwrap();
        assert_eq!(event.body().as_ref(), b"hello");
        assert_eq!(event.attribute("rowID"), Some("r1"));

        let bare = EventRecord::from_json(r#"{"body": "x"}"#).unwrap();
        assert!(bare.attributes().is_empty());
    }

    #[test]
    fn test_from_json_invalid() {
        let err = EventRecord::from_json(r#"{"attributes": {}}"#).unwrap_err();
        assert!(matches!(
            err,
            Error::Serialization(SerializationError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_json_wire_form() {
        let event = EventRecord::new("hello").with_attribute("k", "v");
        let line = event.to_json().unwrap();
        assert_eq!(EventRecord::from_json(&line).unwrap(), event);
    }
}
