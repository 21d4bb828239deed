//! Default builder: one mutation per event.

use super::{MutationBuilder, SerializerFactory, SerializerOptions, SIMPLE_SERIALIZER};
use crate::error::SerializationError;
use crate::event::EventRecord;
use crate::mutation::{ColumnVisibility, Mutation};
use crate::Result;
use bytes::Bytes;

/// Attribute overriding the row key.
pub const ROW_ID_KEY: &str = "rowID";
/// Attribute overriding the column family.
pub const COLUMN_FAMILY_KEY: &str = "columnFamily";
/// Attribute setting the column visibility.
pub const COLUMN_VISIBILITY_KEY: &str = "columnVisibility";

/// Column family used when the event does not name one.
pub const DEFAULT_COLUMN_FAMILY: &str = "flume";
/// Qualifier of the payload column.
pub const BODY_QUALIFIER: &str = "body";
/// Prefix of attribute columns.
pub const HEADER_PREFIX: &str = "header_";

/// Writes the payload to a `body` column and every non-reserved attribute to
/// a `header_<key>` column of a single row.
///
/// The reserved attributes `rowID`, `columnFamily` and `columnVisibility`
/// pick the row key, family and visibility; they are not written. A missing
/// row key becomes a random UUID.
#[derive(Debug, Default)]
pub struct SimpleMutationBuilder {
    current: Option<EventRecord>,
}

impl SimpleMutationBuilder {
    /// Create a builder.
    pub fn new() -> Self {
        Self::default()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl MutationBuilder for SimpleMutationBuilder {
    fn configure(&mut self, _options: &SerializerOptions) -> Result<()> {
        Ok(())
    }

    fn accept(&mut self, event: &EventRecord) {
        self.current = Some(event.clone());
    }

    fn produce(&mut self) -> Result<Vec<Mutation>> {
        let event = self.current.take().ok_or(SerializationError::NoEvent)?;

        let mut headers = event.attributes().clone();
        let row_id = non_empty(headers.remove(ROW_ID_KEY));
        let family = non_empty(headers.remove(COLUMN_FAMILY_KEY));
        let visibility = non_empty(headers.remove(COLUMN_VISIBILITY_KEY));

        let visibility = match visibility {
            Some(expr) => ColumnVisibility::parse(expr)?,
            None => ColumnVisibility::empty(),
        };
        let family = Bytes::from(family.unwrap_or_else(|| DEFAULT_COLUMN_FAMILY.to_string()));
        let row = row_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut mutation = Mutation::new(row);
        mutation.put(
            family.clone(),
            BODY_QUALIFIER,
            &visibility,
            event.body().clone(),
        );

        let mut headers: Vec<_> = headers.into_iter().collect();
        headers.sort_unstable();
        for (key, value) in headers {
            mutation.put(
                family.clone(),
                format!("{HEADER_PREFIX}{key}"),
                &visibility,
                value,
            );
        }

        Ok(vec![mutation])
    }

    fn release(&mut self) {
        self.current = None;
    }
}

/// Factory for [`SimpleMutationBuilder`].
pub struct SimpleSerializerFactory;

impl SerializerFactory for SimpleSerializerFactory {
    fn name(&self) -> &'static str {
        SIMPLE_SERIALIZER
    }

    fn create(&self) -> Box<dyn MutationBuilder> {
        Box::new(SimpleMutationBuilder::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mutation::ColumnUpdate;

    fn produce_one(event: &EventRecord) -> Mutation {
        let mut builder = SimpleMutationBuilder::new();
        builder.accept(event);
        let mut mutations = builder.produce().unwrap();
        assert_eq!(mutations.len(), 1);
        mutations.remove(0)
    }

    fn column<'a>(m: &'a Mutation, qualifier: &str) -> &'a ColumnUpdate {
        m.updates()
            .iter()
            .find(|u| u.qualifier().as_ref() == qualifier.as_bytes())
            .unwrap_or_else(|| panic!("missing column {qualifier}"))
    }

    #[test]
    fn test_default_attributes() {
        let event = EventRecord::new("test event")
            .with_attribute("host", "host1")
            .with_attribute("foo", "bar");
        let m = produce_one(&event);

        let row = std::str::from_utf8(m.row()).unwrap();
        assert!(uuid::Uuid::parse_str(row).is_ok(), "row {row} is not a UUID");

        assert_eq!(m.len(), 3);
        for update in m.updates() {
            assert_eq!(update.family().as_ref(), b"flume");
            assert!(update.visibility().is_empty());
        }
        assert_eq!(column(&m, "body").value().as_ref(), b"test event");
        assert_eq!(column(&m, "header_host").value().as_ref(), b"host1");
        assert_eq!(column(&m, "header_foo").value().as_ref(), b"bar");
    }

    #[test]
    fn test_reserved_attributes_override() {
        let event = EventRecord::new("test event")
            .with_attribute("rowID", "123456")
            .with_attribute("columnFamily", "customCF")
            .with_attribute("columnVisibility", "public")
            .with_attribute("host", "host1");
        let m = produce_one(&event);

        assert_eq!(m.row().as_ref(), b"123456");
        assert_eq!(m.len(), 2);
        for update in m.updates() {
            assert_eq!(update.family().as_ref(), b"customCF");
            assert_eq!(update.visibility().expression().as_ref(), b"public");
            assert!(!update.qualifier().starts_with(b"header_rowID"));
            assert!(!update.qualifier().starts_with(b"header_column"));
        }
        assert_eq!(column(&m, "header_host").value().as_ref(), b"host1");
    }

    #[test]
    fn test_empty_reserved_values_use_defaults() {
        let event = EventRecord::new("x")
            .with_attribute("rowID", "")
            .with_attribute("columnFamily", "")
            .with_attribute("columnVisibility", "");
        let m = produce_one(&event);

        assert!(uuid::Uuid::parse_str(std::str::from_utf8(m.row()).unwrap()).is_ok());
        assert_eq!(m.len(), 1);
        assert_eq!(m.updates()[0].family().as_ref(), b"flume");
        assert!(m.updates()[0].visibility().is_empty());
    }

    #[test]
    fn test_event_is_not_modified() {
        let event = EventRecord::new("x").with_attribute("rowID", "r1");
        produce_one(&event);
        assert_eq!(event.attribute("rowID"), Some("r1"));
    }

    #[test]
    fn test_generated_rows_are_unique() {
        let event = EventRecord::new("x");
        assert_ne!(produce_one(&event).row(), produce_one(&event).row());
    }

    #[test]
    fn test_invalid_visibility_fails_event() {
        let event = EventRecord::new("x").with_attribute("columnVisibility", "a&b|c");
        let mut builder = SimpleMutationBuilder::new();
        builder.accept(&event);

        let err = builder.produce().unwrap_err();
        assert!(matches!(
            err,
            Error::Serialization(SerializationError::InvalidVisibility { .. })
        ));
    }

    #[test]
    fn test_deeply_nested_visibility_fails_event() {
        for depth in [5_000, 50_000] {
            let expression = format!("{}a{}", "(".repeat(depth), ")".repeat(depth));
            let event = EventRecord::new("x").with_attribute("columnVisibility", expression);
            let mut builder = SimpleMutationBuilder::new();
            builder.accept(&event);

            match builder.produce().unwrap_err() {
                Error::Serialization(SerializationError::InvalidVisibility { message, .. }) => {
                    assert_eq!(message, "expression nested too deeply");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn test_produce_clears_state() {
        let mut builder = SimpleMutationBuilder::new();
        assert!(matches!(
            builder.produce(),
            Err(Error::Serialization(SerializationError::NoEvent))
        ));

        builder.accept(&EventRecord::new("x"));
        builder.release();
        assert!(builder.produce().is_err());
    }
}
