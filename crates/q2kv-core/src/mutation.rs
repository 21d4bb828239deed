//! Row mutations submitted to the store.

use crate::error::WriteError;
use bytes::Bytes;

pub use crate::visibility::ColumnVisibility;

/// Fixed per-update overhead added to the byte estimate (timestamp and
/// framing).
const UPDATE_OVERHEAD: usize = 16;

/// One column write within a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUpdate {
    family: Bytes,
    qualifier: Bytes,
    visibility: ColumnVisibility,
    value: Bytes,
}

impl ColumnUpdate {
    /// Column family.
    pub fn family(&self) -> &Bytes {
        &self.family
    }

    /// Column qualifier.
    pub fn qualifier(&self) -> &Bytes {
        &self.qualifier
    }

    /// Column visibility.
    pub fn visibility(&self) -> &ColumnVisibility {
        &self.visibility
    }

    /// Cell value.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    fn estimated_size(&self) -> usize {
        self.family.len()
            + self.qualifier.len()
            + self.visibility.expression().len()
            + self.value.len()
            + UPDATE_OVERHEAD
    }
}

/// An ordered set of column updates to a single row.
///
/// Updates can only be appended. Once submitted to a writer the mutation is
/// owned by it and no longer changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    row: Bytes,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    /// Create an empty mutation for a row.
    pub fn new(row: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    /// Append a column update.
    pub fn put(
        &mut self,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        visibility: &ColumnVisibility,
        value: impl Into<Bytes>,
    ) {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: visibility.clone(),
            value: value.into(),
        });
    }

    /// Row key.
    pub fn row(&self) -> &Bytes {
        &self.row
    }

    /// Column updates in insertion order.
    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }

    /// Number of column updates.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Whether the mutation has no column updates.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Approximate memory footprint in bytes, used for writer accounting.
    pub fn estimated_size(&self) -> usize {
        self.row.len()
            + self
                .updates
                .iter()
                .map(ColumnUpdate::estimated_size)
                .sum::<usize>()
    }

    /// Check the mutation can be written.
    pub fn validate(&self) -> Result<(), WriteError> {
        if self.updates.is_empty() {
            return Err(WriteError::EmptyMutation {
                row: self.row.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_preserves_order() {
        let vis = ColumnVisibility::empty();
        let mut m = Mutation::new("row1");
        m.put("cf", "body", &vis, "payload");
        m.put("cf", "header_host", &vis, "host1");

        assert_eq!(m.row().as_ref(), b"row1");
        assert_eq!(m.len(), 2);
        assert_eq!(m.updates()[0].qualifier().as_ref(), b"body");
        assert_eq!(m.updates()[1].qualifier().as_ref(), b"header_host");
        assert_eq!(m.updates()[1].value().as_ref(), b"host1");
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_empty_mutation_is_invalid() {
        let m = Mutation::new("row1");
        assert!(m.is_empty());
        assert!(matches!(
            m.validate(),
            Err(WriteError::EmptyMutation { .. })
        ));
    }

    #[test]
    fn test_estimated_size_grows_with_updates() {
        let vis = ColumnVisibility::parse("public").unwrap();
        let mut m = Mutation::new("r");
        let base = m.estimated_size();
        assert_eq!(base, 1);

        m.put("cf", "cq", &vis, "value");
        assert_eq!(m.estimated_size(), 1 + 2 + 2 + 6 + 5 + UPDATE_OVERHEAD);
    }
}
