//! Event to mutation conversion.
//!
//! A [`MutationBuilder`] turns one [`EventRecord`] at a time into store
//! mutations. Builders are chosen by name through a [`SerializerRegistry`]
//! when the sink is configured.

mod simple;

pub use simple::{SimpleMutationBuilder, SimpleSerializerFactory};

use crate::event::EventRecord;
use crate::mutation::Mutation;
use crate::{Error, Result};
use std::collections::HashMap;

/// Name of the default builder.
pub const SIMPLE_SERIALIZER: &str = "simple";

/// Builder options taken from the `serializer_options` configuration table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializerOptions {
    options: HashMap<String, String>,
}

impl SerializerOptions {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one option.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Whether no options are set.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl From<HashMap<String, String>> for SerializerOptions {
    fn from(options: HashMap<String, String>) -> Self {
        Self { options }
    }
}

/// Converts events into mutations.
///
/// Call order per event is `accept` then `produce`. State is only held
/// between those two calls.
pub trait MutationBuilder: Send {
    /// Apply options. Called once before the first event.
    fn configure(&mut self, options: &SerializerOptions) -> Result<()>;

    /// Hand the next event to the builder.
    fn accept(&mut self, event: &EventRecord);

    /// Produce the mutations for the accepted event and clear it.
    ///
    /// Returns [`crate::error::SerializationError::NoEvent`] if nothing was
    /// accepted.
    fn produce(&mut self) -> Result<Vec<Mutation>>;

    /// Drop any held state. Called when the sink stops.
    fn release(&mut self);
}

/// Creates builders of one named kind.
pub trait SerializerFactory: Send + Sync {
    /// Name used in configuration.
    fn name(&self) -> &'static str;

    /// Create an unconfigured builder.
    fn create(&self) -> Box<dyn MutationBuilder>;
}

/// Registry of builder factories.
pub struct SerializerRegistry {
    factories: Vec<Box<dyn SerializerFactory>>,
}

impl SerializerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Create a registry with the built-in builders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SimpleSerializerFactory));
        registry
    }

    /// Register a factory. A later registration with the same name wins.
    pub fn register(&mut self, factory: Box<dyn SerializerFactory>) {
        self.factories.retain(|f| f.name() != factory.name());
        self.factories.push(factory);
    }

    /// Create and configure a builder by name.
    pub fn create(
        &self,
        name: &str,
        options: &SerializerOptions,
    ) -> Result<Box<dyn MutationBuilder>> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Unknown serializer {:?}, supported: {}",
                    name,
                    self.supported().join(", ")
                ))
            })?;

        let mut builder = factory.create();
        builder.configure(options)?;
        Ok(builder)
    }

    /// Names of all registered builders.
    pub fn supported(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
