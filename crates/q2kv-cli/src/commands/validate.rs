//! Validate command implementation.

use anyhow::Result;
use q2kv_core::serializer::{SerializerOptions, SerializerRegistry};
use q2kv_core::Config;
use tracing::warn;

/// Check a loaded configuration and report what the sink would run with.
pub fn run(config: &Config) -> Result<()> {
    config.validate()?;

    // Builder names are resolved the same way the sink resolves them.
    let registry = SerializerRegistry::with_defaults();
    let options = SerializerOptions::from(config.sink.serializer_options.clone());
    registry.create(&config.sink.serializer, &options)?;

    if let Err(e) = config.validate_connection() {
        warn!(error = %e, "Store connection settings incomplete");
    }

    println!("Configuration is valid");
    println!("  table:       {}", config.sink.table);
    println!("  batch size:  {}", config.sink.batch_size);
    println!("  serializer:  {}", config.sink.serializer);
    println!(
        "  writer:      {} bytes, {} ms latency, {} threads",
        config.writer.max_memory, config.writer.max_latency_ms, config.writer.max_write_threads
    );
    Ok(())
}
