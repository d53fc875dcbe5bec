/// Example: Running the engine in a memory-constrained configuration
///
/// This demonstrates how to shrink the per-file block caches for
/// constrained environments and watch eviction keep working.

use obelisk::{Config, FieldKind, ObjectSchema, StorageEngine, TypedObject, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Small blocks, a tiny cache, aggressive age-out
    let config = Config {
        storage_path: std::env::temp_dir().join("obelisk-low-mem"),
        block_size: 4 * 1024,               // 4KB blocks
        cache_max_entries: 32,              // ~128KB cached per file
        cache_max_age_secs: 10,             // drop idle blocks quickly
        cache_sweep_interval_secs: 5,
        ..Config::default()
    };

    let engine = StorageEngine::open(config)?;
    engine.register_schema(
        ObjectSchema::new("LogLine")
            .field("source", FieldKind::String)
            .field("message", FieldKind::String)
            .field("level", FieldKind::Byte),
    );
    println!("✓ Engine opened with a 32-entry block cache");

    // 2. Insert well past the cache capacity; evictions flush dirty blocks
    for i in 0..1000u32 {
        let line = TypedObject::new("LogLine")
            .with_field("source", Value::String(format!("sensor-{}", i % 10)))
            .with_field("message", Value::String(format!("measurement tick {}", i)))
            .with_field("level", Value::Byte((i % 4) as u8));
        engine.insert("logs", line).await?;

        if i % 200 == 0 {
            let stats = engine.stats().await?;
            let cache = &stats.collections[0].cache;
            println!(
                "Object {}: cache {}/{} entries, {} hits, {} misses",
                i, cache.size, cache.max_entries, cache.hits, cache.misses
            );
        }
    }

    // 3. Everything is still readable after dropping the caches entirely
    engine.clear_caches().await;
    let count = engine.count("logs").await?;
    println!("✓ {} objects readable through a cold cache", count);

    engine.flush().await?;
    println!("✓ Engine flushed");

    Ok(())
}
