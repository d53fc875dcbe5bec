/// Complete Obelisk API Demo
///
/// Demonstrates all major engine operations:
/// - Schema registration
/// - CRUD operations (Insert, Get, Update, Delete)
/// - Indexes and filtered/sorted queries
/// - BLOB overflow for oversized objects
/// - Statistics

use obelisk::{Config, FieldKind, Filter, ObjectSchema, StorageEngine, TypedObject, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║      Obelisk Object Database - API Demo       ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    // Step 1: Open the engine and register a schema
    println!("Step 1: Opening engine...");
    let config = Config {
        storage_path: std::env::temp_dir().join("obelisk-demo"),
        ..Config::default()
    };
    let engine = StorageEngine::open(config)?;
    engine.register_schema(
        ObjectSchema::new("Reading")
            .field("room", FieldKind::String)
            .field("value", FieldKind::Double)
            .nullable_field("note", FieldKind::String)
            .nullable_field("trace", FieldKind::ByteArray),
    );
    println!("Done!\n");

    // Step 2: INSERT - Add objects
    println!("Step 2: INSERT - Adding objects...");
    engine.ensure_index("readings", &["room", "value"]).await?;

    let mut first_id = None;
    for (room, value) in [("lab", 21.5), ("lab", 22.0), ("hall", 19.0), ("attic", 15.5)] {
        let object = TypedObject::new("Reading")
            .with_field("room", Value::String(room.to_string()))
            .with_field("value", Value::Double(value));
        let id = engine.insert("readings", object).await?;
        first_id.get_or_insert(id);
    }
    println!("  Inserted 4 objects\n");

    // Step 3: FIND - Filtered and sorted queries
    println!("Step 3: FIND - Querying objects...");

    let lab_only = Filter::eq("room", Value::String("lab".into()));
    let mut results = engine
        .find("readings", Some(lab_only), &[], 0, usize::MAX)
        .await?;
    println!("  room == 'lab': {} results", results.collect().await?.len());

    let warm = Filter::gt("value", Value::Double(18.0));
    let mut results = engine
        .find("readings", Some(warm), &["-value"], 0, usize::MAX)
        .await?;
    while let Some(object) = results.next().await? {
        println!(
            "  {:?} in {:?}",
            object.get_field("value").unwrap(),
            object.get_field("room").unwrap()
        );
    }
    println!();

    // Step 4: UPDATE - Modify an object in place
    println!("Step 4: UPDATE - Updating object...");
    let id = first_id.expect("inserted above");
    let mut object = engine.get_object("readings", id).await?.expect("exists");
    object.set_field("note", Value::String("recalibrated".into()));
    engine.update("readings", &object).await?;
    println!("  Updated object {}\n", id);

    // Step 5: BLOB overflow - oversized payloads leave the leaf
    println!("Step 5: BLOB - Storing an oversized object...");
    let big = TypedObject::new("Reading")
        .with_field("room", Value::String("vault".into()))
        .with_field("value", Value::Double(0.0))
        .with_field("trace", Value::ByteArray(vec![0xAB; 100_000]));
    let big_id = engine.insert("readings", big).await?;
    let back = engine.get_object("readings", big_id).await?.expect("exists");
    match back.get_field("trace") {
        Some(Value::ByteArray(bytes)) => println!("  Round-tripped {} bytes\n", bytes.len()),
        _ => println!("  Trace missing!\n"),
    }

    // Step 6: DELETE - Remove an object
    println!("Step 6: DELETE - Removing object...");
    engine.delete("readings", big_id).await?;
    println!("  Deleted object {}\n", big_id);

    // Step 7: STATS
    println!("Step 7: STATISTICS - Engine metrics:");
    println!("  ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let stats = engine.stats().await?;
    for collection in &stats.collections {
        println!("  Collection:      {}", collection.name);
        println!("  Objects:         {}", collection.object_count);
        println!("  Indexes:         {}", collection.index_count);
        println!("  Blocks:          {}", collection.block_count);
        println!("  Free blocks:     {}", collection.free_blocks);
        println!(
            "  Cache hit/miss:  {}/{}",
            collection.cache.hits, collection.cache.misses
        );
    }

    engine.flush().await?;
    println!("\n╔════════════════════════════════════════╗");
    println!("║     All API Operations Completed!      ║");
    println!("╚════════════════════════════════════════╝\n");

    Ok(())
}
