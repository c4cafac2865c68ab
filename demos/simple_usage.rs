/// segdex API walk-through
///
/// - create a database and a table
/// - insert, update and delete documents
/// - term queries, filters and multi-clause queries
/// - sealing, merging and statistics
/// - reopening from disk

use segdex::{document, Config, Engine, FieldKind, FieldSummary, Filter, FilterOp, Query, Value};
use tempfile::TempDir;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== segdex demo ===\n");

    let dir = TempDir::new()?;
    let config = Config {
        data_dir: dir.path().join("data"),
        partition_persist_min_doc_count: 2,
        ..Config::default()
    };

    // Step 1: schema
    println!("Step 1: creating database 'shop' and table 'users'...");
    let engine = Engine::open(config.clone())?;
    let db = engine.create_database("shop")?;
    let users = db.create_table(
        "users",
        "pk",
        &[
            FieldSummary::new("name", FieldKind::WholeString),
            FieldSummary::new("age", FieldKind::Integer),
            FieldSummary::new("tags", FieldKind::ListString),
            FieldSummary::new("desc", FieldKind::Tokenized),
        ],
    )?;
    println!("  fields: {:?}\n", users.fields().iter().map(|f| &f.name).collect::<Vec<_>>());

    // Step 2: insert
    println!("Step 2: inserting documents...");
    let people = [
        ("10001", "Alice", 20, "travel;food", "likes travel and food"),
        ("10002", "Bob", 30, "movies", "likes movies and food"),
        ("10003", "Carol", 41, "chess;food", "plays chess every weekend"),
    ];
    for (pk, name, age, tags, desc) in people {
        let (doc_id, _) = users.add_doc(&document([
            ("pk", Value::from(pk)),
            ("name", Value::from(name)),
            ("age", Value::from(age as i64)),
            ("tags", Value::from(tags)),
            ("desc", Value::from(desc)),
        ]))?;
        println!("  {} -> doc {}", pk, doc_id);
    }
    println!();

    // Step 3: search
    println!("Step 3: searching...");
    let food = users.search_field("desc", "food", &[])?;
    println!("  desc:food -> {:?}", food.iter().filter_map(|h| h.get("name")).collect::<Vec<_>>());

    let older = users.search_field("tags", "food", &[Filter::int("age", FilterOp::Gt, 25)])?;
    println!("  tags:food, age > 25 -> {:?}", older.iter().filter_map(|h| h.get("name")).collect::<Vec<_>>());

    let both = users.search(&Query::term("desc", "likes").and("tags", "movies"))?;
    println!("  desc:likes AND tags:movies -> {:?}\n", both.iter().filter_map(|h| h.get("name")).collect::<Vec<_>>());

    // Step 4: update and delete
    println!("Step 4: updating and deleting...");
    let same = users.update_doc(&document([("pk", Value::from("10001")), ("age", Value::from(21i64))]))?;
    println!("  age of 10001 updated in place, still doc {}", same);
    let moved = users.update_doc(&document([("pk", "10002"), ("name", "Robert")]))?;
    println!("  name of 10002 rewritten, now doc {}", moved);
    users.delete_doc("10003")?;
    println!("  10003 deleted, lookup finds it: {}\n", users.get_doc("10003")?.is_some());

    // Step 5: maintenance
    println!("Step 5: sealing and merging...");
    users.persist_mem_partition()?;
    println!("  partitions before merge: {:?}", users.partition_ranges());
    while users.merge_partitions()? {}
    println!("  partitions after merge:  {:?}", users.partition_ranges());
    println!("  stats: {:?}\n", users.stats()?);

    // Step 6: reopen
    println!("Step 6: closing and reopening...");
    drop(users);
    drop(db);
    engine.close()?;
    drop(engine);

    let engine = Engine::open(config)?;
    let users = engine.database("shop")?.table("users")?;
    match users.get_doc("10002")? {
        Some(doc) => println!("  10002 -> {:?}", doc.fields),
        None => println!("  10002 not found"),
    }
    println!("  live docs matching 'food': {}", users.search_field("desc", "food", &[])?.len());

    println!("\n=== done ===");
    Ok(())
}
