use std::time::{Duration, Instant};
use std::sync::Arc;
use segdex::{
    document, Config, DocId, DocInfo, Document, ErrorKind, FieldKind, FieldSummary, Filter, FilterOp, Query, Table,
    Value,
};
use tempfile::TempDir;

fn config(persist_every: u64) -> Config {
    Config {
        partition_persist_min_doc_count: persist_every,
        partition_merge_min_doc_count: 2,
        ..Config::default()
    }
}

fn schema() -> Vec<FieldSummary> {
    vec![
        FieldSummary::new("pk", FieldKind::Primary),
        FieldSummary::new("name", FieldKind::WholeString),
        FieldSummary::new("age", FieldKind::Integer),
        FieldSummary::new("desc", FieldKind::Tokenized),
    ]
}

fn person(pk: &str, name: &str, age: i64, desc: &str) -> Document {
    document([
        ("pk", Value::from(pk)),
        ("name", Value::from(name)),
        ("age", Value::from(age)),
        ("desc", Value::from(desc)),
    ])
}

fn create(dir: &TempDir, persist_every: u64) -> Table {
    Table::create(dir.path().join("t"), "t", "pk", &schema(), &config(persist_every)).unwrap()
}

fn reopen(dir: &TempDir, persist_every: u64) -> Table {
    Table::open(dir.path().join("t"), "t", &config(persist_every)).unwrap()
}

fn ids(hits: &[DocInfo]) -> Vec<DocId> {
    hits.iter().map(|h| h.doc_id).collect()
}

#[test]
fn simple_add_and_query() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 100);
    assert_eq!(table.add_doc(&person("10001", "Alice", 20, "likes travel and food")).unwrap(), (0, "10001".to_string()));
    assert_eq!(table.add_doc(&person("10002", "Bob", 30, "likes movies and food")).unwrap(), (1, "10002".to_string()));

    let hits = table.search_field("desc", "food", &[]).unwrap();
    assert_eq!(ids(&hits), vec![0, 1]);
    assert_eq!(hits[0].get("name"), Some("Alice"));
    assert_eq!(hits[1].get("age"), Some("30"));
    assert!(hits.iter().all(|h| h.weight > 0));
}

#[test]
fn update_of_string_field_moves_document() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 100);
    table.add_doc(&person("10001", "Alice", 20, "likes travel and food")).unwrap();
    table.add_doc(&person("10002", "Bob", 30, "likes movies and food")).unwrap();

    let new_id = table
        .update_doc(&document([("pk", "10002"), ("name", "Robert")]))
        .unwrap();
    assert_eq!(new_id, 2);
    assert!(table.is_deleted(1));

    let doc = table.get_doc("10002").unwrap().unwrap();
    assert_eq!(doc.doc_id, 2);
    assert_eq!(doc.get("name"), Some("Robert"));
    assert_eq!(doc.get("age"), Some("30"));
    assert_eq!(doc.get("desc"), Some("likes movies and food"));

    assert!(table.search_field("name", "Bob", &[]).unwrap().is_empty());
    assert_eq!(ids(&table.search_field("name", "Robert", &[]).unwrap()), vec![2]);
    assert_eq!(ids(&table.search_field("desc", "food", &[]).unwrap()), vec![0, 2]);
}

#[test]
fn numeric_update_is_in_place() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 2);
    table.add_doc(&person("1", "Ann", 20, "x")).unwrap();
    table.add_doc(&person("2", "Ben", 30, "y")).unwrap();
    table.add_doc(&person("3", "Cat", 40, "z")).unwrap();
    assert_eq!(table.stats().unwrap().partition_count, 1);

    // sealed partition
    assert_eq!(table.update_doc(&document([("pk", Value::from("1")), ("age", Value::from(21i64))])).unwrap(), 0);
    // in-memory partition
    assert_eq!(table.update_doc(&document([("pk", Value::from("3")), ("age", Value::from(41i64))])).unwrap(), 2);
    assert!(!table.is_deleted(0));

    table.close().unwrap();
    drop(table);
    let table = reopen(&dir, 2);
    assert_eq!(table.get_doc("1").unwrap().unwrap().get("age"), Some("21"));
    assert_eq!(table.get_doc("3").unwrap().unwrap().get("age"), Some("41"));
}

#[test]
fn delete_then_merge_keeps_rows_but_hides_them() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 3);
    for i in 0..6 {
        table
            .add_doc(&person(&format!("k{}", i), &format!("n{}", i), 20 + i, "likes chess"))
            .unwrap();
    }
    let ranges = table.partition_ranges();
    assert_eq!(ranges.len(), 2);
    assert_eq!((ranges[0].1, ranges[0].2, ranges[1].1, ranges[1].2), (0, 3, 3, 6));

    assert!(table.delete_doc("k2").unwrap());
    assert!(!table.delete_doc("k2").unwrap());
    assert!(table.merge_partitions().unwrap());

    let stats = table.stats().unwrap();
    assert_eq!(stats.partition_count, 1);
    assert_eq!(stats.doc_count, 6);
    assert_eq!(stats.deleted_count, 1);
    assert_eq!(table.partition_ranges()[0].1..table.partition_ranges()[0].2, 0..6);

    assert_eq!(ids(&table.search_field("desc", "likes", &[]).unwrap()), vec![0, 1, 3, 4, 5]);
    assert_eq!(table.get_doc("k2").unwrap(), None);
    assert_eq!(table.get_doc("k4").unwrap().unwrap().get("name"), Some("n4"));

    let on_disk: Vec<String> = std::fs::read_dir(dir.path().join("t"))
        .unwrap()
        .filter_map(|e| e.ok()?.file_name().into_string().ok())
        .filter(|n| n.ends_with(".meta") && n.starts_with("t_p"))
        .collect();
    assert_eq!(on_disk, vec![format!("{}.meta", table.partition_ranges()[0].0)]);
}

#[test]
fn merge_fills_fields_added_later() {
    let dir = TempDir::new().unwrap();
    let narrow = vec![
        FieldSummary::new("pk", FieldKind::Primary),
        FieldSummary::new("name", FieldKind::WholeString),
    ];
    let table = Table::create(dir.path().join("t"), "t", "pk", &narrow, &config(100)).unwrap();
    table.add_doc(&document([("pk", "a1"), ("name", "Ann")])).unwrap();
    assert!(table.persist_mem_partition().unwrap());

    table.add_field(&FieldSummary::new("age", FieldKind::Integer)).unwrap();
    table.add_field(&FieldSummary::new("desc", FieldKind::Tokenized)).unwrap();
    table.add_doc(&person("b1", "Ben", 33, "likes golf")).unwrap();
    assert!(table.persist_mem_partition().unwrap());

    let before_a = table.get_doc("a1").unwrap().unwrap();
    assert_eq!(before_a.get("age"), Some(""));
    assert!(table.merge_range(0, 2).unwrap());

    let a = table.get_doc("a1").unwrap().unwrap();
    assert_eq!(a, before_a);
    assert_eq!(a.get("desc"), Some(""));
    let b = table.get_doc("b1").unwrap().unwrap();
    assert_eq!(b.get("age"), Some("33"));
    assert_eq!(b.get("desc"), Some("likes golf"));
    assert_eq!(ids(&table.search_field("desc", "golf", &[]).unwrap()), vec![1]);
}

#[test]
fn filter_operators() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 2);
    table.add_doc(&person("1", "Ann", 20, "likes tea")).unwrap();
    table.add_doc(&person("2", "Ben", 30, "likes coffee")).unwrap();
    table.add_doc(&person("3", "Cat", 25, "likes juice")).unwrap();

    let between = table.search_field("desc", "likes", &[Filter::between("age", 21, 29)]).unwrap();
    assert_eq!(between.len(), 1);
    assert_eq!(between[0].get("age"), Some("25"));

    let within = table.search_field("desc", "likes", &[Filter::in_ints("age", false, vec![20, 25])]).unwrap();
    assert_eq!(ids(&within), vec![0, 2]);

    let names = table
        .search_field("", "", &[Filter::in_strs("name", true, vec!["Ann".into(), "Cat".into()])])
        .unwrap();
    assert_eq!(ids(&names), vec![1]);

    let prefix = table.search_field("", "", &[Filter::text("name", FilterOp::Prefix, "Ca")]).unwrap();
    assert_eq!(ids(&prefix), vec![2]);

    let err = table.search_field("desc", "likes", &[Filter::text("age", FilterOp::Prefix, "2")]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
}

#[test]
fn multi_clause_query_intersects() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 2);
    table.add_doc(&person("1", "Ann", 20, "likes tea")).unwrap();
    table.add_doc(&person("2", "Ben", 30, "likes tea")).unwrap();
    table.add_doc(&person("3", "Ann", 25, "likes juice")).unwrap();

    let query = Query::term("desc", "tea").and("name", "Ann");
    assert_eq!(ids(&table.search(&query).unwrap()), vec![0]);

    let err = table.search(&Query::term("age", "20")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
    let err = table.search(&Query::term("missing", "x")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[test]
fn reload_matches_state_before_close() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 3);
    for i in 0..8 {
        table
            .add_doc(&person(&format!("k{}", i), &format!("n{}", i), 20 + i, &format!("likes item{}", i % 3)))
            .unwrap();
    }
    table.delete_doc("k1").unwrap();
    table.update_doc(&document([("pk", "k5"), ("name", "renamed")])).unwrap();
    table.merge_range(0, 2).unwrap();

    let pks: Vec<String> = (0..8).map(|i| format!("k{}", i)).collect();
    let docs_before: Vec<Option<DocInfo>> = pks.iter().map(|pk| table.get_doc(pk).unwrap()).collect();
    let search_before = table.search_field("desc", "likes", &[]).unwrap();
    let meta_before = table.meta();

    table.close().unwrap();
    drop(table);
    let table = reopen(&dir, 3);

    let docs_after: Vec<Option<DocInfo>> = pks.iter().map(|pk| table.get_doc(pk).unwrap()).collect();
    assert_eq!(docs_after, docs_before);
    assert_eq!(table.search_field("desc", "likes", &[]).unwrap(), search_before);
    let meta_after = table.meta();
    assert_eq!(meta_after.next_doc_id, meta_before.next_doc_id);
    assert_eq!(meta_after.partition_names, meta_before.partition_names);
}

#[test]
fn rejected_documents_change_nothing() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 100);
    table.add_doc(&person("1", "Ann", 20, "x")).unwrap();

    let dup = table.add_doc(&person("1", "Dup", 1, "y")).unwrap_err();
    assert_eq!(dup.kind, ErrorKind::AlreadyExists);

    let bad = document([("pk", "2"), ("age", "twenty")]);
    assert_eq!(table.add_doc(&bad).unwrap_err().kind, ErrorKind::TypeMismatch);

    let no_pk = document([("name", "nobody")]);
    assert_eq!(table.add_doc(&no_pk).unwrap_err().kind, ErrorKind::InvalidArgument);

    assert_eq!(table.stats().unwrap().doc_count, 1);
    assert_eq!(table.add_doc(&person("2", "Ben", 30, "y")).unwrap().0, 1);
}

#[test]
fn deleted_documents_cannot_be_updated_but_key_is_free() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 100);
    table.add_doc(&person("1", "Ann", 20, "x")).unwrap();
    table.delete_doc("1").unwrap();

    let err = table.update_doc(&document([("pk", "1"), ("name", "Zed")])).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    assert_eq!(table.add_doc(&person("1", "Again", 21, "x")).unwrap().0, 1);
    assert_eq!(table.get_doc("1").unwrap().unwrap().get("name"), Some("Again"));
}

#[test]
fn schema_changes_on_open_partition() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 100);
    table.add_doc(&person("1", "Ann", 20, "x")).unwrap();

    table.add_field(&FieldSummary::new("city", FieldKind::WholeString)).unwrap();
    assert_eq!(table.stats().unwrap().partition_count, 1);
    assert_eq!(table.get_doc("1").unwrap().unwrap().get("city"), Some(""));

    let err = table.add_field(&FieldSummary::new("city", FieldKind::WholeString)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);
    assert_eq!(table.delete_field("pk").unwrap_err().kind, ErrorKind::InvalidArgument);

    table.delete_field("name").unwrap();
    let doc = table.get_doc("1").unwrap().unwrap();
    assert_eq!(doc.get("name"), None);
    assert_eq!(doc.get("age"), Some("20"));
}

#[test]
fn date_fields_round_trip_and_filter() {
    let dir = TempDir::new().unwrap();
    let fields = vec![
        FieldSummary::new("pk", FieldKind::Primary),
        FieldSummary::new("born", FieldKind::Date),
    ];
    let table = Table::create(dir.path().join("t"), "t", "pk", &fields, &config(100)).unwrap();
    table.add_doc(&document([("pk", "a"), ("born", "2001-02-03 04:05:06")])).unwrap();
    table.add_doc(&document([("pk", "b"), ("born", "1990-01-01 00:00:00")])).unwrap();

    assert_eq!(table.get_doc("a").unwrap().unwrap().get("born"), Some("2001-02-03 04:05:06"));
    let recent = table
        .search_field("", "", &[Filter::text("born", FilterOp::Gt, "2000-01-01 00:00:00")])
        .unwrap();
    assert_eq!(ids(&recent), vec![0]);
}

#[test]
fn gather_field_searches_all_tokenized_fields() {
    let dir = TempDir::new().unwrap();
    let fields = vec![
        FieldSummary::new("pk", FieldKind::Primary),
        FieldSummary::new("title", FieldKind::Tokenized),
        FieldSummary::new("body", FieldKind::Tokenized),
        FieldSummary::new("all", FieldKind::Gather),
    ];
    let table = Table::create(dir.path().join("t"), "t", "pk", &fields, &config(2)).unwrap();
    table.add_doc(&document([("pk", "1"), ("title", "rust search"), ("body", "fast")])).unwrap();
    table.add_doc(&document([("pk", "2"), ("title", "cooking"), ("body", "rust removal")])).unwrap();
    table.add_doc(&document([("pk", "3"), ("title", "gardening"), ("body", "soil")])).unwrap();

    assert_eq!(ids(&table.search_field("all", "rust", &[]).unwrap()), vec![0, 1]);
    assert_eq!(ids(&table.search_field("title", "rust", &[]).unwrap()), vec![0]);
}

#[test]
fn unsealed_rows_are_dropped_after_crash() {
    let dir = TempDir::new().unwrap();
    {
        let table = create(&dir, 2);
        table.add_doc(&person("1", "Ann", 20, "x")).unwrap();
        table.add_doc(&person("2", "Ben", 30, "y")).unwrap();
        table.add_doc(&person("3", "Cat", 40, "z")).unwrap();
        table.delete_doc("3").unwrap();
        // dropped without close: the third row never reached a sealed partition
    }
    std::fs::write(dir.path().join("t").join("t_p000099.fwd"), b"junk").unwrap();

    let table = reopen(&dir, 2);
    assert_eq!(table.stats().unwrap().doc_count, 2);
    assert_eq!(table.stats().unwrap().deleted_count, 0);
    assert!(table.get_doc("3").unwrap().is_none());
    assert!(!dir.path().join("t").join("t_p000099.fwd").exists());

    assert_eq!(table.add_doc(&person("3", "Cat", 40, "z")).unwrap().0, 2);
    assert!(!table.is_deleted(2));
}

#[test]
fn rewrite_lost_in_crash_keeps_sealed_document() {
    let dir = TempDir::new().unwrap();
    {
        let table = create(&dir, 2);
        table.add_doc(&person("a", "Ann", 20, "likes tea")).unwrap();
        table.add_doc(&person("b", "Ben", 30, "likes coffee")).unwrap();
        assert_eq!(table.update_doc(&document([("pk", "a"), ("name", "Anna")])).unwrap(), 2);
        assert!(table.get_doc("a").unwrap().is_some());
        // dropped without close: the rewrite never reached a sealed partition
    }

    let table = reopen(&dir, 2);
    let doc = table.get_doc("a").unwrap().unwrap();
    assert_eq!(doc.doc_id, 0);
    assert_eq!(doc.get("name"), Some("Ann"));
    assert_eq!(doc.get("age"), Some("20"));
    assert!(!table.is_deleted(0));
    assert_eq!(table.stats().unwrap().deleted_count, 0);
    assert_eq!(ids(&table.search_field("desc", "likes", &[]).unwrap()), vec![0, 1]);

    assert_eq!(table.update_doc(&document([("pk", "a"), ("name", "Anna")])).unwrap(), 2);
    table.close().unwrap();
    drop(table);
    let table = reopen(&dir, 2);
    assert_eq!(table.get_doc("a").unwrap().unwrap().get("name"), Some("Anna"));
    assert!(table.is_deleted(0));
}

#[test]
fn sealed_rewrite_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let table = create(&dir, 2);
        table.add_doc(&person("a", "Ann", 20, "x")).unwrap();
        table.add_doc(&person("b", "Ben", 30, "y")).unwrap();
        table.update_doc(&document([("pk", "a"), ("name", "Anna")])).unwrap();
        table.add_doc(&person("c", "Cat", 40, "z")).unwrap();
        assert_eq!(table.stats().unwrap().partition_count, 2);
    }

    let table = reopen(&dir, 2);
    let doc = table.get_doc("a").unwrap().unwrap();
    assert_eq!(doc.doc_id, 2);
    assert_eq!(doc.get("name"), Some("Anna"));
    assert!(table.is_deleted(0));
}

#[test]
fn update_of_field_added_after_seal_rewrites() {
    let dir = TempDir::new().unwrap();
    let narrow = vec![
        FieldSummary::new("pk", FieldKind::Primary),
        FieldSummary::new("name", FieldKind::WholeString),
    ];
    let table = Table::create(dir.path().join("t"), "t", "pk", &narrow, &config(100)).unwrap();
    table.add_doc(&document([("pk", "1"), ("name", "Ann")])).unwrap();
    table.add_field(&FieldSummary::new("age", FieldKind::Integer)).unwrap();
    assert_eq!(table.stats().unwrap().partition_count, 1);

    let moved = table
        .update_doc(&document([("pk", Value::from("1")), ("age", Value::from(41i64))]))
        .unwrap();
    assert_eq!(moved, 1);
    assert!(table.is_deleted(0));
    let doc = table.get_doc("1").unwrap().unwrap();
    assert_eq!(doc.get("age"), Some("41"));
    assert_eq!(doc.get("name"), Some("Ann"));

    // the new row holds the field, so the next change is in place
    let again = table
        .update_doc(&document([("pk", Value::from("1")), ("age", Value::from(42i64))]))
        .unwrap();
    assert_eq!(again, 1);
    let older = table.search_field("", "", &[Filter::between("age", 40, 50)]).unwrap();
    assert_eq!(ids(&older), vec![1]);
    assert_eq!(older[0].get("age"), Some("42"));
}

#[test]
fn rewrite_carries_numbers_and_dates_unchanged() {
    let dir = TempDir::new().unwrap();
    let fields = vec![
        FieldSummary::new("pk", FieldKind::Primary),
        FieldSummary::new("name", FieldKind::WholeString),
        FieldSummary::new("age", FieldKind::Integer),
        FieldSummary::new("born", FieldKind::Date),
    ];
    let table = Table::create(dir.path().join("t"), "t", "pk", &fields, &config(1)).unwrap();
    // the second 01:30 of a New York clock-change night; its local rendering is ambiguous
    let born = 1_636_266_600i64;
    table
        .add_doc(&document([
            ("pk", Value::from("a")),
            ("age", Value::from(-7i64)),
            ("born", Value::from(born)),
        ]))
        .unwrap();
    let before = table.get_doc("a").unwrap().unwrap();

    table.update_doc(&document([("pk", "a"), ("name", "Ann")])).unwrap();
    let after = table.get_doc("a").unwrap().unwrap();
    assert_eq!(after.doc_id, 1);
    assert_eq!(after.get("age"), Some("-7"));
    assert_eq!(after.get("born"), before.get("born"));
    assert_eq!(after.get("name"), Some("Ann"));

    let exact = table
        .search_field("", "", &[Filter::int("born", FilterOp::Eq, born)])
        .unwrap();
    assert_eq!(ids(&exact), vec![1]);
}

#[test]
fn second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let table = create(&dir, 100);
    let err = Table::open(dir.path().join("t"), "t", &config(100)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Io);
    drop(table);
    reopen(&dir, 100);
}

#[test]
fn background_maintenance_merges_partitions() {
    let dir = TempDir::new().unwrap();
    let table = Arc::new(create(&dir, 2));
    for i in 0..4 {
        table.add_doc(&person(&i.to_string(), "n", i, "likes x")).unwrap();
    }
    assert_eq!(table.stats().unwrap().partition_count, 2);

    let handle = table.start_maintenance(Duration::from_millis(10)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while table.stats().unwrap().partition_count > 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(handle);

    assert_eq!(table.stats().unwrap().partition_count, 1);
    assert_eq!(ids(&table.search_field("desc", "likes", &[]).unwrap()), vec![0, 1, 2, 3]);
}
