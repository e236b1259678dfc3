//! End-to-end flows over the in-memory driver: portable parameter
//! binding, lookup-enriched pipelines, bulk runs, and both merge
//! strategies.

use std::collections::HashMap;
use std::sync::Arc;

use dbsurge::{
    translate, Column, Cursor, DbType, MemoryConnection, Operation, ParamStyle, Params, Record,
    Surge, Table, TableDef, Value,
};

fn connection(db: DbType, style: ParamStyle) -> (MemoryConnection, Arc<dyn dbsurge::DriverConnection>) {
    let conn = MemoryConnection::new(db, style);
    let shared: Arc<dyn dbsurge::DriverConnection> = Arc::new(conn.clone());
    (conn, shared)
}

#[test]
fn portable_select_across_styles() {
    let sql = "SELECT id, name FROM t WHERE id = :id AND name = :name";
    let payload = HashMap::from([
        ("id".to_string(), Value::Int(7)),
        ("name".to_string(), Value::Text("Toph".into())),
    ]);

    let named = translate(sql, ParamStyle::Named).unwrap();
    assert_eq!(named.sql(), sql);
    assert!(matches!(named.bind(&payload), Params::Named(_)));

    let qmark = translate(sql, ParamStyle::Qmark).unwrap();
    assert_eq!(qmark.sql(), "SELECT id, name FROM t WHERE id = ? AND name = ?");
    assert_eq!(
        qmark.bind(&payload),
        Params::Positional(vec![Value::Int(7), Value::Text("Toph".into())])
    );

    let numeric = translate(sql, ParamStyle::Numeric).unwrap();
    assert_eq!(numeric.sql(), "SELECT id, name FROM t WHERE id = :1 AND name = :2");

    let format = translate(sql, ParamStyle::Format).unwrap();
    assert_eq!(format.sql(), "SELECT id, name FROM t WHERE id = %s AND name = %s");

    // Every translation references the same parameter multiset.
    for style in [
        ParamStyle::Named,
        ParamStyle::NamedPercent,
        ParamStyle::Qmark,
        ParamStyle::Format,
        ParamStyle::Numeric,
    ] {
        let t = translate(sql, style).unwrap();
        assert_eq!(t.names(), &["id", "name"]);
    }
}

#[tokio::test]
async fn same_records_from_every_style() {
    for style in [ParamStyle::Named, ParamStyle::Qmark, ParamStyle::Format] {
        let (conn, shared) = connection(DbType::Postgres, style);
        conn.script_query(
            "FROM t",
            ["id", "name"],
            vec![vec![Value::Int(7), Value::Text("Toph".into())]],
        );

        let mut cursor = Cursor::new(shared).unwrap();
        cursor
            .execute(
                "SELECT id, name FROM t WHERE id = :id AND name = :name",
                Params::named([
                    ("id", Value::Int(7)),
                    ("name", Value::Text("Toph".into())),
                ]),
            )
            .await
            .unwrap();
        let rows = cursor.fetch_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::Text("Toph".into()));
    }
}

#[tokio::test]
async fn lookup_enriched_pipeline() {
    let (conn, shared) = connection(DbType::Postgres, ParamStyle::Named);
    conn.script_query(
        "name, code FROM states",
        ["name", "code"],
        vec![
            vec![Value::Text("OHIO".into()), Value::Text("OH".into())],
            vec![Value::Text("IOWA".into()), Value::Text("IA".into())],
        ],
    );

    let cursor = Cursor::new(shared).unwrap();
    let table = Table::new(
        "citizens",
        vec![
            Column::builder("id").field("id").key(true),
            Column::builder("state")
                .field("state_name")
                .transform("upper")
                .unwrap()
                .transform("lookup:states:name:code:preload")
                .unwrap(),
        ],
        cursor,
    )
    .unwrap();

    let rows = vec![
        Record::from_pairs([
            ("id", Value::Int(1)),
            ("state_name", Value::Text("ohio".into())),
        ]),
        Record::from_pairs([
            ("id", Value::Int(2)),
            ("state_name", Value::Text("iowa".into())),
        ]),
    ];

    let mut surge = Surge::new(table).with_batch_size(100);
    let progress = surge.insert(rows).await.unwrap();
    assert_eq!(progress.inserted, 2);

    // One preload SELECT plus one batched INSERT.
    let inserts = conn.executed_matching("INSERT INTO citizens");
    assert_eq!(inserts.len(), 1);
    match &inserts[0].payloads[0] {
        Params::Named(map) => assert_eq!(map.get("state"), Some(&Value::Text("OH".into()))),
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(conn.executed_matching("FROM states").len(), 1);
}

fn merge_table(shared: Arc<dyn dbsurge::DriverConnection>) -> Table {
    Table::new(
        "t",
        vec![
            Column::builder("id").field("id").key(true),
            Column::builder("v").field("v").nullable(false),
        ],
        Cursor::new(shared).unwrap(),
    )
    .unwrap()
}

fn merge_rows() -> Vec<Record> {
    vec![
        Record::from_pairs([("id", Value::Int(2)), ("v", Value::Text("B".into()))]),
        Record::from_pairs([("id", Value::Int(3)), ("v", Value::Text("c".into()))]),
    ]
}

#[tokio::test]
async fn merge_counts_equivalent_across_strategies() {
    // Native upsert path.
    let (_, shared) = connection(DbType::Postgres, ParamStyle::Named);
    let mut native = Surge::new(merge_table(shared)).with_batch_size(10);
    let native_progress = native.merge(merge_rows()).await.unwrap();

    // Temp-table fallback path.
    let (temp_conn, shared) = connection(DbType::SqlServer, ParamStyle::Qmark);
    let mut staged = Surge::new(merge_table(shared)).with_batch_size(10);
    let staged_progress = staged.merge(merge_rows()).await.unwrap();

    for progress in [&native_progress, &staged_progress] {
        assert_eq!(progress.merged, 2);
        assert_eq!(progress.inserted, 0);
        assert_eq!(progress.updated, 0);
        assert_eq!(progress.deleted, 0);
        assert_eq!(progress.incomplete, 0);
        assert_eq!(progress.error, 0);
    }

    // The fallback staged through a temp table and cleaned up after itself.
    let sqls: Vec<String> = temp_conn.executed().iter().map(|r| r.sql.clone()).collect();
    assert!(sqls.iter().any(|s| s.contains("MERGE INTO t")));
    assert!(sqls.last().unwrap().starts_with("DROP TABLE"));
}

#[tokio::test]
async fn config_defined_pipeline_end_to_end() {
    let def = r#"
name: people
columns:
  - name: id
    field: person_id
    key: true
  - name: full_name
    field: name
    fn: [strip, maxlen:10]
    required: true
  - name: active
    field: is_active
    fn: indicator:1/0
"#;
    let (conn, shared) = connection(DbType::Postgres, ParamStyle::Named);
    let table = TableDef::parse(def)
        .unwrap()
        .build(Cursor::new(shared).unwrap())
        .unwrap();

    let rows = vec![
        Record::from_pairs([
            ("person_id", Value::Int(1)),
            ("name", Value::Text("  Aang  ".into())),
            ("is_active", Value::Bool(true)),
        ]),
        // Missing name: incomplete for insert.
        Record::from_pairs([
            ("person_id", Value::Int(2)),
            ("is_active", Value::Bool(false)),
        ]),
    ];

    let mut surge = Surge::new(table).with_batch_size(10);
    let progress = surge.insert(rows).await.unwrap();
    assert_eq!(progress.processed, 2);
    assert_eq!(progress.inserted, 1);
    assert_eq!(progress.incomplete, 1);

    let batch = &conn.executed_matching("INSERT INTO people")[0];
    match &batch.payloads[0] {
        Params::Named(map) => {
            assert_eq!(map.get("full_name"), Some(&Value::Text("Aang".into())));
            assert_eq!(map.get("active"), Some(&Value::Text("1".into())));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn single_row_insert_then_fetch_round_trip() {
    let (conn, shared) = connection(DbType::Postgres, ParamStyle::Named);
    conn.script_query(
        "FROM people WHERE",
        ["id", "name"],
        vec![vec![Value::Int(1), Value::Text("Aang".into())]],
    );

    let mut table = Table::new(
        "people",
        vec![
            Column::builder("id").field("id").key(true),
            Column::builder("name").field("name").nullable(false),
        ],
        Cursor::new(shared).unwrap(),
    )
    .unwrap();

    let input = Record::from_pairs([("id", Value::Int(1)), ("name", Value::Text("Aang".into()))]);
    table.set_values(&input).await.unwrap();
    assert!(table.execute(Operation::Insert).await.unwrap());

    let fetched = table.fetch().await.unwrap().unwrap();
    assert_eq!(fetched["id"], input["id"]);
    assert_eq!(fetched["name"], input["name"]);
    assert_eq!(table.counts().insert, 1);
    assert_eq!(table.counts().select, 1);
}
