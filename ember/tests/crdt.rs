use anyhow::Result;
use ember::{
    config::DatabaseOptions,
    crdt::{tree::apply_ops, ChangesOptions, DocUpdate},
    types::CrdtMeta,
    Crdt,
};
use serde_json::json;

async fn open(options: &DatabaseOptions) -> Result<Crdt> {
    Ok(Crdt::open(options.clone()).await?)
}

#[tokio::test]
async fn get_reflects_the_last_write() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let db = open(&DatabaseOptions::memory("basics")?).await?;
    assert_eq!(db.get("missing").await?, None);

    db.bulk(vec![DocUpdate::put("ace", json!({"points": 11}))])
        .await?;
    assert_eq!(db.get("ace").await?, Some(json!({"points": 11})));

    db.bulk(vec![DocUpdate::put("ace", json!({"points": 1}))])
        .await?;
    assert_eq!(db.get("ace").await?, Some(json!({"points": 1})));

    db.bulk(vec![DocUpdate::delete("ace")]).await?;
    assert_eq!(db.get("ace").await?, None);
    assert!(db.all_docs().await?.rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn changes_report_each_key_once() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let db = open(&DatabaseOptions::memory("changes")?).await?;
    db.bulk(vec![DocUpdate::put("a", json!(1))]).await?;
    db.bulk(vec![DocUpdate::put("a", json!(2))]).await?;
    let mid = db.head();
    db.bulk(vec![
        DocUpdate::put("b", json!(3)),
        DocUpdate::put("c", json!(4)),
    ])
    .await?;

    let all = db.changes(&[], ChangesOptions::default()).await?;
    assert_eq!(all.head, db.head());
    let rows: Vec<_> = all
        .rows
        .iter()
        .map(|row| (row.id.as_str(), row.value.clone()))
        .collect();
    assert_eq!(
        rows,
        [
            ("a", Some(json!(2))),
            ("b", Some(json!(3))),
            ("c", Some(json!(4)))
        ]
    );

    let since = db.changes(&mid, ChangesOptions::default()).await?;
    let ids: Vec<_> = since.rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, ["b", "c"]);
    assert!(db.changes(&db.head(), ChangesOptions::default()).await?.rows.is_empty());

    let limited = db
        .changes(
            &[],
            ChangesOptions {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(limited.rows.len(), 2);
    Ok(())
}

#[tokio::test]
async fn compaction_is_read_transparent() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let options = DatabaseOptions::memory("compact")?;
    let db = open(&options).await?;
    for i in 0..5 {
        db.bulk(vec![
            DocUpdate::put(format!("doc-{i}"), json!({"n": i})),
            DocUpdate::put("counter", json!(i)),
        ])
        .await?;
    }
    db.bulk(vec![DocUpdate::delete("doc-0")]).await?;
    let before = db.changes(&[], ChangesOptions::default()).await?;
    let loader = db.blockstore().loader();
    assert_eq!(loader.car_log_len(), 7);

    db.compact().await?;
    assert_eq!(loader.car_log_len(), 1);
    assert_eq!(db.get("counter").await?, Some(json!(4)));

    // a fresh session only sees what the compaction kept
    let reopened = open(&options).await?;
    assert_eq!(reopened.head(), db.head());
    assert_eq!(reopened.blockstore().loader().car_log_len(), 1);
    assert_eq!(reopened.get("doc-3").await?, Some(json!({"n": 3})));
    assert_eq!(reopened.get("doc-0").await?, None);
    assert_eq!(reopened.all_docs().await?.rows.len(), 5);
    let after = reopened.changes(&[], ChangesOptions::default()).await?;
    assert_eq!(after.rows, before.rows);

    // writes continue on top of the compacted log
    reopened
        .bulk(vec![DocUpdate::put("late", json!(true))])
        .await?;
    assert_eq!(reopened.blockstore().loader().car_log_len(), 2);
    assert_eq!(reopened.get("late").await?, Some(json!(true)));
    Ok(())
}

#[tokio::test]
async fn compaction_keeps_values_of_concurrent_writes() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let options = DatabaseOptions::memory("compact-merge")?;
    let db = open(&options).await?;
    db.bulk(vec![DocUpdate::put("base", json!(0))]).await?;
    let base = db.head();
    db.bulk(vec![DocUpdate::put("k", json!("left"))]).await?;

    // a second writer on the same parent
    let fork = db
        .blockstore()
        .transaction(
            |tx| {
                let base = base.clone();
                async move {
                    let value = tx.put_value(&json!({"doc": "right"}))?;
                    let applied = apply_ops(&tx, &base, vec![("k".to_string(), value)]).await?;
                    for block in applied.additions {
                        tx.put(block);
                    }
                    tx.put(applied.event);
                    Ok(CrdtMeta { head: applied.head })
                }
            },
            Default::default(),
        )
        .await?;
    db.clock().apply_head(fork.meta.head, base, None).await?;
    assert_eq!(db.head().len(), 2);

    let value_of_k = |rows: &[DocUpdate]| {
        rows.iter()
            .find(|row| row.id == "k")
            .map(|row| row.value.clone())
    };
    let before = db.changes(&[], ChangesOptions::default()).await?.rows;
    assert!(value_of_k(&before).is_some());

    // the second compaction drops the CARs the first one replaced
    db.compact().await?;
    db.bulk(vec![DocUpdate::put("x", json!(1))]).await?;
    db.compact().await?;

    let reopened = open(&options).await?;
    let after = reopened.changes(&[], ChangesOptions::default()).await?.rows;
    assert_eq!(value_of_k(&after), value_of_k(&before));
    assert_eq!(after.len(), 3);
    assert_eq!(reopened.get("k").await?, db.get("k").await?);
    Ok(())
}

#[tokio::test]
async fn reopening_restores_the_head() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let options = DatabaseOptions::memory("reopen")?;
    let db = open(&options).await?;
    db.bulk(vec![DocUpdate::put("kept", json!({"v": 1}))])
        .await?;
    db.close().await?;

    let reopened = open(&options).await?;
    assert_eq!(reopened.head(), db.head());
    assert_eq!(reopened.get("kept").await?, Some(json!({"v": 1})));

    reopened.destroy().await?;
    let empty = open(&options).await?;
    assert!(empty.head().is_empty());
    assert_eq!(empty.get("kept").await?, None);
    Ok(())
}
