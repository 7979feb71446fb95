use anyhow::Result;
use ember::{
    config::DatabaseOptions,
    crdt::DocUpdate,
    indexer::{Emitter, IndexDefinition, QueryOptions},
    Crdt,
};
use serde_json::{json, Value};

fn ages() -> Vec<DocUpdate> {
    [("ann", 18), ("bob", 25), ("cat", 30), ("dan", 41)]
        .into_iter()
        .map(|(id, age)| DocUpdate::put(id, json!({ "age": age })))
        .collect()
}

#[tokio::test]
async fn range_queries_follow_deletes() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let db = Crdt::open(DatabaseOptions::memory("people")?).await?;
    db.bulk(ages()).await?;
    let index = db.index(IndexDefinition::field("age"));

    let adults = QueryOptions {
        range: Some((json!(20), json!(30))),
        ..Default::default()
    };
    let rows = index.query(adults.clone()).await?;
    let found: Vec<_> = rows.iter().map(|row| (row.id.as_str(), row.key.clone())).collect();
    assert_eq!(found, [("bob", json!(25)), ("cat", json!(30))]);
    assert_eq!(rows[0].doc, Some(json!({"age": 25})));

    db.bulk(vec![DocUpdate::delete("cat")]).await?;
    let rows = index.query(adults).await?;
    let ids: Vec<_> = rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, ["bob"]);
    Ok(())
}

#[tokio::test]
async fn indexes_survive_a_reopen() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let options = DatabaseOptions::memory("persisted")?;
    let db = Crdt::open(options.clone()).await?;
    db.bulk(ages()).await?;
    let index = db.index(IndexDefinition::field("age"));
    assert_eq!(index.query(QueryOptions::default()).await?.len(), 4);
    let built = index.meta();
    assert!(built.by_key.is_some());

    let reopened = Crdt::open(options.clone()).await?;
    let index = reopened.index(IndexDefinition::field("age"));
    // the stored trees are reused as they are
    assert_eq!(index.meta(), built);
    let rows = index
        .query(QueryOptions {
            key: Some(json!(41)),
            ..Default::default()
        })
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "dan");

    // a new version of the map function starts over
    let again = Crdt::open(options).await?;
    let changed = again.index(IndexDefinition::new("age", 2, |doc: &Value, emit: &mut Emitter| {
        if let Some(age) = doc.get("age") {
            emit.emit(json!("age"), age.clone());
        }
        None
    }));
    assert!(changed.head().is_empty());
    let rows = changed
        .query(QueryOptions {
            key: Some(json!("age")),
            include_docs: false,
            ..Default::default()
        })
        .await?;
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|row| row.value.is_some()));
    Ok(())
}

#[tokio::test]
async fn merges_reset_indexes() -> Result<()> {
    let _guard = ember_test::logging::setup();
    let db = Crdt::open(DatabaseOptions::memory("zoom")?).await?;
    db.bulk(ages()).await?;
    let index = db.index(IndexDefinition::field("age"));
    index.query(QueryOptions::default()).await?;
    assert_eq!(index.head(), db.head());

    // a concurrent head written on the same parent forces a merge
    let base = db.head();
    db.bulk(vec![DocUpdate::put("eve", json!({"age": 22}))])
        .await?;
    let fork = db
        .blockstore()
        .transaction(
            |tx| {
                let base = base.clone();
                async move {
                    let value = tx.put_value(&json!({"doc": {"age": 50}}))?;
                    let applied =
                        ember::crdt::tree::apply_ops(&tx, &base, vec![("fay".to_string(), value)])
                            .await?;
                    for block in applied.additions {
                        tx.put(block);
                    }
                    tx.put(applied.event);
                    Ok(ember::types::CrdtMeta { head: applied.head })
                }
            },
            Default::default(),
        )
        .await?;
    db.clock()
        .apply_head(fork.meta.head, base, None)
        .await?;
    assert_eq!(db.head().len(), 2);
    assert!(index.head().is_empty(), "the merge dropped the built index");

    let rows = index.query(QueryOptions::default()).await?;
    let ids: Vec<_> = rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, ["ann", "eve", "bob", "cat", "dan", "fay"]);
    Ok(())
}
