mod common;

use std::collections::HashSet;

use trellis_domain::{
    DatasetSource, ErrorKind, Identity, ListQuery, NewDataset, SortOrder,
};

use common::{memory_context, validated_dataset, TestContext, SCHEMA_IN, SCHEMA_OUT};

async fn create_named(ctx: &TestContext, owner: &Identity, name: &str) {
    ctx.engine
        .datasets
        .create(
            owner,
            NewDataset {
                id: name.to_string(),
                description: String::new(),
                schema_in: String::new(),
                schema_out: String::new(),
                source: DatasetSource::Upload,
                source_address: String::new(),
            },
        )
        .await
        .unwrap();
}

async fn create_datasets(ctx: &TestContext, owner: &Identity, count: usize) {
    for i in 0..count {
        create_named(ctx, owner, &format!("set-{i:02}")).await;
    }
}

async fn page_ids(ctx: &TestContext, owner: &Identity, cursor: &str) -> (Vec<String>, String) {
    let page = ctx
        .engine
        .datasets
        .list(
            owner,
            &ListQuery::new()
                .sort_by("id", SortOrder::Asc)
                .limit(4)
                .cursor(cursor.to_string()),
        )
        .await
        .unwrap();
    (
        page.items.into_iter().map(|d| d.id).collect(),
        page.next_page_cursor,
    )
}

#[tokio::test]
async fn test_cursor_walks_every_item_once() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    create_datasets(&ctx, &alice, 25).await;

    let mut seen = Vec::new();
    let mut cursor = String::new();
    let mut pages = 0;
    loop {
        let page = ctx
            .engine
            .datasets
            .list(
                &alice,
                &ListQuery::new()
                    .sort_by("id", SortOrder::Asc)
                    .limit(10)
                    .cursor(cursor.clone()),
            )
            .await
            .unwrap();
        pages += 1;
        assert_eq!(page.total_result_size, 25);
        assert_eq!(page.returned_result_size, page.items.len() as u64);
        seen.extend(page.items.into_iter().map(|d| d.id));
        if page.next_page_cursor.is_empty() {
            break;
        }
        cursor = page.next_page_cursor;
    }

    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 25);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 25);
}

#[tokio::test]
async fn test_insertions_between_pages_do_not_disturb_cursor() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    create_datasets(&ctx, &alice, 10).await;

    let (first, cursor) = page_ids(&ctx, &alice, "").await;
    assert_eq!(first.last().map(String::as_str), Some("alice/set-03"));

    // 一条排在游标之前，两条排在游标之后
    create_named(&ctx, &alice, "set-00b").await;
    create_named(&ctx, &alice, "set-05b").await;
    create_named(&ctx, &alice, "set-99").await;

    let mut seen = first;
    let mut cursor = cursor;
    while !cursor.is_empty() {
        let (ids, next) = page_ids(&ctx, &alice, &cursor).await;
        seen.extend(ids);
        cursor = next;
    }

    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), seen.len());
    assert!(!seen.contains(&"alice/set-00b".to_string()));
    assert!(seen.contains(&"alice/set-05b".to_string()));
    assert_eq!(seen.last().map(String::as_str), Some("alice/set-99"));
    assert_eq!(seen.len(), 12);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
}

#[tokio::test]
async fn test_descending_order_and_exact_last_page() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    create_datasets(&ctx, &alice, 4).await;

    let first = ctx
        .engine
        .datasets
        .list(&alice, &ListQuery::new().sort_by("id", SortOrder::Desc).limit(2))
        .await
        .unwrap();
    assert_eq!(first.items[0].id, "alice/set-03");
    assert!(!first.next_page_cursor.is_empty());

    let second = ctx
        .engine
        .datasets
        .list(
            &alice,
            &ListQuery::new()
                .sort_by("id", SortOrder::Desc)
                .limit(2)
                .cursor(first.next_page_cursor),
        )
        .await
        .unwrap();
    assert_eq!(
        second.items.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["alice/set-01", "alice/set-00"]
    );
    // 正好取完时不再给出游标
    assert!(second.next_page_cursor.is_empty());
}

#[tokio::test]
async fn test_default_order_uses_insertion() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    create_datasets(&ctx, &alice, 3).await;

    let page = ctx
        .engine
        .datasets
        .list(&alice, &ListQuery::new().limit(0))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.items[0].id, "alice/set-00");
    assert!(page.next_page_cursor.is_empty());
}

#[tokio::test]
async fn test_invalid_query_inputs() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    create_datasets(&ctx, &alice, 1).await;

    let bad_cursor = ctx
        .engine
        .datasets
        .list(&alice, &ListQuery::new().cursor("not-hex"))
        .await
        .unwrap_err();
    assert_eq!(bad_cursor.kind(), ErrorKind::BadInput);

    let bad_filter = ctx
        .engine
        .datasets
        .list(&alice, &ListQuery::new().filter("favourite-colour", "blue"))
        .await
        .unwrap_err();
    assert_eq!(bad_filter.kind(), ErrorKind::BadInput);

    let bad_sort = ctx
        .engine
        .datasets
        .list(&alice, &ListQuery::new().sort_by("status", SortOrder::Asc))
        .await
        .unwrap_err();
    assert_eq!(bad_sort.kind(), ErrorKind::BadInput);
}

#[tokio::test]
async fn test_visibility_scope() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    let bob = Identity::user("bob");
    create_datasets(&ctx, &alice, 2).await;
    create_datasets(&ctx, &bob, 3).await;
    create_datasets(&ctx, &Identity::root(), 1).await;

    let alice_view = ctx.engine.datasets.list(&alice, &ListQuery::new()).await.unwrap();
    assert_eq!(alice_view.total_result_size, 3);
    assert!(alice_view
        .items
        .iter()
        .all(|d| d.user == "alice" || d.user == "root"));

    let root_view = ctx
        .engine
        .datasets
        .list(&Identity::root(), &ListQuery::new())
        .await
        .unwrap();
    assert_eq!(root_view.total_result_size, 6);

    let hidden = ctx
        .engine
        .datasets
        .get(&alice, "bob/set-00")
        .await
        .unwrap_err();
    assert_eq!(hidden.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_schema_filter_applied_after_fetch() {
    let ctx = memory_context().await;
    let alice = Identity::user("alice");
    create_datasets(&ctx, &alice, 3).await;
    let matching = validated_dataset(&ctx, &alice, "matching").await;

    let page = ctx
        .engine
        .datasets
        .list(
            &alice,
            &ListQuery::new()
                .filter("schema-in", SCHEMA_IN)
                .filter("schema-out", SCHEMA_OUT),
        )
        .await
        .unwrap();
    assert_eq!(page.returned_result_size, 1);
    assert_eq!(page.items[0].id, matching.id);
    // 总数在 schema 筛选之前统计
    assert_eq!(page.total_result_size, 4);
}
