use pretty_assertions::assert_eq;
use shardkeeper_catalog::CatalogStore;
use shardkeeper_types::{ErrorCode, NamespaceString, ReadConcern, ShardId, Timestamp};

mod common;

use common::{cluster, shard_collection, step_up};

#[test_log::test(tokio::test)]
async fn drop_removes_collection_and_records_placement_once() {
    let c = cluster("s0");
    step_up(&c, 1).await;
    let nss = NamespaceString::new("db", "orders");
    let entry = shard_collection(&c, &nss, Timestamp::new(20, 0)).await;

    c.ctx.drop_collection(nss.clone()).await.unwrap();

    let store = &c.store;
    assert!(
        store
            .find_collection(&nss, ReadConcern::Majority)
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.chunks(entry.uuid, ReadConcern::Majority).await.unwrap().is_empty());
    assert!(
        store
            .index_entries(entry.uuid, ReadConcern::Majority)
            .await
            .unwrap()
            .is_empty()
    );
    let history = store
        .placement_history(&nss, ReadConcern::Majority)
        .await
        .unwrap();
    assert_eq!(1, history.len());
    assert_eq!(entry.uuid, history[0].uuid);
    assert!(history[0].shards.is_empty());

    for shard in [ShardId::new("s0"), ShardId::new("s1")] {
        let events = c.shards.drop_events(&shard);
        assert!(events.iter().any(|e| e.nss == nss && e.existed), "{shard}");
    }

    // dropping again finds nothing to drop and appends no history
    c.ctx.drop_collection(nss.clone()).await.unwrap();
    let history = store
        .placement_history(&nss, ReadConcern::Majority)
        .await
        .unwrap();
    assert_eq!(1, history.len());
    assert!(
        store
            .recovery_documents(ReadConcern::Majority)
            .await
            .unwrap()
            .is_empty()
    );
}

#[test_log::test(tokio::test)]
async fn drop_is_rejected_when_not_primary() {
    let c = cluster("s0");
    let err = c
        .ctx
        .drop_collection(NamespaceString::new("db", "orders"))
        .await
        .unwrap_err();
    assert_eq!(ErrorCode::NotWritablePrimary, err.code());

    step_up(&c, 1).await;
    c.ctx.step_down();
    let err = c
        .ctx
        .drop_collection(NamespaceString::new("db", "orders"))
        .await
        .unwrap_err();
    assert_eq!(ErrorCode::NotWritablePrimary, err.code());
}

#[test_log::test(tokio::test)]
async fn drop_clears_filtering_metadata_on_refresh() {
    let c = cluster("s1");
    step_up(&c, 1).await;
    let nss = NamespaceString::new("db", "orders");
    shard_collection(&c, &nss, Timestamp::new(20, 0)).await;

    c.ctx.refresh_filtering_metadata(&nss).await.unwrap();
    let runtime = c.ctx.sharding_state().collection(&nss);
    assert!(runtime.current_metadata_if_known().unwrap().is_sharded());

    c.ctx.drop_collection(nss.clone()).await.unwrap();
    c.ctx.refresh_filtering_metadata(&nss).await.unwrap();
    assert!(!runtime.current_metadata_if_known().unwrap().is_sharded());
}
