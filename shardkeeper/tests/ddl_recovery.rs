use std::{sync::Arc, time::Duration};

use shardkeeper_ddl::{LockMode, LockRequest, RecoveryState, ResourceId};
use shardkeeper_types::{ErrorCode, NamespaceString};

mod common;

use common::{cluster, step_up};

fn orders() -> ResourceId {
    ResourceId::Collection(NamespaceString::new("db", "orders"))
}

#[test_log::test(tokio::test)]
async fn locks_wait_for_step_up_recovery() {
    let c = Arc::new(cluster("s0"));
    assert_eq!(RecoveryState::Paused, c.ctx.recovery_state());

    // requested before the node is primary, granted once recovery finishes
    let waiter = tokio::spawn({
        let c = Arc::clone(&c);
        async move {
            c.ctx
                .lock_manager()
                .acquire(
                    LockRequest::new(orders(), LockMode::Exclusive, "drop")
                        .with_timeout(Duration::from_secs(10)),
                )
                .await
                .map(|lock| lock.info().reason.clone())
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    step_up(&c, 2).await;
    let reason = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!("drop", reason);
}

#[test_log::test(tokio::test)]
async fn lock_request_times_out_while_not_primary() {
    let c = cluster("s0");
    let err = c
        .ctx
        .lock_manager()
        .acquire(
            LockRequest::new(orders(), LockMode::Shared, "rename")
                .with_timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
    assert_eq!(ErrorCode::LockTimeout, err.code());
}

#[test_log::test(tokio::test)]
async fn step_down_releases_blocked_waiter_promptly() {
    let c = Arc::new(cluster("s0"));
    step_up(&c, 1).await;
    let held = c
        .ctx
        .lock_manager()
        .acquire(LockRequest::new(orders(), LockMode::Exclusive, "drop"))
        .await
        .unwrap();

    let waiter = tokio::spawn({
        let c = Arc::clone(&c);
        async move {
            c.ctx
                .lock_manager()
                .acquire(
                    LockRequest::new(orders(), LockMode::Exclusive, "rename")
                        .with_timeout(Duration::from_secs(3600)),
                )
                .await
                .map(|_| ())
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    c.ctx.step_down();

    let res = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ErrorCode::LockTimeout, res.unwrap_err().code());
    drop(held);
}

#[test_log::test(tokio::test)]
async fn step_up_records_the_term() {
    let c = cluster("s0");
    step_up(&c, 4).await;
    assert_eq!(Some(4), c.ctx.lock_manager().recovery().current_term());
    c.ctx.step_down();
    assert_eq!(None, c.ctx.lock_manager().recovery().current_term());
    assert_eq!(RecoveryState::Paused, c.ctx.recovery_state());
}
