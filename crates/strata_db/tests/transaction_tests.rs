mod common;

use common::*;
use strata_common::{ErrorKind, FieldError, RepositoryError};
use strata_db::error::from_sqlx;
use strata_db::TransactionManager;

const INSERT_WIDGET: &str = "INSERT INTO widgets (id, name, quantity, created_at, updated_at) \
                             VALUES (?, ?, 0, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')";

async fn widget_count(client: &strata_db::DbClient) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM widgets")
        .fetch_one(client.pool())
        .await
        .expect("count widgets")
}

#[tokio::test]
async fn test_commit_keeps_every_write() {
    let client = setup_client().await;
    let transactions = TransactionManager::new(client.clone());

    let inserted = transactions
        .execute_transaction(|tx| {
            Box::pin(async move {
                let mut total = 0;
                for (id, name) in [(1_i64, "bolt"), (2, "nut")] {
                    let done = sqlx::query(INSERT_WIDGET)
                        .bind(id)
                        .bind(name)
                        .execute(&mut **tx)
                        .await
                        .map_err(from_sqlx)?;
                    total += done.rows_affected();
                }
                Ok::<_, RepositoryError>(total)
            })
        })
        .await
        .expect("transaction");

    assert_eq!(inserted, 2);
    assert_eq!(widget_count(&client).await, 2);
    let stats = transactions.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.rolled_back, 0);
}

#[tokio::test]
async fn test_work_error_rolls_back_and_keeps_its_kind() {
    let client = setup_client().await;
    let transactions = TransactionManager::new(client.clone());

    let err = transactions
        .execute_transaction(|tx| {
            Box::pin(async move {
                sqlx::query(INSERT_WIDGET)
                    .bind(1_i64)
                    .bind("bolt")
                    .execute(&mut **tx)
                    .await
                    .map_err(from_sqlx)?;
                Err::<(), _>(RepositoryError::validation(vec![FieldError::new("name", "rejected")]))
            })
        })
        .await
        .expect_err("work failed");

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(widget_count(&client).await, 0);
    assert_eq!(transactions.stats().rolled_back, 1);
    assert_eq!(transactions.stats().committed, 0);
}

#[tokio::test]
async fn test_constraint_violation_inside_work_is_a_conflict() {
    let client = setup_client().await;
    let transactions = TransactionManager::new(client.clone());

    let err = transactions
        .execute_transaction(|tx| {
            Box::pin(async move {
                for id in [1_i64, 2] {
                    sqlx::query(INSERT_WIDGET)
                        .bind(id)
                        .bind("bolt")
                        .execute(&mut **tx)
                        .await
                        .map_err(from_sqlx)?;
                }
                Ok::<_, RepositoryError>(())
            })
        })
        .await
        .expect_err("duplicate name");

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.code(), "UNIQUE_CONSTRAINT_VIOLATION");
    assert_eq!(widget_count(&client).await, 0);
}

#[tokio::test]
async fn test_begin_failure_is_transaction_failed() {
    let client = setup_client().await;
    let transactions = TransactionManager::new(client.clone());
    client.close().await;

    let err = transactions
        .execute_transaction(|_tx| Box::pin(async move { Ok::<_, RepositoryError>(()) }))
        .await
        .expect_err("closed pool");

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.code(), "TRANSACTION_FAILED");
    let stats = transactions.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.started, 0);
}
