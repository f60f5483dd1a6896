//! PostgreSQL Store Integration Tests
//!
//! Run against a scratch database:
//! `TEST_DATABASE_URL=postgres://localhost/corecheck_test cargo test -- --ignored`

#![cfg(feature = "postgres")]

use corecheck_storage::{
    Direction, Execution, ExecutionState, PgConnectOptions, PipelineStore, PostgresStore,
    RepositoryRecord, SchemaStore, UpsertOutcome, MIGRATIONS,
};
use serde_json::json;
use std::env;
use std::str::FromStr;

fn test_options() -> PgConnectOptions {
    let url = env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/corecheck_test".to_string());
    PgConnectOptions::from_str(&url).expect("valid TEST_DATABASE_URL")
}

async fn migrated_store() -> PostgresStore {
    let store = PostgresStore::connect_with(test_options(), 4)
        .await
        .expect("Failed to connect to PostgreSQL");

    let current = store.current_version().await.unwrap();
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        store.apply_migration(migration, Direction::Up).await.unwrap();
    }
    store
}

#[tokio::test]
#[ignore] // Requires PostgreSQL server
async fn test_postgres_schema_reaches_latest() {
    let store = migrated_store().await;
    assert_eq!(
        store.current_version().await.unwrap(),
        corecheck_storage::migrations::latest_version()
    );
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_repository_upsert_is_idempotent() {
    let store = migrated_store().await;
    let external_id = format!("pg-{}", uuid::Uuid::new_v4());
    let repo = RepositoryRecord::new(&external_id, "acme/pg-widgets", "main");

    assert_eq!(
        store.upsert_repository(&repo).await.unwrap(),
        UpsertOutcome::Inserted
    );
    assert_eq!(
        store.upsert_repository(&repo).await.unwrap(),
        UpsertOutcome::Unchanged
    );
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_execution_compare_and_set() {
    let store = migrated_store().await;
    let mut execution = Execution::new(json!({"target": "repo-42"}));
    store.insert_execution(&execution).await.unwrap();

    let stale = execution.clone();
    execution.current_state = ExecutionState::SubmittingJob;
    execution.version = store.update_execution(&execution).await.unwrap();

    assert!(store.update_execution(&stale).await.unwrap_err().is_conflict());

    let loaded = store
        .get_execution(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.current_state, ExecutionState::SubmittingJob);
    assert_eq!(loaded.version, 1);
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_claim_takeover_has_one_winner() {
    let store = migrated_store().await;
    let key = format!("pg-{}@abc", uuid::Uuid::new_v4());

    let original = store.claim_task(&key).await.unwrap().unwrap();
    let observed = store.get_task_claim(&key).await.unwrap().unwrap();
    assert_eq!(observed.claimed_at, original.claimed_at);

    let winner = store.take_over_task(&observed).await.unwrap().unwrap();
    assert!(store.take_over_task(&observed).await.unwrap().is_none());
    assert!(!store.release_task(&original).await.unwrap());
    assert!(store
        .complete_task(&winner, uuid::Uuid::new_v4())
        .await
        .unwrap());
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn test_postgres_replayed_step_conflicts() {
    let store = migrated_store().await;

    let err = store
        .apply_migration(&MIGRATIONS[0], Direction::Up)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    store.close().await;
}
