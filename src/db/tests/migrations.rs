use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    assert!(tables.contains(&"task_history".to_string()));
    assert!(tables.contains(&"schema_version".to_string()));
    drop(conn);

    db.close().await;
}

#[tokio::test]
async fn test_reopen_does_not_reapply_migrations() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("nested").join("history.db");

    let db = Database::new(&path).await.unwrap();
    db.close().await;

    let db = Database::new(&path).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1]);

    db.close().await;
}

#[tokio::test]
async fn test_query_after_close_returns_error() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.pool().close().await;

    let result = db.count_history(None).await;
    assert!(
        result.is_err(),
        "count_history after pool close should return an error, got: {:?}",
        result
    );
}
